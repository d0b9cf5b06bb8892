//! Structured custom-property substitution for theme stylesheets.
//!
//! A stylesheet is split into raw text and custom-property declarations
//! (`--name: value;`). Overrides replace a declaration's value by name and the
//! sheet is serialized back, leaving every other byte untouched. Comments,
//! strings and nested parentheses inside values are respected, so
//! `--x: url("a;b")` is one declaration.

use std::collections::BTreeMap;
use std::fmt;

use crate::descriptor::StyleVariable;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Property {
    name: String,
    /// Whitespace and the colon between name and value, as written.
    separator: String,
    value: String,
    /// ` !important` suffix as written, if any.
    important: String,
    /// Whitespace between value and terminator, as written.
    trailing: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Raw(String),
    Property(Property),
}

/// A parsed stylesheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stylesheet {
    segments: Vec<Segment>,
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        self.src.get(self.pos..).unwrap_or("")
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self, bytes: usize) {
        self.pos = self.pos.saturating_add(bytes).min(self.src.len());
    }

    fn bump_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.bump(c.len_utf8());
        Some(c)
    }

    fn skip_past(&mut self, pat: &str) {
        match self.rest().find(pat) {
            Some(idx) => {
                self.bump(idx);
                self.bump(pat.len());
            },
            None => self.pos = self.src.len(),
        }
    }

    fn skip_string(&mut self, quote: char) {
        self.bump_char();
        while let Some(c) = self.bump_char() {
            if c == '\\' {
                self.bump_char();
            } else if c == quote {
                break;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump_char();
        }
    }

    fn slice(&self, from: usize) -> &'a str {
        self.src.get(from..self.pos).unwrap_or("")
    }
}

fn is_name_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, ':' | ';' | '{' | '}' | '(' | ')' | '"' | '\'')
}

/// Parse a custom property starting at the cursor (which sits on `--`).
///
/// Leaves the cursor on the terminator (`;`, `}`) or at end of input.
fn parse_property(cur: &mut Cursor<'_>) -> Option<Property> {
    let start = cur.pos;
    cur.bump(2);
    while cur.peek().is_some_and(is_name_char) {
        cur.bump_char();
    }
    let name = cur.slice(start).to_string();
    if name.len() <= 2 {
        return None;
    }

    let sep_start = cur.pos;
    cur.skip_whitespace();
    if cur.peek() != Some(':') {
        return None;
    }
    cur.bump(1);
    cur.skip_whitespace();
    let separator = cur.slice(sep_start).to_string();

    let value_start = cur.pos;
    let mut depth: u32 = 0;
    while let Some(c) = cur.peek() {
        match c {
            '"' | '\'' => {
                cur.skip_string(c);
                continue;
            },
            '/' if cur.rest().starts_with("/*") => {
                cur.skip_past("*/");
                continue;
            },
            '(' | '[' | '{' => depth = depth.saturating_add(1),
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth = depth.saturating_sub(1),
            ';' | '}' => break,
            _ => {},
        }
        cur.bump_char();
    }
    let raw = cur.slice(value_start);
    let trimmed = raw.trim_end();
    let trailing = raw.get(trimmed.len()..).unwrap_or("").to_string();

    let (value, important) = match trimmed.rfind('!') {
        Some(idx) if trimmed[idx..].eq_ignore_ascii_case("!important") => {
            let head = trimmed[..idx].trim_end();
            (head.to_string(), trimmed[head.len()..].to_string())
        },
        _ => (trimmed.to_string(), String::new()),
    };

    Some(Property {
        name,
        separator,
        value,
        important,
        trailing,
    })
}

impl Stylesheet {
    /// Parse stylesheet text. Never fails: anything that is not a
    /// custom-property declaration is kept verbatim.
    #[must_use]
    pub fn parse(css: &str) -> Self {
        let mut segments = Vec::new();
        let mut cur = Cursor { src: css, pos: 0 };
        let mut raw_start = 0;
        let mut at_declaration_start = true;

        while let Some(c) = cur.peek() {
            if c == '/' && cur.rest().starts_with("/*") {
                cur.skip_past("*/");
                continue;
            }
            if c.is_whitespace() {
                cur.bump_char();
                continue;
            }
            if at_declaration_start && cur.rest().starts_with("--") {
                let prop_start = cur.pos;
                if let Some(prop) = parse_property(&mut cur) {
                    let raw = css.get(raw_start..prop_start).unwrap_or("");
                    if !raw.is_empty() {
                        segments.push(Segment::Raw(raw.to_string()));
                    }
                    segments.push(Segment::Property(prop));
                    raw_start = cur.pos;
                    at_declaration_start = false;
                    continue;
                }
                // Not a declaration after all: rewind and treat as raw text.
                cur.pos = prop_start;
                cur.bump(2);
                at_declaration_start = false;
                continue;
            }
            match c {
                '"' | '\'' => {
                    cur.skip_string(c);
                    at_declaration_start = false;
                    continue;
                },
                '{' | '}' | ';' => at_declaration_start = true,
                _ => at_declaration_start = false,
            }
            cur.bump_char();
        }

        let raw = css.get(raw_start..).unwrap_or("");
        if !raw.is_empty() {
            segments.push(Segment::Raw(raw.to_string()));
        }
        Self { segments }
    }

    /// Custom-property declarations in document order as `(name, value)`.
    pub fn declarations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Property(p) => Some((p.name.as_str(), p.value.as_str())),
            Segment::Raw(_) => None,
        })
    }

    /// Replace the value of every declaration of `name`.
    ///
    /// Returns the number of declarations changed; `0` means the sheet does
    /// not declare `name` and is unchanged.
    pub fn set_property(&mut self, name: &str, value: &str) -> usize {
        let mut changed = 0_usize;
        for segment in &mut self.segments {
            if let Segment::Property(p) = segment
                && p.name == name
            {
                p.value = value.trim().to_string();
                changed = changed.saturating_add(1);
            }
        }
        changed
    }
}

impl fmt::Display for Stylesheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Raw(raw) => f.write_str(raw)?,
                Segment::Property(p) => {
                    write!(f, "{}{}{}{}{}", p.name, p.separator, p.value, p.important, p.trailing)?;
                },
            }
        }
        Ok(())
    }
}

/// Apply overrides for declared variables to stylesheet text.
///
/// Overrides whose name is not in `declared`, or that the sheet never
/// declares, are skipped.
#[must_use]
pub fn apply_overrides(
    css: &str,
    declared: &[StyleVariable],
    overrides: &BTreeMap<String, String>,
) -> String {
    let applicable: Vec<(&String, &String)> = overrides
        .iter()
        .filter(|(name, _)| declared.iter().any(|v| &v.name == *name))
        .collect();
    if applicable.is_empty() {
        return css.to_string();
    }
    let mut sheet = Stylesheet::parse(css);
    for (name, value) in applicable {
        if sheet.set_property(name, value) == 0 {
            tracing::debug!(variable = %name, "Override has no matching declaration");
        }
    }
    sheet.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> StyleVariable {
        StyleVariable {
            name: name.into(),
            default: String::new(),
            description: None,
        }
    }

    #[test]
    fn unmodified_sheet_serializes_identically() {
        let css = ":root {\n  --accent: #f80;\n  --gap : 4px ;\n  color: red;\n}\n/* --fake: 1; */\n";
        assert_eq!(Stylesheet::parse(css).to_string(), css);
    }

    #[test]
    fn finds_declarations() {
        let sheet = Stylesheet::parse(":root{--a:1px;--b: calc(1px + 2px)}");
        let decls: Vec<_> = sheet.declarations().collect();
        assert_eq!(decls, vec![("--a", "1px"), ("--b", "calc(1px + 2px)")]);
    }

    #[test]
    fn substitution_preserves_formatting() {
        let mut sheet = Stylesheet::parse(":root {\n  --accent : #f80 !important ;\n}");
        assert_eq!(sheet.set_property("--accent", "blue"), 1);
        assert_eq!(sheet.to_string(), ":root {\n  --accent : blue !important ;\n}");
    }

    #[test]
    fn ignores_names_in_comments_strings_and_selectors() {
        let css = r#".btn--primary { content: "--accent: x;"; } /* --accent: y; */ :root { --accent: red; }"#;
        let mut sheet = Stylesheet::parse(css);
        assert_eq!(sheet.declarations().count(), 1);
        assert_eq!(sheet.set_property("--accent", "green"), 1);
        assert!(sheet.to_string().contains("--accent: green;"));
        assert!(sheet.to_string().contains("\"--accent: x;\""));
        assert!(sheet.to_string().contains("/* --accent: y; */"));
    }

    #[test]
    fn values_with_semicolons_in_strings() {
        let mut sheet = Stylesheet::parse(":root { --font: \"A;B\", serif; --x: 1; }");
        let decls: Vec<_> = sheet.declarations().collect();
        assert_eq!(decls[0], ("--font", "\"A;B\", serif"));
        sheet.set_property("--x", "2");
        assert_eq!(sheet.to_string(), ":root { --font: \"A;B\", serif; --x: 2; }");
    }

    #[test]
    fn prefix_names_do_not_match() {
        let mut sheet = Stylesheet::parse(":root { --accent-dark: #000; --accent: #fff; }");
        assert_eq!(sheet.set_property("--accent", "red"), 1);
        assert_eq!(
            sheet.to_string(),
            ":root { --accent-dark: #000; --accent: red; }"
        );
    }

    #[test]
    fn last_declaration_without_terminator() {
        let mut sheet = Stylesheet::parse(":root { --a: 1px }");
        sheet.set_property("--a", "2px");
        assert_eq!(sheet.to_string(), ":root { --a: 2px }");
    }

    #[test]
    fn apply_overrides_skips_undeclared_names() {
        let css = ":root { --accent: #f80; --hidden: 1; }";
        let overrides = BTreeMap::from([
            ("--accent".to_string(), "blue".to_string()),
            ("--hidden".to_string(), "2".to_string()),
        ]);
        let out = apply_overrides(css, &[var("--accent")], &overrides);
        assert_eq!(out, ":root { --accent: blue; --hidden: 1; }");
    }

    #[test]
    fn apply_overrides_without_matches_is_identity() {
        let css = ":root { --a: 1; }";
        let overrides = BTreeMap::from([("--zzz".to_string(), "2".to_string())]);
        assert_eq!(apply_overrides(css, &[var("--zzz")], &overrides), css);
    }
}
