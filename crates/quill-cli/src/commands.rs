//! Addon management commands.
//!
//! Every command initializes the runtime against the user's addon
//! directories, performs one operation, and shuts the runtime down again.
//! Persisted state carries the result to the next launch.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use quill_addons::{
    AddonConfig, AddonHandles, AddonHost, AddonId, AddonSystem, DiskAddonFs, LogSurface,
    PermissionLevel, PluginInstance, ReloadOutcome,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::OutputFormat;
use crate::theme::Theme;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open(watch: bool) -> anyhow::Result<(AddonSystem, AddonHandles)> {
    let mut config = AddonConfig::load().context("failed to load addon configuration")?;
    config.watch = watch;
    debug!(
        plugins_dir = %config.plugins_dir.display(),
        themes_dir = %config.themes_dir.display(),
        watch,
        "Opening addon runtime"
    );
    let host = AddonHost {
        fs: Arc::new(DiskAddonFs::from_config(&config)),
        surface: Arc::new(LogSurface::new()),
    };
    let system = AddonSystem::new(host, config);
    let handles = system
        .init()
        .await
        .context("failed to initialize the addon runtime")?;
    Ok((system, handles))
}

/// Run `op` against an initialized runtime, shutting it down afterwards
/// whatever the outcome.
async fn with_runtime<T, F, Fut>(op: F) -> anyhow::Result<T>
where
    F: FnOnce(AddonHandles) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let (system, handles) = open(false).await?;
    let result = op(handles).await;
    system.shutdown().await;
    result
}

fn parse_id(raw: &str) -> anyhow::Result<AddonId> {
    AddonId::new(raw).map_err(|e| anyhow!("{e}"))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report(out: OutputFormat, id: &AddonId, action: &str, message: &str) -> anyhow::Result<()> {
    match out {
        OutputFormat::Json => print_json(&json!({ "id": id, "action": action, "ok": true })),
        OutputFormat::Pretty => {
            println!("{}", Theme::success(message));
            Ok(())
        },
    }
}

fn plugin_state(p: &PluginInstance) -> &'static str {
    if p.started {
        "started"
    } else if p.error.is_some() {
        "failed"
    } else if p.loaded {
        "loaded"
    } else {
        "unloaded"
    }
}

fn failure(handles: &AddonHandles, id: &AddonId) -> String {
    handles
        .plugins
        .plugin(id)
        .and_then(|p| p.error)
        .unwrap_or_else(|| "unknown error".to_string())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PluginRow {
    id: AddonId,
    name: String,
    version: String,
    permission: PermissionLevel,
    state: &'static str,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ThemeRow {
    id: AddonId,
    name: String,
    version: String,
    enabled: bool,
    applied: bool,
    variables: usize,
}

pub(crate) async fn list(out: OutputFormat) -> anyhow::Result<()> {
    let (plugins, themes) = with_runtime(|h| async move {
        let plugins: Vec<PluginRow> = h
            .plugins
            .plugins()
            .into_iter()
            .map(|p| PluginRow {
                state: plugin_state(&p),
                enabled: h.plugins.is_enabled(p.id()),
                id: p.descriptor.id.clone(),
                name: p.descriptor.name.clone(),
                version: p.descriptor.version.clone(),
                permission: p.permission,
                error: p.error,
            })
            .collect();
        let themes: Vec<ThemeRow> = h
            .themes
            .themes()
            .into_iter()
            .map(|d| ThemeRow {
                enabled: h.themes.is_enabled(&d.id),
                applied: h.themes.is_applied(&d.id),
                variables: d.variables.len(),
                id: d.id,
                name: d.name,
                version: d.version,
            })
            .collect();
        Ok((plugins, themes))
    })
    .await?;

    if out == OutputFormat::Json {
        return print_json(&json!({ "plugins": plugins, "themes": themes }));
    }

    if plugins.is_empty() {
        println!("{}", Theme::info("No plugins installed"));
    } else {
        println!("{}", Theme::header("Plugins"));
        println!("  {:<24} {:<10} {:<10} STATE", "ID", "VERSION", "TIER");
        println!("{}", Theme::separator());
        for p in &plugins {
            println!(
                "  {:<24} {:<10} {:<10} {}",
                p.id.as_str(),
                p.version,
                p.permission.as_str(),
                Theme::state(p.state)
            );
            if let Some(error) = &p.error {
                println!("    {}", Theme::error(error));
            }
        }
    }

    println!();
    if themes.is_empty() {
        println!("{}", Theme::info("No themes installed"));
    } else {
        println!("{}", Theme::header("Themes"));
        println!("  {:<24} {:<10} {:<6} STATE", "ID", "VERSION", "VARS");
        println!("{}", Theme::separator());
        for t in &themes {
            let state = match (t.applied, t.enabled) {
                (true, _) => "applied",
                (false, true) => "enabled",
                (false, false) => "disabled",
            };
            println!(
                "  {:<24} {:<10} {:<6} {}",
                t.id.as_str(),
                t.version,
                t.variables,
                Theme::state(state)
            );
        }
    }
    println!(
        "\n{}",
        Theme::dimmed(&format!(
            "{} plugin(s), {} theme(s)",
            plugins.len(),
            themes.len()
        ))
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// enable / disable / reload
// ---------------------------------------------------------------------------

pub(crate) async fn enable(raw: &str, out: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    let message = with_runtime(|h| {
        let id = id.clone();
        async move {
            if let Some(plugin) = h.plugins.plugin(&id) {
                if plugin.started {
                    return Ok(format!("Plugin {id} is already running"));
                }
                if !h.plugins.start_plugin(&id).await {
                    bail!("plugin {id} failed to start: {}", failure(&h, &id));
                }
                return Ok(format!("Plugin {id} enabled"));
            }
            if h.themes.theme(&id).is_some() {
                if !h.themes.enable_theme(&id).await {
                    bail!("theme {id} could not be applied");
                }
                return Ok(format!("Theme {id} enabled"));
            }
            bail!("no plugin or theme named '{id}'")
        }
    })
    .await?;
    report(out, &id, "enable", &message)
}

pub(crate) async fn disable(raw: &str, out: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    let message = with_runtime(|h| {
        let id = id.clone();
        async move {
            if h.plugins.plugin(&id).is_some() {
                if !h.plugins.stop_plugin(&id).await {
                    return Ok(format!("Plugin {id} was not running"));
                }
                return Ok(format!("Plugin {id} disabled"));
            }
            if h.themes.disable_theme(&id).await {
                return Ok(format!("Theme {id} disabled"));
            }
            bail!("no plugin or theme named '{id}'")
        }
    })
    .await?;
    report(out, &id, "disable", &message)
}

pub(crate) async fn reload(raw: &str, out: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    let message = with_runtime(|h| {
        let id = id.clone();
        async move {
            let outcome = if h.plugins.plugin(&id).is_some() {
                h.plugins.reload_plugin(&id).await?
            } else {
                h.themes.reload_theme(&id).await?
            };
            Ok(match outcome {
                ReloadOutcome::Reloaded { active: true } => format!("{id} reloaded and running"),
                ReloadOutcome::Reloaded { active: false } => format!("{id} reloaded"),
                ReloadOutcome::Coalesced => format!("{id} is busy, reload skipped"),
                ReloadOutcome::Removed => format!("{id} no longer exists and was unloaded"),
            })
        }
    })
    .await?;
    report(out, &id, "reload", &message)
}

// ---------------------------------------------------------------------------
// permission / setting
// ---------------------------------------------------------------------------

pub(crate) async fn permission(
    raw: &str,
    tier: Option<&str>,
    out: OutputFormat,
) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    let requested = tier
        .map(str::parse::<PermissionLevel>)
        .transpose()
        .map_err(|e| anyhow!(e))?;

    let level = with_runtime(|h| {
        let id = id.clone();
        async move {
            if h.plugins.plugin(&id).is_none() {
                bail!("no plugin named '{id}'");
            }
            if let Some(level) = requested {
                h.plugins.set_permission(&id, level).await;
            }
            Ok(h.plugins.permission(&id))
        }
    })
    .await?;

    match (out, requested) {
        (OutputFormat::Json, _) => print_json(&json!({ "id": id, "permission": level })),
        (OutputFormat::Pretty, Some(_)) => {
            println!("{}", Theme::success(&format!("{id} now runs at tier '{level}'")));
            println!(
                "{}",
                Theme::dimmed("Takes effect the next time the plugin is loaded")
            );
            Ok(())
        },
        (OutputFormat::Pretty, None) => {
            println!("{id}: {level}");
            Ok(())
        },
    }
}

pub(crate) async fn setting(
    raw: &str,
    key: &str,
    value: Option<&str>,
    out: OutputFormat,
) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    let parsed = value.map(|v| serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.to_string())));

    let current = with_runtime(|h| {
        let (id, key) = (id.clone(), key.to_string());
        async move {
            if h.plugins.plugin(&id).is_none() {
                bail!("no plugin named '{id}'");
            }
            if let Some(value) = parsed {
                h.plugins.set_setting(&id, &key, value).await;
            }
            Ok(h.plugins.setting(&id, &key))
        }
    })
    .await?;

    match out {
        OutputFormat::Json => print_json(&json!({ "id": id, "key": key, "value": current })),
        OutputFormat::Pretty => {
            match current {
                Some(v) => println!("{id}.{key} = {v}"),
                None => println!("{}", Theme::warning(&format!("{id}.{key} is not set"))),
            }
            Ok(())
        },
    }
}

// ---------------------------------------------------------------------------
// vars / var
// ---------------------------------------------------------------------------

pub(crate) async fn vars(raw: &str, out: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    let vars = with_runtime(|h| {
        let id = id.clone();
        async move {
            if h.themes.theme(&id).is_none() {
                bail!("no theme named '{id}'");
            }
            Ok(h.themes.css_variables(&id))
        }
    })
    .await?;

    if out == OutputFormat::Json {
        return print_json(&vars);
    }
    if vars.is_empty() {
        println!("{}", Theme::info(&format!("Theme {id} declares no variables")));
        return Ok(());
    }
    let overridden = vars.iter().filter(|v| v.overridden).count();
    println!("{}", Theme::header(&format!("Variables of {id}")));
    println!("  {:<24} {:<20} DEFAULT", "NAME", "VALUE");
    println!("{}", Theme::separator());
    for v in &vars {
        let marker = if v.overridden { "*" } else { " " };
        println!(
            "  {:<24} {:<20}{marker} {}",
            v.name,
            v.value,
            Theme::dimmed(&v.default)
        );
    }
    if overridden > 0 {
        println!("\n{}", Theme::dimmed("* overridden"));
    }
    Ok(())
}

pub(crate) async fn var(raw: &str, name: &str, value: &str, out: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(raw)?;
    with_runtime(|h| {
        let id = id.clone();
        async move {
            let Some(theme) = h.themes.theme(&id) else {
                bail!("no theme named '{id}'");
            };
            if theme.variable(name).is_none() {
                bail!("theme {id} does not declare {name}");
            }
            h.themes.set_css_variable(&id, name, value).await;
            Ok(())
        }
    })
    .await?;
    report(out, &id, "var", &format!("{id}: {name} = {value}"))
}

// ---------------------------------------------------------------------------
// watch
// ---------------------------------------------------------------------------

pub(crate) async fn watch() -> anyhow::Result<()> {
    let (system, handles) = open(true).await?;
    let config = system.config();
    println!(
        "{}",
        Theme::info(&format!(
            "Watching {} and {} ({} plugin(s), {} theme(s)). Press Ctrl-C to stop.",
            config.plugins_dir.display(),
            config.themes_dir.display(),
            handles.plugins.plugins().len(),
            handles.themes.themes().len()
        ))
    );

    let waited = tokio::signal::ctrl_c().await;
    system.shutdown().await;
    waited.context("failed to listen for Ctrl-C")?;
    println!("{}", Theme::success("Addon runtime stopped"));
    Ok(())
}
