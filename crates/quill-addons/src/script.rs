//! Compiled plugin scripts.
//!
//! A [`ScriptUnit`] owns one Rhai engine, the compiled AST and the scope left
//! by running the script's top level. The engine has no module resolver and
//! no `eval`, and only the plugin's capability graph is registered, so the
//! script cannot reach anything the graph does not grant.

use std::sync::{Arc, OnceLock, Weak};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope};
use tracing::{debug, info};

use crate::capability::{Capability, CapabilityGraph};
use crate::descriptor::AddonId;
use crate::error::{AddonError, AddonResult};
use crate::permission::PermissionLevel;

/// Late-bound reference from host callbacks back to the unit that registered
/// them. Set once the unit is built.
pub(crate) type UnitCell = Arc<OnceLock<Weak<ScriptUnit>>>;

/// Hook that runs when a plugin starts.
pub const START_HOOK: &str = "start";
/// Hook that runs when a plugin stops.
pub const STOP_HOOK: &str = "stop";
/// Function that renders a settings panel as markup.
pub const SETTINGS_PANEL_HOOK: &str = "settings_panel";
/// Function that returns the settings definition list.
pub const SETTINGS_HOOK: &str = "settings";

/// Execution bounds applied to every plugin engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Operation budget per top-level run or hook call. `0` is unlimited.
    pub max_operations: u64,
    /// Maximum function call depth.
    pub max_call_levels: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
        }
    }
}

/// The functions a script defines that the runtime knows how to call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Exports {
    /// `fn start()`
    pub start: bool,
    /// `fn stop()`
    pub stop: bool,
    /// `fn settings_panel()`
    pub settings_panel: bool,
    /// `fn settings()`
    pub settings: bool,
}

impl Exports {
    fn from_ast(ast: &AST) -> Self {
        let mut exports = Self::default();
        for f in ast.iter_functions().filter(|f| f.params.is_empty()) {
            match f.name {
                START_HOOK => exports.start = true,
                STOP_HOOK => exports.stop = true,
                SETTINGS_PANEL_HOOK => exports.settings_panel = true,
                SETTINGS_HOOK => exports.settings = true,
                _ => {},
            }
        }
        exports
    }
}

/// A compiled, top-level-evaluated plugin script.
pub(crate) struct ScriptUnit {
    plugin_id: AddonId,
    level: PermissionLevel,
    members: Vec<Capability>,
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    exports: Exports,
}

impl std::fmt::Debug for ScriptUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptUnit")
            .field("plugin_id", &self.plugin_id)
            .field("level", &self.level)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

fn sandboxed_engine(plugin_id: &AddonId, limits: ScriptLimits) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);

    let id = plugin_id.clone();
    engine.on_print(move |text| info!(plugin = %id, "{text}"));
    let id = plugin_id.clone();
    engine.on_debug(move |text, source, pos| {
        debug!(plugin = %id, source = source.unwrap_or(""), position = %pos, "{text}");
    });
    engine
}

impl ScriptUnit {
    /// Compile `source`, install `graph`, and run the top level.
    ///
    /// On success `cell` is pointed at the new unit so callbacks registered
    /// during the run can reach it later.
    pub(crate) fn load(
        plugin_id: &AddonId,
        source: &str,
        graph: CapabilityGraph,
        limits: ScriptLimits,
        cell: &UnitCell,
    ) -> AddonResult<Arc<Self>> {
        let level = graph.level();
        let members = graph.members();
        let mut engine = sandboxed_engine(plugin_id, limits);
        graph.install(&mut engine);

        let ast = engine
            .compile(source)
            .map_err(|e| AddonError::CompileFailed {
                plugin_id: plugin_id.clone(),
                message: e.to_string(),
            })?;

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| map_script_error(plugin_id, level, &members, &e, "load"))?;

        let exports = Exports::from_ast(&ast);
        debug!(plugin = %plugin_id, ?exports, "Plugin script evaluated");

        let unit = Arc::new(Self {
            plugin_id: plugin_id.clone(),
            level,
            members,
            engine,
            ast,
            scope,
            exports,
        });
        // A fresh cell is used per load, so this only fails if a caller reuses one.
        let _ = cell.set(Arc::downgrade(&unit));
        Ok(unit)
    }

    pub(crate) fn exports(&self) -> Exports {
        self.exports
    }

    pub(crate) fn members(&self) -> &[Capability] {
        &self.members
    }

    /// Call a zero-argument script function.
    ///
    /// Calling a hook the script does not define returns `()`.
    pub(crate) fn call_hook(&self, name: &str) -> AddonResult<Dynamic> {
        if !self.defines(name) {
            return Ok(Dynamic::UNIT);
        }
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let mut scope = self.scope.clone();
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, name, ())
            .map_err(|e| map_script_error(&self.plugin_id, self.level, &self.members, &e, name))
    }

    fn defines(&self, name: &str) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == name && f.params.is_empty())
    }
}

/// Namespace of a qualified call that could not be resolved, if that is
/// what `err` ultimately is.
fn unresolved_namespace(err: &EvalAltResult) -> Option<String> {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => unresolved_namespace(inner),
        EvalAltResult::ErrorModuleNotFound(name, _) => Some(name.trim().to_string()),
        EvalAltResult::ErrorFunctionNotFound(signature, _) => signature
            .split_once("::")
            .map(|(namespace, _)| namespace.trim().to_string()),
        _ => None,
    }
}

fn map_script_error(
    plugin_id: &AddonId,
    level: PermissionLevel,
    members: &[Capability],
    err: &EvalAltResult,
    phase: &str,
) -> AddonError {
    if let Some(namespace) = unresolved_namespace(err)
        && namespace != "addon"
        && !members.iter().any(|c| c.as_str() == namespace)
    {
        return AddonError::CapabilityUnavailable {
            plugin_id: plugin_id.clone(),
            capability: namespace,
            level,
        };
    }
    AddonError::ScriptFailed {
        plugin_id: plugin_id.clone(),
        phase: phase.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityContext, OwnedStyles, PluginDirectory, PluginSummary};
    use crate::descriptor::{AddonDescriptor, AddonKind};
    use crate::memory::{MemoryAddonFs, MemorySurface};
    use crate::state::{AddonState, StateStore};

    struct NoPlugins;

    impl PluginDirectory for NoPlugins {
        fn describe(&self, _id: &AddonId) -> Option<PluginSummary> {
            None
        }

        fn describe_all(&self) -> Vec<PluginSummary> {
            Vec::new()
        }

        fn is_enabled(&self, _id: &AddonId) -> bool {
            false
        }
    }

    fn descriptor(id: &str) -> AddonDescriptor {
        AddonDescriptor {
            id: AddonId::from_static(id),
            name: id.to_string(),
            author: "tests".into(),
            version: "1.2.3".into(),
            description: String::new(),
            source_url: None,
            website: None,
            location: format!("/memory/plugins/{id}/main.rhai").into(),
            kind: AddonKind::Plugin,
            variables: Vec::new(),
        }
    }

    type Loaded = (AddonResult<Arc<ScriptUnit>>, Arc<MemorySurface>, Arc<StateStore>);

    fn load(source: &str, level: PermissionLevel) -> Loaded {
        let fs = Arc::new(MemoryAddonFs::new());
        let store = Arc::new(StateStore::with_state(fs, AddonState::default()));
        let surface = Arc::new(MemorySurface::new());
        let ctx = CapabilityContext {
            descriptor: descriptor("sample"),
            level,
            store: Arc::clone(&store),
            surface: surface.clone(),
            directory: Arc::new(NoPlugins),
            unit: UnitCell::default(),
            styles: OwnedStyles::default(),
        };
        let graph = CapabilityGraph::build(&ctx);
        let unit = ScriptUnit::load(
            &ctx.descriptor.id,
            source,
            graph,
            ScriptLimits::default(),
            &ctx.unit,
        );
        (unit, surface, store)
    }

    #[test]
    fn detects_exports() {
        let (unit, ..) = load(
            "fn start() {} fn settings() { [] } fn helper(x) { x }",
            PermissionLevel::Limited,
        );
        let exports = unit.unwrap().exports();
        assert!(exports.start);
        assert!(!exports.stop);
        assert!(exports.settings);
        assert!(!exports.settings_panel);
    }

    #[test]
    fn hooks_reach_granted_services() {
        let (unit, surface, store) = load(
            r#"fn start() { settings::set("runs", 1); notify::toast("hi " + addon::id); }"#,
            PermissionLevel::Limited,
        );
        unit.unwrap().call_hook(START_HOOK).unwrap();
        assert_eq!(surface.toasts(), vec!["hi sample".to_string()]);
        let id = AddonId::from_static("sample");
        assert_eq!(
            store.read(|s| s.setting(&id, "runs").cloned()),
            Some(serde_json::json!(1))
        );
        assert!(store.is_dirty());
    }

    #[test]
    fn ungranted_namespace_is_a_capability_error() {
        let (unit, ..) = load("fn start() { plugins::get_all() }", PermissionLevel::Limited);
        let err = unit.unwrap().call_hook(START_HOOK).unwrap_err();
        match err {
            AddonError::CapabilityUnavailable {
                capability, level, ..
            } => {
                assert_eq!(capability, "plugins");
                assert_eq!(level, PermissionLevel::Limited);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn top_level_throw_fails_load() {
        let (unit, ..) = load(r#"throw "boom";"#, PermissionLevel::Full);
        assert!(matches!(unit, Err(AddonError::ScriptFailed { .. })));
    }

    #[test]
    fn syntax_error_fails_compile() {
        let (unit, ..) = load("fn start( {", PermissionLevel::Full);
        assert!(matches!(unit, Err(AddonError::CompileFailed { .. })));
    }

    #[test]
    fn eval_is_disabled() {
        let (unit, ..) = load(r#"eval("1 + 1");"#, PermissionLevel::Full);
        assert!(unit.is_err());
    }

    #[test]
    fn runaway_loops_hit_the_operation_budget() {
        let (unit, ..) = load("fn start() { loop {} }", PermissionLevel::Limited);
        let err = unit.unwrap().call_hook(START_HOOK).unwrap_err();
        assert!(matches!(err, AddonError::ScriptFailed { .. }));
    }

    #[test]
    fn missing_hook_is_a_no_op() {
        let (unit, ..) = load("let x = 1;", PermissionLevel::Limited);
        assert!(unit.unwrap().call_hook(STOP_HOOK).unwrap().is_unit());
    }
}
