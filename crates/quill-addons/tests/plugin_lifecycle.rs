//! Plugin lifecycle against in-memory collaborators.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{Harness, id};
use quill_addons::{AddonError, Capability, PermissionLevel, ReloadOutcome};
use serde_json::json;

const TOASTING: &str = r#"
fn start() { notify::toast("started " + addon::id); }
fn stop() { notify::toast("stopped " + addon::id); }
"#;

#[tokio::test]
async fn tiers_nest_strictly() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);

    let mut graphs = Vec::new();
    for level in PermissionLevel::ALL {
        let name = format!("tier-{level}");
        let descriptor = h.fs.add_plugin(&name, "fn start() {}");
        plugins.set_permission(&descriptor.id, level).await;
        let instance = plugins.load_plugin(descriptor).await.unwrap();
        assert!(instance.loaded, "{level}: {:?}", instance.error);
        assert_eq!(instance.permission, level);
        graphs.push(instance.capabilities.into_iter().collect::<BTreeSet<Capability>>());
    }

    for pair in graphs.windows(2) {
        assert!(pair[0].is_subset(&pair[1]));
        assert!(pair[0].len() < pair[1].len());
    }
    assert!(graphs[0].contains(&Capability::Settings));
    assert!(!graphs[0].contains(&Capability::Ui));
    assert!(graphs[2].contains(&Capability::Plugins));
}

#[tokio::test]
async fn start_then_stop_restores_enabled_list() {
    let h = Harness::new();
    h.fs.set_state(json!({ "enabled_plugins": ["other"] }));
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let descriptor = h.fs.add_plugin("word-count", TOASTING);
    plugins.load_plugin(descriptor).await.unwrap();

    let before = store.snapshot().enabled_plugins;
    assert!(plugins.start_plugin(&id("word-count")).await);
    assert!(plugins.is_enabled(&id("word-count")));
    assert!(h.fs.saved_state().is_plugin_enabled(&id("word-count")));

    assert!(plugins.stop_plugin(&id("word-count")).await);
    assert_eq!(store.snapshot().enabled_plugins, before);
    assert_eq!(h.fs.saved_state().enabled_plugins, before);
    assert_eq!(h.toast_count("started word-count"), 1);
    assert_eq!(h.toast_count("stopped word-count"), 1);
}

#[tokio::test]
async fn start_and_stop_refuse_wrong_states() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin("a", TOASTING))
        .await
        .unwrap();

    assert!(!plugins.stop_plugin(&id("a")).await);
    assert!(plugins.start_plugin(&id("a")).await);
    assert!(!plugins.start_plugin(&id("a")).await);
    assert!(!plugins.start_plugin(&id("missing")).await);
    assert_eq!(h.toast_count("started a"), 1);
}

#[tokio::test]
async fn reload_keeps_plugin_running_new_source() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let descriptor = h
        .fs
        .add_plugin("greeter", r#"fn start() { notify::toast("v1"); }"#);
    let location = descriptor.location.clone();
    plugins.load_plugin(descriptor).await.unwrap();
    assert!(plugins.start_plugin(&id("greeter")).await);

    h.fs
        .write_file(&location, r#"fn start() { notify::toast("v2"); }"#);
    let outcome = plugins.reload_plugin(&id("greeter")).await.unwrap();

    assert_eq!(outcome, ReloadOutcome::Reloaded { active: true });
    assert!(plugins.plugin(&id("greeter")).unwrap().started);
    assert_eq!(h.surface.toasts(), vec!["v1".to_string(), "v2".to_string()]);
    assert!(plugins.is_enabled(&id("greeter")));
}

#[tokio::test]
async fn reload_of_stopped_plugin_stays_stopped() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin("idle", TOASTING))
        .await
        .unwrap();

    let outcome = plugins.reload_plugin(&id("idle")).await.unwrap();
    assert_eq!(outcome, ReloadOutcome::Reloaded { active: false });
    assert!(h.surface.toasts().is_empty());
}

#[tokio::test]
async fn throwing_plugin_does_not_block_its_neighbour() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);

    let bad = plugins
        .load_plugin(h.fs.add_plugin("bad", r#"throw "kaboom";"#))
        .await
        .unwrap();
    let good = plugins
        .load_plugin(h.fs.add_plugin("good", TOASTING))
        .await
        .unwrap();

    assert!(!bad.loaded);
    assert!(!bad.started);
    assert!(bad.error.as_deref().is_some_and(|e| e.contains("kaboom")));
    assert!(good.loaded);
    assert!(good.error.is_none());

    assert!(!plugins.start_plugin(&id("bad")).await);
    assert!(plugins.start_plugin(&id("good")).await);
    assert_eq!(plugins.plugins().len(), 2);
}

#[tokio::test]
async fn unreadable_source_is_recorded() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let mut descriptor = h.fs.add_plugin("ghost", "");
    descriptor.location = descriptor.location.with_file_name("elsewhere.rhai");

    let instance = plugins.load_plugin(descriptor).await.unwrap();
    assert!(!instance.loaded);
    assert!(instance.error.is_some());
}

#[tokio::test]
async fn concurrent_reloads_collapse_into_one() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin("busy", TOASTING))
        .await
        .unwrap();
    assert!(plugins.start_plugin(&id("busy")).await);

    let busy = id("busy");
    h.fs.set_read_delay(Some(Duration::from_millis(50)));
    let (first, second) = tokio::join!(
        plugins.reload_plugin(&busy),
        plugins.reload_plugin(&busy)
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ReloadOutcome::Coalesced));

    assert_eq!(
        outcomes,
        vec![ReloadOutcome::Reloaded { active: true }, ReloadOutcome::Coalesced]
    );
    assert_eq!(h.toast_count("stopped busy"), 1);
    assert_eq!(h.toast_count("started busy"), 2);
}

#[tokio::test]
async fn load_while_busy_is_refused() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let descriptor = h.fs.add_plugin("slow", TOASTING);
    plugins.load_plugin(descriptor.clone()).await.unwrap();

    let slow = id("slow");
    h.fs.set_read_delay(Some(Duration::from_millis(50)));
    let (reload, load) = tokio::join!(
        plugins.reload_plugin(&slow),
        plugins.load_plugin(descriptor)
    );
    assert!(reload.is_ok());
    assert!(matches!(load, Err(AddonError::Busy(_))));
}

#[tokio::test]
async fn limited_plugin_reaching_for_plugins_fails_to_start() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let instance = plugins
        .load_plugin(h.fs.add_plugin("snoop", "fn start() { plugins::get_all(); }"))
        .await
        .unwrap();

    assert!(instance.loaded);
    assert_eq!(instance.permission, PermissionLevel::Limited);
    assert!(!plugins.start_plugin(&id("snoop")).await);

    let after = plugins.plugin(&id("snoop")).unwrap();
    assert!(!after.started);
    let error = after.error.unwrap();
    assert!(error.contains("'plugins'"), "{error}");
    assert!(!plugins.is_enabled(&id("snoop")));
}

#[tokio::test]
async fn full_plugin_sees_its_neighbours() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin("quiet", "fn start() {}"))
        .await
        .unwrap();
    plugins.set_permission(&id("inspector"), PermissionLevel::Full).await;
    plugins
        .load_plugin(h.fs.add_plugin(
            "inspector",
            r#"
fn start() {
    let all = plugins::get_all();
    notify::toast("seen " + all.len());
    let quiet = plugins::get("quiet");
    notify::toast("quiet started: " + quiet.started);
}
"#,
        ))
        .await
        .unwrap();

    assert!(plugins.start_plugin(&id("inspector")).await);
    assert_eq!(
        h.surface.toasts(),
        vec!["seen 2".to_string(), "quiet started: false".to_string()]
    );
}

#[tokio::test]
async fn plugin_styles_are_removed_on_stop() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins.set_permission(&id("styler"), PermissionLevel::Partial).await;
    plugins
        .load_plugin(h.fs.add_plugin(
            "styler",
            r#"fn start() { ui::inject_style(".word-count { color: red; }"); }"#,
        ))
        .await
        .unwrap();

    assert!(plugins.start_plugin(&id("styler")).await);
    assert!(h.surface.style_for_key("quill-plugin-styler").is_some());
    assert!(plugins.stop_plugin(&id("styler")).await);
    assert!(h.surface.styles().is_empty());
}

#[tokio::test]
async fn script_settings_are_persisted_after_hooks() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin(
            "counter",
            r#"
fn start() {
    let runs = settings::get("runs") ?? 0;
    settings::set("runs", runs + 1);
}
"#,
        ))
        .await
        .unwrap();

    assert!(plugins.start_plugin(&id("counter")).await);
    assert!(!store.is_dirty());
    assert_eq!(
        h.fs.saved_state().setting(&id("counter"), "runs"),
        Some(&json!(1))
    );
    assert_eq!(plugins.setting(&id("counter"), "runs"), Some(json!(1)));
}

#[tokio::test]
async fn settings_providers() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin(
            "configurable",
            r#"
fn settings_panel() { "<form><input name='goal'></form>" }
fn settings() {
    [
        #{ "key": "goal", "label": "Daily goal", "type": "number", "default": 500 },
        #{ "key": "mode", "kind": "select", "options": ["words", "chars"] },
    ]
}
"#,
        ))
        .await
        .unwrap();
    plugins
        .load_plugin(h.fs.add_plugin("bare", "fn start() {}"))
        .await
        .unwrap();

    let panel = plugins.settings_panel(&id("configurable")).await.unwrap();
    assert!(panel.starts_with("<form>"));
    let defs = plugins.settings_def(&id("configurable")).await;
    assert_eq!(defs.len(), 2);
    assert_eq!(defs[0].key, "goal");
    assert_eq!(defs[0].default, Some(json!(500)));
    assert_eq!(defs[1].options, vec!["words".to_string(), "chars".to_string()]);

    assert!(plugins.settings_panel(&id("bare")).await.is_none());
    assert!(plugins.settings_def(&id("bare")).await.is_empty());
}

#[tokio::test]
async fn vanished_plugin_is_removed_on_reload() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    plugins
        .load_plugin(h.fs.add_plugin("temp", TOASTING))
        .await
        .unwrap();
    assert!(plugins.start_plugin(&id("temp")).await);

    h.fs.remove_addon("temp");
    assert_eq!(
        plugins.reload_plugin(&id("temp")).await.unwrap(),
        ReloadOutcome::Removed
    );
    assert!(plugins.plugin(&id("temp")).is_none());
    assert_eq!(h.toast_count("stopped temp"), 1);
    assert!(matches!(
        plugins.reload_plugin(&id("temp")).await,
        Err(AddonError::NotFound(_))
    ));
}

#[tokio::test]
async fn failed_restart_on_reload_clears_enablement() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let descriptor = h.fs.add_plugin("broken", TOASTING);
    let location = descriptor.location.clone();
    plugins.load_plugin(descriptor).await.unwrap();
    assert!(plugins.start_plugin(&id("broken")).await);

    h.fs.write_file(&location, "fn start( {");
    let outcome = plugins.reload_plugin(&id("broken")).await.unwrap();

    assert_eq!(outcome, ReloadOutcome::Reloaded { active: false });
    let after = plugins.plugin(&id("broken")).unwrap();
    assert!(!after.started);
    assert!(after.error.is_some());
    assert!(!plugins.is_enabled(&id("broken")));
    assert!(!h.fs.saved_state().is_plugin_enabled(&id("broken")));
}

#[tokio::test]
async fn loading_over_running_plugin_clears_enablement() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let descriptor = h.fs.add_plugin("twice", TOASTING);
    plugins.load_plugin(descriptor.clone()).await.unwrap();
    assert!(plugins.start_plugin(&id("twice")).await);

    let instance = plugins.load_plugin(descriptor).await.unwrap();
    assert!(instance.loaded);
    assert!(!instance.started);
    assert_eq!(h.toast_count("stopped twice"), 1);
    assert!(!plugins.is_enabled(&id("twice")));
    assert!(!h.fs.saved_state().is_plugin_enabled(&id("twice")));
}

#[tokio::test]
async fn permission_change_applies_on_reload() {
    let h = Harness::new();
    let store = h.store().await;
    let plugins = h.plugin_manager(&store);
    let before = plugins
        .load_plugin(h.fs.add_plugin("promoted", TOASTING))
        .await
        .unwrap();
    assert!(plugins.start_plugin(&id("promoted")).await);

    plugins.set_permission(&id("promoted"), PermissionLevel::Full).await;
    let running = plugins.plugin(&id("promoted")).unwrap();
    assert_eq!(running.permission, PermissionLevel::Limited);
    assert_eq!(running.capabilities, before.capabilities);
    assert!(!running.capabilities.contains(&Capability::Plugins));

    assert_eq!(
        plugins.reload_plugin(&id("promoted")).await.unwrap(),
        ReloadOutcome::Reloaded { active: true }
    );
    let reloaded = plugins.plugin(&id("promoted")).unwrap();
    assert_eq!(reloaded.permission, PermissionLevel::Full);
    assert!(reloaded.capabilities.contains(&Capability::Plugins));
    assert!(reloaded.started);
}
