//! Directory discovery, manifest validation and dependency-ordered loading.

use std::path::Path;

use agentry_core::kernel::audit::AuditKind;
use agentry_core::kernel::types::{AdminStatus, ModuleState};
use agentry_core::module::testing::{Behavior, ModuleScript, ScriptedModule};
use agentry_core::module::MANIFEST_FILE;
use agentry_core::{Config, Runtime};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Helper: write `<root>/<dir>/module.json`.
fn write_manifest(root: &Path, dir: &str, manifest: &Value) {
    let module_dir = root.join(dir);
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(
        module_dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
}

fn config_for(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.module_dirs = vec![dir.path().join("plugins")];
    config.paths.data_dir = dir.path().join("data");
    config.paths.config_dir = dir.path().join("config");
    config
}

fn scripted(command: &str) -> ScriptedModule {
    ScriptedModule::new(ModuleScript::new().command(command, Behavior::Version))
}

#[tokio::test]
async fn test_invalid_manifests_are_excluded_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_manifest(
        &plugins,
        "clock",
        &json!({
            "name": "clock",
            "version": "1.2.0",
            "description": "tells time",
            "capabilities": ["command_provider"],
            "commands": [{ "name": "clock.now" }]
        }),
    );
    write_manifest(&plugins, "broken", &json!({ "name": "broken", "version": "not-semver" }));
    write_manifest(
        &plugins,
        "future",
        &json!({ "name": "future", "version": "1.0.0", "host_version": ">=99.0.0" }),
    );
    write_manifest(
        &plugins,
        "sneaky",
        &json!({ "name": "sneaky", "version": "1.0.0", "commands": [{ "name": "sneaky.run" }] }),
    );
    std::fs::create_dir_all(plugins.join("garbage")).unwrap();
    std::fs::write(plugins.join("garbage").join(MANIFEST_FILE), "{ not json").unwrap();

    let clock = scripted("clock.now");
    let rt = Runtime::builder(config_for(&dir))
        .with_module_fn("clock", move |_| clock.clone())
        .build()
        .unwrap();

    let report = rt.discover().await;
    assert_eq!(report.added, vec!["clock".to_string()]);
    assert_eq!(report.rejected.len(), 4);

    let modules = rt.list_modules().await;
    let invalid: Vec<&str> = modules
        .iter()
        .filter(|m| !m.validated)
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(invalid.len(), 4);
    assert!(invalid.contains(&"broken"));
    assert!(invalid.contains(&"sneaky"));
    let sneaky = modules.iter().find(|m| m.name == "sneaky").unwrap();
    assert!(sneaky
        .validation_error
        .as_deref()
        .unwrap()
        .contains("command_provider"));

    let rejections = rt
        .audit()
        .query(|e| matches!(e.kind, AuditKind::DiscoveryRejected { .. }));
    assert_eq!(rejections.len(), 4);

    // The valid module is unaffected
    assert!(rt.load_module("clock").await.is_ok());
    let reply = rt.invoke("clock.now", json!({})).await.unwrap();
    assert_eq!(reply["version"], "1.2.0");
    assert_eq!(rt.load_module("broken").await.status, AdminStatus::NotFound);
}

#[tokio::test]
async fn test_dependency_order_and_refusal() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_manifest(
        &plugins,
        "storage",
        &json!({
            "name": "storage",
            "version": "1.4.0",
            "capabilities": ["command_provider"],
            "commands": [{ "name": "storage.get" }]
        }),
    );
    write_manifest(
        &plugins,
        "reports",
        &json!({
            "name": "reports",
            "version": "0.3.0",
            "capabilities": ["command_provider"],
            "commands": [{ "name": "reports.build" }],
            "dependencies": { "storage": "^1.2" }
        }),
    );

    let storage = scripted("storage.get");
    let reports = scripted("reports.build");
    let rt = Runtime::builder(config_for(&dir))
        .with_module_fn("storage", move |_| storage.clone())
        .with_module_fn("reports", move |_| reports.clone())
        .build()
        .unwrap();
    rt.discover().await;

    // Dependency not running yet: refused, instance untouched
    let refused = rt.load_module("reports").await;
    assert_eq!(refused.status, AdminStatus::Invalid);
    assert_eq!(refused.state, None);

    let outcomes = rt.load_all().await;
    let order: Vec<&str> = outcomes.iter().map(|o| o.module.as_str()).collect();
    assert_eq!(order, vec!["storage", "reports"]);
    assert!(outcomes.iter().all(|o| o.is_ok()), "{:?}", outcomes);
}

#[tokio::test]
async fn test_missing_factory_quarantines() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        &dir.path().join("plugins"),
        "orphan",
        &json!({ "name": "orphan", "version": "1.0.0", "entry": "nowhere" }),
    );
    let rt = Runtime::builder(config_for(&dir)).build().unwrap();
    rt.discover().await;

    let outcome = rt.load_module("orphan").await;
    assert!(!outcome.is_ok());
    assert_eq!(outcome.state, Some(ModuleState::Quarantined));
    let row = rt
        .list_modules()
        .await
        .into_iter()
        .find(|m| m.name == "orphan")
        .unwrap();
    assert!(row.last_error.unwrap().contains("nowhere"));
}

#[tokio::test]
async fn test_private_store_persists_across_unload() {
    let dir = tempfile::tempdir().unwrap();
    let rt = agentry_core::builtin::install(Runtime::builder(config_for(&dir)))
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("echo").await.is_ok());

    rt.invoke("echo.count", json!({})).await.unwrap();
    assert!(rt.unload_module("echo").await.is_ok());

    let raw = std::fs::read_to_string(dir.path().join("data/modules/echo/store.json")).unwrap();
    let stored: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored["count"], 1);

    assert!(rt.load_module("echo").await.is_ok());
    let again = rt.invoke("echo.count", json!({})).await.unwrap();
    assert_eq!(again["count"], 2);
}
