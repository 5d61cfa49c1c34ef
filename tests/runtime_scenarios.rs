//! End-to-end runtime scenarios: upgrade/reload and failed reload, deadlock
//! isolation, single-flight serialization, unload revocation, threshold
//! quarantine and permission gating.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agentry_core::capability::{HostPolicy, Permission};
use agentry_core::kernel::audit::AuditKind;
use agentry_core::kernel::dispatcher::{FailureCause, Task};
use agentry_core::kernel::types::{AdminStatus, ModuleState};
use agentry_core::module::testing::{Behavior, ModuleScript, ScriptedModule};
use agentry_core::module::{
    MemorySource, Module, ModuleContext, ModuleDescriptor, ModuleError, ModuleManifest, ModuleResult,
};
use agentry_core::{Config, Error, Runtime, RuntimeBuilder};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Helper: config rooted in a temp dir with no directory sources.
fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.module_dirs.clear();
    config.paths.data_dir = dir.path().join("data");
    config.paths.config_dir = dir.path().join("config");
    config
}

/// Helper: builder with one scripted module registered under `name`.
fn with_scripted(builder: RuntimeBuilder, name: &str, manifest: ModuleManifest, module: &ScriptedModule) -> RuntimeBuilder {
    let module = module.clone();
    builder
        .with_manifest(manifest)
        .with_module_fn(name, move |_| module.clone())
}

#[tokio::test]
async fn test_pending_upgrade_then_reload_promotes() {
    let dir = tempfile::tempdir().unwrap();
    let script = ModuleScript::new().command("weather.current", Behavior::Version);
    let source = MemorySource::new("weather").with_manifest(script.manifest("weather", "1.0.0"));
    let module = ScriptedModule::new(script.clone());
    let probe = module.probe();

    let rt = Runtime::builder(test_config(&dir))
        .with_source(Box::new(source.clone()))
        .with_module_fn("weather", move |_| module.clone())
        .build()
        .unwrap();

    rt.discover().await;
    assert!(rt.load_module("weather").await.is_ok());
    let v1 = rt.invoke("weather.current", json!({})).await.unwrap();
    assert_eq!(v1["version"], "1.0.0");

    // v2 shows up while v1 runs: queued, not applied
    source.insert(script.manifest("weather", "2.0.0"));
    let report = rt.discover().await;
    assert_eq!(report.pending_upgrade, vec!["weather".to_string()]);
    assert_eq!(rt.state_of("weather").await, Some(ModuleState::Running));
    assert_eq!(rt.invoke("weather.current", json!({})).await.unwrap()["version"], "1.0.0");

    let row = rt
        .list_modules()
        .await
        .into_iter()
        .find(|m| m.name == "weather")
        .unwrap();
    assert_eq!(row.version.as_deref(), Some("1.0.0"));
    assert_eq!(row.pending_upgrade.as_deref(), Some("2.0.0"));

    let reloaded = rt.reload_module("weather").await;
    assert!(reloaded.is_ok(), "{:?}", reloaded);
    assert_eq!(rt.invoke("weather.current", json!({})).await.unwrap()["version"], "2.0.0");

    assert_eq!(probe.initialized(), 2);
    assert_eq!(probe.shutdowns(), 1);
    let row = rt
        .list_modules()
        .await
        .into_iter()
        .find(|m| m.name == "weather")
        .unwrap();
    assert_eq!(row.version.as_deref(), Some("2.0.0"));
    assert_eq!(row.pending_upgrade, None);
    assert_eq!(row.commands, vec!["weather.current".to_string()]);
}

#[tokio::test]
async fn test_failed_reload_quarantines_without_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let script = ModuleScript::new().command("weather.current", Behavior::Version);
    let broken_script = script
        .clone()
        .init_delay(Duration::from_millis(150))
        .init_error("bad config");
    let source = MemorySource::new("weather").with_manifest(script.manifest("weather", "1.0.0"));
    let v1 = ScriptedModule::new(script.clone());
    let v2 = ScriptedModule::new(broken_script);

    let rt = Runtime::builder(test_config(&dir))
        .with_source(Box::new(source.clone()))
        .with_module_fn("weather", move |descriptor: &ModuleDescriptor| {
            if descriptor.version.major >= 2 {
                v2.clone()
            } else {
                v1.clone()
            }
        })
        .build()
        .unwrap();

    rt.discover().await;
    assert!(rt.load_module("weather").await.is_ok());
    assert_eq!(rt.invoke("weather.current", json!({})).await.unwrap()["version"], "1.0.0");

    source.insert(script.manifest("weather", "2.0.0"));
    assert_eq!(rt.discover().await.pending_upgrade, vec!["weather".to_string()]);

    let reload = tokio::spawn({
        let rt = rt.clone();
        async move { rt.reload_module("weather").await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Parked behind the reload; released with nothing registered
    let parked = rt.invoke("weather.current", json!({})).await;
    assert!(matches!(parked, Err(Error::NotFound(_))), "{:?}", parked);

    let outcome = reload.await.unwrap();
    assert!(!outcome.is_ok());
    assert_eq!(outcome.state, Some(ModuleState::Quarantined));
    assert_eq!(rt.state_of("weather").await, Some(ModuleState::Quarantined));

    // v1 is not restored
    let err = rt.invoke("weather.current", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{:?}", err);
    let row = rt
        .list_modules()
        .await
        .into_iter()
        .find(|m| m.name == "weather")
        .unwrap();
    assert_eq!(row.state, ModuleState::Quarantined);
    assert_eq!(row.version.as_deref(), Some("2.0.0"));
    assert!(row.commands.is_empty());
    assert!(row.last_error.as_deref().unwrap_or_default().contains("bad config"), "{:?}", row.last_error);

    let outcome = rt.unload_module("weather").await;
    assert_eq!(outcome.state, Some(ModuleState::Unloaded));
}

#[tokio::test]
async fn test_hung_handler_is_deadlock_while_other_task_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.monitor.interval = Duration::from_millis(10);
    config.monitor.stall_threshold = Duration::from_millis(80);

    let stuck_script = ModuleScript::new().command("stuck.wait", Behavior::Hang);
    let fast_script = ModuleScript::new()
        .command("fast.ping", Behavior::Reply(json!("pong")))
        .handler_delay(Duration::from_millis(20));
    let stuck = ScriptedModule::new(stuck_script.clone());
    let fast = ScriptedModule::new(fast_script.clone());

    let builder = Runtime::builder(config);
    let builder = with_scripted(builder, "stuck", stuck_script.manifest("stuck", "1.0.0"), &stuck);
    let builder = with_scripted(builder, "fast", fast_script.manifest("fast", "1.0.0"), &fast);
    let rt = builder.build().unwrap();
    rt.discover().await;
    rt.load_all().await;
    rt.start_monitor().await;

    let hung = rt
        .submit(Task::new("hung").invoke("stuck.wait", json!({})))
        .await
        .unwrap();
    let mut busy = Task::new("busy");
    for _ in 0..6 {
        busy = busy.invoke("fast.ping", json!({}));
    }
    let busy = rt.submit(busy).await.unwrap();

    let busy = tokio::time::timeout(Duration::from_secs(5), busy.join())
        .await
        .unwrap()
        .unwrap();
    assert!(busy.completed(), "{:?}", busy.failure);
    assert_eq!(busy.steps.len(), 6);

    let hung_id = hung.id().clone();
    let hung = tokio::time::timeout(Duration::from_secs(5), hung.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hung.cause(), Some(FailureCause::Deadlock));

    rt.stop_monitor().await;

    // Deadlock is module-agnostic: the module keeps running
    assert_eq!(rt.state_of("stuck").await, Some(ModuleState::Running));
    let recorded = rt.audit().for_task(&hung_id);
    assert!(recorded.iter().any(|e| matches!(
        &e.kind,
        AuditKind::TaskFinished { ok: false, cause: Some(cause), .. } if cause == "deadlock"
    )));
}

#[tokio::test]
async fn test_single_flight_serializes_calls() {
    let dir = tempfile::tempdir().unwrap();
    let delay = Duration::from_millis(50);

    let serial_script = ModuleScript::new()
        .command("serial.work", Behavior::Echo)
        .handler_delay(delay);
    let parallel_script = ModuleScript::new()
        .command("parallel.work", Behavior::Echo)
        .handler_delay(delay);
    let serial = ScriptedModule::new(serial_script.clone());
    let parallel = ScriptedModule::new(parallel_script.clone());

    let builder = Runtime::builder(test_config(&dir));
    let builder = with_scripted(
        builder,
        "serial",
        serial_script.manifest("serial", "1.0.0").single_flight(),
        &serial,
    );
    let builder = with_scripted(builder, "parallel", parallel_script.manifest("parallel", "1.0.0"), &parallel);
    let rt = builder.build().unwrap();
    rt.discover().await;
    rt.load_all().await;

    let started = Instant::now();
    let calls = (0..4).map(|i| rt.invoke("serial.work", json!({ "i": i })));
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
    let serial_elapsed = started.elapsed();
    assert_eq!(serial.probe().max_concurrency(), 1);
    assert!(serial_elapsed >= delay * 4, "{:?}", serial_elapsed);

    let calls = (0..4).map(|i| rt.invoke("parallel.work", json!({ "i": i })));
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
    assert!(parallel.probe().max_concurrency() >= 2);
}

#[tokio::test]
async fn test_unload_revokes_commands_and_subscriptions() {
    let dir = tempfile::tempdir().unwrap();
    let script = ModuleScript::new()
        .command("notes.add", Behavior::Echo)
        .on_event("notes.changed");
    let module = ScriptedModule::new(script.clone());
    let probe = module.probe();

    let rt = with_scripted(Runtime::builder(test_config(&dir)), "notes", script.manifest("notes", "1.0.0"), &module)
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("notes").await.is_ok());

    rt.invoke("notes.add", json!({"text": "a"})).await.unwrap();
    assert_eq!(rt.publish("notes.changed", json!({})).await.delivered, 1);
    assert_eq!(probe.events().len(), 1);

    let outcome = rt.unload_module("notes").await;
    assert!(outcome.is_ok());
    assert_eq!(outcome.state, Some(ModuleState::Unloaded));

    let err = rt.invoke("notes.add", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{:?}", err);
    assert_eq!(rt.publish("notes.changed", json!({})).await.delivered, 0);
    assert_eq!(probe.events().len(), 1);
    assert_eq!(probe.shutdowns(), 1);
}

#[tokio::test]
async fn test_failure_threshold_quarantines_module() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.monitor.failure_threshold = 3;

    let script = ModuleScript::new()
        .command("flaky.call", Behavior::Fail("upstream down".into()))
        .on_event("flaky.poke");
    let module = ScriptedModule::new(script.clone());
    let probe = module.probe();
    let rt = with_scripted(Runtime::builder(config), "flaky", script.manifest("flaky", "1.0.0"), &module)
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("flaky").await.is_ok());

    for _ in 0..2 {
        let err = rt.invoke("flaky.call", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }
    assert!(rt.sweep().await.quarantined.is_empty());

    rt.invoke("flaky.call", json!({})).await.unwrap_err();
    let report = rt.sweep().await;
    assert_eq!(report.quarantined, vec!["flaky".to_string()]);
    assert_eq!(rt.state_of("flaky").await, Some(ModuleState::Quarantined));

    // Rows are gone; nothing reaches the module
    assert!(matches!(rt.invoke("flaky.call", json!({})).await, Err(Error::NotFound(_))));
    assert_eq!(rt.publish("flaky.poke", json!({})).await.delivered, 0);
    assert!(probe.events().is_empty());

    // No auto-recovery: another sweep leaves it alone, only an explicit
    // request moves it out
    assert!(rt.sweep().await.quarantined.is_empty());
    assert_eq!(rt.load_module("flaky").await.status, AdminStatus::Invalid);
    let reloaded = rt.reload_module("flaky").await;
    assert!(reloaded.is_ok(), "{:?}", reloaded);
    assert_eq!(rt.state_of("flaky").await, Some(ModuleState::Running));
    assert_eq!(rt.health("flaky").await.unwrap().consecutive_failures, 0);
}

/// Module that calls the model facade from a command.
#[derive(Debug, Default)]
struct Asker {
    ctx: Mutex<Option<ModuleContext>>,
}

#[async_trait]
impl Module for Asker {
    async fn initialize(&self, ctx: &ModuleContext) -> ModuleResult<()> {
        *self.ctx.lock().unwrap() = Some(ctx.clone());
        Ok(())
    }

    async fn handle_command(&self, _command: &str, args: Value) -> ModuleResult<Value> {
        let ctx = self
            .ctx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ModuleError::failed("not initialized"))?;
        let prompt = args["prompt"].as_str().unwrap_or_default().to_string();
        let answer = ctx.facade().query_model(&prompt, json!({})).await?;
        Ok(json!(answer))
    }
}

#[tokio::test]
async fn test_undeclared_permission_denied_module_unaffected() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::builder(test_config(&dir))
        .with_manifest(ModuleManifest::new("asker", "1.0.0").with_command("asker.ask", None))
        .with_module_fn("asker", |_| Asker::default())
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("asker").await.is_ok());

    let err = rt.invoke("asker.ask", json!({"prompt": "hi"})).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{:?}", err);
    assert_eq!(rt.state_of("asker").await, Some(ModuleState::Running));
    assert_eq!(rt.health("asker").await.unwrap().consecutive_failures, 0);
    assert!(rt
        .audit()
        .for_module("asker")
        .iter()
        .any(|e| matches!(e.kind, AuditKind::PermissionDenied { permission: Permission::ModelAccess, .. })));
}

#[tokio::test]
async fn test_host_blocked_permission_quarantines_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.policy = HostPolicy::default().block(Permission::CommandExecution);

    let rt = Runtime::builder(config)
        .with_manifest(
            ModuleManifest::new("shell", "1.0.0")
                .with_command("shell.run", None)
                .with_permission(Permission::CommandExecution),
        )
        .with_module_fn("shell", |_| Asker::default())
        .build()
        .unwrap();
    rt.discover().await;

    let outcome = rt.load_module("shell").await;
    assert_eq!(outcome.status, AdminStatus::PermissionError);
    assert_eq!(outcome.state, Some(ModuleState::Quarantined));
    assert!(matches!(rt.invoke("shell.run", json!({})).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_concurrent_registration_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let a_script = ModuleScript::new().command("shared.name", Behavior::Reply(json!("a")));
    let b_script = ModuleScript::new().command("shared.name", Behavior::Reply(json!("b")));
    let a = ScriptedModule::new(a_script.clone());
    let b = ScriptedModule::new(b_script.clone());

    let builder = Runtime::builder(test_config(&dir));
    let builder = with_scripted(builder, "alpha", a_script.manifest("alpha", "1.0.0"), &a);
    let builder = with_scripted(builder, "beta", b_script.manifest("beta", "1.0.0"), &b);
    let rt = builder.build().unwrap();
    rt.discover().await;

    let (first, second) = tokio::join!(rt.load_module("alpha"), rt.load_module("beta"));
    let oks = [&first, &second].iter().filter(|o| o.is_ok()).count();
    assert_eq!(oks, 1, "{:?} / {:?}", first, second);

    let loser = if first.is_ok() { &second } else { &first };
    assert_eq!(loser.state, Some(ModuleState::Quarantined));
    let winner_reply = rt.invoke("shared.name", json!({})).await.unwrap();
    let expected = if first.is_ok() { json!("a") } else { json!("b") };
    assert_eq!(winner_reply, expected);
}

#[tokio::test]
async fn test_event_delivery_in_subscription_order() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::builder(test_config(&dir)).build().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["h1", "h2"] {
        let order = order.clone();
        rt.subscribe(
            "ordered",
            Arc::new(move |_event: agentry_core::commbus::Event| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(tag);
                    Ok::<(), Error>(())
                }
            }),
        )
        .await
        .unwrap();
    }

    let report = rt.publish("ordered", json!({})).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(*order.lock().unwrap(), vec!["h1", "h2"]);
}

#[tokio::test]
async fn test_unload_with_slow_shutdown_reports_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.timeouts.lifecycle = Duration::from_millis(50);

    let script = ModuleScript::new()
        .command("slow.x", Behavior::Echo)
        .shutdown_delay(Duration::from_millis(500));
    let module = ScriptedModule::new(script.clone());
    let rt = with_scripted(Runtime::builder(config), "slow", script.manifest("slow", "1.0.0"), &module)
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("slow").await.is_ok());

    let outcome = rt.unload_module("slow").await;
    assert_eq!(outcome.status, AdminStatus::Timeout);
    assert_eq!(outcome.state, Some(ModuleState::Unloaded));
    assert!(matches!(rt.invoke("slow.x", json!({})).await, Err(Error::NotFound(_))));
}

/// Single-flight module whose slow handler is a closure registered from
/// `initialize`, counting every call that reaches it.
#[derive(Debug, Default, Clone)]
struct SlowCounter {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Module for SlowCounter {
    async fn initialize(&self, ctx: &ModuleContext) -> ModuleResult<()> {
        let hits = self.hits.clone();
        let handler = move |_args: Value| {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<Value, Error>(json!(n))
            }
        };
        ctx.register_handler("counter.work", Arc::new(handler)).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_unload_withdraws_queued_single_flight_caller() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.timeouts.unregister_grace = Duration::from_millis(50);

    let counter = SlowCounter::default();
    let hits = counter.hits.clone();
    let rt = Runtime::builder(config)
        .with_manifest(
            ModuleManifest::new("counter", "1.0.0")
                .with_command("counter.work", None)
                .single_flight(),
        )
        .with_module_fn("counter", move |_| counter.clone())
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("counter").await.is_ok());

    let first = tokio::spawn({
        let rt = rt.clone();
        async move { rt.invoke("counter.work", json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let queued = tokio::spawn({
        let rt = rt.clone();
        async move { rt.invoke("counter.work", json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Grace runs out while the first call still holds the lane
    let outcome = rt.unload_module("counter").await;
    assert_eq!(outcome.state, Some(ModuleState::Unloaded));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(first.await.unwrap().unwrap(), json!(1));
    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{:?}", err);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hang_is_deadlock_before_handler_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.timeouts.handler = Duration::from_millis(300);
    config.monitor.stall_threshold = Duration::from_millis(100);
    config.monitor.interval = Duration::from_millis(10);
    config.validate().unwrap();

    let script = ModuleScript::new().command("stuck.wait", Behavior::Hang);
    let module = ScriptedModule::new(script.clone());
    let rt = with_scripted(Runtime::builder(config), "stuck", script.manifest("stuck", "1.0.0"), &module)
        .build()
        .unwrap();
    rt.discover().await;
    assert!(rt.load_module("stuck").await.is_ok());
    rt.start_monitor().await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        rt.run_task(Task::new("hung").invoke("stuck.wait", json!({}))),
    )
    .await
    .unwrap()
    .unwrap();
    rt.stop_monitor().await;

    assert_eq!(outcome.cause(), Some(FailureCause::Deadlock), "{:?}", outcome.failure);
    assert_eq!(rt.state_of("stuck").await, Some(ModuleState::Running));
}
