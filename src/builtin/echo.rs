//! Echo module, used for smoke runs of the binary.
//!
//! Commands:
//! - `echo.say {text}` returns the text with the configured `prefix`
//! - `echo.count` increments a counter kept in the private store
//!
//! Every `echo.ping` event is answered with an `echo.pong` carrying the same
//! payload.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::commbus::Event;
use crate::module::{Capability, Module, ModuleContext, ModuleError, ModuleManifest, ModuleResult};

pub const ECHO_MODULE: &str = "echo";

const COUNT_KEY: &str = "count";

#[derive(Debug, Default)]
pub struct EchoModule {
    ctx: Mutex<Option<ModuleContext>>,
}

impl EchoModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest() -> ModuleManifest {
        let mut manifest = ModuleManifest::new(ECHO_MODULE, env!("CARGO_PKG_VERSION"))
            .with_command(
                "echo.say",
                Some(json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                })),
            )
            .with_command("echo.count", None)
            .with_capability(Capability::EventSubscriber)
            .with_config("prefix", json!(""));
        manifest.description = "Echoes text and answers pings".to_string();
        manifest
    }

    fn context(&self) -> ModuleResult<ModuleContext> {
        self.ctx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| ModuleError::failed("echo module is not initialized"))
    }
}

#[async_trait]
impl Module for EchoModule {
    async fn initialize(&self, ctx: &ModuleContext) -> ModuleResult<()> {
        ctx.subscribe("echo.ping").await?;
        *self.ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ctx.clone());
        tracing::debug!(module_id = %ctx.module_id(), "echo_initialized");
        Ok(())
    }

    async fn shutdown(&self) -> ModuleResult<()> {
        self.ctx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Ok(())
    }

    async fn handle_command(&self, command: &str, args: Value) -> ModuleResult<Value> {
        let ctx = self.context()?;
        match command {
            "echo.say" => {
                let prefix: String = ctx.config().get_as("prefix")?.unwrap_or_default();
                let text = args["text"].as_str().unwrap_or_default();
                Ok(json!({ "text": format!("{}{}", prefix, text) }))
            }
            "echo.count" => {
                let count = ctx.store().get_as::<u64>(COUNT_KEY).await?.unwrap_or(0) + 1;
                ctx.store().set(COUNT_KEY, count).await?;
                Ok(json!({ "count": count }))
            }
            other => Err(ModuleError::failed(format!("unknown command '{}'", other))),
        }
    }

    async fn handle_event(&self, event: &Event) -> ModuleResult<()> {
        let ctx = self.context()?;
        let report = ctx.publish("echo.pong", event.payload.clone()).await;
        if !report.all_delivered() {
            tracing::debug!(failures = report.failures.len(), "echo_pong_partially_delivered");
        }
        Ok(())
    }
}
