//! Capability-gated facade over external collaborators.
//!
//! Modules never talk to model providers, the OS, speech engines, the
//! filesystem or the network directly. Every facade call authorizes against
//! the gateway and the instance's grant first; a denial is audited and
//! surfaced as `Error::PermissionDenied`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::gateway::{denied, CapabilityGateway, Decision, DenyReason, PermissionGrant};
use crate::capability::Permission;
use crate::kernel::audit::{AuditKind, AuditLog, AuditScope};
use crate::module::ModuleDescriptor;
use crate::types::{Error, ModuleId, Result};

// =============================================================================
// Collaborator interfaces
// =============================================================================

/// Language model provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn query(&self, prompt: &str, options: Value) -> Result<String>;
}

/// Output of an OS command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Desktop/OS command execution.
#[async_trait]
pub trait OsCommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Text-to-speech.
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    async fn speak(&self, text: &str) -> Result<()>;
}

/// Speech-to-text.
#[async_trait]
pub trait SpeechInput: Send + Sync {
    async fn listen(&self, max_duration: Duration) -> Result<String>;
}

/// Outbound HTTP.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<String>;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl OsCommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// `reqwest`-backed network client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[async_trait]
impl NetworkClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::handler(format!("GET {} failed: {}", url, e)))?;
        let response = response
            .error_for_status()
            .map_err(|e| Error::handler(format!("GET {} failed: {}", url, e)))?;
        response
            .text()
            .await
            .map_err(|e| Error::handler(format!("GET {} body: {}", url, e)))
    }
}

/// Providers attached by the host. Model and speech providers are external
/// and absent unless attached.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Option<Arc<dyn ModelProvider>>,
    pub os: Arc<dyn OsCommandRunner>,
    pub speech_out: Option<Arc<dyn SpeechOutput>>,
    pub speech_in: Option<Arc<dyn SpeechInput>>,
    pub network: Arc<dyn NetworkClient>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            model: None,
            os: Arc::new(ProcessRunner),
            speech_out: None,
            speech_in: None,
            network: Arc::new(ReqwestClient::default()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("model", &self.model.is_some())
            .field("speech_out", &self.speech_out.is_some())
            .field("speech_in", &self.speech_in.is_some())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn with_model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_os(mut self, os: Arc<dyn OsCommandRunner>) -> Self {
        self.os = os;
        self
    }

    pub fn with_speech(
        mut self,
        output: Option<Arc<dyn SpeechOutput>>,
        input: Option<Arc<dyn SpeechInput>>,
    ) -> Self {
        self.speech_out = output;
        self.speech_in = input;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkClient>) -> Self {
        self.network = network;
        self
    }
}

// =============================================================================
// Facade
// =============================================================================

/// Capability-checked entry point handed to one module instance.
#[derive(Clone, Debug)]
pub struct Facade {
    module_id: ModuleId,
    descriptor: Arc<ModuleDescriptor>,
    grant: Arc<PermissionGrant>,
    gateway: Arc<CapabilityGateway>,
    collaborators: Arc<Collaborators>,
    audit: Arc<AuditLog>,
}

impl Facade {
    pub fn new(
        module_id: ModuleId,
        descriptor: Arc<ModuleDescriptor>,
        grant: Arc<PermissionGrant>,
        gateway: Arc<CapabilityGateway>,
        collaborators: Arc<Collaborators>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            module_id,
            descriptor,
            grant,
            gateway,
            collaborators,
            audit,
        }
    }

    /// Gateway decision plus instance grant membership.
    pub fn check(&self, permission: Permission) -> Result<()> {
        let reason = match self.gateway.authorize(&self.descriptor, permission) {
            Decision::Denied(reason) => Some(reason),
            Decision::Granted if !self.grant.contains(permission) => Some(DenyReason::NotGranted),
            Decision::Granted => None,
        };
        match reason {
            None => Ok(()),
            Some(reason) => {
                tracing::warn!(
                    module = %self.descriptor.name,
                    permission = %permission,
                    reason = %reason,
                    "permission_denied"
                );
                self.audit.record(
                    AuditScope::module(&self.module_id, &self.descriptor.name),
                    AuditKind::PermissionDenied { permission, reason },
                );
                Err(denied(&self.descriptor.name, permission, reason))
            }
        }
    }

    pub async fn query_model(&self, prompt: &str, options: Value) -> Result<String> {
        self.check(Permission::ModelAccess)?;
        let model = self
            .collaborators
            .model
            .as_ref()
            .ok_or_else(|| Error::not_found("no model provider attached"))?;
        model.query(prompt, options).await
    }

    pub async fn execute_os_command(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.check(Permission::CommandExecution)?;
        tracing::info!(module = %self.descriptor.name, program, "os_command");
        self.collaborators.os.run(program, args).await
    }

    pub async fn speak(&self, text: &str) -> Result<()> {
        self.check(Permission::AudioOutput)?;
        let speech = self
            .collaborators
            .speech_out
            .as_ref()
            .ok_or_else(|| Error::not_found("no speech output attached"))?;
        speech.speak(text).await
    }

    pub async fn listen(&self, max_duration: Duration) -> Result<String> {
        self.check(Permission::AudioInput)?;
        let speech = self
            .collaborators
            .speech_in
            .as_ref()
            .ok_or_else(|| Error::not_found("no speech input attached"))?;
        speech.listen(max_duration).await
    }

    pub async fn read_file(&self, path: &Path) -> Result<String> {
        self.check(Permission::FileAccess)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    pub async fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.check(Permission::FileAccess)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(path, contents).await?)
    }

    pub async fn http_get(&self, url: &str) -> Result<String> {
        self.check(Permission::NetworkAccess)?;
        self.collaborators.network.get(url).await
    }
}
