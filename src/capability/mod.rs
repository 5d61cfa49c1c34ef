//! Capability model: permission checks and the gated collaborator facade.

mod facade;
mod gateway;

pub use facade::{
    Collaborators, CommandOutput, Facade, ModelProvider, NetworkClient, OsCommandRunner,
    ProcessRunner, ReqwestClient, SpeechInput, SpeechOutput,
};
pub use gateway::{
    CapabilityGateway, Decision, DenyReason, HostPolicy, ModulePolicy, Permission,
    PermissionGrant,
};
