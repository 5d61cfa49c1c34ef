//! Modules compiled into the host.

mod echo;

pub use echo::{EchoModule, ECHO_MODULE};

use crate::kernel::RuntimeBuilder;

/// Register every built-in module's manifest and factory.
pub fn install(builder: RuntimeBuilder) -> RuntimeBuilder {
    builder
        .with_manifest(EchoModule::manifest())
        .with_module_fn(ECHO_MODULE, |_| EchoModule::new())
}
