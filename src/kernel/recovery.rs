//! Panic recovery for module code.
//!
//! Module code (factories, initialize/shutdown, handlers, background hooks)
//! runs behind these wrappers so a panicking module surfaces as a
//! `Handler` error instead of unwinding through the host.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::FutureExt;

use crate::types::{Error, Result};

/// Run a synchronous closure, converting a panic into `Error::Handler`.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => Err(panic_error(operation_name, payload.as_ref())),
    }
}

/// Await a future, converting a panic raised while polling into `Error::Handler`.
///
/// The panic is caught on every poll, not only while constructing the future.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(operation_name, payload.as_ref())),
    }
}

fn panic_error(operation_name: &str, payload: &(dyn std::any::Any + Send)) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(operation = operation_name, panic = %panic_msg, "panic_recovered");
    Error::handler(format!("panic in {}: {}", operation_name, panic_msg))
}

fn extract_panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}
