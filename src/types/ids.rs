//! Strongly-typed identifiers.
//!
//! Module instances, tasks and subscriptions are addressed by opaque ids.
//! Ids are UUID v4 strings, so a retired id is never handed out again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `new()` (UUID v4), `from_string()`, `as_str()`,
/// Default, Display, Serialize, Deserialize.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ModuleId);
define_id!(TaskId);
define_id!(SubscriptionId);

/// Reserved owner id for subscriptions made by the host itself.
const HOST_OWNER: &str = "host";

impl ModuleId {
    /// Pseudo-owner used for host/orchestrator subscriptions.
    pub fn host() -> Self {
        Self(HOST_OWNER.to_string())
    }

    pub fn is_host(&self) -> bool {
        self.0 == HOST_OWNER
    }
}
