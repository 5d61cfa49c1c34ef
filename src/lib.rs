//! # Agentry Core - extensible agent runtime
//!
//! Hosts independently developed extension modules inside one process:
//! - Module discovery from manifests, with semver-aware pending upgrades
//! - Capability gating of sensitive collaborator calls
//! - Command routing and event pub/sub with identifier-based revocation
//! - Lifecycle with hot reload, quarantine and bounded shutdown
//! - Task dispatch on independent workers with deadlock detection
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   host / CLI   →   │               Runtime                │
//!                    │  ┌──────────┐ ┌──────────┐ ┌───────┐ │
//!                    │  │Lifecycle │ │Dispatcher│ │Monitor│ │
//!                    │  └────┬─────┘ └────┬─────┘ └───┬───┘ │
//!                    │  ┌────┴────────────┴───────────┴───┐ │
//!                    │  │  CommandRegistry  ·  EventBus   │ │
//!                    │  └─────────────────────────────────┘ │
//!                    └──────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod builtin;
pub mod capability;
pub mod commbus;
pub mod kernel;
pub mod module;
pub mod types;

// Internal utilities
pub mod observability;
pub mod validation;

pub use kernel::{Runtime, RuntimeBuilder};
pub use types::{Config, Error, Result};
