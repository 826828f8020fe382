//! # snipbox-core
//!
//! Sandboxed execution of short Python snippets on behalf of many users.
//!
//! - Per-user private working directories with session expiry
//! - A restricted interpreter scaffold (allow-listed builtins and modules)
//! - Resource ceilings applied in the child before user code runs
//! - Wall-clock timeout enforced on the whole process group
//! - Markup detection and per-user artifact publishing
//! - Length-prefixed msgpack protocol for the daemon

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod isolation;
pub mod markup;
pub mod protocol;
pub mod result;
pub mod sandbox;
pub mod scaffold;
pub mod service;
pub mod user;

pub use config::SandboxConfig;
pub use error::{FetchError, SnipboxError};
pub use result::{ExecutionResult, Limit, Outcome, SandboxStatus};
pub use service::Snipbox;
pub use user::UserId;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SnipboxError>;
