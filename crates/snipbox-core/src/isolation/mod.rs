//! Process-level isolation primitives
//!
//! This module contains what the engine applies to every child:
//! - `rlimits` - CPU, address-space and file-size ceilings set before exec
//! - `process_group` - group leadership and whole-tree teardown
//!
//! There is no namespace, seccomp or Landlock layer; confinement of names
//! inside the interpreter is the job of [`crate::scaffold`].

pub mod process_group;
pub mod rlimits;

pub use self::process_group::kill_group;
pub use self::rlimits::ResourceLimits;
