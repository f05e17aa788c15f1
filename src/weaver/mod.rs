//! Static interception weaving.
//!
//! This module rewrites compiled modules so that calls to their methods can be answered by a
//! [`crate::runtime::CallRegistry`] at run time. It is organised bottom-up:
//!
//! - [`rewriter`] - inserts the interception prologue in front of one method body
//! - [`support`] - builds the support module that provides the bridge and the placeholder type
//! - [`marker`] - the patch marker stored in module metadata
//! - [`injector`] - patches every eligible type and method of one module
//! - [`orchestrator`] - walks the closure of co-located modules and replaces them on disk
//!
//! # Usage
//!
//! ```rust,no_run
//! use cilweave::weaver::{patch_closure, PatchOptions, PatchState};
//! use std::path::Path;
//!
//! let results = patch_closure(
//!     Path::new("build/Game.Tests.dll"),
//!     PatchOptions::new().skip_verify(false),
//! )?;
//!
//! for result in results.iter().filter(|r| r.state == PatchState::Patched) {
//!     println!("patched {}", result.path.display());
//! }
//! # Ok::<(), cilweave::Error>(())
//! ```
//!
//! The support module (`Cilweave.Elevated.dll`) must sit next to the root module, see
//! [`support::write_support_module`].

pub mod injector;
pub mod marker;
pub mod orchestrator;
pub mod rewriter;
pub mod support;

pub use injector::MockInjector;
pub use marker::{MarkerStatus, PatchMarker};
pub use orchestrator::{
    backup_path_for, patch_closure, restore, ClosurePatcher, PatchOptions, PatchResult,
    PatchState,
};
pub use rewriter::{rewrite_method, BridgeImports};
pub use support::{build_support_module, write_support_module, SupportIdentity};

/// Extension of module files.
pub const MODULE_EXTENSION: &str = "dll";

/// Suffix appended to a module file name for its backup.
pub const BACKUP_SUFFIX: &str = ".orig";

/// Extension of the staged rewritten module.
pub const TEMP_EXTENSION: &str = "tmp";

/// Name of the per-type storage slot added to patched types.
pub const INJECTED_STATIC_FIELD: &str = "__mock_StaticData";

/// Name of the per-instance storage slot added to patched types.
pub const INJECTED_INSTANCE_FIELD: &str = "__mock_Data";
