// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' maps module files into memory
#![allow(clippy::too_many_arguments)]

//! # cilweave
//!
//! Static CIL method rewriting and run-time call routing, for replacing the behaviour of
//! members that ordinary mocking frameworks cannot reach: static methods, non-virtual instance
//! methods and members of sealed types.
//!
//! The crate works in two phases:
//!
//! 1. **Weaving** ([`weaver`]) - every eligible method of every module in the closure of a test
//!    module gets an interception prologue that asks the bridge method `TryMock` whether the
//!    call is substituted. Rewritten modules are verified ([`verify`]) and replace the originals
//!    atomically, with a `.orig` backup next to them.
//! 2. **Routing** ([`runtime`]) - a [`runtime::CallRegistry`] binds routers to types or
//!    instances. The bridge consults it on every intercepted call; without a binding the
//!    original body runs unchanged.
//!
//! ## Features
//!
//! - **Native module images** - read, modify and write ECMA-335 PE modules without any
//!   runtime installed ([`metadata`], [`write`])
//! - **Instruction level tooling** - decoder, label-aware encoder and opcode tables
//!   ([`assembly`])
//! - **Safe replacement** - staged temporary files, structural verification before any original
//!   is touched, idempotent re-runs through a patch marker
//! - **Explicit binding lifecycle** - duplicate bindings, unbalanced releases and leaked
//!   bindings are reported as errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cilweave::prelude::*;
//! use std::path::Path;
//!
//! // Phase 1: patch the closure of the test module
//! let results = patch_closure(Path::new("build/Game.Tests.dll"), PatchOptions::new())?;
//! for result in &results {
//!     println!("{}: {}", result.path.display(), result.state);
//! }
//!
//! // Phase 2: route calls while the patched code runs
//! let registry = CallRegistry::new();
//! let mut interpreter = Interpreter::new(&registry);
//! interpreter.load_file(Path::new("build/Game.dll"))?;
//! # Ok::<(), cilweave::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - module model, signatures, method bodies and the metadata tables
//! - [`write`] - PE image writer
//! - [`assembly`] - CIL instruction decoding and encoding
//! - [`weaver`] - rewriter, support module, patch marker, injector and closure orchestrator
//! - [`verify`] - structural verification of rewritten method bodies
//! - [`runtime`] - binding registry, routers and the interpreter hosting patched code
//! - [`prelude`] - the commonly used types in one import
//!
//! ## Concurrency
//!
//! Patching assumes exclusive access to the module files. The run-time registry uses interior
//! mutability without locking and is confined to one thread.

#[macro_use]
pub(crate) mod error;

/// Shared fixtures for unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use cilweave::prelude::*;
///
/// let module = Module::from_file(std::path::Path::new("build/Calculator.dll"))?;
/// verify_module(&module)?;
/// # Ok::<(), cilweave::Error>(())
/// ```
pub mod prelude;

/// CIL instruction decoding and encoding.
///
/// The rewriter emits prologues through [`assembly::InstructionEncoder`]; the verifier, the
/// interpreter and the CLI listing work on [`assembly::Instruction`] values produced by
/// [`assembly::decode_stream`].
pub mod assembly;

/// The module model and its binary format.
///
/// A [`metadata::module::Module`] holds identity, references, types, fields, methods with their
/// bodies, custom attributes, user strings and the tables it does not interpret. The patch
/// marker is an assembly level custom attribute.
pub mod metadata;

/// Writing modules as PE images.
pub mod write;

/// Raw module file access and the binary primitives of the image format.
pub mod file;

/// Run-time call routing.
pub mod runtime;

/// Hashing and formatting helpers.
pub mod utils;

/// Structural verification of rewritten modules.
pub mod verify;

/// Static interception weaving.
pub mod weaver;

/// `cilweave` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`crate::Error`].
///
/// # Examples
///
/// ```rust,no_run
/// use cilweave::{metadata::module::Module, Result};
///
/// fn load(path: &str) -> Result<Module> {
///     Module::from_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `cilweave` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use cilweave::{runtime::CallRegistry, Error};
///
/// let registry = CallRegistry::new();
/// match registry.teardown() {
///     Ok(()) => println!("clean"),
///     Err(Error::LeakDetected(targets)) => println!("leaked: {}", targets.join(", ")),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// Raw file access, memory mapped or in memory.
pub use file::{parser::Parser, writer::Writer, File};
