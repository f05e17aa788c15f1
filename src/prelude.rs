//! # cilweave Prelude
//!
//! The types most programs need, in one glob import: load and inspect modules, patch a module
//! closure, verify the result, and route calls at run time.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilweave operations
pub use crate::Error;

/// The result type used throughout cilweave
pub use crate::Result;

// ================================================================================================
// Module Model
// ================================================================================================

/// A compiled module and its rows
pub use crate::metadata::module::{MemberSig, MethodDef, Module, TypeDef};

/// Metadata tokens
pub use crate::metadata::token::{TableId, Token};

/// Module identity
pub use crate::metadata::identity::{ModuleIdentity, ModuleVersion};

/// Signatures
pub use crate::metadata::signatures::{MethodSignature, TypeSig};

/// Attribute flags
pub use crate::metadata::flags::{
    FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes,
};

/// Method bodies
pub use crate::metadata::method::{
    ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodBodyBuilder,
};

// ================================================================================================
// Instructions
// ================================================================================================

/// Decoding and encoding of CIL instructions
pub use crate::assembly::{
    decode_instruction, decode_stream, FlowType, Instruction, InstructionEncoder, Operand,
};

// ================================================================================================
// Weaving
// ================================================================================================

/// Closure patching
pub use crate::weaver::{
    backup_path_for, patch_closure, restore, ClosurePatcher, PatchOptions, PatchResult,
    PatchState,
};

/// Module patching and the patch marker
pub use crate::weaver::{MarkerStatus, MockInjector, PatchMarker};

/// The support module
pub use crate::weaver::{build_support_module, write_support_module};

// ================================================================================================
// Verification
// ================================================================================================

/// Structural verification
pub use crate::verify::{verify_module, StructuralVerifier, Verifier};

// ================================================================================================
// Run Time
// ================================================================================================

/// Binding registry and routers
pub use crate::runtime::{
    substitute_static_for, BindingHandle, Call, CallRegistry, CallRouter, Substitute, Target,
    Unconfigured,
};

/// Execution of patched modules
pub use crate::runtime::{ExecutionLimits, Interpreter, RuntimeMethod, RuntimeType, Value};
