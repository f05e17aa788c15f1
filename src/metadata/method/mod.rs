//! Method bodies.
//!
//! A [`MethodBody`] is the executable part of a method: the CIL code bytes, the evaluation
//! stack limit, the local variable types and the exception handling clauses. Bodies are stored
//! in module images using the ECMA-335 II.25.4 layout (tiny or fat header, code, optional
//! exception handling sections), which [`MethodBody::parse`] and [`MethodBody::encode`]
//! implement. [`MethodBodyBuilder`] produces bodies from an
//! [`crate::assembly::InstructionEncoder`] closure.

mod body;
mod builder;
mod exceptions;

pub use body::{MethodBody, MethodBodyFlags, SectionFlags};
pub use builder::MethodBodyBuilder;
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags};
