use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into four groups:
///
/// ## Module image errors
/// - [`Error::Malformed`] - Corrupted or invalid module image structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of the data
/// - [`Error::NotSupported`] - Unsupported format version or feature
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - The PE container could not be parsed
///
/// ## Patching errors
/// - [`Error::RewriteFailure`] - A single method could not be rewritten, aborts the pass
/// - [`Error::VerificationFailure`] - A rewritten module failed the structural check
/// - [`Error::MockCtorUnavailable`] - No base constructor to chain the placeholder constructor to
/// - [`Error::InjectedFieldMismatch`] - A type carries only one of the two injected fields
/// - [`Error::InvariantViolation`] - The closure walk found a state it must never see
///
/// ## Binding lifecycle errors
/// - [`Error::DuplicateBinding`] - A target is already bound
/// - [`Error::UnbalancedDispose`] - Release of an unknown or already released binding
/// - [`Error::RegistryCorrupted`] - The stored router differs from the one being released
/// - [`Error::LeakDetected`] - Bindings were still active at teardown
///
/// ## Execution errors
/// - [`Error::Execution`] - The interpreter hit an invalid state
/// - [`Error::Substitute`] - Invalid use of the substitution API
///
/// # Examples
///
/// ```rust,no_run
/// use cilweave::{Error, metadata::module::Module};
/// use std::path::Path;
///
/// match Module::from_file(Path::new("SystemUnderTest.dll")) {
///     Ok(module) => println!("Loaded {}", module.name()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed module: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The module image is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the data.
    #[error("Out of Bound read would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// This file type or feature is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The PE container could not be parsed.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Recursion limit reached while decoding nested signatures.
    #[error("Reached the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// A metadata token did not resolve to an existing row.
    #[error("Token could not be resolved - {0}")]
    TokenNotFound(Token),

    /// Rewriting one method failed.
    ///
    /// Carries the offending method and the full name of its declaring type. A single
    /// method that cannot be rewritten aborts the patch of its module and of the whole
    /// closure pass.
    #[error("Failed to inject mock interception into {type_name}::{method}: {source}")]
    RewriteFailure {
        /// Full name of the declaring type
        type_name: String,
        /// Name and token of the method
        method: String,
        /// The underlying failure
        source: Box<Error>,
    },

    /// A rewritten module failed the structural validity check.
    ///
    /// The original module file is guaranteed to be untouched when this is returned.
    #[error("Structural verification of {path} failed: {message}")]
    VerificationFailure {
        /// The path of the temporary file that was checked
        path: String,
        /// Description of the first violation
        message: String,
    },

    /// A type has neither a placeholder nor a parameterless base constructor to chain to.
    #[error("No base constructor available for the mock constructor of {0}")]
    MockCtorUnavailable(String),

    /// A type carries exactly one of the two injected mock storage fields.
    #[error("Unexpected mismatch between static and instance mock injected fields on {0}")]
    InjectedFieldMismatch(String),

    /// The patch pass found a state that a previous run must have left behind.
    #[error("{0}")]
    InvariantViolation(String),

    /// The target is already bound.
    #[error("Cannot substitute {0} twice (did you forget to release the previous substitute?)")]
    DuplicateBinding(String),

    /// Release of an unknown binding, or a second release of the same handle.
    #[error("Unbalanced release of substitute for {0}")]
    UnbalancedDispose(String),

    /// The router stored for a target is not the one the handle was created for.
    #[error("Discovered unexpected call router attached to {0}")]
    RegistryCorrupted(String),

    /// Bindings were still active when the registry was torn down.
    #[error("Test forgot to release substitutes for: {}", .0.join(", "))]
    LeakDetected(Vec<String>),

    /// Invalid mnemonic passed to the instruction encoder.
    #[error("Invalid instruction mnemonic - {0}")]
    InvalidMnemonic(String),

    /// Invalid branch emission.
    #[error("Invalid branch - {0}")]
    InvalidBranch(String),

    /// A branch references a label that was never defined.
    #[error("Undefined label - {0}")]
    UndefinedLabel(String),

    /// The interpreter reached an invalid state.
    #[error("Execution failed - {0}")]
    Execution(String),

    /// Invalid use of the substitution API.
    #[error("{0}")]
    Substitute(String),
}

impl Error {
    /// Wraps `self` as a [`Error::RewriteFailure`] for the given type and method.
    pub(crate) fn in_method(self, type_name: &str, method: &str) -> Error {
        Error::RewriteFailure {
            type_name: type_name.to_string(),
            method: method.to_string(),
            source: Box::new(self),
        }
    }
}
