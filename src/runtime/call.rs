//! Intercepted calls and the router seam.

use std::{cell::Cell, fmt};

use crate::runtime::value::{ObjectId, RuntimeMethod, RuntimeType, Value};

/// What a binding intercepts: every static call of a type, or every call on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Static methods of the type
    Type(RuntimeType),
    /// Instance methods invoked on the object of the given runtime type
    Instance(RuntimeType, ObjectId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Type(ty) => write!(f, "{}", ty.name),
            Target::Instance(ty, id) => write!(f, "{} instance object#{id}", ty.name),
        }
    }
}

/// One intercepted invocation, as handed to a [`CallRouter`].
///
/// A router that wants the original method body to run calls [`Call::call_original`] and
/// returns any value; the value is then discarded.
#[derive(Debug)]
pub struct Call {
    method: RuntimeMethod,
    args: Vec<Value>,
    instance: Option<ObjectId>,
    return_type: RuntimeType,
    call_original: Cell<bool>,
}

impl Call {
    /// Creates a call record.
    #[must_use]
    pub fn new(
        method: RuntimeMethod,
        args: Vec<Value>,
        instance: Option<ObjectId>,
        return_type: RuntimeType,
    ) -> Self {
        Call {
            method,
            args,
            instance,
            return_type,
            call_original: Cell::new(false),
        }
    }

    /// The invoked method.
    #[must_use]
    pub fn method(&self) -> &RuntimeMethod {
        &self.method
    }

    /// Arguments in declaration order, value types boxed.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The receiver, `None` for static calls and value type methods.
    #[must_use]
    pub fn instance(&self) -> Option<ObjectId> {
        self.instance
    }

    /// Declared return type of the method.
    #[must_use]
    pub fn return_type(&self) -> &RuntimeType {
        &self.return_type
    }

    /// Requests that the original method body runs instead of a substituted result.
    pub fn call_original(&self) {
        self.call_original.set(true);
    }

    /// Returns `true` if the router requested the original body.
    #[must_use]
    pub fn wants_original(&self) -> bool {
        self.call_original.get()
    }
}

/// Decides the outcome of intercepted calls for one bound target.
pub trait CallRouter {
    /// Produces the result of `call`, or requests the original through [`Call::call_original`].
    fn route(&self, call: &Call) -> Value;
}

impl<F> CallRouter for F
where
    F: Fn(&Call) -> Value,
{
    fn route(&self, call: &Call) -> Value {
        self(call)
    }
}
