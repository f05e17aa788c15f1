//! A configurable router.
//!
//! [`Substitute`] answers intercepted calls from rules configured by the test and records every
//! call it receives:
//!
//! ```rust
//! use std::rc::Rc;
//! use cilweave::runtime::{substitute_static_for, CallRegistry, RuntimeType, Substitute, Value};
//!
//! let registry = CallRegistry::new();
//! let substitute = Rc::new(Substitute::new());
//! substitute.returns("Add", vec![Value::I32(1), Value::I32(2)], Value::I32(5));
//!
//! let calculator = RuntimeType::new("Calculator", "Demo.Calculator");
//! let handle = substitute_static_for(&registry, calculator, substitute.clone()).unwrap();
//! // ... run code under test ...
//! handle.release().unwrap();
//! registry.teardown().unwrap();
//! ```

use std::{cell::RefCell, rc::Rc};

use crate::{
    runtime::{
        call::{Call, CallRouter, Target},
        registry::{BindingHandle, CallRegistry},
        value::{ObjectId, RuntimeType, Value},
    },
    Result,
};

/// What a [`Substitute`] does with calls no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unconfigured {
    /// Run the original method body
    #[default]
    CallOriginal,
    /// Return the zero value of the return type
    ReturnDefault,
}

#[derive(Debug, Clone)]
enum Arguments {
    Exactly(Vec<Value>),
    Any,
}

#[derive(Debug, Clone)]
enum Action {
    Return(Value),
    CallOriginal,
}

#[derive(Debug, Clone)]
struct Rule {
    method: String,
    arguments: Arguments,
    action: Action,
}

impl Rule {
    fn matches(&self, call: &Call) -> bool {
        self.method == call.method().name
            && match &self.arguments {
                Arguments::Exactly(args) => args.as_slice() == call.args(),
                Arguments::Any => true,
            }
    }
}

/// A call a [`Substitute`] received.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCall {
    /// Method name
    pub method: String,
    /// Arguments
    pub args: Vec<Value>,
    /// Receiver of instance calls
    pub instance: Option<ObjectId>,
}

/// Router answering calls from configured rules.
///
/// Rules match on the method name and either exact arguments or any arguments. When several
/// rules match, the one configured last wins.
#[derive(Debug, Default)]
pub struct Substitute {
    rules: RefCell<Vec<Rule>>,
    unconfigured: Unconfigured,
    received: RefCell<Vec<ReceivedCall>>,
}

impl Substitute {
    /// Creates a substitute that runs the original body for unconfigured calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a substitute with the given policy for unconfigured calls.
    #[must_use]
    pub fn with_unconfigured(unconfigured: Unconfigured) -> Self {
        Substitute {
            unconfigured,
            ..Self::default()
        }
    }

    /// `method(args)` returns `value`.
    pub fn returns(&self, method: &str, args: Vec<Value>, value: Value) -> &Self {
        self.push(method, Arguments::Exactly(args), Action::Return(value))
    }

    /// Every call of `method` returns `value`.
    pub fn returns_for_any_args(&self, method: &str, value: Value) -> &Self {
        self.push(method, Arguments::Any, Action::Return(value))
    }

    /// Every call of `method` runs the original body.
    pub fn calls_original(&self, method: &str) -> &Self {
        self.push(method, Arguments::Any, Action::CallOriginal)
    }

    fn push(&self, method: &str, arguments: Arguments, action: Action) -> &Self {
        self.rules.borrow_mut().push(Rule {
            method: method.to_string(),
            arguments,
            action,
        });
        self
    }

    /// Calls received so far, in order.
    #[must_use]
    pub fn received(&self) -> Vec<ReceivedCall> {
        self.received.borrow().clone()
    }

    /// Number of received calls of `method`.
    #[must_use]
    pub fn received_count(&self, method: &str) -> usize {
        self.received
            .borrow()
            .iter()
            .filter(|call| call.method == method)
            .count()
    }
}

impl CallRouter for Substitute {
    fn route(&self, call: &Call) -> Value {
        self.received.borrow_mut().push(ReceivedCall {
            method: call.method().name.clone(),
            args: call.args().to_vec(),
            instance: call.instance(),
        });

        let action = self
            .rules
            .borrow()
            .iter()
            .rev()
            .find(|rule| rule.matches(call))
            .map(|rule| rule.action.clone());

        match (action, self.unconfigured) {
            (Some(Action::Return(value)), _) => value,
            (None, Unconfigured::ReturnDefault) => Value::default_for(call.return_type()),
            (Some(Action::CallOriginal) | None, _) => {
                call.call_original();
                Value::Null
            }
        }
    }
}

/// Intercepts every static call of `ty` through `router`.
///
/// # Errors
/// Returns [`crate::Error::DuplicateBinding`] if `ty` is already substituted.
pub fn substitute_static_for(
    registry: &CallRegistry,
    ty: RuntimeType,
    router: Rc<dyn CallRouter>,
) -> Result<BindingHandle<'_>> {
    registry.bind(Target::Type(ty), router)
}
