//! Run-time side of interception.
//!
//! A patched method starts by calling `PatchedAssemblyBridge::TryMock`. At run time that call
//! lands in [`CallRegistry::bridge`], which looks up the router bound to the called type or
//! instance and lets it decide the result. Without a binding, or when the router asks for it,
//! the original method body runs.
//!
//! # Key Components
//!
//! - [`CallRegistry`] - target to router bindings of one test context, with leak detection
//! - [`BindingHandle`] - releases one binding
//! - [`CallRouter`] / [`Call`] - the router seam and the intercepted call it receives
//! - [`Substitute`] - a router configured with per-call rules
//! - [`Interpreter`] - executes loaded modules and hosts the bridge
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::{path::Path, rc::Rc};
//! use cilweave::runtime::{substitute_static_for, CallRegistry, Interpreter, Substitute, Value};
//!
//! let registry = CallRegistry::new();
//! let mut interpreter = Interpreter::new(&registry);
//! interpreter.load_file(Path::new("build/Calculator.dll"))?;
//!
//! let substitute = Rc::new(Substitute::new());
//! substitute.returns("Add", vec![Value::I32(1), Value::I32(2)], Value::I32(5));
//! let calculator = interpreter.runtime_type("Demo.Calculator")?;
//! let handle = substitute_static_for(&registry, calculator, substitute.clone())?;
//!
//! let args = vec![Value::I32(1), Value::I32(2)];
//! assert_eq!(interpreter.invoke("Demo.Calculator::Add", None, args)?, Value::I32(5));
//!
//! handle.release()?;
//! registry.teardown()?;
//! # Ok::<(), cilweave::Error>(())
//! ```

mod call;
mod interpreter;
mod registry;
mod substitute;
mod value;

pub use call::{Call, CallRouter, Target};
pub use interpreter::{ExecutionLimits, Interpreter};
pub use registry::{BindingHandle, CallRegistry};
pub use substitute::{substitute_static_for, ReceivedCall, Substitute, Unconfigured};
pub use value::{Location, ObjectId, RuntimeMethod, RuntimeType, Value};
