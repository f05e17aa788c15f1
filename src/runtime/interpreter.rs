//! A small CIL interpreter that hosts patched modules.
//!
//! The [`Interpreter`] loads modules and executes their method bodies one instruction at a
//! time. Calls to the bridge method `TryMock` are not executed as code: they go to the
//! [`CallRegistry`] the interpreter was created with, which is how interception prologues reach
//! the routers a test has bound.
//!
//! Covered are arguments and locals, integer and float arithmetic, comparisons and branches,
//! `switch`, calls across loaded modules, objects and their fields, static fields, arrays,
//! strings, `try`/`finally` through `leave` and `endfinally`, and token loading. Boxing and
//! type casts are the identity. Thrown exceptions end execution with [`Error::Execution`].
//!
//! Arguments and locals live in interpreter-owned storage keyed by frame, so managed pointers
//! ([`Location`]) taken with `ldloca` or `ldarga` stay valid in callees and are read and
//! written with `ldobj`, `stobj`, `ldind.*` and `stind.*`.
//!
//! `callvirt` dispatches statically to the referenced method.

use std::{cmp::Ordering, collections::HashMap, path::Path, rc::Rc};

use crate::{
    assembly::{decode_stream, opcodes, Instruction},
    metadata::{
        method::ExceptionHandlerFlags,
        module::{MemberSig, Module, CORE_LIBRARY},
        signatures::{MethodSignature, TypeSig},
        token::{TableId, Token},
    },
    runtime::{
        call::{CallRouter, Target},
        registry::{BindingHandle, CallRegistry},
        value::{Location, ObjectId, RuntimeMethod, RuntimeType, Value},
    },
    weaver::{
        injector::find_placeholder_ctor,
        rewriter::{is_bridge_call, is_value_type},
    },
    Error, Result,
};

/// Bounds on one top-level invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum number of nested calls
    pub max_call_depth: usize,
    /// Maximum number of executed instructions, 0 for unlimited
    pub max_instructions: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            max_call_depth: 256,
            max_instructions: 1_000_000,
        }
    }
}

enum HeapEntry {
    Object {
        ty: RuntimeType,
        fields: HashMap<String, Value>,
    },
    Array(Vec<Value>),
}

/// How a call instruction is carried out.
enum Callee {
    /// A method body of a loaded module
    Method { module: usize, token: Token },
    /// `PatchedAssemblyBridge::TryMock`
    Bridge,
    /// `System.Object::.ctor` and `System.ValueType::.ctor`
    BaseConstructor,
    /// `GetTypeFromHandle` and `GetMethodFromHandle`
    Handle,
}

/// Result of one instruction.
enum Step {
    Next,
    Jump(u64),
    Leave(u64),
    Return(Value),
    EndFinally,
}

/// How a run of instructions ended.
enum Exit {
    Return(Value),
    EndFinally,
}

struct FieldRef {
    owner: String,
    name: String,
    signature: TypeSig,
}

/// Arguments and locals of one activation.
struct FrameSlots {
    id: u64,
    args: Vec<Value>,
    locals: Vec<Value>,
}

/// Activation record of one method. Its variables are the [`FrameSlots`] with the same id.
struct Frame {
    id: u64,
    module: usize,
    name: String,
    code: Rc<[Instruction]>,
    stack: Vec<Value>,
    finally_blocks: Vec<(u64, u64, u64)>,
    returns: bool,
}

impl Frame {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Execution(format!("Stack underflow in {}", self.name)))
    }

    fn pop_many(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(Error::Execution(format!("Stack underflow in {}", self.name)));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn pop_index(&mut self) -> Result<usize> {
        let value = self.pop()?;
        value
            .as_i64()
            .and_then(|index| usize::try_from(index).ok())
            .ok_or_else(|| Error::Execution(format!("Invalid index {value} in {}", self.name)))
    }

    fn position(&self, offset: u64) -> Result<usize> {
        self.code
            .binary_search_by_key(&offset, |instruction| instruction.offset)
            .map_err(|_| {
                Error::Execution(format!("No instruction at IL_{offset:04x} in {}", self.name))
            })
    }

    /// Handler offsets of the finally blocks a `leave` from `source` to `target` exits,
    /// innermost first.
    fn exited_finally_blocks(&self, source: u64, target: u64) -> Vec<u64> {
        self.finally_blocks
            .iter()
            .filter(|(start, end, _)| {
                (*start..*end).contains(&source) && !(*start..*end).contains(&target)
            })
            .map(|(_, _, handler)| *handler)
            .collect()
    }
}

/// Executes methods of loaded modules, routing `TryMock` calls to a [`CallRegistry`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::path::Path;
/// use cilweave::runtime::{CallRegistry, Interpreter, Value};
///
/// let registry = CallRegistry::new();
/// let mut interpreter = Interpreter::new(&registry);
/// interpreter.load_file(Path::new("Calculator.dll"))?;
///
/// let sum = interpreter.invoke("Demo.Calculator::Add", None, vec![Value::I32(2), Value::I32(1)])?;
/// assert_eq!(sum, Value::I32(3));
/// # Ok::<(), cilweave::Error>(())
/// ```
pub struct Interpreter<'r> {
    registry: &'r CallRegistry,
    modules: Vec<Module>,
    heap: Vec<HeapEntry>,
    statics: HashMap<(String, String), Value>,
    slots: Vec<FrameSlots>,
    next_frame: u64,
    code: HashMap<(usize, Token), Rc<[Instruction]>>,
    limits: ExecutionLimits,
    depth: usize,
    executed: u64,
}

impl<'r> Interpreter<'r> {
    /// Creates an interpreter without modules.
    #[must_use]
    pub fn new(registry: &'r CallRegistry) -> Self {
        Interpreter {
            registry,
            modules: Vec::new(),
            heap: Vec::new(),
            statics: HashMap::new(),
            slots: Vec::new(),
            next_frame: 0,
            code: HashMap::new(),
            limits: ExecutionLimits::default(),
            depth: 0,
            executed: 0,
        }
    }

    /// Replaces the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Adds `module` to the loaded modules.
    ///
    /// # Errors
    /// Returns [`Error::Error`] if a module with the same name is already loaded.
    pub fn load(&mut self, module: Module) -> Result<()> {
        if self.module_index(module.name()).is_some() {
            return Err(Error::Error(format!(
                "Module {} is already loaded",
                module.name()
            )));
        }
        log::debug!("Loaded module {}", module.name());
        self.modules.push(module);
        Ok(())
    }

    /// Reads a module from `path` and loads it.
    ///
    /// # Errors
    /// Returns any read or parse error, or the errors of [`Interpreter::load`].
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        self.load(Module::from_file(path)?)
    }

    /// Instructions executed by the last top-level invocation.
    #[must_use]
    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Run-time identity of the loaded type `full_name`.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if no loaded module defines the type.
    pub fn runtime_type(&self, full_name: &str) -> Result<RuntimeType> {
        let (module, _) = self.locate_type(None, full_name)?;
        Ok(RuntimeType::new(self.modules[module].name(), full_name))
    }

    /// Calls `Type::Method` with `args`.
    ///
    /// `instance` is the receiver of instance methods. The overload is chosen by parameter
    /// count. Returns [`Value::Null`] for void methods.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if the method cannot be found or execution fails.
    pub fn invoke(
        &mut self,
        method: &str,
        instance: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let (type_name, method_name) = method
            .rsplit_once("::")
            .ok_or_else(|| Error::Execution(format!("Expected Type::Method, got {method}")))?;
        let (module, type_token) = self.locate_type(None, type_name)?;

        let target = {
            let loaded = &self.modules[module];
            let type_def = loaded
                .type_def(type_token)
                .ok_or(Error::TokenNotFound(type_token))?;
            loaded
                .type_methods(type_def)
                .find(|m| {
                    m.name == method_name
                        && m.signature.params.len() == args.len()
                        && m.signature.has_this == instance.is_some()
                })
                .map(|m| m.token)
                .ok_or_else(|| {
                    Error::Execution(format!(
                        "{method} with {} parameters is not defined",
                        args.len()
                    ))
                })?
        };

        let args = instance.into_iter().chain(args).collect();
        self.executed = 0;
        self.call_method(module, target, args)
    }

    /// Allocates an instance of `type_name` and runs the constructor matching `args`.
    ///
    /// Value types without a matching constructor are allocated with zeroed fields.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if the type is not loaded, no constructor matches, or the
    /// constructor fails.
    pub fn new_object(&mut self, type_name: &str, args: Vec<Value>) -> Result<Value> {
        let (module, type_token) = self.locate_type(None, type_name)?;
        let ctor = {
            let loaded = &self.modules[module];
            let type_def = loaded
                .type_def(type_token)
                .ok_or(Error::TokenNotFound(type_token))?;
            loaded
                .type_methods(type_def)
                .find(|m| {
                    m.name == ".ctor"
                        && m.signature.has_this
                        && m.signature.params.len() == args.len()
                })
                .map(|m| m.token)
        };

        let id = self.allocate(RuntimeType::new(self.modules[module].name(), type_name));
        match ctor {
            Some(ctor) => {
                let args = std::iter::once(Value::Object(id)).chain(args).collect();
                self.executed = 0;
                self.call_method(module, ctor, args)?;
            }
            None if args.is_empty() && is_value_type(&self.modules[module], type_token) => {}
            None => {
                return Err(Error::Execution(format!(
                    "{type_name} has no constructor with {} parameters",
                    args.len()
                )))
            }
        }
        Ok(Value::Object(id))
    }

    /// Allocates an array holding `elements`.
    pub fn new_array(&mut self, elements: Vec<Value>) -> Value {
        self.heap.push(HeapEntry::Array(elements));
        Value::Array(self.heap.len() - 1)
    }

    /// Reads the field `name` of an object, `None` if it was never written.
    #[must_use]
    pub fn field(&self, target: &Value, name: &str) -> Option<Value> {
        match self.heap.get(target.as_object()?)? {
            HeapEntry::Object { fields, .. } => fields.get(name).cloned(),
            HeapEntry::Array(_) => None,
        }
    }

    /// Writes the field `name` of an object.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `target` is not an object.
    pub fn set_field(&mut self, target: &Value, name: &str, value: Value) -> Result<()> {
        let id = target
            .as_object()
            .ok_or_else(|| Error::Execution(format!("Cannot set {name} on {target}")))?;
        self.object_fields_mut(id)?.insert(name.to_string(), value);
        Ok(())
    }

    /// Run-time type of an object.
    #[must_use]
    pub fn type_of(&self, target: &Value) -> Option<&RuntimeType> {
        match self.heap.get(target.as_object()?)? {
            HeapEntry::Object { ty, .. } => Some(ty),
            HeapEntry::Array(_) => None,
        }
    }

    /// Creates an instance of the patched type `type_name` whose instance calls go to `router`.
    ///
    /// The instance is built through the injected placeholder constructor, so no constructor
    /// of the type itself runs.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for interfaces, [`Error::Substitute`] for constructor
    /// arguments or a type without placeholder constructor, and the errors of
    /// [`CallRegistry::bind`].
    pub fn substitute_instance_for(
        &mut self,
        type_name: &str,
        ctor_args: Vec<Value>,
        router: Rc<dyn CallRouter>,
    ) -> Result<(Value, BindingHandle<'r>)> {
        let (module, type_token) = self.locate_type(None, type_name)?;
        let placeholder = {
            let loaded = &self.modules[module];
            let type_def = loaded
                .type_def(type_token)
                .ok_or(Error::TokenNotFound(type_token))?;
            if type_def.flags.is_interface() {
                return Err(Error::NotSupported);
            }
            if !ctor_args.is_empty() {
                return Err(Error::Substitute(format!(
                    "Constructor arguments are not supported when substituting {type_name}"
                )));
            }
            find_placeholder_ctor(loaded, type_def).ok_or_else(|| {
                Error::Substitute(format!(
                    "{type_name} has no mock constructor, is {} patched?",
                    loaded.name()
                ))
            })?
        };

        let ty = RuntimeType::new(self.modules[module].name(), type_name);
        let id = self.allocate(ty.clone());
        self.executed = 0;
        self.call_method(module, placeholder, vec![Value::Object(id), Value::Null])?;

        let registry: &'r CallRegistry = self.registry;
        let handle = registry.bind(Target::Instance(ty, id), router)?;
        Ok((Value::Object(id), handle))
    }

    fn module_index(&self, name: &str) -> Option<usize> {
        self.modules
            .iter()
            .position(|module| module.name().eq_ignore_ascii_case(name))
    }

    /// Finds a type by full name, preferring the module named `scope`.
    fn locate_type(&self, scope: Option<&str>, full_name: &str) -> Result<(usize, Token)> {
        let preferred = scope.and_then(|name| self.module_index(name));
        preferred
            .into_iter()
            .chain(0..self.modules.len())
            .find_map(|index| {
                self.modules[index]
                    .find_type_by_full_name(full_name)
                    .map(|type_def| (index, type_def.token))
            })
            .ok_or_else(|| Error::Execution(format!("Type {full_name} is not loaded")))
    }

    fn allocate(&mut self, ty: RuntimeType) -> ObjectId {
        self.heap.push(HeapEntry::Object {
            ty,
            fields: HashMap::new(),
        });
        self.heap.len() - 1
    }

    fn object_fields_mut(&mut self, id: ObjectId) -> Result<&mut HashMap<String, Value>> {
        match self.heap.get_mut(id) {
            Some(HeapEntry::Object { fields, .. }) => Ok(fields),
            _ => Err(Error::Execution(format!("object#{id} is not an object"))),
        }
    }

    fn array(&self, id: ObjectId) -> Result<&Vec<Value>> {
        match self.heap.get(id) {
            Some(HeapEntry::Array(elements)) => Ok(elements),
            _ => Err(Error::Execution(format!("array#{id} is not an array"))),
        }
    }

    fn array_mut(&mut self, id: ObjectId) -> Result<&mut Vec<Value>> {
        match self.heap.get_mut(id) {
            Some(HeapEntry::Array(elements)) => Ok(elements),
            _ => Err(Error::Execution(format!("array#{id} is not an array"))),
        }
    }

    fn frame_slots_mut(&mut self, frame: u64) -> Result<&mut FrameSlots> {
        // the running frame is on top, addresses from callers sit below it
        self.slots
            .iter_mut()
            .rev()
            .find(|slots| slots.id == frame)
            .ok_or_else(|| Error::Execution(format!("frame{frame} is no longer active")))
    }

    fn arg_mut(&mut self, frame: &Frame, index: usize) -> Result<&mut Value> {
        self.frame_slots_mut(frame.id)?
            .args
            .get_mut(index)
            .ok_or_else(|| {
                Error::Execution(format!("Argument {index} out of range in {}", frame.name))
            })
    }

    fn local_mut(&mut self, frame: &Frame, index: usize) -> Result<&mut Value> {
        self.frame_slots_mut(frame.id)?
            .locals
            .get_mut(index)
            .ok_or_else(|| Error::Execution(format!("Local {index} out of range in {}", frame.name)))
    }

    /// The storage a managed pointer designates.
    fn slot_mut(&mut self, location: &Location) -> Result<&mut Value> {
        let dangling = || Error::Execution(format!("{location} does not designate a value"));
        match location {
            Location::Argument { frame, index } => self
                .frame_slots_mut(*frame)?
                .args
                .get_mut(*index)
                .ok_or_else(dangling),
            Location::Local { frame, index } => self
                .frame_slots_mut(*frame)?
                .locals
                .get_mut(*index)
                .ok_or_else(dangling),
            Location::Field { object, name } => Ok(self
                .object_fields_mut(*object)?
                .entry(name.clone())
                .or_insert(Value::Null)),
            Location::StaticField { owner, name } => Ok(self
                .statics
                .entry((owner.clone(), name.clone()))
                .or_insert(Value::Null)),
            Location::Element { array, index } => {
                self.array_mut(*array)?.get_mut(*index).ok_or_else(dangling)
            }
        }
    }

    /// Follows a managed pointer; other values are returned as they are.
    fn dereference(&mut self, value: Value) -> Result<Value> {
        match value {
            Value::Address(location) => Ok(self.slot_mut(&location)?.clone()),
            other => Ok(other),
        }
    }

    fn code_of(&mut self, module: usize, token: Token) -> Result<Rc<[Instruction]>> {
        if let Some(code) = self.code.get(&(module, token)) {
            return Ok(Rc::clone(code));
        }

        let body = self.modules[module]
            .method(token)
            .and_then(|method| method.body.as_ref())
            .ok_or_else(|| Error::Execution(format!("{token} has no body")))?;
        let code: Rc<[Instruction]> = decode_stream(&body.code)?.into();
        self.code.insert((module, token), Rc::clone(&code));
        Ok(code)
    }

    fn check_limits(&mut self) -> Result<()> {
        self.executed += 1;
        if self.limits.max_instructions != 0 && self.executed > self.limits.max_instructions {
            return Err(Error::Execution(format!(
                "Instruction limit of {} exceeded",
                self.limits.max_instructions
            )));
        }
        Ok(())
    }

    fn call_method(&mut self, module: usize, token: Token, args: Vec<Value>) -> Result<Value> {
        if self.depth >= self.limits.max_call_depth {
            return Err(Error::Execution(format!(
                "Call depth limit of {} exceeded",
                self.limits.max_call_depth
            )));
        }

        let code = self.code_of(module, token)?;
        let loaded = &self.modules[module];
        let method = loaded.method(token).ok_or(Error::TokenNotFound(token))?;
        let name = loaded
            .method_full_name(token)
            .unwrap_or_else(|| token.to_string());
        if args.len() != method.signature.arg_count() {
            return Err(Error::Execution(format!(
                "{name} expects {} arguments, got {}",
                method.signature.arg_count(),
                args.len()
            )));
        }
        let (locals, finally_blocks) = match &method.body {
            Some(body) => (
                body.locals.iter().map(Value::zero_of).collect(),
                body.exception_handlers
                    .iter()
                    .filter(|handler| handler.flags.contains(ExceptionHandlerFlags::FINALLY))
                    .map(|handler| {
                        (
                            u64::from(handler.try_offset),
                            u64::from(handler.try_offset) + u64::from(handler.try_length),
                            u64::from(handler.handler_offset),
                        )
                    })
                    .collect::<Vec<_>>(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        let returns = !method.signature.ret.is_void();

        let id = self.next_frame;
        self.next_frame += 1;
        self.slots.push(FrameSlots { id, args, locals });
        let mut frame = Frame {
            id,
            module,
            name,
            code,
            stack: Vec::new(),
            finally_blocks,
            returns,
        };
        frame
            .finally_blocks
            .sort_by_key(|(start, end, _)| end - start);

        self.depth += 1;
        let exit = self.run(&mut frame, 0);
        self.depth -= 1;
        self.slots.pop();

        match exit? {
            Exit::Return(value) => Ok(value),
            Exit::EndFinally => Err(Error::Execution(format!(
                "endfinally outside of a finally block in {}",
                frame.name
            ))),
        }
    }

    /// Executes `frame` from `start` until it returns or leaves a finally block.
    fn run(&mut self, frame: &mut Frame, start: u64) -> Result<Exit> {
        let code = Rc::clone(&frame.code);
        let mut index = frame.position(start)?;
        loop {
            let instruction = code.get(index).ok_or_else(|| {
                Error::Execution(format!("Execution ran past the end of {}", frame.name))
            })?;
            self.check_limits()?;

            match self.step(frame, instruction)? {
                Step::Next => index += 1,
                Step::Jump(target) => index = frame.position(target)?,
                Step::Leave(target) => {
                    frame.stack.clear();
                    for handler in frame.exited_finally_blocks(instruction.offset, target) {
                        if let Exit::Return(_) = self.run(frame, handler)? {
                            return Err(Error::Execution(format!(
                                "ret inside a finally block of {}",
                                frame.name
                            )));
                        }
                        frame.stack.clear();
                    }
                    index = frame.position(target)?;
                }
                Step::Return(value) => return Ok(Exit::Return(value)),
                Step::EndFinally => return Ok(Exit::EndFinally),
            }
        }
    }

    /// Executes one instruction.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<Step> {
        if instruction.prefix == opcodes::FE_PREFIX {
            return self.step_extended(frame, instruction);
        }

        match instruction.opcode {
            opcodes::NOP => {}

            // Arguments and locals
            opcodes::LDARG_0..=opcodes::LDARG_3 => {
                let index = usize::from(instruction.opcode - opcodes::LDARG_0);
                let value = self.arg_mut(frame, index)?.clone();
                frame.push(value);
            }
            opcodes::LDLOC_0..=opcodes::LDLOC_3 => {
                let index = usize::from(instruction.opcode - opcodes::LDLOC_0);
                let value = self.local_mut(frame, index)?.clone();
                frame.push(value);
            }
            opcodes::STLOC_0..=opcodes::STLOC_3 => {
                let value = frame.pop()?;
                let index = usize::from(instruction.opcode - opcodes::STLOC_0);
                *self.local_mut(frame, index)? = value;
            }
            opcodes::LDARG_S => {
                let value = self.arg_mut(frame, index_operand(instruction)?)?.clone();
                frame.push(value);
            }
            opcodes::STARG_S => {
                let value = frame.pop()?;
                *self.arg_mut(frame, index_operand(instruction)?)? = value;
            }
            opcodes::LDLOC_S => {
                let value = self.local_mut(frame, index_operand(instruction)?)?.clone();
                frame.push(value);
            }
            opcodes::LDARGA_S => {
                let index = index_operand(instruction)?;
                self.arg_mut(frame, index)?;
                frame.push(Value::Address(Location::Argument {
                    frame: frame.id,
                    index,
                }));
            }
            opcodes::LDLOCA_S => {
                let index = index_operand(instruction)?;
                self.local_mut(frame, index)?;
                frame.push(Value::Address(Location::Local {
                    frame: frame.id,
                    index,
                }));
            }
            opcodes::STLOC_S => {
                let value = frame.pop()?;
                *self.local_mut(frame, index_operand(instruction)?)? = value;
            }

            // Constants
            opcodes::LDNULL => frame.push(Value::Null),
            opcodes::LDC_I4_M1..=opcodes::LDC_I4_8 => {
                frame.push(Value::I32(i32::from(instruction.opcode) - 0x16));
            }
            opcodes::LDC_I4_S | opcodes::LDC_I4 => {
                let value = instruction
                    .get_i32_operand()
                    .ok_or_else(|| invalid_operand(instruction))?;
                frame.push(Value::I32(value));
            }
            opcodes::LDC_I8 => {
                let value = instruction
                    .get_i64_operand()
                    .ok_or_else(|| invalid_operand(instruction))?;
                frame.push(Value::I64(value));
            }
            opcodes::LDC_R4 | opcodes::LDC_R8 => {
                let value = instruction
                    .get_f64_operand()
                    .ok_or_else(|| invalid_operand(instruction))?;
                frame.push(Value::F64(value));
            }
            opcodes::LDSTR => {
                let token = token_operand(instruction)?;
                let value = self.modules[frame.module]
                    .user_string(token)
                    .ok_or(Error::TokenNotFound(token))?;
                frame.push(Value::String(value));
            }

            // Stack
            opcodes::DUP => {
                let value = frame.pop()?;
                frame.push(value.clone());
                frame.push(value);
            }
            opcodes::POP => {
                frame.pop()?;
            }

            // Control flow
            opcodes::CALL | opcodes::CALLVIRT => self.call(frame, token_operand(instruction)?)?,
            opcodes::RET => {
                let value = if frame.returns { frame.pop()? } else { Value::Null };
                return Ok(Step::Return(value));
            }
            opcodes::BR_S..=opcodes::BLT_UN => return branch(frame, instruction),
            opcodes::SWITCH => {
                let selector = frame.pop()?;
                let target = selector
                    .as_i32()
                    .and_then(|value| usize::try_from(value).ok())
                    .and_then(|index| instruction.branch_targets.get(index));
                if let Some(target) = target {
                    return Ok(Step::Jump(*target));
                }
            }
            opcodes::LEAVE | opcodes::LEAVE_S => {
                let target = instruction
                    .branch_targets
                    .first()
                    .ok_or_else(|| invalid_operand(instruction))?;
                return Ok(Step::Leave(*target));
            }
            opcodes::ENDFINALLY => return Ok(Step::EndFinally),
            opcodes::THROW => {
                let exception = frame.pop()?;
                return Err(Error::Execution(format!(
                    "Unhandled exception {exception} thrown in {}",
                    frame.name
                )));
            }

            // Arithmetic
            opcodes::ADD..=opcodes::XOR => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(binary(instruction.opcode, left, right)?);
            }
            opcodes::SHL..=opcodes::SHR_UN => {
                let amount = frame.pop()?;
                let value = frame.pop()?;
                frame.push(shift(instruction.opcode, &value, &amount)?);
            }
            opcodes::NEG => {
                let value = match frame.pop()? {
                    Value::I32(value) => Value::I32(value.wrapping_neg()),
                    Value::I64(value) => Value::I64(value.wrapping_neg()),
                    Value::F64(value) => Value::F64(-value),
                    other => return Err(invalid_value(instruction, &other)),
                };
                frame.push(value);
            }
            opcodes::NOT => {
                let value = match frame.pop()? {
                    Value::I32(value) => Value::I32(!value),
                    Value::I64(value) => Value::I64(!value),
                    other => return Err(invalid_value(instruction, &other)),
                };
                frame.push(value);
            }
            opcodes::CONV_I1..=opcodes::CONV_U8
            | opcodes::CONV_U2
            | opcodes::CONV_U1
            | opcodes::CONV_I
            | opcodes::CONV_U => {
                let value = frame.pop()?;
                frame.push(convert(instruction, &value)?);
            }

            // Objects
            opcodes::NEWOBJ => self.new_instance(frame, token_operand(instruction)?)?,
            opcodes::LDFLD => {
                let field = self.field_ref(frame.module, token_operand(instruction)?)?;
                let receiver = frame.pop()?;
                let value = match self.dereference(receiver)? {
                    Value::Object(id) => match self.heap.get(id) {
                        Some(HeapEntry::Object { fields, .. }) => fields
                            .get(&field.name)
                            .cloned()
                            .unwrap_or_else(|| Value::zero_of(&field.signature)),
                        _ => return Err(invalid_value(instruction, &Value::Object(id))),
                    },
                    Value::Null => return Err(null_reference(frame, &field)),
                    other => return Err(invalid_value(instruction, &other)),
                };
                frame.push(value);
            }
            opcodes::STFLD => {
                let field = self.field_ref(frame.module, token_operand(instruction)?)?;
                let value = frame.pop()?;
                let receiver = frame.pop()?;
                match self.dereference(receiver)? {
                    Value::Object(id) => {
                        self.object_fields_mut(id)?.insert(field.name, value);
                    }
                    Value::Null => return Err(null_reference(frame, &field)),
                    other => return Err(invalid_value(instruction, &other)),
                }
            }
            opcodes::LDSFLD => {
                let field = self.field_ref(frame.module, token_operand(instruction)?)?;
                let value = self
                    .statics
                    .get(&(field.owner, field.name))
                    .cloned()
                    .unwrap_or_else(|| Value::zero_of(&field.signature));
                frame.push(value);
            }
            opcodes::STSFLD => {
                let field = self.field_ref(frame.module, token_operand(instruction)?)?;
                let value = frame.pop()?;
                self.statics.insert((field.owner, field.name), value);
            }
            opcodes::LDFLDA => {
                let field = self.field_ref(frame.module, token_operand(instruction)?)?;
                let receiver = frame.pop()?;
                let id = match self.dereference(receiver)? {
                    Value::Object(id) => id,
                    Value::Null => return Err(null_reference(frame, &field)),
                    other => return Err(invalid_value(instruction, &other)),
                };
                self.object_fields_mut(id)?
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::zero_of(&field.signature));
                frame.push(Value::Address(Location::Field {
                    object: id,
                    name: field.name,
                }));
            }
            opcodes::LDSFLDA => {
                let field = self.field_ref(frame.module, token_operand(instruction)?)?;
                self.statics
                    .entry((field.owner.clone(), field.name.clone()))
                    .or_insert_with(|| Value::zero_of(&field.signature));
                frame.push(Value::Address(Location::StaticField {
                    owner: field.owner,
                    name: field.name,
                }));
            }

            // Indirection, `ldobj` passes references through
            opcodes::LDOBJ | opcodes::LDIND_I1..=opcodes::LDIND_REF => {
                let value = match frame.pop()? {
                    Value::Address(location) => self.slot_mut(&location)?.clone(),
                    other if instruction.opcode == opcodes::LDOBJ => other,
                    other => return Err(invalid_value(instruction, &other)),
                };
                frame.push(load_indirect(instruction.opcode, value));
            }
            opcodes::STOBJ | opcodes::STIND_REF..=opcodes::STIND_R8 | opcodes::STIND_I => {
                let value = frame.pop()?;
                let Value::Address(location) = frame.pop()? else {
                    return Err(Error::Execution(format!(
                        "{} expects an address at IL_{:04x} in {}",
                        instruction.mnemonic, instruction.offset, frame.name
                    )));
                };
                *self.slot_mut(&location)? = store_indirect(instruction.opcode, value);
            }
            opcodes::BOX | opcodes::UNBOX_ANY | opcodes::CASTCLASS | opcodes::ISINST => {
                if frame.stack.is_empty() {
                    return Err(Error::Execution(format!("Stack underflow in {}", frame.name)));
                }
            }
            opcodes::LDTOKEN => {
                let value = self.load_token(frame.module, token_operand(instruction)?)?;
                frame.push(value);
            }

            // Arrays
            opcodes::NEWARR => {
                let element = self.runtime_type_of(frame.module, token_operand(instruction)?)?;
                let length = frame.pop_index()?;
                let array = self.new_array(vec![Value::default_for(&element); length]);
                frame.push(array);
            }
            opcodes::LDLEN => {
                let length = match frame.pop()? {
                    Value::Array(id) => self.array(id)?.len(),
                    other => return Err(invalid_value(instruction, &other)),
                };
                let length = i32::try_from(length)
                    .map_err(|_| Error::Execution(format!("Array length {length} overflows")))?;
                frame.push(Value::I32(length));
            }
            opcodes::LDELEM_I1..=opcodes::LDELEM_REF | opcodes::LDELEM => {
                let index = frame.pop_index()?;
                let element = match frame.pop()? {
                    Value::Array(id) => self.array(id)?.get(index).cloned(),
                    other => return Err(invalid_value(instruction, &other)),
                };
                let element = element.ok_or_else(|| index_out_of_range(frame, index))?;
                frame.push(element);
            }
            opcodes::LDELEMA => {
                let index = frame.pop_index()?;
                let array = match frame.pop()? {
                    Value::Array(id) => id,
                    other => return Err(invalid_value(instruction, &other)),
                };
                if index >= self.array(array)?.len() {
                    return Err(index_out_of_range(frame, index));
                }
                frame.push(Value::Address(Location::Element { array, index }));
            }
            opcodes::STELEM_I..=opcodes::STELEM_REF | opcodes::STELEM => {
                let value = frame.pop()?;
                let index = frame.pop_index()?;
                let slot = match frame.pop()? {
                    Value::Array(id) => self.array_mut(id)?.get_mut(index),
                    other => return Err(invalid_value(instruction, &other)),
                };
                *slot.ok_or_else(|| index_out_of_range(frame, index))? = value;
            }

            _ => return Err(unsupported(frame, instruction)),
        }
        Ok(Step::Next)
    }

    fn step_extended(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<Step> {
        match instruction.opcode {
            opcodes::FE_CEQ..=opcodes::FE_CLT_UN => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let result = match instruction.opcode {
                    opcodes::FE_CEQ => values_equal(&left, &right),
                    opcodes::FE_CGT => compare(&left, &right, false)? == Some(Ordering::Greater),
                    opcodes::FE_CGT_UN => match compare(&left, &right, true) {
                        Ok(ordering) => matches!(ordering, Some(Ordering::Greater) | None),
                        // References: `cgt.un` against null is the inequality test
                        Err(_) => !values_equal(&left, &right),
                    },
                    opcodes::FE_CLT => compare(&left, &right, false)? == Some(Ordering::Less),
                    _ => matches!(compare(&left, &right, true)?, Some(Ordering::Less) | None),
                };
                frame.push(Value::from(result));
            }
            opcodes::FE_LDARG => {
                let value = self.arg_mut(frame, index_operand(instruction)?)?.clone();
                frame.push(value);
            }
            opcodes::FE_STARG => {
                let value = frame.pop()?;
                *self.arg_mut(frame, index_operand(instruction)?)? = value;
            }
            opcodes::FE_LDLOC => {
                let value = self.local_mut(frame, index_operand(instruction)?)?.clone();
                frame.push(value);
            }
            opcodes::FE_LDARGA => {
                let index = index_operand(instruction)?;
                self.arg_mut(frame, index)?;
                frame.push(Value::Address(Location::Argument {
                    frame: frame.id,
                    index,
                }));
            }
            opcodes::FE_LDLOCA => {
                let index = index_operand(instruction)?;
                self.local_mut(frame, index)?;
                frame.push(Value::Address(Location::Local {
                    frame: frame.id,
                    index,
                }));
            }
            opcodes::FE_STLOC => {
                let value = frame.pop()?;
                *self.local_mut(frame, index_operand(instruction)?)? = value;
            }
            _ => return Err(unsupported(frame, instruction)),
        }
        Ok(Step::Next)
    }

    fn call(&mut self, frame: &mut Frame, token: Token) -> Result<()> {
        match self.resolve_callee(frame.module, token)? {
            Callee::Method { module, token } => {
                let signature = self.signature_of(module, token)?;
                let args = frame.pop_many(signature.arg_count())?;
                let result = self.call_method(module, token, args)?;
                if !signature.ret.is_void() {
                    frame.push(result);
                }
            }
            Callee::Bridge => self.bridge(frame)?,
            Callee::BaseConstructor => {
                frame.pop()?;
            }
            Callee::Handle => {
                if frame.stack.is_empty() {
                    return Err(Error::Execution(format!("Stack underflow in {}", frame.name)));
                }
            }
        }
        Ok(())
    }

    fn new_instance(&mut self, frame: &mut Frame, token: Token) -> Result<()> {
        match self.resolve_callee(frame.module, token)? {
            Callee::Method { module, token } => {
                let (declaring, params) = {
                    let method = self.modules[module]
                        .method(token)
                        .ok_or(Error::TokenNotFound(token))?;
                    (method.declaring, method.signature.params.len())
                };
                let ty = self.runtime_type_of(module, declaring)?;
                let args = frame.pop_many(params)?;
                let id = self.allocate(ty);
                let args = std::iter::once(Value::Object(id)).chain(args).collect();
                self.call_method(module, token, args)?;
                frame.push(Value::Object(id));
            }
            Callee::BaseConstructor => {
                let id = self.allocate(RuntimeType::new(CORE_LIBRARY, "System.Object"));
                frame.push(Value::Object(id));
            }
            Callee::Bridge | Callee::Handle => {
                return Err(Error::Execution(format!(
                    "{token} is not a constructor, in {}",
                    frame.name
                )))
            }
        }
        Ok(())
    }

    /// `TryMock(owner, instance, returnType, out result, method, args)`
    fn bridge(&mut self, frame: &mut Frame) -> Result<()> {
        let [owner, instance, return_type, result, method, args]: [Value; 6] = frame
            .pop_many(6)?
            .try_into()
            .map_err(|_| Error::Execution("TryMock expects 6 arguments".to_string()))?;

        let invalid = |what: &str, value: &Value| {
            Error::Execution(format!("TryMock received {value} as {what} in {}", frame.name))
        };
        let Value::Type(owner) = owner else {
            return Err(invalid("owner", &owner));
        };
        let instance = match instance {
            Value::Object(id) => Some(id),
            Value::Null => None,
            other => return Err(invalid("instance", &other)),
        };
        let Value::Type(return_type) = return_type else {
            return Err(invalid("return type", &return_type));
        };
        let Value::Address(result) = result else {
            return Err(invalid("result address", &result));
        };
        let Value::Method(method) = method else {
            return Err(invalid("method", &method));
        };
        let Value::Array(args) = args else {
            return Err(invalid("arguments", &args));
        };
        let args = self.array(args)?.clone();

        let instance_type = match instance {
            Some(id) => match self.heap.get(id) {
                Some(HeapEntry::Object { ty, .. }) => Some((ty.clone(), id)),
                _ => return Err(Error::Execution(format!("object#{id} is not an object"))),
            },
            None => None,
        };
        let (handled, value) = self.registry.bridge(
            &owner,
            instance_type.as_ref().map(|(ty, id)| (ty, *id)),
            &return_type,
            method,
            args,
        );
        *self.slot_mut(&result)? = value;
        frame.push(Value::from(handled));
        Ok(())
    }

    fn resolve_callee(&self, module: usize, token: Token) -> Result<Callee> {
        let current = &self.modules[module];
        match token.table_id() {
            Some(TableId::MethodDef) if current.method(token).is_some() => {
                Ok(Callee::Method { module, token })
            }
            Some(TableId::MemberRef) => {
                if is_bridge_call(current, token) {
                    return Ok(Callee::Bridge);
                }

                let member = current
                    .member_ref(token)
                    .ok_or(Error::TokenNotFound(token))?;
                let MemberSig::Method(signature) = &member.signature else {
                    return Err(Error::Execution(format!("{token} is not a method reference")));
                };
                let parent = current
                    .type_full_name(member.parent)
                    .ok_or(Error::TokenNotFound(member.parent))?;
                match (parent.as_str(), member.name.as_str()) {
                    ("System.Object" | "System.ValueType", ".ctor") => {
                        return Ok(Callee::BaseConstructor)
                    }
                    ("System.Type", "GetTypeFromHandle")
                    | ("System.Reflection.MethodBase", "GetMethodFromHandle") => {
                        return Ok(Callee::Handle)
                    }
                    _ => {}
                }

                let scope = self.scope_of(module, member.parent);
                let (target_module, type_token) = self.locate_type(scope.as_deref(), &parent)?;
                let target = &self.modules[target_module];
                let type_def = target
                    .type_def(type_token)
                    .ok_or(Error::TokenNotFound(type_token))?;
                target
                    .type_methods(type_def)
                    .find(|candidate| {
                        candidate.name == member.name
                            && self.signatures_match(
                                module,
                                signature,
                                target_module,
                                &candidate.signature,
                            )
                    })
                    .map(|candidate| Callee::Method {
                        module: target_module,
                        token: candidate.token,
                    })
                    .ok_or_else(|| {
                        Error::Execution(format!(
                            "Cannot resolve {parent}::{} in {}",
                            member.name,
                            target.name()
                        ))
                    })
            }
            _ => Err(Error::TokenNotFound(token)),
        }
    }

    /// Name of the module that defines the type `token` of `module`.
    fn scope_of(&self, module: usize, token: Token) -> Option<String> {
        let current = &self.modules[module];
        if token.is_table(TableId::TypeRef) {
            current
                .type_ref_reference(token)
                .map(|reference| reference.name.clone())
        } else {
            Some(current.name().to_string())
        }
    }

    fn signatures_match(
        &self,
        left_module: usize,
        left: &MethodSignature,
        right_module: usize,
        right: &MethodSignature,
    ) -> bool {
        left.has_this == right.has_this
            && left.params.len() == right.params.len()
            && self.type_key(left_module, &left.ret) == self.type_key(right_module, &right.ret)
            && left
                .params
                .iter()
                .zip(&right.params)
                .all(|(l, r)| self.type_key(left_module, l) == self.type_key(right_module, r))
    }

    /// Module independent name of a signature type.
    fn type_key(&self, module: usize, signature: &TypeSig) -> String {
        match signature {
            TypeSig::Class(token) | TypeSig::ValueType(token) => self.modules[module]
                .type_full_name(*token)
                .unwrap_or_else(|| token.to_string()),
            TypeSig::SzArray(element) => format!("{}[]", self.type_key(module, element)),
            TypeSig::ByRef(element) => format!("{}&", self.type_key(module, element)),
            other => other.to_string(),
        }
    }

    fn signature_of(&self, module: usize, token: Token) -> Result<MethodSignature> {
        self.modules[module]
            .method(token)
            .map(|method| method.signature.clone())
            .ok_or(Error::TokenNotFound(token))
    }

    fn field_ref(&self, module: usize, token: Token) -> Result<FieldRef> {
        let current = &self.modules[module];
        match token.table_id() {
            Some(TableId::Field) => {
                let field = current.field(token).ok_or(Error::TokenNotFound(token))?;
                Ok(FieldRef {
                    owner: current
                        .type_full_name(field.declaring)
                        .ok_or(Error::TokenNotFound(field.declaring))?,
                    name: field.name.clone(),
                    signature: field.signature.clone(),
                })
            }
            Some(TableId::MemberRef) => {
                let member = current
                    .member_ref(token)
                    .ok_or(Error::TokenNotFound(token))?;
                let MemberSig::Field(signature) = &member.signature else {
                    return Err(Error::Execution(format!("{token} is not a field reference")));
                };
                Ok(FieldRef {
                    owner: current
                        .type_full_name(member.parent)
                        .ok_or(Error::TokenNotFound(member.parent))?,
                    name: member.name.clone(),
                    signature: signature.clone(),
                })
            }
            _ => Err(Error::TokenNotFound(token)),
        }
    }

    fn runtime_type_of(&self, module: usize, token: Token) -> Result<RuntimeType> {
        let current = &self.modules[module];
        let name = current
            .type_full_name(token)
            .ok_or(Error::TokenNotFound(token))?;
        let scope = self
            .scope_of(module, token)
            .unwrap_or_else(|| current.name().to_string());
        Ok(RuntimeType::new(scope, name))
    }

    fn load_token(&self, module: usize, token: Token) -> Result<Value> {
        let current = &self.modules[module];
        match token.table_id() {
            Some(TableId::TypeDef | TableId::TypeRef | TableId::TypeSpec) => {
                Ok(Value::Type(self.runtime_type_of(module, token)?))
            }
            Some(TableId::MethodDef) => {
                let method = current.method(token).ok_or(Error::TokenNotFound(token))?;
                Ok(Value::Method(RuntimeMethod {
                    declaring: self.runtime_type_of(module, method.declaring)?,
                    name: method.name.clone(),
                    arity: method.signature.params.len(),
                }))
            }
            Some(TableId::MemberRef) => {
                let member = current
                    .member_ref(token)
                    .ok_or(Error::TokenNotFound(token))?;
                let MemberSig::Method(signature) = &member.signature else {
                    return Err(Error::Execution(format!("ldtoken of field {token}")));
                };
                Ok(Value::Method(RuntimeMethod {
                    declaring: self.runtime_type_of(module, member.parent)?,
                    name: member.name.clone(),
                    arity: signature.params.len(),
                }))
            }
            _ => Err(Error::Execution(format!("ldtoken of {token} is not supported"))),
        }
    }
}

fn index_operand(instruction: &Instruction) -> Result<usize> {
    instruction
        .get_index_operand()
        .map(usize::from)
        .ok_or_else(|| invalid_operand(instruction))
}

fn token_operand(instruction: &Instruction) -> Result<Token> {
    instruction
        .get_token_operand()
        .ok_or_else(|| invalid_operand(instruction))
}

fn invalid_operand(instruction: &Instruction) -> Error {
    Error::Execution(format!(
        "Invalid operand for {} at IL_{:04x}",
        instruction.mnemonic, instruction.offset
    ))
}

fn invalid_value(instruction: &Instruction, value: &Value) -> Error {
    Error::Execution(format!(
        "{} cannot operate on {value} at IL_{:04x}",
        instruction.mnemonic, instruction.offset
    ))
}

fn unsupported(frame: &Frame, instruction: &Instruction) -> Error {
    Error::Execution(format!(
        "Unsupported instruction {} at IL_{:04x} in {}",
        instruction.mnemonic, instruction.offset, frame.name
    ))
}

fn null_reference(frame: &Frame, field: &FieldRef) -> Error {
    Error::Execution(format!(
        "Null reference accessing {}::{} in {}",
        field.owner, field.name, frame.name
    ))
}

fn index_out_of_range(frame: &Frame, index: usize) -> Error {
    Error::Execution(format!("Index {index} out of range in {}", frame.name))
}

fn branch(frame: &mut Frame, instruction: &Instruction) -> Result<Step> {
    let target = *instruction
        .branch_targets
        .first()
        .ok_or_else(|| invalid_operand(instruction))?;
    // br, brfalse, brtrue, beq, bge, bgt, ble, blt, bne.un, bge.un, bgt.un, ble.un, blt.un
    let kind = if instruction.opcode >= opcodes::BR {
        instruction.opcode - opcodes::BR
    } else {
        instruction.opcode - opcodes::BR_S
    };

    let taken = match kind {
        0 => true,
        1 => !frame.pop()?.is_truthy(),
        2 => frame.pop()?.is_truthy(),
        3 | 8 => {
            let right = frame.pop()?;
            let left = frame.pop()?;
            values_equal(&left, &right) == (kind == 3)
        }
        _ => {
            let right = frame.pop()?;
            let left = frame.pop()?;
            let unsigned = kind > 8;
            let ordering = compare(&left, &right, unsigned)?;
            let accepted: &[Ordering] = match kind {
                4 | 9 => &[Ordering::Greater, Ordering::Equal],
                5 | 10 => &[Ordering::Greater],
                6 | 11 => &[Ordering::Less, Ordering::Equal],
                _ => &[Ordering::Less],
            };
            ordering.map_or(unsigned, |ordering| accepted.contains(&ordering))
        }
    };

    Ok(if taken { Step::Jump(target) } else { Step::Next })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match compare(left, right, false) {
        Ok(ordering) => ordering == Some(Ordering::Equal),
        Err(_) => left == right,
    }
}

/// Orders two numeric values. `None` for unordered floats.
#[allow(clippy::cast_sign_loss)]
fn compare(left: &Value, right: &Value, unsigned: bool) -> Result<Option<Ordering>> {
    match (left, right) {
        (Value::I32(l), Value::I32(r)) if unsigned => Ok(Some((*l as u32).cmp(&(*r as u32)))),
        (Value::I32(l), Value::I32(r)) => Ok(Some(l.cmp(r))),
        (Value::F64(l), Value::F64(r)) => Ok(l.partial_cmp(r)),
        _ => match (left.as_i64(), right.as_i64()) {
            (Some(l), Some(r)) if unsigned => Ok(Some((l as u64).cmp(&(r as u64)))),
            (Some(l), Some(r)) => Ok(Some(l.cmp(&r))),
            _ => Err(Error::Execution(format!("Cannot compare {left} with {right}"))),
        },
    }
}

/// `add` to `xor`, 32-bit operands wrap like 32-bit hardware.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn binary(opcode: u8, left: Value, right: Value) -> Result<Value> {
    let invalid = || Error::Execution(format!("Invalid operands {left} and {right}"));
    let division_by_zero = || Error::Execution("Division by zero".to_string());
    let overflow = || Error::Execution("Arithmetic overflow".to_string());

    if let (Value::F64(l), Value::F64(r)) = (&left, &right) {
        let value = match opcode {
            opcodes::ADD => l + r,
            opcodes::SUB => l - r,
            opcodes::MUL => l * r,
            opcodes::DIV => l / r,
            opcodes::REM => l % r,
            _ => return Err(invalid()),
        };
        return Ok(Value::F64(value));
    }

    let narrow = matches!((&left, &right), (Value::I32(_), Value::I32(_)));
    let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) else {
        return Err(invalid());
    };
    let mask = if narrow { u64::from(u32::MAX) } else { u64::MAX };
    let (ul, ur) = (l as u64 & mask, r as u64 & mask);

    let value = match opcode {
        opcodes::ADD => l.wrapping_add(r),
        opcodes::SUB => l.wrapping_sub(r),
        opcodes::MUL => l.wrapping_mul(r),
        opcodes::DIV if r == 0 => return Err(division_by_zero()),
        opcodes::DIV if narrow => (l as i32)
            .checked_div(r as i32)
            .map(i64::from)
            .ok_or_else(overflow)?,
        opcodes::DIV => l.checked_div(r).ok_or_else(overflow)?,
        opcodes::DIV_UN if ur == 0 => return Err(division_by_zero()),
        opcodes::DIV_UN => (ul / ur) as i64,
        opcodes::REM if r == 0 => return Err(division_by_zero()),
        opcodes::REM if narrow => (l as i32)
            .checked_rem(r as i32)
            .map(i64::from)
            .ok_or_else(overflow)?,
        opcodes::REM => l.checked_rem(r).ok_or_else(overflow)?,
        opcodes::REM_UN if ur == 0 => return Err(division_by_zero()),
        opcodes::REM_UN => (ul % ur) as i64,
        opcodes::AND => l & r,
        opcodes::OR => l | r,
        opcodes::XOR => l ^ r,
        _ => return Err(invalid()),
    };

    Ok(if narrow {
        Value::I32(value as i32)
    } else {
        Value::I64(value)
    })
}

/// Narrows a value read by `ldind.i1` to `ldind.u2` to the width it names.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn load_indirect(opcode: u8, value: Value) -> Value {
    match (opcode, value) {
        (opcodes::LDIND_I1, Value::I32(v)) => Value::I32(i32::from(v as i8)),
        (opcodes::LDIND_U1, Value::I32(v)) => Value::I32(i32::from(v as u8)),
        (opcodes::LDIND_I2, Value::I32(v)) => Value::I32(i32::from(v as i16)),
        (opcodes::LDIND_U2, Value::I32(v)) => Value::I32(i32::from(v as u16)),
        (_, value) => value,
    }
}

/// Truncates a value written by `stind.i1` or `stind.i2`.
#[allow(clippy::cast_possible_truncation)]
fn store_indirect(opcode: u8, value: Value) -> Value {
    match (opcode, value) {
        (opcodes::STIND_I1, Value::I32(v)) => Value::I32(i32::from(v as i8)),
        (opcodes::STIND_I2, Value::I32(v)) => Value::I32(i32::from(v as i16)),
        (_, value) => value,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn shift(opcode: u8, value: &Value, amount: &Value) -> Result<Value> {
    let amount = amount
        .as_i32()
        .map(|amount| amount as u32)
        .ok_or_else(|| Error::Execution(format!("Invalid shift amount {amount}")))?;
    match (value, opcode) {
        (Value::I32(v), opcodes::SHL) => Ok(Value::I32(v.wrapping_shl(amount))),
        (Value::I32(v), opcodes::SHR) => Ok(Value::I32(v.wrapping_shr(amount))),
        (Value::I32(v), _) => Ok(Value::I32((*v as u32).wrapping_shr(amount) as i32)),
        (Value::I64(v), opcodes::SHL) => Ok(Value::I64(v.wrapping_shl(amount))),
        (Value::I64(v), opcodes::SHR) => Ok(Value::I64(v.wrapping_shr(amount))),
        (Value::I64(v), _) => Ok(Value::I64((*v as u64).wrapping_shr(amount) as i64)),
        _ => Err(Error::Execution(format!("Cannot shift {value}"))),
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]
fn convert(instruction: &Instruction, value: &Value) -> Result<Value> {
    let integer = match value {
        Value::I32(v) => i64::from(*v),
        Value::I64(v) => *v,
        Value::F64(v) => *v as i64,
        other => return Err(invalid_value(instruction, other)),
    };
    // conv.u8 and conv.u zero-extend 32-bit operands
    let unsigned = match value {
        Value::I32(v) => i64::from(*v as u32),
        _ => integer,
    };

    Ok(match instruction.opcode {
        opcodes::CONV_I1 => Value::I32(i32::from(integer as i8)),
        opcodes::CONV_I2 => Value::I32(i32::from(integer as i16)),
        opcodes::CONV_I4 | opcodes::CONV_U4 => Value::I32(integer as i32),
        opcodes::CONV_U1 => Value::I32(i32::from(integer as u8)),
        opcodes::CONV_U2 => Value::I32(i32::from(integer as u16)),
        opcodes::CONV_I8 | opcodes::CONV_I => Value::I64(integer),
        opcodes::CONV_U8 | opcodes::CONV_U => Value::I64(unsigned),
        opcodes::CONV_R4 => Value::F64(f64::from(value.as_f64().unwrap_or_default() as f32)),
        opcodes::CONV_R8 => Value::F64(value.as_f64().unwrap_or_default()),
        _ => return Err(invalid_value(instruction, value)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            flags::{MethodAttributes, MethodImplAttributes, TypeAttributes},
            identity::ModuleVersion,
            method::MethodBodyBuilder,
        },
        runtime::substitute::{substitute_static_for, Substitute},
        test::{app_module, calculator_module, CALCULATOR_TYPE, POINT_TYPE, SCIENTIFIC_TYPE},
        weaver::{build_support_module, MockInjector},
    };

    fn patched(mut module: Module) -> Module {
        let support = build_support_module().unwrap();
        let image = support.to_bytes().unwrap();
        let injector = MockInjector::from_support(&support, &image, Path::new(".")).unwrap();
        injector.patch(&mut module, &[]).unwrap();
        module
    }

    fn add(interpreter: &mut Interpreter<'_>, a: i32, b: i32) -> Value {
        interpreter
            .invoke("Demo.Calculator::Add", None, vec![Value::I32(a), Value::I32(b)])
            .unwrap()
    }

    #[test]
    fn runs_original_methods() {
        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry);
        interpreter.load(calculator_module()).unwrap();

        assert_eq!(add(&mut interpreter, 2, 1), Value::I32(3));
        let max = interpreter
            .invoke("Demo.Calculator::Max", None, vec![Value::I32(3), Value::I32(7)])
            .unwrap();
        assert_eq!(max, Value::I32(7));
        let guarded = interpreter
            .invoke("Demo.Calculator::Guarded", None, vec![Value::I32(5)])
            .unwrap();
        assert_eq!(guarded, Value::I32(5));
        let describe = interpreter
            .invoke("Demo.Calculator::Describe", None, vec![])
            .unwrap();
        assert_eq!(describe, Value::from("calculator"));

        let array = interpreter.new_array(vec![Value::I32(9), Value::I32(8)]);
        let first = interpreter
            .invoke("Demo.Calculator::First", None, vec![array])
            .unwrap();
        assert_eq!(first, Value::I32(9));
    }

    #[test]
    fn objects_and_fields() {
        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry);
        interpreter.load(calculator_module()).unwrap();

        let calculator = interpreter.new_object(SCIENTIFIC_TYPE, vec![]).unwrap();
        assert_eq!(interpreter.field(&calculator, "offset"), Some(Value::I32(0)));
        assert_eq!(
            interpreter.type_of(&calculator).map(|ty| ty.name.as_str()),
            Some(SCIENTIFIC_TYPE)
        );

        interpreter
            .invoke(
                "Demo.Calculator::SetOffset",
                Some(calculator.clone()),
                vec![Value::I32(10)],
            )
            .unwrap();
        let sum = interpreter
            .invoke("Demo.Calculator::AddOffset", Some(calculator.clone()), vec![Value::I32(4)])
            .unwrap();
        assert_eq!(sum, Value::I32(14));
        let square = interpreter
            .invoke("Demo.ScientificCalculator::Square", Some(calculator), vec![Value::I32(6)])
            .unwrap();
        assert_eq!(square, Value::I32(36));

        let point = interpreter.new_object(POINT_TYPE, vec![]).unwrap();
        interpreter.set_field(&point, "X", Value::I32(2)).unwrap();
        interpreter.set_field(&point, "Y", Value::I32(5)).unwrap();
        let sum = interpreter
            .invoke("Demo.Point::Sum", Some(point), vec![])
            .unwrap();
        assert_eq!(sum, Value::I32(7));
    }

    #[test]
    fn patched_methods_are_transparent() {
        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry);
        interpreter.load(patched(calculator_module())).unwrap();
        interpreter.load(patched(app_module())).unwrap();

        assert_eq!(add(&mut interpreter, 2, 1), Value::I32(3));
        let run = interpreter
            .invoke("Demo.App.Program::Run", None, vec![])
            .unwrap();
        assert_eq!(run, Value::I32(3));
        let touch = interpreter
            .invoke("Demo.Calculator::Touch", None, vec![])
            .unwrap();
        assert_eq!(touch, Value::Null);
        let guarded = interpreter
            .invoke("Demo.Calculator::Guarded", None, vec![Value::I32(8)])
            .unwrap();
        assert_eq!(guarded, Value::I32(8));
        registry.teardown().unwrap();
    }

    #[test]
    fn static_override_with_fallback() {
        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry);
        interpreter.load(patched(calculator_module())).unwrap();

        let substitute = Rc::new(Substitute::new());
        substitute
            .returns("Add", vec![Value::I32(1), Value::I32(2)], Value::I32(5))
            .returns_for_any_args("Describe", Value::from("mocked"));
        let ty = interpreter.runtime_type(CALCULATOR_TYPE).unwrap();
        let handle = substitute_static_for(&registry, ty, substitute.clone()).unwrap();

        assert_eq!(add(&mut interpreter, 1, 2), Value::I32(5));
        assert_eq!(add(&mut interpreter, 2, 1), Value::I32(3));
        let describe = interpreter
            .invoke("Demo.Calculator::Describe", None, vec![])
            .unwrap();
        assert_eq!(describe, Value::from("mocked"));
        assert_eq!(substitute.received_count("Add"), 2);

        handle.release().unwrap();
        assert_eq!(add(&mut interpreter, 1, 2), Value::I32(3));
        assert_eq!(substitute.received_count("Add"), 2);
        registry.teardown().unwrap();
    }

    #[test]
    fn instance_substitution() {
        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry);
        interpreter.load(patched(calculator_module())).unwrap();

        let substitute = Rc::new(Substitute::new());
        substitute.returns_for_any_args("Square", Value::I32(100));
        let (mock, handle) = interpreter
            .substitute_instance_for(SCIENTIFIC_TYPE, vec![], substitute.clone())
            .unwrap();

        let square = interpreter
            .invoke("Demo.ScientificCalculator::Square", Some(mock.clone()), vec![Value::I32(3)])
            .unwrap();
        assert_eq!(square, Value::I32(100));
        // Unconfigured calls run the original, on an instance whose own constructor never ran.
        let sum = interpreter
            .invoke("Demo.Calculator::AddOffset", Some(mock.clone()), vec![Value::I32(4)])
            .unwrap();
        assert_eq!(sum, Value::I32(4));
        assert_eq!(substitute.received()[0].instance, mock.as_object());

        let real = interpreter.new_object(SCIENTIFIC_TYPE, vec![]).unwrap();
        let square = interpreter
            .invoke("Demo.ScientificCalculator::Square", Some(real), vec![Value::I32(3)])
            .unwrap();
        assert_eq!(square, Value::I32(9));

        handle.release().unwrap();
        registry.teardown().unwrap();
    }

    #[test]
    fn instance_substitution_errors() {
        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry);
        interpreter.load(patched(calculator_module())).unwrap();
        let router: Rc<dyn CallRouter> = Rc::new(Substitute::new());

        assert!(matches!(
            interpreter.substitute_instance_for("Demo.IShape", vec![], router.clone()),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            interpreter.substitute_instance_for(CALCULATOR_TYPE, vec![Value::I32(1)], router.clone()),
            Err(Error::Substitute(_))
        ));

        let registry = CallRegistry::new();
        let mut unpatched = Interpreter::new(&registry);
        unpatched.load(calculator_module()).unwrap();
        assert!(matches!(
            unpatched.substitute_instance_for(CALCULATOR_TYPE, vec![], router),
            Err(Error::Substitute(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn instruction_limit() {
        let mut module = Module::new("Loop", ModuleVersion::new(1, 0, 0, 0));
        let object = module.import_core_type("System", "Object");
        let ty = module.add_type("Demo", "Spin", TypeAttributes::PUBLIC, Some(object));
        let body = MethodBodyBuilder::new()
            .implementation(|asm| {
                asm.define_label("top")?;
                asm.emit_branch("br.s", "top")
            })
            .build()
            .unwrap();
        module
            .add_method(
                ty,
                "Forever",
                MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                MethodImplAttributes::IL,
                MethodSignature::new_static(TypeSig::Void, vec![]),
                Some(body),
            )
            .unwrap();

        let registry = CallRegistry::new();
        let mut interpreter = Interpreter::new(&registry).with_limits(ExecutionLimits {
            max_call_depth: 8,
            max_instructions: 100,
        });
        interpreter.load(module).unwrap();
        assert!(matches!(
            interpreter.invoke("Demo.Spin::Forever", None, vec![]),
            Err(Error::Execution(message)) if message.contains("limit")
        ));
        assert_eq!(interpreter.instructions_executed(), 101);
    }

    #[test]
    fn arithmetic() {
        let value = binary(opcodes::ADD, Value::I32(i32::MAX), Value::I32(1)).unwrap();
        assert_eq!(value, Value::I32(i32::MIN));
        let value = binary(opcodes::DIV_UN, Value::I32(-2), Value::I32(2)).unwrap();
        assert_eq!(value, Value::I32(i32::MAX));
        let value = binary(opcodes::MUL, Value::I64(3), Value::I32(4)).unwrap();
        assert_eq!(value, Value::I64(12));
        assert!(binary(opcodes::REM, Value::I32(1), Value::I32(0)).is_err());
        for opcode in [opcodes::DIV, opcodes::REM] {
            assert!(matches!(
                binary(opcode, Value::I32(i32::MIN), Value::I32(-1)),
                Err(Error::Execution(message)) if message == "Arithmetic overflow"
            ));
            assert!(matches!(
                binary(opcode, Value::I64(i64::MIN), Value::I64(-1)),
                Err(Error::Execution(message)) if message == "Arithmetic overflow"
            ));
        }
        assert_eq!(
            binary(opcodes::DIV, Value::I32(i32::MIN), Value::I32(1)).unwrap(),
            Value::I32(i32::MIN)
        );
        assert_eq!(
            shift(opcodes::SHR_UN, &Value::I32(-1), &Value::I32(28)).unwrap(),
            Value::I32(15)
        );
        assert_eq!(compare(&Value::I32(-1), &Value::I32(1), true).unwrap(), Some(Ordering::Greater));
        assert!(values_equal(&Value::Null, &Value::Null));
        assert!(!values_equal(&Value::Object(1), &Value::Null));
    }
}
