use crate::{
    assembly::InstructionEncoder,
    metadata::{
        method::{ExceptionHandler, MethodBody},
        signatures::TypeSig,
    },
    Error, Result,
};

type ImplementationFn = Box<dyn FnOnce(&mut InstructionEncoder) -> Result<()>>;

/// Builds a [`MethodBody`] from an encoder closure.
///
/// ```rust
/// use cilweave::metadata::{method::MethodBodyBuilder, signatures::TypeSig};
///
/// // static int Add(int a, int b) => a + b;
/// let body = MethodBodyBuilder::new()
///     .implementation(|asm| {
///         asm.emit_ldarg(0)?;
///         asm.emit_ldarg(1)?;
///         asm.emit_instruction("add", None)?;
///         asm.emit_ret(true)
///     })
///     .build()?;
///
/// assert_eq!(body.code, vec![0x02, 0x03, 0x58, 0x2A]);
/// assert_eq!(body.max_stack, 2);
/// # Ok::<(), cilweave::Error>(())
/// ```
pub struct MethodBodyBuilder {
    /// Explicit stack limit, computed from the code when unset
    max_stack: Option<u16>,
    init_locals: bool,
    locals: Vec<TypeSig>,
    implementation: Option<ImplementationFn>,
    exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBodyBuilder {
    /// Create a builder with `init_locals` set and no locals.
    #[must_use]
    pub fn new() -> Self {
        MethodBodyBuilder {
            max_stack: None,
            init_locals: true,
            locals: Vec::new(),
            implementation: None,
            exception_handlers: Vec::new(),
        }
    }

    /// Override the computed stack limit.
    #[must_use]
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    /// Add a local variable; locals are numbered in the order they are added.
    #[must_use]
    pub fn local(mut self, local_type: TypeSig) -> Self {
        self.locals.push(local_type);
        self
    }

    /// Set whether locals are zero-initialised.
    #[must_use]
    pub fn init_locals(mut self, init: bool) -> Self {
        self.init_locals = init;
        self
    }

    /// Add an exception handling clause.
    #[must_use]
    pub fn exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    /// Set the code generator.
    #[must_use]
    pub fn implementation<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut InstructionEncoder) -> Result<()> + 'static,
    {
        self.implementation = Some(Box::new(f));
        self
    }

    /// Run the code generator and assemble the body.
    ///
    /// # Errors
    /// [`Error::Error`] without implementation, otherwise whatever the generator or the encoder
    /// reports.
    pub fn build(self) -> Result<MethodBody> {
        let MethodBodyBuilder {
            max_stack,
            init_locals,
            locals,
            implementation,
            exception_handlers,
        } = self;

        let implementation = implementation
            .ok_or_else(|| Error::Error("Method body implementation is required".to_string()))?;

        let mut encoder = InstructionEncoder::new();
        implementation(&mut encoder)?;
        let (code, computed_max_stack, _) = encoder.finalize()?;

        Ok(MethodBody {
            max_stack: max_stack.unwrap_or(computed_max_stack),
            init_locals,
            locals,
            code,
            exception_handlers,
        })
    }
}

impl Default for MethodBodyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
