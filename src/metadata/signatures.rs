//! Type and method signatures.
//!
//! Signatures use the ECMA-335 II.23.2 blob encoding: one element-type byte per type, type
//! references as compressed `TypeDefOrRefOrSpec` coded indexes and counts as compressed
//! integers. Every element type of the standard is understood, including generic
//! instantiations, generic parameters, pointers, general arrays, function pointers and custom
//! modifiers, so the signatures of any compiled module can be decoded and written back.
//!
//! Field (`0x06`) and local variable (`0x07`) signatures carry their own prefix and are handled
//! by [`parse_field_signature`] and [`parse_local_signature`] with their `encode_*`
//! counterparts.

use std::fmt;

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::token::Token,
    Error::RecursionLimit,
    Result,
};

const MAX_RECURSION_DEPTH: usize = 50;

/// Element type codes (ECMA-335 II.23.1.16)
#[allow(non_snake_case, missing_docs)]
pub mod ELEMENT_TYPE {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1b;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;
    pub const MVAR: u8 = 0x1e;
    pub const CMOD_REQD: u8 = 0x1f;
    pub const CMOD_OPT: u8 = 0x20;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;
}

/// Calling convention flag for instance methods
pub const CALLCONV_HASTHIS: u8 = 0x20;
/// Calling convention flag for an explicitly declared `this` parameter
pub const CALLCONV_EXPLICITTHIS: u8 = 0x40;
/// Calling convention flag for generic methods
pub const CALLCONV_GENERIC: u8 = 0x10;
/// Calling convention of variable argument methods
pub const CALLCONV_VARARG: u8 = 0x05;
/// Leading byte of a field signature
pub const SIGNATURE_FIELD: u8 = 0x06;
/// Leading byte of a local variable signature
pub const SIGNATURE_LOCAL: u8 = 0x07;

/// Shape of a general array: rank, declared sizes and lower bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArrayShape {
    /// Number of dimensions
    pub rank: u32,
    /// Sizes of the leading dimensions
    pub sizes: Vec<u32>,
    /// Lower bounds of the leading dimensions
    pub lower_bounds: Vec<i32>,
}

/// A type as it appears in a field, local, parameter or return signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// void
    Void,
    /// bool
    Boolean,
    /// char
    Char,
    /// signed 8bit integer
    I1,
    /// unsigned 8bit integer
    U1,
    /// signed 16bit integer
    I2,
    /// unsigned 16bit integer
    U2,
    /// signed 32bit integer
    I4,
    /// unsigned 32bit integer
    U4,
    /// signed 64bit integer
    I8,
    /// unsigned 64bit integer
    U8,
    /// 32bit floating-point
    R4,
    /// 64bit floating-point
    R8,
    /// signed integer, sized to executing platform
    I,
    /// unsigned integer, sized to executing platform
    U,
    /// System.String
    String,
    /// System.Object
    Object,
    /// System.TypedReference
    TypedByRef,
    /// A reference type, `TypeDef` / `TypeRef` / `TypeSpec` token
    Class(Token),
    /// A value type, `TypeDef` / `TypeRef` / `TypeSpec` token
    ValueType(Token),
    /// Single dimensional, zero based array
    SzArray(Box<TypeSig>),
    /// General array with an explicit shape
    Array(Box<TypeSig>, ArrayShape),
    /// Managed reference
    ByRef(Box<TypeSig>),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Function pointer
    FnPtr(Box<MethodSignature>),
    /// A generic type, [`TypeSig::Class`] or [`TypeSig::ValueType`], with its arguments
    GenericInst(Box<TypeSig>, Vec<TypeSig>),
    /// Generic parameter of the enclosing type
    Var(u32),
    /// Generic parameter of the enclosing method
    MVar(u32),
    /// Pinned local
    Pinned(Box<TypeSig>),
    /// Type with a required custom modifier
    RequiredModifier(Token, Box<TypeSig>),
    /// Type with an optional custom modifier
    OptionalModifier(Token, Box<TypeSig>),
}

impl TypeSig {
    /// Decodes one type at the parser position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] / [`crate::Error::OutOfBounds`] for damaged data and
    /// [`crate::Error::RecursionLimit`] for nesting deeper than the decoder follows.
    pub fn parse(parser: &mut Parser) -> Result<TypeSig> {
        Self::parse_depth(parser, 0)
    }

    fn parse_depth(parser: &mut Parser, depth: usize) -> Result<TypeSig> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let current_byte = parser.read_le::<u8>()?;
        match current_byte {
            ELEMENT_TYPE::VOID => Ok(TypeSig::Void),
            ELEMENT_TYPE::BOOLEAN => Ok(TypeSig::Boolean),
            ELEMENT_TYPE::CHAR => Ok(TypeSig::Char),
            ELEMENT_TYPE::I1 => Ok(TypeSig::I1),
            ELEMENT_TYPE::U1 => Ok(TypeSig::U1),
            ELEMENT_TYPE::I2 => Ok(TypeSig::I2),
            ELEMENT_TYPE::U2 => Ok(TypeSig::U2),
            ELEMENT_TYPE::I4 => Ok(TypeSig::I4),
            ELEMENT_TYPE::U4 => Ok(TypeSig::U4),
            ELEMENT_TYPE::I8 => Ok(TypeSig::I8),
            ELEMENT_TYPE::U8 => Ok(TypeSig::U8),
            ELEMENT_TYPE::R4 => Ok(TypeSig::R4),
            ELEMENT_TYPE::R8 => Ok(TypeSig::R8),
            ELEMENT_TYPE::I => Ok(TypeSig::I),
            ELEMENT_TYPE::U => Ok(TypeSig::U),
            ELEMENT_TYPE::STRING => Ok(TypeSig::String),
            ELEMENT_TYPE::OBJECT => Ok(TypeSig::Object),
            ELEMENT_TYPE::TYPEDBYREF => Ok(TypeSig::TypedByRef),
            ELEMENT_TYPE::CLASS => Ok(TypeSig::Class(parser.read_compressed_token()?)),
            ELEMENT_TYPE::VALUETYPE => Ok(TypeSig::ValueType(parser.read_compressed_token()?)),
            ELEMENT_TYPE::SZARRAY => Ok(TypeSig::SzArray(Self::parse_boxed(parser, depth + 1)?)),
            ELEMENT_TYPE::BYREF => Ok(TypeSig::ByRef(Self::parse_boxed(parser, depth + 1)?)),
            ELEMENT_TYPE::PTR => Ok(TypeSig::Ptr(Self::parse_boxed(parser, depth + 1)?)),
            ELEMENT_TYPE::PINNED => Ok(TypeSig::Pinned(Self::parse_boxed(parser, depth + 1)?)),
            ELEMENT_TYPE::VAR => Ok(TypeSig::Var(parser.read_compressed_uint()?)),
            ELEMENT_TYPE::MVAR => Ok(TypeSig::MVar(parser.read_compressed_uint()?)),
            ELEMENT_TYPE::CMOD_REQD => {
                let modifier = parser.read_compressed_token()?;
                Ok(TypeSig::RequiredModifier(modifier, Self::parse_boxed(parser, depth + 1)?))
            }
            ELEMENT_TYPE::CMOD_OPT => {
                let modifier = parser.read_compressed_token()?;
                Ok(TypeSig::OptionalModifier(modifier, Self::parse_boxed(parser, depth + 1)?))
            }
            ELEMENT_TYPE::ARRAY => {
                let element = Self::parse_boxed(parser, depth + 1)?;
                let rank = parser.read_compressed_uint()?;

                let mut sizes = Vec::new();
                for _ in 0..parser.read_count()? {
                    sizes.push(parser.read_compressed_uint()?);
                }
                let mut lower_bounds = Vec::new();
                for _ in 0..parser.read_count()? {
                    lower_bounds.push(parser.read_compressed_int()?);
                }

                Ok(TypeSig::Array(
                    element,
                    ArrayShape {
                        rank,
                        sizes,
                        lower_bounds,
                    },
                ))
            }
            ELEMENT_TYPE::GENERICINST => {
                let generic = match parser.read_le::<u8>()? {
                    ELEMENT_TYPE::CLASS => TypeSig::Class(parser.read_compressed_token()?),
                    ELEMENT_TYPE::VALUETYPE => TypeSig::ValueType(parser.read_compressed_token()?),
                    other => {
                        return Err(malformed_error!(
                            "Generic instantiation of element type 0x{:02X}",
                            other
                        ))
                    }
                };

                let count = parser.read_count()?;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(Self::parse_depth(parser, depth + 1)?);
                }
                Ok(TypeSig::GenericInst(Box::new(generic), args))
            }
            ELEMENT_TYPE::FNPTR => Ok(TypeSig::FnPtr(Box::new(MethodSignature::parse_depth(
                parser,
                depth + 1,
            )?))),
            _ => Err(malformed_error!(
                "Unknown element type - 0x{:02X}",
                current_byte
            )),
        }
    }

    fn parse_boxed(parser: &mut Parser, depth: usize) -> Result<Box<TypeSig>> {
        Self::parse_depth(parser, depth).map(Box::new)
    }

    /// Encodes this type.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a referenced token is not a type token.
    pub fn encode(&self, writer: &mut Writer) -> Result<()> {
        match self {
            TypeSig::Class(token) => {
                writer.write_le(ELEMENT_TYPE::CLASS);
                writer.write_compressed_token(*token)?;
            }
            TypeSig::ValueType(token) => {
                writer.write_le(ELEMENT_TYPE::VALUETYPE);
                writer.write_compressed_token(*token)?;
            }
            TypeSig::SzArray(element) => {
                writer.write_le(ELEMENT_TYPE::SZARRAY);
                element.encode(writer)?;
            }
            TypeSig::ByRef(element) => {
                writer.write_le(ELEMENT_TYPE::BYREF);
                element.encode(writer)?;
            }
            TypeSig::Ptr(element) => {
                writer.write_le(ELEMENT_TYPE::PTR);
                element.encode(writer)?;
            }
            TypeSig::Pinned(element) => {
                writer.write_le(ELEMENT_TYPE::PINNED);
                element.encode(writer)?;
            }
            TypeSig::Var(index) => {
                writer.write_le(ELEMENT_TYPE::VAR);
                writer.write_compressed_uint(*index)?;
            }
            TypeSig::MVar(index) => {
                writer.write_le(ELEMENT_TYPE::MVAR);
                writer.write_compressed_uint(*index)?;
            }
            TypeSig::RequiredModifier(modifier, inner) => {
                writer.write_le(ELEMENT_TYPE::CMOD_REQD);
                writer.write_compressed_token(*modifier)?;
                inner.encode(writer)?;
            }
            TypeSig::OptionalModifier(modifier, inner) => {
                writer.write_le(ELEMENT_TYPE::CMOD_OPT);
                writer.write_compressed_token(*modifier)?;
                inner.encode(writer)?;
            }
            TypeSig::Array(element, shape) => {
                writer.write_le(ELEMENT_TYPE::ARRAY);
                element.encode(writer)?;
                writer.write_compressed_uint(shape.rank)?;
                writer.write_count(shape.sizes.len())?;
                for size in &shape.sizes {
                    writer.write_compressed_uint(*size)?;
                }
                writer.write_count(shape.lower_bounds.len())?;
                for bound in &shape.lower_bounds {
                    writer.write_compressed_int(*bound)?;
                }
            }
            TypeSig::GenericInst(generic, args) => {
                writer.write_le(ELEMENT_TYPE::GENERICINST);
                match generic.as_ref() {
                    TypeSig::Class(_) | TypeSig::ValueType(_) => generic.encode(writer)?,
                    other => {
                        return Err(malformed_error!(
                            "Generic instantiation of {} is not encodable",
                            other
                        ))
                    }
                }
                writer.write_count(args.len())?;
                for arg in args {
                    arg.encode(writer)?;
                }
            }
            TypeSig::FnPtr(signature) => {
                writer.write_le(ELEMENT_TYPE::FNPTR);
                signature.encode(writer)?;
            }
            simple => {
                if let Some(code) = simple.element_type() {
                    writer.write_le(code);
                }
            }
        }

        Ok(())
    }

    /// Returns the element type byte of a type without operands.
    fn element_type(&self) -> Option<u8> {
        match self {
            TypeSig::Void => Some(ELEMENT_TYPE::VOID),
            TypeSig::Boolean => Some(ELEMENT_TYPE::BOOLEAN),
            TypeSig::Char => Some(ELEMENT_TYPE::CHAR),
            TypeSig::I1 => Some(ELEMENT_TYPE::I1),
            TypeSig::U1 => Some(ELEMENT_TYPE::U1),
            TypeSig::I2 => Some(ELEMENT_TYPE::I2),
            TypeSig::U2 => Some(ELEMENT_TYPE::U2),
            TypeSig::I4 => Some(ELEMENT_TYPE::I4),
            TypeSig::U4 => Some(ELEMENT_TYPE::U4),
            TypeSig::I8 => Some(ELEMENT_TYPE::I8),
            TypeSig::U8 => Some(ELEMENT_TYPE::U8),
            TypeSig::R4 => Some(ELEMENT_TYPE::R4),
            TypeSig::R8 => Some(ELEMENT_TYPE::R8),
            TypeSig::I => Some(ELEMENT_TYPE::I),
            TypeSig::U => Some(ELEMENT_TYPE::U),
            TypeSig::String => Some(ELEMENT_TYPE::STRING),
            TypeSig::Object => Some(ELEMENT_TYPE::OBJECT),
            TypeSig::TypedByRef => Some(ELEMENT_TYPE::TYPEDBYREF),
            _ => None,
        }
    }

    /// Returns `true` for `void`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    /// Returns the type without custom modifiers and pinning.
    #[must_use]
    pub fn unmodified(&self) -> &TypeSig {
        match self {
            TypeSig::RequiredModifier(_, inner)
            | TypeSig::OptionalModifier(_, inner)
            | TypeSig::Pinned(inner) => inner.unmodified(),
            other => other,
        }
    }

    /// Returns `true` for types that are copied by value and need boxing to become an object:
    /// primitives, value types, generic parameters and unmanaged pointers.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        match self.unmodified() {
            TypeSig::Void
            | TypeSig::String
            | TypeSig::Object
            | TypeSig::Class(_)
            | TypeSig::SzArray(_)
            | TypeSig::Array(..)
            | TypeSig::ByRef(_) => false,
            TypeSig::GenericInst(generic, _) => generic.is_value_type(),
            _ => true,
        }
    }

    /// Returns `true` for types that cannot be boxed: unmanaged and function pointers and
    /// typed references, also when nested in a by-ref.
    #[must_use]
    pub fn is_unboxable(&self) -> bool {
        match self.unmodified() {
            TypeSig::Ptr(_) | TypeSig::FnPtr(_) | TypeSig::TypedByRef => true,
            TypeSig::ByRef(inner) => inner.is_unboxable(),
            _ => false,
        }
    }

    /// Returns the core library namespace and name of types that have a built-in element code.
    #[must_use]
    pub fn core_type_name(&self) -> Option<(&'static str, &'static str)> {
        let name = match self {
            TypeSig::Void => "Void",
            TypeSig::Boolean => "Boolean",
            TypeSig::Char => "Char",
            TypeSig::I1 => "SByte",
            TypeSig::U1 => "Byte",
            TypeSig::I2 => "Int16",
            TypeSig::U2 => "UInt16",
            TypeSig::I4 => "Int32",
            TypeSig::U4 => "UInt32",
            TypeSig::I8 => "Int64",
            TypeSig::U8 => "UInt64",
            TypeSig::R4 => "Single",
            TypeSig::R8 => "Double",
            TypeSig::I => "IntPtr",
            TypeSig::U => "UIntPtr",
            TypeSig::String => "String",
            TypeSig::Object => "Object",
            TypeSig::TypedByRef => "TypedReference",
            _ => return None,
        };

        Some(("System", name))
    }

    /// Type tokens this signature references.
    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens = Vec::new();
        self.collect_tokens(&mut tokens);
        tokens
    }

    fn collect_tokens(&self, tokens: &mut Vec<Token>) {
        match self {
            TypeSig::Class(token) | TypeSig::ValueType(token) => tokens.push(*token),
            TypeSig::SzArray(inner)
            | TypeSig::Array(inner, _)
            | TypeSig::ByRef(inner)
            | TypeSig::Ptr(inner)
            | TypeSig::Pinned(inner) => inner.collect_tokens(tokens),
            TypeSig::RequiredModifier(modifier, inner)
            | TypeSig::OptionalModifier(modifier, inner) => {
                tokens.push(*modifier);
                inner.collect_tokens(tokens);
            }
            TypeSig::GenericInst(generic, args) => {
                generic.collect_tokens(tokens);
                for arg in args {
                    arg.collect_tokens(tokens);
                }
            }
            TypeSig::FnPtr(signature) => tokens.extend(signature.tokens()),
            _ => {}
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Boolean => write!(f, "bool"),
            TypeSig::Char => write!(f, "char"),
            TypeSig::I1 => write!(f, "int8"),
            TypeSig::U1 => write!(f, "uint8"),
            TypeSig::I2 => write!(f, "int16"),
            TypeSig::U2 => write!(f, "uint16"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::U4 => write!(f, "uint32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::U8 => write!(f, "uint64"),
            TypeSig::R4 => write!(f, "float32"),
            TypeSig::R8 => write!(f, "float64"),
            TypeSig::I => write!(f, "native int"),
            TypeSig::U => write!(f, "native uint"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::TypedByRef => write!(f, "typedref"),
            TypeSig::Class(token) => write!(f, "class {token}"),
            TypeSig::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSig::SzArray(element) => write!(f, "{element}[]"),
            TypeSig::Array(element, shape) => {
                write!(f, "{element}[{}]", ",".repeat(shape.rank.saturating_sub(1) as usize))
            }
            TypeSig::ByRef(element) => write!(f, "{element}&"),
            TypeSig::Ptr(element) => write!(f, "{element}*"),
            TypeSig::Pinned(element) => write!(f, "{element} pinned"),
            TypeSig::FnPtr(signature) => write!(f, "method {signature}"),
            TypeSig::GenericInst(generic, args) => {
                write!(f, "{generic}<")?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ">")
            }
            TypeSig::Var(index) => write!(f, "!{index}"),
            TypeSig::MVar(index) => write!(f, "!!{index}"),
            TypeSig::RequiredModifier(modifier, inner) => write!(f, "{inner} modreq({modifier})"),
            TypeSig::OptionalModifier(modifier, inner) => write!(f, "{inner} modopt({modifier})"),
        }
    }
}

/// A method signature: calling convention, return type and parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// The method receives `this` as hidden first argument
    pub has_this: bool,
    /// `this` is declared as the first parameter
    pub explicit_this: bool,
    /// Calling convention kind, the low nibble of the leading byte
    pub calling_convention: u8,
    /// Number of generic parameters of a generic method
    pub generic_params: u32,
    /// Return type
    pub ret: TypeSig,
    /// Parameter types, without `this`
    pub params: Vec<TypeSig>,
    /// Extra arguments of a vararg call site, after the sentinel
    pub varargs: Vec<TypeSig>,
}

impl MethodSignature {
    /// Signature of a static method.
    #[must_use]
    pub fn new_static(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            has_this: false,
            explicit_this: false,
            calling_convention: 0,
            generic_params: 0,
            ret,
            params,
            varargs: Vec::new(),
        }
    }

    /// Signature of an instance method.
    #[must_use]
    pub fn new_instance(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            has_this: true,
            ..Self::new_static(ret, params)
        }
    }

    /// Number of arguments on the evaluation stack, `this` included.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + self.varargs.len() + usize::from(self.has_this)
    }

    /// Returns `true` for the vararg calling convention.
    #[must_use]
    pub fn is_vararg(&self) -> bool {
        self.calling_convention == CALLCONV_VARARG
    }

    /// Decodes a method signature.
    ///
    /// # Errors
    /// See [`TypeSig::parse`]; additionally [`crate::Error::Malformed`] for field, local and
    /// property signatures.
    pub fn parse(parser: &mut Parser) -> Result<MethodSignature> {
        Self::parse_depth(parser, 0)
    }

    fn parse_depth(parser: &mut Parser, depth: usize) -> Result<MethodSignature> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let convention = parser.read_le::<u8>()?;
        let calling_convention = convention & 0x0F;
        if calling_convention > CALLCONV_VARARG {
            return Err(malformed_error!(
                "Not a method signature - 0x{:02X}",
                convention
            ));
        }

        let generic_params = if convention & CALLCONV_GENERIC != 0 {
            parser.read_compressed_uint()?
        } else {
            0
        };

        let param_count = parser.read_count()?;
        let ret = TypeSig::parse_depth(parser, depth + 1)?;

        let mut params = Vec::with_capacity(param_count);
        let mut varargs = Vec::new();
        for _ in 0..param_count {
            if parser.peek_byte()? == ELEMENT_TYPE::SENTINEL {
                if !varargs.is_empty() || calling_convention != CALLCONV_VARARG {
                    return Err(malformed_error!("Unexpected sentinel in method signature"));
                }
                parser.read_le::<u8>()?;
                varargs.push(TypeSig::parse_depth(parser, depth + 1)?);
            } else if varargs.is_empty() {
                params.push(TypeSig::parse_depth(parser, depth + 1)?);
            } else {
                varargs.push(TypeSig::parse_depth(parser, depth + 1)?);
            }
        }

        Ok(MethodSignature {
            has_this: convention & CALLCONV_HASTHIS != 0,
            explicit_this: convention & CALLCONV_EXPLICITTHIS != 0,
            calling_convention,
            generic_params,
            ret,
            params,
            varargs,
        })
    }

    /// Encodes this signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a referenced token is not a type token.
    pub fn encode(&self, writer: &mut Writer) -> Result<()> {
        let mut convention = self.calling_convention & 0x0F;
        if self.has_this {
            convention |= CALLCONV_HASTHIS;
        }
        if self.explicit_this {
            convention |= CALLCONV_EXPLICITTHIS;
        }
        if self.generic_params > 0 {
            convention |= CALLCONV_GENERIC;
        }

        writer.write_le(convention);
        if self.generic_params > 0 {
            writer.write_compressed_uint(self.generic_params)?;
        }
        writer.write_count(self.params.len() + self.varargs.len())?;
        self.ret.encode(writer)?;
        for param in &self.params {
            param.encode(writer)?;
        }
        if !self.varargs.is_empty() {
            writer.write_le(ELEMENT_TYPE::SENTINEL);
            for param in &self.varargs {
                param.encode(writer)?;
            }
        }

        Ok(())
    }

    /// Type tokens this signature references.
    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        std::iter::once(&self.ret)
            .chain(self.params.iter())
            .chain(self.varargs.iter())
            .flat_map(TypeSig::tokens)
            .collect()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_this {
            write!(f, "instance ")?;
        }
        if self.is_vararg() {
            write!(f, "vararg ")?;
        }

        write!(f, "{}", self.ret)?;
        if self.generic_params > 0 {
            write!(f, " <{}>", self.generic_params)?;
        }
        write!(f, " (")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        if !self.varargs.is_empty() {
            write!(f, ", ...")?;
            for param in &self.varargs {
                write!(f, ", {param}")?;
            }
        }
        write!(f, ")")
    }
}

/// Decodes a field signature blob.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the blob does not start with the field prefix, plus
/// the errors of [`TypeSig::parse`].
pub fn parse_field_signature(data: &[u8]) -> Result<TypeSig> {
    let mut parser = Parser::new(data);
    let prefix = parser.read_le::<u8>()?;
    if prefix != SIGNATURE_FIELD {
        return Err(malformed_error!("Not a field signature - 0x{:02X}", prefix));
    }

    TypeSig::parse(&mut parser)
}

/// Encodes a field signature blob.
///
/// # Errors
/// See [`TypeSig::encode`].
pub fn encode_field_signature(field: &TypeSig) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_le(SIGNATURE_FIELD);
    field.encode(&mut writer)?;
    Ok(writer.into_vec())
}

/// Decodes a local variable signature blob.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the blob does not start with the local prefix, plus
/// the errors of [`TypeSig::parse`].
pub fn parse_local_signature(data: &[u8]) -> Result<Vec<TypeSig>> {
    let mut parser = Parser::new(data);
    let prefix = parser.read_le::<u8>()?;
    if prefix != SIGNATURE_LOCAL {
        return Err(malformed_error!("Not a local signature - 0x{:02X}", prefix));
    }

    let count = parser.read_count()?;
    let mut locals = Vec::with_capacity(count);
    for _ in 0..count {
        locals.push(TypeSig::parse(&mut parser)?);
    }
    Ok(locals)
}

/// Encodes a local variable signature blob.
///
/// # Errors
/// See [`TypeSig::encode`].
pub fn encode_local_signature(locals: &[TypeSig]) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_le(SIGNATURE_LOCAL);
    writer.write_count(locals.len())?;
    for local in locals {
        local.encode(&mut writer)?;
    }
    Ok(writer.into_vec())
}
