//! Attribute flags of types, methods and fields.
//!
//! The bit values follow ECMA-335 II.23.1 so a module produced by a regular compiler maps onto
//! these sets unchanged. Only the visibility and layout masks need care: they are small
//! enumerations packed into a few bits, not independent flags, which is why the helpers below
//! compare the masked value instead of calling `contains`.

use bitflags::bitflags;

/// Mask for the visibility bits of [`TypeAttributes`]
pub const TYPE_VISIBILITY_MASK: u32 = 0x0000_0007;
/// Mask for the layout bits of [`TypeAttributes`]
pub const TYPE_LAYOUT_MASK: u32 = 0x0000_0018;
/// Mask for the access bits of [`MethodAttributes`] and [`FieldAttributes`]
pub const MEMBER_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    /// Flags of a type definition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeAttributes: u32 {
        /// Class has no public scope
        const NOT_PUBLIC = 0x0000_0000;
        /// Class has public scope
        const PUBLIC = 0x0000_0001;
        /// Class is nested with public visibility
        const NESTED_PUBLIC = 0x0000_0002;
        /// Class is nested with private visibility
        const NESTED_PRIVATE = 0x0000_0003;
        /// Class is nested with family visibility
        const NESTED_FAMILY = 0x0000_0004;
        /// Class is nested with assembly visibility
        const NESTED_ASSEMBLY = 0x0000_0005;
        /// Class is nested with family and assembly visibility
        const NESTED_FAM_AND_ASSEM = 0x0000_0006;
        /// Class is nested with family or assembly visibility
        const NESTED_FAM_OR_ASSEM = 0x0000_0007;
        /// Class fields are laid out sequentially
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Layout is supplied explicitly
        const EXPLICIT_LAYOUT = 0x0000_0010;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Class is abstract
        const ABSTRACT = 0x0000_0080;
        /// Class cannot be extended
        const SEALED = 0x0000_0100;
        /// Class name is special
        const SPECIAL_NAME = 0x0000_0400;
        /// Class is imported
        const IMPORT = 0x0000_1000;
        /// Class is serializable
        const SERIALIZABLE = 0x0000_2000;
        /// Initialize the class before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
        /// The runtime checks the name encoding
        const RT_SPECIAL_NAME = 0x0000_0800;
    }
}

impl TypeAttributes {
    /// Returns `true` if the visibility bits say nested-private.
    #[must_use]
    pub fn is_nested_private(&self) -> bool {
        self.bits() & TYPE_VISIBILITY_MASK == Self::NESTED_PRIVATE.bits()
    }

    /// Returns `true` for any nested visibility.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.bits() & TYPE_VISIBILITY_MASK >= Self::NESTED_PUBLIC.bits()
    }

    /// Returns `true` if the layout bits say explicit layout.
    #[must_use]
    pub fn is_explicit_layout(&self) -> bool {
        self.bits() & TYPE_LAYOUT_MASK == Self::EXPLICIT_LAYOUT.bits()
    }

    /// Returns `true` for interface types.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.contains(Self::INTERFACE)
    }
}

bitflags! {
    /// Flags of a method definition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodAttributes: u32 {
        /// Member not referenceable
        const COMPILER_CONTROLLED = 0x0000;
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by sub-types only in this module
        const FAM_AND_ASSEM = 0x0002;
        /// Accessible by anyone in the module
        const ASSEM = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by sub-types anywhere, plus anyone in the module
        const FAM_OR_ASSEM = 0x0005;
        /// Accessible by anyone who has visibility to this scope
        const PUBLIC = 0x0006;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method cannot be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method hides by name+sig, else just by name
        const HIDE_BY_SIG = 0x0080;
        /// Method always gets a new slot in the vtable
        const NEW_SLOT = 0x0100;
        /// Method does not provide an implementation
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// The runtime provides special behavior depending on the name
        const RT_SPECIAL_NAME = 0x1000;
        /// Implementation is forwarded through PInvoke
        const PINVOKE_IMPL = 0x2000;
    }
}

impl MethodAttributes {
    /// Returns `true` if the access bits say compiler-controlled.
    #[must_use]
    pub fn is_compiler_controlled(&self) -> bool {
        self.bits() & MEMBER_ACCESS_MASK == Self::COMPILER_CONTROLLED.bits()
    }

    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.contains(Self::STATIC)
    }
}

bitflags! {
    /// Implementation flags of a method definition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodImplAttributes: u32 {
        /// Method implementation is CIL
        const IL = 0x0000;
        /// Method implementation is native
        const NATIVE = 0x0001;
        /// Method implementation is provided by the runtime
        const RUNTIME = 0x0003;
        /// Method is not inlined
        const NO_INLINING = 0x0008;
        /// Method is single threaded through the body
        const SYNCHRONIZED = 0x0020;
        /// Method body is provided by the runtime itself
        const INTERNAL_CALL = 0x1000;
    }
}

bitflags! {
    /// Flags of a field definition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldAttributes: u32 {
        /// Member not referenceable
        const COMPILER_CONTROLLED = 0x0000;
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by anyone in the module
        const ASSEMBLY = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by anyone who has visibility to this scope
        const PUBLIC = 0x0006;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field can only be initialized
        const INIT_ONLY = 0x0020;
        /// Value is a compile time constant
        const LITERAL = 0x0040;
        /// Field does not have to be serialized
        const NOT_SERIALIZED = 0x0080;
        /// Field is special
        const SPECIAL_NAME = 0x0200;
        /// Field has initial data mapped through `FieldRVA`
        const HAS_FIELD_RVA = 0x0100;
        /// The runtime checks the name encoding
        const RT_SPECIAL_NAME = 0x0400;
        /// Field has a default value
        const HAS_DEFAULT = 0x8000;
    }
}

impl FieldAttributes {
    /// Returns `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.contains(Self::STATIC)
    }
}
