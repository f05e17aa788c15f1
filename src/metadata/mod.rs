//! Module metadata.
//!
//! Everything needed to load, inspect, modify and store a compiled module:
//!
//! - [`module`] - the table model ([`module::Module`]) with lookup and append operations
//! - [`loader`] - reading a PE image into the model
//! - [`image`] - PE level values kept next to the model
//! - [`root`], [`cor20header`], [`streams`], [`tables`] - the ECMA-335 physical layout
//! - [`token`] - table/row handles that tie rows and instruction operands together
//! - [`signatures`] - type and method signatures
//! - [`method`] - method bodies and the body builder
//! - [`identity`] - module name, version and strong-name key
//! - [`flags`] - attribute bit sets
//!
//! Storing a module is the job of [`crate::write`].

pub mod cor20header;
pub mod flags;
pub mod identity;
pub mod image;
pub mod loader;
pub mod method;
pub mod module;
pub mod root;
pub mod signatures;
pub mod streams;
pub mod tables;
pub mod token;
