//! Writing modules as PE images.
//!
//! Serialisation runs in three steps:
//!
//! - members are regrouped by owner so every type and method list is a contiguous run of rows
//! - method bodies, field data, resources and the strong name space are placed in `.text`
//!   while the rows they need (local signatures, RVAs) are collected
//! - the metadata section is laid out from the rows and the PE container is written around it
//!
//! The output depends only on the module, never on time, paths or memory addresses.
//!
//! # Example
//!
//! ```rust,no_run
//! use cilweave::metadata::{identity::ModuleVersion, module::Module};
//! use std::path::Path;
//!
//! let module = Module::new("Empty", ModuleVersion::new(1, 0, 0, 0));
//! module.write(Path::new("Empty.dll"))?;
//! # Ok::<(), cilweave::Error>(())
//! ```

mod pe;
mod remap;
mod tables;

use std::path::Path;

use crate::{
    metadata::{
        cor20header::{CliFlags, Cor20Header},
        module::Module,
        token::Token,
    },
    Result,
};

use self::{
    pe::{write_image, TextSection},
    remap::regroup,
    tables::MetadataBuilder,
};

impl Module {
    /// Serialises the module as a PE image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for rows that cannot be encoded, members without
    /// a declaring type and images past 4 GiB. Fails with [`crate::Error::TokenNotFound`] for
    /// member lists naming rows that do not exist.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let module = regroup(self)?;
        let mut metadata = MetadataBuilder::new(&module);
        let mut text = TextSection::new(module.image.headers.is_64);

        let mut method_rvas = Vec::with_capacity(module.methods.len());
        for method in &module.methods {
            let rva = match &method.body {
                Some(body) => {
                    let locals = if body.locals.is_empty() {
                        Token::new(0)
                    } else {
                        metadata.locals_token(&body.locals)?
                    };
                    text.append(&body.encode_with_locals(locals)?, 4)?
                }
                None => 0,
            };
            method_rvas.push(rva);
        }

        let mut field_rvas = Vec::with_capacity(module.fields.len());
        for field in &module.fields {
            field_rvas.push(match &field.initial_data {
                Some(data) => text.append(data, 8)?,
                None => 0,
            });
        }

        let resources = &module.image.resources;
        let resource_rva = if resources.is_empty() {
            0
        } else {
            text.append(resources, 8)?
        };

        let strong_name_size = module.image.strong_name_signature_size;
        let strong_name_rva = if strong_name_size == 0 {
            0
        } else {
            text.reserve(strong_name_size, 4)?
        };

        let metadata = metadata.finish(&method_rvas, &field_rvas)?;
        let metadata_rva = text.append(&metadata, 4)?;

        let mut flags = module.image.cli_flags;
        flags.remove(CliFlags::NATIVE_ENTRYPOINT);
        flags.set(CliFlags::STRONG_NAME_SIGNED, strong_name_size != 0);

        let cor20 = Cor20Header {
            major_runtime_version: 2,
            minor_runtime_version: 5,
            meta_data_rva: metadata_rva,
            meta_data_size: u32::try_from(metadata.len())
                .map_err(|_| malformed_error!("Metadata exceeds 4 GiB"))?,
            flags,
            entry_point_token: module.entry_point.map_or(0, |token| token.value()),
            resource_rva,
            resource_size: u32::try_from(resources.len())
                .map_err(|_| malformed_error!("Resources exceed 4 GiB"))?,
            strong_name_signature_rva: strong_name_rva,
            strong_name_signature_size: strong_name_size,
            vtable_fixups_rva: 0,
            vtable_fixups_size: 0,
            managed_native_header_rva: 0,
            managed_native_header_size: 0,
        };

        let image = write_image(text, &cor20, &module.image)?;
        log::debug!(
            "Wrote {} as {} bytes, {} methods",
            module.name(),
            image.len(),
            module.methods.len()
        );
        Ok(image)
    }

    /// Writes the module to `path`.
    ///
    /// # Errors
    /// Returns the errors of [`Module::to_bytes`] and [`crate::Error::FileError`].
    pub fn write(&self, path: &Path) -> Result<()> {
        let image = self.to_bytes()?;
        std::fs::write(path, image)?;
        log::info!("Wrote {}", path.display());
        Ok(())
    }
}
