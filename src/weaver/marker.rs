//! The patch marker.
//!
//! A patched module carries one [`crate::metadata::module::MetadataEntry`], stored as an
//! `AssemblyMetadataAttribute`, whose key is the display name of the support module it was
//! patched against and whose value is the lowercase hex MD5 of that support module's bytes. A module whose marker names the support module but
//! does not match the current one exactly is [`MarkerStatus::Stale`]: it was patched by other
//! tooling and is left alone.

use strum::Display;

use crate::{
    metadata::module::Module,
    utils::{compute_md5, to_hex},
    Result,
};

/// Marker state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MarkerStatus {
    /// Patched against the current support module
    Current,
    /// Patched against a different build or version of the support module
    Stale,
    /// Never patched
    Absent,
}

/// Key and value identifying one support module build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMarker {
    /// Display name of the support module
    pub key: String,
    /// Lowercase hex MD5 of the support module image
    pub value: String,
}

impl PatchMarker {
    /// Marker for the support module `support` serialised as `image`.
    #[must_use]
    pub fn new(support: &Module, image: &[u8]) -> Self {
        PatchMarker {
            key: support.identity.display_name(),
            value: to_hex(&compute_md5(image)),
        }
    }

    /// Classifies `module`.
    #[must_use]
    pub fn status(&self, module: &Module) -> MarkerStatus {
        if module.get_metadata(&self.key).as_deref() == Some(self.value.as_str()) {
            return MarkerStatus::Current;
        }

        let support_name = simple_name(&self.key);
        if module
            .metadata_entries()
            .iter()
            .any(|entry| simple_name(&entry.key) == support_name)
        {
            MarkerStatus::Stale
        } else {
            MarkerStatus::Absent
        }
    }

    /// Returns `true` if `module` carries exactly this marker.
    #[must_use]
    pub fn is_present(&self, module: &Module) -> bool {
        self.status(module) == MarkerStatus::Current
    }

    /// Writes the marker into `module`.
    ///
    /// # Errors
    /// See [`Module::set_metadata`].
    pub fn stamp(&self, module: &mut Module) -> Result<()> {
        module.set_metadata(&self.key, &self.value)
    }
}

fn simple_name(display_name: &str) -> &str {
    display_name
        .split(',')
        .next()
        .map_or(display_name, str::trim)
}
