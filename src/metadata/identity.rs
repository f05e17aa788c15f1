//! Module identities.
//!
//! A module is identified by its simple name, a four-part version and optionally a public key.
//! A module that carries a public key is strong-named: its identity is locked to the signature
//! over its content, so rewriting it would break every reference to it. The patch orchestrator
//! therefore leaves strong-named modules alone.
//!
//! ```rust
//! use cilweave::metadata::identity::{ModuleIdentity, ModuleVersion};
//!
//! let identity = ModuleIdentity::new("Calculator", ModuleVersion::new(1, 2, 0, 0));
//! assert_eq!(
//!     identity.display_name(),
//!     "Calculator, Version=1.2.0.0, Culture=neutral, PublicKeyToken=null"
//! );
//! assert!(!identity.is_strong_named());
//! ```

use std::fmt;

use crate::{
    utils::{compute_sha1, to_hex},
    Result,
};

/// Four-part module version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModuleVersion {
    /// Major version component
    pub major: u16,
    /// Minor version component
    pub minor: u16,
    /// Build version component
    pub build: u16,
    /// Revision version component
    pub revision: u16,
}

impl ModuleVersion {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        ModuleVersion {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Parses `major[.minor[.build[.revision]]]`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for empty, non-numeric or over-long input.
    pub fn parse(version: &str) -> Result<Self> {
        let mut parts = [0_u16; 4];
        let mut count = 0;

        for part in version.split('.') {
            if count == 4 {
                return Err(malformed_error!("Too many version components - {}", version));
            }

            parts[count] = part
                .trim()
                .parse::<u16>()
                .map_err(|_| malformed_error!("Invalid version component - {}", part))?;
            count += 1;
        }

        Ok(ModuleVersion::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Name, version and optional public key of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentity {
    /// Simple name, also the file stem of the module on disk
    pub name: String,
    /// Module version
    pub version: ModuleVersion,
    /// Full public key of a strong-named module
    pub public_key: Option<Vec<u8>>,
}

impl ModuleIdentity {
    /// Create an identity without public key.
    pub fn new(name: impl Into<String>, version: ModuleVersion) -> Self {
        ModuleIdentity {
            name: name.into(),
            version,
            public_key: None,
        }
    }

    /// Returns `true` if the module carries a public key.
    #[must_use]
    pub fn is_strong_named(&self) -> bool {
        self.public_key.as_ref().is_some_and(|key| !key.is_empty())
    }

    /// Returns the 8-byte public key token: the last 8 bytes of the SHA-1 of the key, reversed.
    #[must_use]
    pub fn public_key_token(&self) -> Option<[u8; 8]> {
        let key = self.public_key.as_ref().filter(|key| !key.is_empty())?;
        Some(public_key_token(key))
    }

    /// Returns the display name, `Name, Version=a.b.c.d, Culture=neutral, PublicKeyToken=...`.
    #[must_use]
    pub fn display_name(&self) -> String {
        let token = match self.public_key_token() {
            Some(token) => to_hex(&token),
            None => "null".to_string(),
        };

        format!(
            "{}, Version={}, Culture=neutral, PublicKeyToken={}",
            self.name, self.version, token
        )
    }
}

/// `CALG_SHA1`, the hash algorithm of new assemblies.
pub const HASH_ALGORITHM_SHA1: u32 = 0x8004;

/// `AssemblyFlags.PublicKey`: the key blob of a reference holds the full key.
pub const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;

/// The `Assembly` row values besides name, version and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssemblyInfo {
    /// Hash algorithm of the file hashes
    pub hash_algorithm: u32,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Culture, empty for neutral
    pub culture: String,
}

impl Default for AssemblyInfo {
    fn default() -> Self {
        AssemblyInfo {
            hash_algorithm: HASH_ALGORITHM_SHA1,
            flags: 0,
            culture: String::new(),
        }
    }
}

/// Computes the token of a full public key.
#[must_use]
pub fn public_key_token(key: &[u8]) -> [u8; 8] {
    let hash = compute_sha1(key);

    let mut token = [0_u8; 8];
    for (slot, byte) in token.iter_mut().zip(hash.iter().rev()) {
        *slot = *byte;
    }
    token
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse() {
        assert_eq!(
            ModuleVersion::parse("4.0.0.0").unwrap(),
            ModuleVersion::new(4, 0, 0, 0)
        );
        assert_eq!(
            ModuleVersion::parse("1.2").unwrap(),
            ModuleVersion::new(1, 2, 0, 0)
        );
        assert!(ModuleVersion::parse("1.2.3.4.5").is_err());
        assert!(ModuleVersion::parse("1.x").is_err());
        assert!(ModuleVersion::parse("").is_err());
    }

    #[test]
    fn public_key_token() {
        let mut identity = ModuleIdentity::new("Locked", ModuleVersion::new(1, 0, 0, 0));
        assert_eq!(identity.public_key_token(), None);

        identity.public_key = Some(Vec::new());
        assert!(!identity.is_strong_named());

        identity.public_key = Some(b"abc".to_vec());
        assert!(identity.is_strong_named());

        // SHA-1("abc") ends with ... 6c 9c d0 d8 9d
        let token = identity.public_key_token().unwrap();
        assert_eq!(token[0], 0x9d);
        assert_eq!(token[1], 0xd8);
        assert!(identity.display_name().ends_with(&format!(
            "PublicKeyToken={}",
            to_hex(&token)
        )));
    }
}
