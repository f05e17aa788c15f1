//! Closure patching with crash-safe replacement.
//!
//! [`ClosurePatcher::patch_closure`] starts at a root module, follows module references to
//! files in the same directory and patches every module that qualifies. The pass has two
//! phases:
//!
//! 1. Walk, classify and patch. Every patched module is written to `<stem>.tmp` next to the
//!    original and checked by the [`Verifier`]. Any failure removes all staged files and
//!    leaves every original untouched.
//! 2. Commit, in discovery order. The original is preserved as `<file>.orig` (an existing
//!    backup is never overwritten) and the staged file is renamed over it.
//!
//! References that do not resolve to a co-located file are reported as
//! [`PatchState::IgnoredForeignAssembly`] under their reference name.
//!
//! The pass assumes exclusive access to the files in the directory.

use std::{
    collections::{HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
};

use strum::Display;

use crate::{
    metadata::module::Module,
    verify::{StructuralVerifier, Verifier},
    weaver::{
        injector::MockInjector, marker::MarkerStatus, BACKUP_SUFFIX, MODULE_EXTENSION,
        TEMP_EXTENSION,
    },
    Error, Result,
};

/// Options of one closure pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchOptions {
    /// Patch the root module as well, otherwise it is reported as
    /// [`PatchState::IgnoredTestAssembly`]
    pub include_root: bool,
    /// Skip the structural verification of staged modules
    pub skip_verify: bool,
}

impl PatchOptions {
    /// Options with the root excluded and verification enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the root module is patched.
    #[must_use]
    pub fn include_root(mut self, include_root: bool) -> Self {
        self.include_root = include_root;
        self
    }

    /// Set whether structural verification is skipped.
    #[must_use]
    pub fn skip_verify(mut self, skip_verify: bool) -> Self {
        self.skip_verify = skip_verify;
        self
    }
}

/// Outcome for one module or reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PatchState {
    /// Rewritten and replaced on disk
    Patched,
    /// Already carries a patch marker
    AlreadyPatched,
    /// Not co-located with the root, or strong-named
    IgnoredForeignAssembly,
    /// The root module of a pass that excludes it
    IgnoredTestAssembly,
    /// Failed; used by callers that report errors per module
    GeneralFailure,
}

/// Result of one module or reference of a closure pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    /// Module path, or the bare reference name for modules that were not found
    pub path: PathBuf,
    /// Backup of the original, set for [`PatchState::Patched`]
    pub backup_path: Option<PathBuf>,
    /// Outcome
    pub state: PatchState,
}

impl PatchResult {
    fn new(path: PathBuf, state: PatchState) -> Self {
        PatchResult {
            path,
            backup_path: None,
            state,
        }
    }
}

/// A patched module waiting for commit.
struct Staged {
    result: usize,
    path: PathBuf,
    temp_path: PathBuf,
}

/// Runs closure passes with one injector and verifier.
pub struct ClosurePatcher {
    injector: MockInjector,
    verifier: Box<dyn Verifier>,
}

impl ClosurePatcher {
    /// Patcher using the [`StructuralVerifier`].
    #[must_use]
    pub fn new(injector: MockInjector) -> Self {
        ClosurePatcher {
            injector,
            verifier: Box::new(StructuralVerifier),
        }
    }

    /// Replace the verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    /// The injector used for patching.
    #[must_use]
    pub fn injector(&self) -> &MockInjector {
        &self.injector
    }

    /// Patches the closure of `root`.
    ///
    /// Returns one result per distinct module path or unresolved reference name, compared
    /// case-insensitively, in discovery order.
    ///
    /// # Errors
    /// Any I/O, parse, rewrite or verification failure aborts the pass. Failures before the
    /// commit phase leave every original file untouched. [`Error::InvariantViolation`] is
    /// returned for an excluded root that is already patched or strong-named.
    pub fn patch_closure(&self, root: &Path, options: PatchOptions) -> Result<Vec<PatchResult>> {
        let dir = module_dir(root);
        let root = dir.join(
            root.file_name()
                .ok_or_else(|| Error::Error(format!("{} is not a file", root.display())))?,
        );

        let mut results = Vec::new();
        let mut staged = Vec::new();

        if let Err(error) = self.stage(&dir, &root, options, &mut results, &mut staged) {
            discard(&staged);
            return Err(error);
        }

        for (position, entry) in staged.iter().enumerate() {
            match commit(entry) {
                Ok(backup) => {
                    log::info!(
                        "Patched {} (backup {})",
                        entry.path.display(),
                        backup.display()
                    );
                    results[entry.result].backup_path = Some(backup);
                }
                Err(error) => {
                    discard(&staged[position..]);
                    return Err(error);
                }
            }
        }

        Ok(results)
    }

    fn stage(
        &self,
        dir: &Path,
        root: &Path,
        options: PatchOptions,
        results: &mut Vec<PatchResult>,
        staged: &mut Vec<Staged>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        let mut staged_modules: Vec<Module> = Vec::new();

        seen.insert(result_key(root));
        queue.push_back(root.to_path_buf());

        while let Some(path) = queue.pop_front() {
            let module = Module::from_file(&path)?;

            for name in module.referenced_module_names() {
                let candidate = dir.join(format!("{name}.{MODULE_EXTENSION}"));
                if candidate.is_file() {
                    if seen.insert(result_key(&candidate)) {
                        queue.push_back(candidate);
                    }
                } else if seen.insert(name.to_lowercase()) {
                    log::debug!("{} is not co-located, ignoring it", name);
                    results.push(PatchResult::new(
                        PathBuf::from(name),
                        PatchState::IgnoredForeignAssembly,
                    ));
                }
            }

            let is_root = path == root;
            let state = self.classify(&module, &path, is_root, options)?;
            if state != PatchState::Patched {
                log::info!("{}: {}", path.display(), state);
                results.push(PatchResult::new(path, state));
                continue;
            }

            let mut module = module;
            self.injector.patch(&mut module, &staged_modules)?;

            let temp_path = path.with_extension(TEMP_EXTENSION);
            staged.push(Staged {
                result: results.len(),
                path: path.clone(),
                temp_path: temp_path.clone(),
            });
            results.push(PatchResult::new(path, PatchState::Patched));

            module.write(&temp_path)?;
            if !options.skip_verify {
                self.verifier.verify(&temp_path)?;
            }
            staged_modules.push(module);
        }

        Ok(())
    }

    fn classify(
        &self,
        module: &Module,
        path: &Path,
        is_root: bool,
        options: PatchOptions,
    ) -> Result<PatchState> {
        let status = self.injector.marker_status(module);
        let strong_named = module.identity.is_strong_named();

        if is_root && !options.include_root {
            if status != MarkerStatus::Absent {
                return Err(Error::InvariantViolation(format!(
                    "Root module {} is already patched",
                    path.display()
                )));
            }
            if strong_named {
                return Err(Error::InvariantViolation(format!(
                    "Root module {} is strong-named",
                    path.display()
                )));
            }
            return Ok(PatchState::IgnoredTestAssembly);
        }

        if strong_named {
            return Ok(PatchState::IgnoredForeignAssembly);
        }

        match status {
            MarkerStatus::Current => Ok(PatchState::AlreadyPatched),
            MarkerStatus::Stale => {
                log::warn!(
                    "{} was patched against another build of the support module, leaving it alone",
                    path.display()
                );
                Ok(PatchState::AlreadyPatched)
            }
            MarkerStatus::Absent => Ok(PatchState::Patched),
        }
    }
}

/// Patches the closure of `root` against the support module in the root's directory.
///
/// # Errors
/// See [`MockInjector::new`] and [`ClosurePatcher::patch_closure`].
pub fn patch_closure(root: &Path, options: PatchOptions) -> Result<Vec<PatchResult>> {
    ClosurePatcher::new(MockInjector::new(&module_dir(root))?).patch_closure(root, options)
}

/// Backup location of `path`: the file name with [`BACKUP_SUFFIX`] appended.
#[must_use]
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Moves the backup of `path` back over it.
///
/// # Errors
/// Returns [`Error::FileError`] if there is no backup or the rename fails.
pub fn restore(path: &Path) -> Result<()> {
    let backup = backup_path_for(path);
    fs::rename(&backup, path)?;
    log::info!("Restored {} from {}", path.display(), backup.display());
    Ok(())
}

fn module_dir(root: &Path) -> PathBuf {
    match root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn result_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

fn commit(entry: &Staged) -> Result<PathBuf> {
    let backup = backup_path_for(&entry.path);
    if backup.exists() {
        log::warn!("Keeping existing backup {}", backup.display());
    } else if fs::hard_link(&entry.path, &backup).is_err() {
        fs::copy(&entry.path, &backup)?;
    }

    fs::rename(&entry.temp_path, &entry.path)?;
    Ok(backup)
}

fn discard(staged: &[Staged]) {
    for entry in staged {
        if let Err(error) = fs::remove_file(&entry.temp_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove staged file {}: {}",
                    entry.temp_path.display(),
                    error
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{write_closure, CALCULATOR_MODULE},
        weaver::support::SUPPORT_MODULE_NAME,
    };

    struct Rejecting;

    impl Verifier for Rejecting {
        fn verify(&self, path: &Path) -> Result<()> {
            Err(Error::VerificationFailure {
                path: path.display().to_string(),
                message: "rejected".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    fn state_of(results: &[PatchResult], name: &str) -> PatchState {
        results
            .iter()
            .find(|r| {
                r.path
                    .file_stem()
                    .is_some_and(|stem| stem.eq_ignore_ascii_case(name))
            })
            .map(|r| r.state)
            .unwrap_or_else(|| panic!("no result for {name}"))
    }

    fn leftovers(dir: &Path, extension: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|e| e == extension)
            })
            .count()
    }

    #[test]
    fn patches_colocated_references() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());
        let calculator = dir.path().join("Calculator.dll");
        let original = fs::read(&calculator).unwrap();

        let results = patch_closure(&root, PatchOptions::new()).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(state_of(&results, "App"), PatchState::IgnoredTestAssembly);
        assert_eq!(state_of(&results, "mscorlib"), PatchState::IgnoredForeignAssembly);
        assert_eq!(state_of(&results, CALCULATOR_MODULE), PatchState::Patched);

        let patched = results
            .iter()
            .find(|r| r.state == PatchState::Patched)
            .unwrap();
        assert_eq!(patched.path, calculator);
        assert_eq!(
            patched.backup_path.as_deref(),
            Some(backup_path_for(&calculator).as_path())
        );
        assert_eq!(fs::read(backup_path_for(&calculator)).unwrap(), original);
        assert_ne!(fs::read(&calculator).unwrap(), original);
        assert_eq!(leftovers(dir.path(), TEMP_EXTENSION), 0);
    }

    #[test]
    fn second_pass_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());
        let calculator = dir.path().join("Calculator.dll");

        patch_closure(&root, PatchOptions::new()).unwrap();
        let first = fs::read(&calculator).unwrap();

        let results = patch_closure(&root, PatchOptions::new()).unwrap();
        assert_eq!(state_of(&results, CALCULATOR_MODULE), PatchState::AlreadyPatched);
        // the patched module now references the co-located, strong-named support module
        assert_eq!(
            state_of(&results, SUPPORT_MODULE_NAME),
            PatchState::IgnoredForeignAssembly
        );
        assert_eq!(fs::read(&calculator).unwrap(), first);
    }

    #[test]
    fn failed_verification_leaves_originals() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());
        let calculator = dir.path().join("Calculator.dll");
        let original = fs::read(&calculator).unwrap();

        let patcher = ClosurePatcher::new(MockInjector::new(dir.path()).unwrap())
            .with_verifier(Rejecting);
        let result = patcher.patch_closure(&root, PatchOptions::new().include_root(true));

        assert!(matches!(result, Err(Error::VerificationFailure { .. })));
        assert_eq!(fs::read(&calculator).unwrap(), original);
        assert!(!backup_path_for(&calculator).exists());
        assert_eq!(leftovers(dir.path(), TEMP_EXTENSION), 0);
    }

    #[test]
    fn skip_verify_bypasses_the_verifier() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());

        let patcher = ClosurePatcher::new(MockInjector::new(dir.path()).unwrap())
            .with_verifier(Rejecting);
        let results = patcher
            .patch_closure(&root, PatchOptions::new().skip_verify(true))
            .unwrap();
        assert_eq!(state_of(&results, CALCULATOR_MODULE), PatchState::Patched);
    }

    #[test]
    fn patched_root_must_be_included() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());

        let results = patch_closure(&root, PatchOptions::new().include_root(true)).unwrap();
        assert_eq!(state_of(&results, "App"), PatchState::Patched);

        assert!(matches!(
            patch_closure(&root, PatchOptions::new()),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn existing_backup_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());
        let calculator = dir.path().join("Calculator.dll");
        fs::write(backup_path_for(&calculator), b"pristine").unwrap();

        let results = patch_closure(&root, PatchOptions::new()).unwrap();
        let patched = results
            .iter()
            .find(|r| r.state == PatchState::Patched)
            .unwrap();
        assert_eq!(patched.backup_path, Some(backup_path_for(&calculator)));
        assert_eq!(fs::read(backup_path_for(&calculator)).unwrap(), b"pristine");
    }

    #[test]
    fn restore_brings_back_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_closure(dir.path());
        let calculator = dir.path().join("Calculator.dll");
        let original = fs::read(&calculator).unwrap();

        patch_closure(&root, PatchOptions::new()).unwrap();
        restore(&calculator).unwrap();

        assert_eq!(fs::read(&calculator).unwrap(), original);
        assert!(!backup_path_for(&calculator).exists());
        assert!(matches!(restore(&calculator), Err(Error::FileError(_))));
    }

    #[test]
    fn backup_naming() {
        assert_eq!(
            backup_path_for(Path::new("bin/Calculator.dll")),
            PathBuf::from("bin/Calculator.dll.orig")
        );
        assert_eq!(PatchState::IgnoredTestAssembly.to_string(), "IgnoredTestAssembly");
    }
}
