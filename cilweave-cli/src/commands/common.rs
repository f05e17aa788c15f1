use std::path::{Path, PathBuf};

use anyhow::Context;
use cilweave::{metadata::module::Module, weaver::MockInjector, File};

/// Load and parse one module file.
pub fn load_module(path: &Path) -> anyhow::Result<Module> {
    Module::from_file(path).with_context(|| format!("failed to load module: {}", path.display()))
}

/// Directory containing `path`, `.` for bare file names.
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Injector for the support module in `support_dir`, resolving base types next to `module_dir`.
pub fn load_injector(support_dir: &Path, module_dir: &Path) -> anyhow::Result<MockInjector> {
    let support_path = cilweave::weaver::support::support_module_path(support_dir);
    let file = File::from_file(&support_path)
        .with_context(|| format!("failed to read support module: {}", support_path.display()))?;
    let support = Module::parse(file.data())
        .with_context(|| format!("failed to parse support module: {}", support_path.display()))?;
    MockInjector::from_support(&support, file.data(), module_dir)
        .with_context(|| format!("unusable support module: {}", support_path.display()))
}

/// Extract a display-friendly filename from a path.
pub fn file_display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}
