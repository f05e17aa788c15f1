use std::path::Path;

use anyhow::{bail, Context};
use cilweave::weaver::{backup_path_for, restore};
use serde::Serialize;

use crate::{app::GlobalOptions, output::print_output};

#[derive(Debug, Serialize)]
pub struct RestoreResult {
    path: String,
    backup: String,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let backup = backup_path_for(path);
    if !backup.is_file() {
        bail!("no backup found at {}", backup.display());
    }
    restore(path).with_context(|| format!("failed to restore: {}", path.display()))?;

    let result = RestoreResult {
        path: path.display().to_string(),
        backup: backup.display().to_string(),
    };
    print_output(&result, opts, |r| {
        println!("Restored {} from {}", r.path, r.backup);
    })
}
