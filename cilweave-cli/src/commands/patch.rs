use std::path::Path;

use anyhow::Context;
use cilweave::weaver::{ClosurePatcher, PatchOptions, PatchState};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{file_display_name, load_injector, parent_dir},
    output::{print_output, Align, Columns},
};

pub struct PatchFlags<'a> {
    pub include_root: bool,
    pub skip_verify: bool,
    pub support_dir: Option<&'a Path>,
}

#[derive(Debug, Serialize)]
pub struct ModuleEntry {
    module: String,
    path: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PatchSummary {
    root: String,
    patched: usize,
    modules: Vec<ModuleEntry>,
}

pub fn run(root: &Path, flags: PatchFlags<'_>, opts: &GlobalOptions) -> anyhow::Result<()> {
    let module_dir = parent_dir(root);
    let support_dir = flags.support_dir.unwrap_or(&module_dir);
    let injector = load_injector(support_dir, &module_dir)?;

    let options = PatchOptions::new()
        .include_root(flags.include_root)
        .skip_verify(flags.skip_verify);
    let results = ClosurePatcher::new(injector)
        .patch_closure(root, options)
        .with_context(|| format!("patching failed for: {}", root.display()))?;

    let summary = PatchSummary {
        root: root.display().to_string(),
        patched: results
            .iter()
            .filter(|r| r.state == PatchState::Patched)
            .count(),
        modules: results
            .iter()
            .map(|r| ModuleEntry {
                module: file_display_name(&r.path),
                path: r.path.display().to_string(),
                state: r.state.to_string(),
                backup: r.backup_path.as_ref().map(|b| b.display().to_string()),
            })
            .collect(),
    };

    print_output(&summary, opts, |s| {
        println!("Patched {} module(s) reachable from {}", s.patched, s.root);
        println!();
        let mut columns = Columns::new(&[
            ("Module", Align::Left),
            ("State", Align::Left),
            ("Backup", Align::Left),
        ]);
        for entry in &s.modules {
            columns.push([
                entry.module.clone(),
                entry.state.clone(),
                entry.backup.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }
        columns.print();
    })
}
