use std::path::Path;

use anyhow::Context;
use cilweave::{metadata::module::Module, utils::compute_md5, utils::to_hex};
use serde::Serialize;

use crate::{app::GlobalOptions, output::print_output};

#[derive(Debug, Serialize)]
pub struct SupportResult {
    path: String,
    name: String,
    version: String,
    md5: String,
}

pub fn run(dir: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    let path = cilweave::weaver::write_support_module(dir)
        .with_context(|| format!("failed to write support module into: {}", dir.display()))?;

    let image = std::fs::read(&path)?;
    let module = Module::parse(&image)?;

    let result = SupportResult {
        path: path.display().to_string(),
        name: module.name().to_string(),
        version: module.identity.version.to_string(),
        md5: to_hex(&compute_md5(&image)),
    };

    print_output(&result, opts, |r| {
        println!("Wrote {} {} to {}", r.name, r.version, r.path);
        println!("  md5: {}", r.md5);
    })
}
