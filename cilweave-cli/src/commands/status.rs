use std::path::Path;

use cilweave::weaver::injector::{is_eligible_method, is_eligible_type, type_is_patched};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{load_injector, load_module, parent_dir},
    output::{print_output, yes_no, Align, Columns},
};

#[derive(Debug, Serialize)]
pub struct TypeEntry {
    name: String,
    eligible_methods: usize,
    patched: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResult {
    path: String,
    module: String,
    version: String,
    strong_named: bool,
    marker: String,
    types: Vec<TypeEntry>,
}

pub fn run(path: &Path, support_dir: Option<&Path>, opts: &GlobalOptions) -> anyhow::Result<()> {
    let module = load_module(path)?;
    let module_dir = parent_dir(path);
    let injector = load_injector(support_dir.unwrap_or(&module_dir), &module_dir)?;

    let mut types = Vec::new();
    for type_def in module.types.iter().filter(|t| is_eligible_type(&module, t)) {
        let eligible_methods = type_def
            .methods
            .iter()
            .filter_map(|token| module.method(*token))
            .filter(|method| is_eligible_method(&module, method))
            .count();
        types.push(TypeEntry {
            name: module
                .type_full_name(type_def.token)
                .unwrap_or_else(|| type_def.name.clone()),
            eligible_methods,
            patched: type_is_patched(&module, type_def)?,
        });
    }

    let result = StatusResult {
        path: path.display().to_string(),
        module: module.name().to_string(),
        version: module.identity.version.to_string(),
        strong_named: module.identity.is_strong_named(),
        marker: injector.marker_status(&module).to_string(),
        types,
    };

    print_output(&result, opts, |r| {
        println!("Module:       {} {}", r.module, r.version);
        println!("Path:         {}", r.path);
        println!("Strong-named: {}", yes_no(r.strong_named));
        println!("Marker:       {}", r.marker);
        if r.types.is_empty() {
            return;
        }
        println!();
        let mut columns = Columns::new(&[
            ("Type", Align::Left),
            ("Methods", Align::Right),
            ("Patched", Align::Left),
        ]);
        for entry in &r.types {
            columns.push([
                entry.name.clone(),
                entry.eligible_methods.to_string(),
                yes_no(entry.patched),
            ]);
        }
        columns.print();
    })
}
