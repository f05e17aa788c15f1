use std::{
    io::{self, BufWriter, Write},
    path::Path,
};

use anyhow::{bail, Context};
use cilweave::{
    assembly::decode_stream,
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags},
        module::{MethodDef, Module},
        token::Token,
    },
};

use crate::commands::common::load_module;

pub fn run(
    path: &Path,
    type_filter: Option<&str>,
    method_filter: Option<&str>,
    bytes: bool,
) -> anyhow::Result<()> {
    let module = load_module(path)?;

    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());

    writeln!(w, "// {}", module.identity)?;
    for entry in module.metadata_entries() {
        writeln!(w, "// metadata {} = {}", entry.key, entry.value)?;
    }

    let mut printed = 0usize;
    for type_def in &module.types {
        let type_name = module
            .type_full_name(type_def.token)
            .unwrap_or_else(|| type_def.name.clone());
        if type_filter.is_some_and(|filter| !type_name.contains(filter)) {
            continue;
        }

        let methods: Vec<&MethodDef> = module
            .type_methods(type_def)
            .filter(|m| method_filter.map_or(true, |name| m.name == name))
            .collect();
        if methods.is_empty() {
            continue;
        }

        writeln!(w)?;
        writeln!(w, ".class {type_name}")?;
        writeln!(w, "{{")?;
        for method in methods {
            format_method(&mut w, &module, method, bytes)?;
            printed += 1;
        }
        writeln!(w, "}}")?;
    }
    w.flush()?;

    if printed == 0 {
        match (type_filter, method_filter) {
            (_, Some(method)) => bail!("no methods matching '{method}' found"),
            (Some(ty), None) => bail!("no types matching '{ty}' found"),
            (None, None) => {}
        }
    }
    Ok(())
}

fn format_method(
    w: &mut impl Write,
    module: &Module,
    method: &MethodDef,
    bytes: bool,
) -> anyhow::Result<()> {
    writeln!(w)?;
    writeln!(w, "  .method {} {}", method.name, method.signature)?;
    writeln!(w, "  {{")?;

    let Some(body) = &method.body else {
        writeln!(w, "    // no body")?;
        writeln!(w, "  }}")?;
        return Ok(());
    };

    writeln!(w, "    .maxstack {}", body.max_stack)?;
    if !body.locals.is_empty() {
        let locals: Vec<String> = body.locals.iter().map(ToString::to_string).collect();
        let init = if body.init_locals { "init " } else { "" };
        writeln!(w, "    .locals {init}({})", locals.join(", "))?;
    }

    let instructions = decode_stream(&body.code)
        .with_context(|| format!("failed to decode {}", method.name))?;
    for instruction in &instructions {
        let mut line = instruction.to_string();
        if let Some(token) = instruction.get_token_operand() {
            if let Some(name) = describe_token(module, token) {
                line.push_str(&format!("  // {name}"));
            }
        }
        if bytes {
            let start = usize::try_from(instruction.offset)?;
            let end = (start + usize::try_from(instruction.size)?).min(body.code.len());
            let raw: Vec<String> = body.code[start..end]
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect();
            writeln!(w, "    {:<24} {line}", raw.join(" "))?;
        } else {
            writeln!(w, "    {line}")?;
        }
    }

    for handler in &body.exception_handlers {
        writeln!(w, "    {}", format_handler(handler))?;
    }
    writeln!(w, "  }}")?;
    Ok(())
}

fn format_handler(handler: &ExceptionHandler) -> String {
    let kind = if handler.flags.contains(ExceptionHandlerFlags::FINALLY) {
        "finally"
    } else if handler.flags.contains(ExceptionHandlerFlags::FAULT) {
        "fault"
    } else if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
        "filter"
    } else {
        "catch"
    };
    format!(
        ".try IL_{:04x} to IL_{:04x} {kind} IL_{:04x} to IL_{:04x}",
        handler.try_offset,
        handler.try_offset + handler.try_length,
        handler.handler_offset,
        handler.handler_offset + handler.handler_length
    )
}

fn describe_token(module: &Module, token: Token) -> Option<String> {
    if let Some(name) = module.method_full_name(token) {
        return Some(name);
    }
    if let Some(field) = module.field(token) {
        return Some(field.name.clone());
    }
    if let Some(value) = module.user_string(token) {
        return Some(format!("{value:?}"));
    }
    module.type_full_name(token)
}
