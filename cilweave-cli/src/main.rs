mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // cilweave info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("cilweave", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Patch {
            root,
            include_root,
            skip_verify,
            support_dir,
        } => commands::patch::run(
            root,
            commands::patch::PatchFlags {
                include_root: *include_root,
                skip_verify: *skip_verify,
                support_dir: support_dir.as_deref(),
            },
            &cli.global,
        ),
        Command::Status { path, support_dir } => {
            commands::status::run(path, support_dir.as_deref(), &cli.global)
        }
        Command::Verify { path } => commands::verify::run(path, &cli.global),
        Command::Disasm {
            path,
            r#type,
            method,
            bytes,
        } => commands::disasm::run(path, r#type.as_deref(), method.as_deref(), *bytes),
        Command::Support { dir } => commands::support::run(dir, &cli.global),
        Command::Restore { path } => commands::restore::run(path, &cli.global),
    }
}
