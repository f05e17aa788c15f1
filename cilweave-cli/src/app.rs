use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cilweave - static interception weaving for CIL modules
#[derive(Debug, Parser)]
#[command(name = "cilweave", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Patch every co-located module referenced by a test module.
    Patch {
        /// Path to the root (test) module.
        #[arg(value_name = "ROOT")]
        root: PathBuf,

        /// Patch the root module as well.
        #[arg(long)]
        include_root: bool,

        /// Skip structural verification of the rewritten modules.
        #[arg(long)]
        skip_verify: bool,

        /// Directory holding the support module (defaults to the root's directory).
        #[arg(long, value_name = "DIR")]
        support_dir: Option<PathBuf>,
    },

    /// Show whether a module carries the patch marker.
    Status {
        /// Path to the module file.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Directory holding the support module (defaults to the module's directory).
        #[arg(long, value_name = "DIR")]
        support_dir: Option<PathBuf>,
    },

    /// Run the structural verifier over a module.
    Verify {
        /// Path to the module file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Disassemble method bodies.
    Disasm {
        /// Path to the module file.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Only types whose full name contains this string.
        #[arg(short, long)]
        r#type: Option<String>,

        /// Only methods with this name.
        #[arg(short, long)]
        method: Option<String>,

        /// Show the raw bytes of every instruction.
        #[arg(long)]
        bytes: bool,
    },

    /// Write the support module into a directory.
    Support {
        /// Target directory.
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Move the `.orig` backup of a patched module back over it.
    Restore {
        /// Path to the patched module file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}
