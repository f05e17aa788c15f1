use std::path::Path;

use cilweave::verify::{StructuralVerifier, Verifier};
use serde::Serialize;

use crate::{app::GlobalOptions, output::print_output};

#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub path: String,
    pub verifier: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let verifier = StructuralVerifier;
    let outcome = verifier.verify(path);

    let result = VerificationResult {
        path: path.display().to_string(),
        verifier: verifier.name().to_string(),
        valid: outcome.is_ok(),
        error_message: outcome.err().map(|e| e.to_string()),
    };

    print_output(&result, opts, |r| {
        let status = if r.valid { "PASS" } else { "FAIL" };
        println!("{status}  {path}  ({verifier})", path = r.path, verifier = r.verifier);
        if let Some(err) = &r.error_message {
            println!("  Error: {err}");
        }
    })?;

    if result.valid {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
