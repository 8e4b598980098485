//! The `ailc` command-line interface for the AILANG compiler.
//!
//! The CLI is a thin shell around [`ailang_codegen`]: it loads a parsed
//! program, runs the backend, writes the executable, and marks it
//! executable. The lexer/parser is an external collaborator; this binary
//! consumes its serialized AST output (serde JSON, tagged by node kind).

use anyhow::{bail, Context as _, Result};
use ailang_codegen::{compile_program, Frontend, Options};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

/// Compile an AILANG program to a standalone Linux/x86-64 executable.
#[derive(Parser, Debug)]
#[command(name = "ailc", version, about)]
pub struct CompileCommand {
    /// Path to the parsed program (AST JSON produced by the frontend).
    pub input: PathBuf,

    /// Path of the executable to write.
    pub output: PathBuf,

    /// Enable inline performance timers around the program body.
    #[arg(short = 'P')]
    pub perf_timers: bool,

    /// Debug verbosity 1-4; injects assert/trace snippets into the
    /// emitted code.
    #[arg(short = 'D', value_name = "LEVEL")]
    pub debug_level: Option<u8>,

    /// Use the full try/catch lowering (per-frame error slot) instead of
    /// the simplified try/finally.
    #[arg(long)]
    pub full_try_catch: bool,
}

/// Loads pre-parsed ASTs for the backend's on-demand library loads.
///
/// A library reference `Library.Text` resolves to `Library.Text.ailang`;
/// the external parser drops the parsed form next to it as
/// `Library.Text.ailang.json`, which is preferred. A library file that is
/// itself AST JSON is accepted as a fallback.
struct JsonFrontend;

impl Frontend for JsonFrontend {
    fn parse_file(
        &self,
        path: &Path,
    ) -> std::result::Result<ailang_ast::Program, Box<dyn std::error::Error + Send + Sync>> {
        let mut json_path = path.as_os_str().to_owned();
        json_path.push(".json");
        let json_path = PathBuf::from(json_path);
        let text = if json_path.exists() {
            fs::read_to_string(&json_path)?
        } else {
            fs::read_to_string(path)?
        };
        Ok(serde_json::from_str(&text)?)
    }
}

impl CompileCommand {
    /// Run the compilation and write the executable.
    pub fn execute(&self) -> Result<()> {
        let debug_level = self.debug_level.unwrap_or(0);
        if debug_level > 4 {
            bail!("debug level must be between 1 and 4");
        }

        let text = fs::read_to_string(&self.input)
            .with_context(|| format!("reading {}", self.input.display()))?;
        let program: ailang_ast::Program = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.input.display()))?;

        let options = Options {
            debug_level,
            perf_timers: self.perf_timers,
            full_try_catch: self.full_try_catch,
        };
        let frontend = JsonFrontend;
        let image = compile_program(&program, options, Some(&frontend))
            .with_context(|| format!("compiling {}", self.input.display()))?;

        fs::write(&self.output, &image)
            .with_context(|| format!("writing {}", self.output.display()))?;
        mark_executable(&self.output)?;
        log::info!(
            "wrote {} ({} bytes)",
            self.output.display(),
            image.len()
        );
        Ok(())
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use rustix::fs::{chmod, Mode};
    chmod(path, Mode::from_raw_mode(0o755))
        .with_context(|| format!("setting permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}
