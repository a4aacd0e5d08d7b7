//! lunac: compile Luna source to binary chunks, list compiled code, or
//! just check syntax.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use luna_bytecode::dump;
use luna_parser::load_bytes;

mod listing;

/// The Luna compiler command-line interface
#[derive(Parser)]
#[command(name = "lunac")]
#[command(about = "The Luna bytecode compiler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a binary chunk
    Compile {
        /// Source file (Luna text or an already-compiled chunk)
        input: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "luna.out")]
        output: PathBuf,

        /// Strip debug information from the output
        #[arg(short, long)]
        strip: bool,
    },

    /// Disassemble a source or binary chunk
    List {
        input: PathBuf,

        /// Emit the prototype tree as JSON instead of a listing
        #[arg(long)]
        json: bool,
    },

    /// Parse and report errors without producing output
    Check {
        input: PathBuf,
    },
}

fn chunk_name(path: &PathBuf) -> String {
    format!("@{}", path.display())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Compile { input, output, strip } => {
            let source = fs::read(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let closure = load_bytes(&source, &chunk_name(&input), None)?;
            let mut out = Vec::new();
            dump::dump(&closure.proto, &mut out, strip)?;
            fs::write(&output, out)
                .with_context(|| format!("cannot write {}", output.display()))?;
            log::info!("wrote {}", output.display());
        }
        Commands::List { input, json } => {
            let source = fs::read(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let closure = load_bytes(&source, &chunk_name(&input), None)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&closure.proto)?);
            } else {
                print!("{}", listing::list_proto(&closure.proto, true));
            }
        }
        Commands::Check { input } => {
            let source = fs::read(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            load_bytes(&source, &chunk_name(&input), None)?;
            println!("{}: ok", input.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_writes_loadable_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("in.luna");
        fs::write(&src_path, "return 1 + 2").unwrap();
        let source = fs::read(&src_path).unwrap();
        let closure = load_bytes(&source, &chunk_name(&src_path), None).unwrap();
        let mut out = Vec::new();
        dump::dump(&closure.proto, &mut out, false).unwrap();
        let out_path = dir.path().join("out.lnc");
        fs::write(&out_path, &out).unwrap();
        let reloaded = load_bytes(&fs::read(&out_path).unwrap(), "=out", None).unwrap();
        assert_eq!(reloaded.proto, closure.proto);
    }
}
