//! Karst heap-dump tooling
//!
//! Command-line interface for working with raw-heap binary dumps:
//! conversion to the Chrome DevTools heapsnapshot format and quick
//! inspection of a dump's structure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use karst_engine::profiler::rawheap::summarize_rawheap;
use karst_engine::HeapProfiler;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "karst")]
#[command(about = "Karst heap dump tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a raw-heap binary dump into a Chrome DevTools heapsnapshot
    Translate {
        /// Input .rawheap file
        input: PathBuf,
        /// Output file (defaults to the input path with .heapsnapshot)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a dump's version, section table, and record counts
    Inspect {
        /// Input .rawheap file
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Translate { input, output } => {
            let output = output.unwrap_or_else(|| input.with_extension("heapsnapshot"));
            HeapProfiler::generate_heap_snapshot(&input, &output)
                .with_context(|| format!("failed to translate {}", input.display()))?;
            println!("wrote {}", output.display());
        }
        Commands::Inspect { input } => {
            let bytes = std::fs::read(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let summary = summarize_rawheap(&bytes)
                .with_context(|| format!("cannot parse {}", input.display()))?;
            println!("version:    {:?}", summary.version);
            println!("timestamp:  {} ms", summary.timestamp_ms);
            println!("roots:      {}", summary.root_count);
            println!("objects:    {}", summary.object_count);
            println!("strings:    {}", summary.string_count);
            println!("sections:");
            const NAMES: [&str; 5] = ["roots", "names", "strings", "objects", "memory"];
            for (i, (offset, size)) in summary.sections.iter().enumerate() {
                println!(
                    "  {:<8} offset {:>10}  size {:>10}",
                    NAMES.get(i).copied().unwrap_or("?"),
                    offset,
                    size
                );
            }
        }
    }
    Ok(())
}
