use anyhow::{Context, Result};
use clap::Parser;
use locksentry::history;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Locksentry - inspect recorded deadlock history files"
)]
struct Cli {
    /// Path to a deadlock history file
    history_file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let groups = history::load(&cli.history_file)
        .with_context(|| format!("failed to load {}", cli.history_file.display()))?;
    if groups.is_empty() {
        println!("no recorded deadlocks");
        return Ok(());
    }
    for (slot, group) in groups.iter().enumerate() {
        println!("merge set #{slot}: {} locks", group.entries.len());
        for entry in &group.entries {
            if entry.stack.is_empty() {
                println!("  lock {:#x} (immediate redirection)", entry.lock);
            } else {
                println!("  lock {:#x}, {} init frames", entry.lock, entry.stack.len());
            }
        }
    }
    Ok(())
}
