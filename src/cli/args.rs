//! CLI argument parsing using clap.

use clap::{
    Args, Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Regenerate documentation as source files change
#[derive(Parser, Debug)]
#[command(
    name = "docwatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Regenerate documentation as source files change",
    long_about = "Watch a directory of source files, run a generator once per burst of \
                  changes to a file, and stream status notifications.",
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Set up .docwatch directory with default settings
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Display active settings
    Config,

    /// Watch the source directory and regenerate on change
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct WatchArgs {
    /// Directory to watch (overrides config)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Directory generated files are written to (overrides config)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Quiet period in milliseconds before a changed file is processed
    #[arg(long, allow_negative_numbers = true)]
    pub debounce_ms: Option<i64>,

    /// Print every notification as a JSON line
    #[arg(long)]
    pub events: bool,

    /// Generator command; the changed file's path is appended
    #[arg(last = true)]
    pub command: Vec<String>,
}
