//! Quill addon manager.
//!
//! Runs the addon runtime headless against the user's addon directories:
//! list what is installed, toggle plugins and themes, change tiers, settings
//! and theme variables, or stay resident and live-reload on file changes.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod theme;

/// Quill addon manager
#[derive(Parser)]
#[command(name = "quill-addons")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// How results and logs are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable tables.
    Pretty,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed plugins and themes
    List,

    /// Enable (start) a plugin or theme
    Enable {
        /// Addon id
        id: String,
    },

    /// Disable (stop) a plugin or theme
    Disable {
        /// Addon id
        id: String,
    },

    /// Re-read an addon from disk
    Reload {
        /// Addon id
        id: String,
    },

    /// Show or set a plugin's permission tier
    Permission {
        /// Plugin id
        id: String,
        /// New tier: limited, partial or full
        tier: Option<String>,
    },

    /// Show or set a plugin setting
    Setting {
        /// Plugin id
        id: String,
        /// Setting key
        key: String,
        /// New value as JSON (bare words are stored as strings)
        value: Option<String>,
    },

    /// List a theme's overridable variables
    Vars {
        /// Theme id
        theme: String,
    },

    /// Override a theme variable
    Var {
        /// Theme id
        theme: String,
        /// Custom property name, e.g. --accent
        name: String,
        /// New value
        value: String,
    },

    /// Load everything and live-reload on file changes until Ctrl-C
    Watch,
}

fn setup_logging(verbose: bool, format: OutputFormat) {
    let default = if verbose {
        "debug"
    } else {
        "warn,quill_addons=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Pretty => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.format);
    let out = cli.format;

    match cli.command {
        Commands::List => commands::list(out).await,
        Commands::Enable { id } => commands::enable(&id, out).await,
        Commands::Disable { id } => commands::disable(&id, out).await,
        Commands::Reload { id } => commands::reload(&id, out).await,
        Commands::Permission { id, tier } => commands::permission(&id, tier.as_deref(), out).await,
        Commands::Setting { id, key, value } => {
            commands::setting(&id, &key, value.as_deref(), out).await
        },
        Commands::Vars { theme } => commands::vars(&theme, out).await,
        Commands::Var { theme, name, value } => commands::var(&theme, &name, &value, out).await,
        Commands::Watch => commands::watch().await,
    }
}
