//! idevbackup CLI
//!
//! Command-line tools for inspecting device backups on disk.
//!
//! # Commands
//!
//! - `list` - List the device backups under a backup root
//! - `status` - Show the `Status.plist` of one backup
//! - `info` - Show the `Info.plist` of one backup

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Device backup inspection tools.
#[derive(Parser)]
#[command(name = "idevbackup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backup root holding one directory per device
    #[arg(global = true, short, long, default_value = ".")]
    root: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List device backups
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the backup status of a device
    Status {
        /// Device identifier
        udid: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the device information recorded in a backup
    Info {
        /// Device identifier
        udid: String,

        /// List the iTunes files stored in the info file
        #[arg(short, long)]
        files: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::List { format } => {
            commands::list::run(&cli.root, &format)?;
        }
        Commands::Status { udid, format } => {
            commands::status::run(&cli.root, &udid, &format)?;
        }
        Commands::Info {
            udid,
            files,
            format,
        } => {
            commands::info::run(&cli.root, &udid, files, &format)?;
        }
        Commands::Version => {
            println!("idevbackup CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "backup protocol versions {:?}",
                idevbackup_protocol::SUPPORTED_PROTOCOL_VERSIONS
            );
        }
    }

    Ok(())
}
