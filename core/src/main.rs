//! Thin CLI entry point for the mount's local config/ops surface. There is
//! no concrete backing store, kernel bridge, or RPC transport in this
//! workspace (spec's explicit external collaborators), so this binary only
//! does what's possible with config and overlay state alone: scaffold a
//! fresh `config.json` and print an existing one back. Actually mounting a
//! repository is the job of whatever wires a real `ObjectSource` and
//! channel bridge together and calls into `edenfs_core::mount::Mount`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use edenfs_castore::CasePolicy;
use edenfs_core::config::MountConfig;

#[derive(Parser)]
#[command(author, version, about = "edenfs core mount utilities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a fresh config.json for a new mount.
    Init {
        /// Where to write the config file.
        config_path: PathBuf,
        #[arg(long)]
        mount_path: PathBuf,
        #[arg(long)]
        overlay_dir: PathBuf,
        #[arg(long, default_value = "")]
        parent_root_id: String,
        #[arg(long, default_value = "sensitive")]
        case_policy: String,
        #[arg(long, default_value_t = 256 * 1024 * 1024)]
        journal_memory_limit_bytes: u64,
    },
    /// Print an existing config.json.
    Show {
        config_path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    edenfs_tracing::TracingBuilder::default().build()?;
    let cli = Cli::parse();
    match cli.command {
        Command::Init { config_path, mount_path, overlay_dir, parent_root_id, case_policy, journal_memory_limit_bytes } => {
            let case_policy = match case_policy.as_str() {
                "insensitive-preserving" => CasePolicy::InsensitivePreserving,
                _ => CasePolicy::Sensitive,
            };
            let config = MountConfig { parent_root_id, case_policy, mount_path, overlay_dir, journal_memory_limit_bytes };
            config.save(&config_path)?;
            println!("wrote {}", config_path.display());
        }
        Command::Show { config_path } => {
            let config = MountConfig::load(&config_path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
