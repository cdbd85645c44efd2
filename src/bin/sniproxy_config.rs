//! CLI tool for inspecting the domain configuration
//!
//! Usage:
//!   sniproxy-config check [--config <path>]
//!   sniproxy-config routes [--config <path>] [--json]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sniproxy::{DomainConfig, RouteTable, StartupError};
use std::path::PathBuf;

/// CLI tool for checking SniProxy domain configuration
#[derive(Parser, Debug)]
#[command(name = "sniproxy-config")]
#[command(author = "SniProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Validate and list SniProxy domain routes")]
struct Args {
    /// Domain configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = "./config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration and load every credential it references
    Check,

    /// List configured routes
    Routes {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let bytes = std::fs::read(&args.config)
        .with_context(|| format!("Failed to read {}", args.config.display()))?;

    match args.command {
        Commands::Check => match RouteTable::load(&bytes) {
            Ok(routes) => {
                println!(
                    "{}: OK ({} domain(s), all credentials loaded)",
                    args.config.display(),
                    routes.len()
                );
            }
            Err(err) => {
                eprintln!("{}: {}", args.config.display(), err);
                if let StartupError::Config(config) = &err {
                    for field in config.field_errors() {
                        eprintln!("  {}", field);
                    }
                }
                std::process::exit(1);
            }
        },

        Commands::Routes { json } => {
            let config = match DomainConfig::parse(&bytes) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{}: {}", args.config.display(), err);
                    for field in err.field_errors() {
                        eprintln!("  {}", field);
                    }
                    std::process::exit(1);
                }
            };

            if config.is_empty() {
                println!("No domains configured");
                return Ok(());
            }

            if json {
                let json_output: Vec<serde_json::Value> = config
                    .domains
                    .iter()
                    .map(|(hostname, entry)| {
                        serde_json::json!({
                            "hostname": hostname,
                            "target": entry.target,
                            "name": entry.name,
                            "key_path": entry.ssl.key_path,
                            "cert_path": entry.ssl.cert_path,
                            "ca_path": entry.ssl.ca_path,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            } else {
                println!("{:<40} {:<40} {:<20}", "DOMAIN", "TARGET", "NAME");
                println!("{}", "-".repeat(100));

                for (hostname, entry) in &config.domains {
                    println!(
                        "{:<40} {:<40} {:<20}",
                        hostname,
                        entry.target,
                        entry.name.as_deref().unwrap_or("unnamed")
                    );
                }

                println!("\nTotal: {} domain(s)", config.len());
            }
        }
    }

    Ok(())
}
