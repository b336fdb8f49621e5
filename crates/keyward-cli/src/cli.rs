use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "keyward",
    about = "Certificate-protected automation settings and gated configuration sync",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Settings file to use instead of the configured default.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Encrypt NAME=VALUE pairs into the settings file, replacing its contents.
    Protect {
        /// Certificate subject or thumbprint; defaults to the configured certificate.
        #[arg(long)]
        cert: Option<String>,
        /// Overwrite without keeping a timestamped backup.
        #[arg(long)]
        force: bool,
        #[arg(required = true, value_parser = parse_entry)]
        entries: Vec<(String, String)>,
    },
    /// Print decrypted values for the given setting names.
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// List setting names without decrypting them.
    List,
    /// Manage certificates.
    #[command(subcommand)]
    Cert(CertCommand),
    /// Pull the configuration source and apply it if it changed.
    Sync {
        /// Apply even when the recorded hash matches.
        #[arg(long)]
        force: bool,
    },
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CertCommand {
    /// Generate a certificate key pair into the certificate directory.
    New { subject: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

fn parse_entry(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}
