//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Forward-auth gate - bypass rules, client certificates and Basic auth with
/// cookie sessions
#[derive(Parser, Debug)]
#[command(name = "trauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TRAUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TRAUTH_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TRAUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gate server (default)
    Serve,

    /// Load and validate the configuration, then exit
    Check,

    /// Certificate helpers for client certificate authentication
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Create a self-signed CA to use as `ca_path`
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "trauth CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory; writes ca.crt and ca.key
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Issue a certificate signed by the CA
    Issue {
        /// Common Name; for client certificates this is the username
        #[arg(long, required = true)]
        cn: String,

        /// Issue a server certificate instead of a client certificate
        #[arg(long)]
        server: bool,

        /// DNS subject alternative names (server certificates)
        #[arg(long = "san")]
        san_dns: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// CA certificate
        #[arg(long, default_value = "ca.crt")]
        ca_cert: PathBuf,

        /// CA private key
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,

        /// Output directory; writes <name>.crt and <name>.key
        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// File stem for the output (defaults to the CN)
        #[arg(long)]
        name: Option<String>,
    },
}
