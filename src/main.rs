//! trauth - forward-auth gate
//!
//! Bypass rules, client certificates and HTTP Basic authentication with
//! cookie sessions, in front of any reverse proxy.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use trauth::{
    cli::{Cli, Command, TlsCommand},
    config::Config,
    gate::{AuthEngine, Server},
    mtls::{CaParams, CertGenerator, LeafCertParams, LeafKind},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => run_check(cli.config.as_deref()),
        Some(Command::Tls(ref tls_cmd)) => run_tls_command(tls_cmd),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Run the gate until shutdown
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        tls = config.server.tls.is_some(),
        domain = %config.domain,
        "Starting trauth"
    );

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create gate: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Gate error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Validate configuration, rules, trust anchor and credential store
fn run_check(path: Option<&Path>) -> ExitCode {
    let result = Config::load(path).and_then(|config| {
        let engine = AuthEngine::from_config(&config)?;
        if let Some(tls) = &config.server.tls {
            trauth::mtls::build_server_tls_config(tls)?;
        }
        Ok(engine)
    });

    match result {
        Ok(engine) => {
            println!("✅ Configuration valid for domain {}", engine.domain());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run certificate helper commands
fn run_tls_command(cmd: &TlsCommand) -> ExitCode {
    let result = match cmd {
        TlsCommand::InitCa { cn, days, out } => CertGenerator::init_ca(&CaParams {
            cn,
            validity_days: *days,
        })
        .and_then(|ca| {
            CertGenerator::write_to_dir(&ca, out, "ca")?;
            Ok(out.join("ca.crt"))
        }),
        TlsCommand::Issue {
            cn,
            server,
            san_dns,
            days,
            ca_cert,
            ca_key,
            out,
            name,
        } => issue(
            &LeafCertParams {
                cn,
                san_dns: san_dns.clone(),
                validity_days: *days,
                kind: if *server {
                    LeafKind::Server
                } else {
                    LeafKind::Client
                },
            },
            ca_cert,
            ca_key,
            out,
            name.as_deref().unwrap_or(cn),
        ),
    };

    match result {
        Ok(path) => {
            println!("✅ Wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn issue(
    params: &LeafCertParams<'_>,
    ca_cert: &Path,
    ca_key: &Path,
    out: &Path,
    stem: &str,
) -> trauth::Result<std::path::PathBuf> {
    let ca_cert_pem = fs::read_to_string(ca_cert)?;
    let ca_key_pem = fs::read_to_string(ca_key)?;
    let leaf = CertGenerator::issue_leaf(params, &ca_cert_pem, &ca_key_pem)?;
    CertGenerator::write_to_dir(&leaf, out, stem)?;
    Ok(out.join(format!("{stem}.crt")))
}
