use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rkctl::data_source::data_from_args;
use rkctl::operator::OperatorClient;
use rkctl::output::format_license_reply;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rkctl", version, about = "RK8s administrative CLI")]
struct Cli {
    /// Address of a cluster server
    #[arg(long, env = "RKCTL_ADDR", default_value = "127.0.0.1:4647", global = true)]
    address: SocketAddr,

    /// TLS name the server certificate must carry
    #[arg(long, default_value = "localhost", global = true)]
    server_name: String,

    /// PEM file with the CA that signed the server certificate
    #[arg(long, env = "RKCTL_CA_CERT", global = true)]
    ca_cert: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the cluster license
    License {
        #[command(subcommand)]
        command: LicenseCommands,
    },
}

#[derive(Subcommand)]
enum LicenseCommands {
    /// Install a new license from a file (@rk8s.license), stdin (-) or a literal string
    Put {
        #[arg(value_name = "LICENSE", allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::License {
            command: LicenseCommands::Put { args },
        } => {
            let data = data_from_args(&args, std::io::stdin().lock())
                .context("Error parsing arguments")?;

            let tls = client_tls(cli.ca_cert.as_deref()).context("Error initializing client")?;
            let client = OperatorClient::connect(cli.address, &cli.server_name, tls)
                .await
                .context("Error initializing client")?;
            let reply = client
                .license_put(data)
                .await
                .context("Error putting license");
            client.close();

            print!("{}", format_license_reply(&reply?));
            Ok(())
        }
    }
}

fn client_tls(ca_cert: Option<&Path>) -> Result<rustls::ClientConfig> {
    let path = ca_cert.context("no CA certificate given, set --ca-cert or RKCTL_CA_CERT")?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(path)
        .with_context(|| format!("Failed to read CA certificate {}", path.display()))?
    {
        let cert = cert.with_context(|| format!("Invalid CA certificate {}", path.display()))?;
        roots.add(cert).context("Failed to trust CA certificate")?;
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
