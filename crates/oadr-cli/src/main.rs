mod common;
mod events;
mod keys;
mod ven;
mod vtn;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "oadr", about = "OpenADR 2.0b VEN, VTN and key tooling", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the fingerprint of a certificate or public key (PEM or DER).
    Fingerprint {
        /// Path to the certificate file.
        cert: PathBuf,
    },

    /// Generate an Ed25519 signing key.
    Keygen {
        /// Output prefix: writes <prefix>.key and <prefix>.pem.
        #[arg(long)]
        out: PathBuf,
    },

    /// Run a VTN on HTTP, logging VEN activity as JSONL.
    Vtn {
        /// VTN identifier announced at registration.
        #[arg(long, default_value = "oadr-vtn")]
        vtn_id: String,
        /// Listen address.
        #[arg(long, default_value = oadr_transport::DEFAULT_LISTEN_ADDR)]
        listen: SocketAddr,
        /// Path prefix in front of the service names.
        #[arg(long, default_value = oadr_transport::DEFAULT_PATH_PREFIX)]
        prefix: String,
        /// Signing key written by `oadr keygen`.
        #[arg(long)]
        key: Option<PathBuf>,
        /// Poll frequency handed to VENs, in seconds.
        #[arg(long, default_value = "10")]
        poll_freq: u64,
        /// Queue a demo event for every VEN that registers.
        #[arg(long)]
        demo_event: bool,
        /// Report interval requested from VENs, in seconds.
        #[arg(long, default_value = "60")]
        report_interval: u64,
    },

    /// Run a VEN against a VTN, opting in to every event.
    Ven {
        /// VTN base URL including the path prefix.
        #[arg(long)]
        vtn_url: String,
        #[arg(long, default_value = "oadr-ven")]
        ven_name: String,
        /// Ask the VTN for this ven_id.
        #[arg(long)]
        ven_id: Option<String>,
        /// Signing key written by `oadr keygen`.
        #[arg(long)]
        key: Option<PathBuf>,
        /// Only accept VTN messages signed by this fingerprint.
        #[arg(long)]
        vtn_fingerprint: Option<String>,
        /// Opt out of events instead.
        #[arg(long)]
        opt_out: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Fingerprint { cert } => {
            println!("{}", keys::fingerprint(&cert)?);
        }

        Command::Keygen { out } => {
            let (key_path, pem_path, fingerprint) = keys::keygen(&out)?;
            eprintln!("wrote {} and {}", key_path.display(), pem_path.display());
            println!("{fingerprint}");
        }

        Command::Vtn {
            vtn_id,
            listen,
            prefix,
            key,
            poll_freq,
            demo_event,
            report_interval,
        } => {
            vtn::run(vtn::VtnOptions {
                vtn_id,
                listen,
                prefix,
                key,
                poll_freq: Duration::from_secs(poll_freq),
                demo_event,
                report_interval: Duration::from_secs(report_interval),
            })
            .await?;
        }

        Command::Ven {
            vtn_url,
            ven_name,
            ven_id,
            key,
            vtn_fingerprint,
            opt_out,
        } => {
            ven::run(ven::VenOptions {
                vtn_url,
                ven_name,
                ven_id,
                key,
                vtn_fingerprint,
                opt_out,
            })
            .await?;
        }
    }

    Ok(())
}
