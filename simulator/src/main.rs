use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;
use veilmatch_simulator::{Api, Simulator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Program id as 64 hex characters; every storage handle derives from it.
    #[arg(long)]
    program_id: String,

    /// Artificial delay applied to each verification, in milliseconds.
    #[arg(long)]
    verification_delay_ms: Option<u64>,
}

fn parse_program_id(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw).context("invalid program id hex format")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("program id must be 32 bytes"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let program_id = parse_program_id(&args.program_id)?;
    let simulator = Arc::new(Simulator::new(program_id));
    if let Some(delay) = args.verification_delay_ms {
        simulator.set_verification_delay_ms(delay);
    }
    info!(
        mxe_public_key = %hex::encode(simulator.mxe_public_key()),
        "simulator ready"
    );

    let api = Api::new(simulator);
    let app = api.router();

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .await
        .context("axum server error")?;

    Ok(())
}
