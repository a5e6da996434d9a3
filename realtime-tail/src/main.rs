//! Realtime Stream Tail
//!
//! Connects to the dashboard event stream, subscribes to the requested topics
//! and prints every inbound frame as one JSON line on stdout. Logs go to
//! stderr so the output can be piped.

use clap::Parser;
use realtime_client::config::resolve_url;
use realtime_client::{StreamClient, StreamConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "realtime-tail")]
#[command(about = "Print the dashboard event stream as JSON lines")]
struct Args {
    /// Topics to subscribe, in addition to REALTIME_TOPICS
    topics: Vec<String>,

    /// Server base or full channel URL (overrides REALTIME_WS_URL)
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,realtime_client=debug")),
        )
        .init();

    let args = Args::parse();

    let mut config = StreamConfig::from_env()?;
    if let Some(url) = &args.url {
        config.url = resolve_url(url)?;
    }

    info!("Starting realtime tail against {}", config.url);

    let client = StreamClient::new(config)?;
    for topic in &args.topics {
        client.subscribe(topic);
    }
    info!("Topics: {:?}", client.topics());

    let mut frames = client.frames();
    let mut states = client.state_changes();

    // Keeps retrying in the background after a failed first attempt
    let initial = client.connect();
    tokio::spawn(async move {
        if let Err(e) = initial.await {
            warn!("Initial connection failed, will keep retrying: {}", e);
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!("Connection state: {}", state);
            }

            frame = frames.recv() => match frame {
                Ok(frame) => println!("{}", serde_json::to_string(&frame)?),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Output fell behind, skipped {} frame(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect();
    info!("Stopped");
    Ok(())
}
