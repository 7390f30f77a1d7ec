use clap::Parser;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

use rml_rtmp_pacer::media::DEFAULT_AGGREGATE_BYTE_LIMIT;
use rml_rtmp_pacer::sessions::{ServerSessionConfig, StreamRegistry};

use crate::connection::{Connection, ConnectionSettings};

mod connection;
mod handshake;

/// RTMP server that plays FLV files from a directory and relays live publishes
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(short, long, default_value_t = 1935)]
    port: u16,

    /// Directory holding `<stream key>.flv` files
    #[arg(short, long, default_value = ".")]
    media_dir: PathBuf,

    /// Outbound RTMP chunk size
    #[arg(long, default_value_t = 4096)]
    chunk_size: u32,

    /// How far ahead of the player recorded media is sent, unless the player asks otherwise
    #[arg(long, default_value_t = 5000)]
    buffer_duration_ms: u32,

    /// Largest aggregate message built from recorded media
    #[arg(long, default_value_t = DEFAULT_AGGREGATE_BYTE_LIMIT)]
    aggregate_byte_limit: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut session_config = ServerSessionConfig::new();
    session_config.chunk_size = args.chunk_size;
    session_config.playback.buffer_duration_ms = args.buffer_duration_ms;

    let settings = Arc::new(ConnectionSettings {
        session_config,
        media_dir: args.media_dir,
        aggregate_byte_limit: args.aggregate_byte_limit,
    });

    let registry = Arc::new(StreamRegistry::new());

    info!(port = args.port, media_dir = %settings.media_dir.display(), "Listening for connections");
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let mut current_id = 0;

    loop {
        let (stream, connection_info) = listener.accept().await?;
        info!(connection_id = current_id, peer = %connection_info, "Connection received");

        let connection = Connection::new(current_id, Arc::clone(&settings), Arc::clone(&registry));
        spawn(connection.start(stream));
        current_id += 1;
    }
}

fn spawn<F, E>(future: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display,
{
    tokio::task::spawn(async {
        if let Err(error) = future.await {
            error!(error = %error, "Task failed");
        }
    });
}

/// Sends a message over an unbounded sender and returns true if the message was sent
/// or false if the channel has been closed.
fn send<T>(sender: &UnboundedSender<T>, message: T) -> bool {
    sender.send(message).is_ok()
}
