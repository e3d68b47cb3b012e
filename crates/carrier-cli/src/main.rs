//! Carrier CLI
//!
//! Runs two Carrier nodes over the in-process transport and moves a file
//! between them.

mod config;
mod progress;

use carrier_core::{
    CarrierNode, Event, FileId, FileSource, MemoryTransport, PeerId,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferProgress, format_bytes, format_duration};

/// Carrier - friend-to-friend file transfer
#[derive(Parser)]
#[command(name = "carrier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a file between two in-memory nodes
    Demo {
        /// File to send; a generated buffer is sent when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Size of the generated buffer in bytes
        #[arg(short, long, default_value_t = 1024 * 1024)]
        size: u64,

        /// Receive directory (overrides the config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Demo {
            file,
            size,
            output,
            timeout,
        } => {
            let output = output.unwrap_or_else(|| config.demo.output_dir.clone());
            tokio::time::timeout(
                Duration::from_secs(timeout),
                run_demo(&config, file, size, output),
            )
            .await
            .map_err(|_| anyhow::anyhow!("demo timed out after {timeout}s"))??;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Wait for the first event matching `pred`, logging the others
async fn wait_for(node: &CarrierNode, pred: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = node.events().next().await;
        if pred(&event) {
            return event;
        }
        tracing::debug!("Skipping {:?}", event);
    }
}

/// Demo pattern so corruption would be visible in the output file
fn demo_payload(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

async fn run_demo(
    config: &Config,
    file: Option<PathBuf>,
    size: u64,
    output: PathBuf,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&output).await?;

    let sender_id = PeerId::new(config.demo.sender.clone());
    let receiver_id = PeerId::new(config.demo.receiver.clone());

    let sender_transport = MemoryTransport::new(sender_id.clone());
    let receiver_transport = sender_transport.endpoint(receiver_id.clone());
    let sender_inbox = sender_transport.register(sender_id.clone());
    let receiver_inbox = sender_transport.register(receiver_id.clone());

    let sender = CarrierNode::new(config.carrier(), Arc::new(sender_transport))?;
    let receiver = CarrierNode::new(config.carrier(), Arc::new(receiver_transport))?;
    let sender_task = sender.spawn_inbox(sender_inbox);
    let receiver_task = receiver.spawn_inbox(receiver_inbox);

    println!("Sender:   {sender_id}");
    println!("Receiver: {receiver_id}");
    println!("Output:   {}", output.display());

    sender.open_session(&receiver_id).await?;
    wait_for(&receiver, |e| matches!(e, Event::IncomingSessionRequest { .. })).await;
    receiver.accept_session(&sender_id).await?;
    wait_for(&sender, |e| matches!(e, Event::SessionReady { .. })).await;
    tracing::info!("Session {} <-> {} ready", sender_id, receiver_id);

    let started = Instant::now();
    let file_id = match file {
        Some(path) => sender.send_file(&receiver_id, &path).await?,
        None => {
            let file_id = FileId::generate()?;
            let source = FileSource::memory(demo_payload(size));
            sender
                .request(&receiver_id, &file_id, "carrier-demo.bin", source)
                .await?;
            file_id
        }
    };

    let mut bar: Option<TransferProgress> = None;
    let outcome = loop {
        match receiver.events().next().await {
            Event::FileRequest {
                file_id: id,
                file_name,
                total_size,
                ..
            } if id == file_id => {
                println!("Incoming '{}' ({})", file_name, format_bytes(total_size));
                bar = Some(TransferProgress::new(total_size, &file_name));
                receiver.accept(&id, &output).await?;
            }
            Event::FileProgress {
                transferred_bytes, ..
            } => {
                if let Some(bar) = &bar {
                    bar.update(transferred_bytes);
                }
            }
            event if event.is_terminal() && event.file_id() == Some(&file_id) => break event,
            other => tracing::debug!("Receiver event {:?}", other),
        }
    };

    let result = match outcome {
        Event::FileCompleted {
            transferred_bytes, ..
        } => {
            let elapsed = started.elapsed();
            if let Some(bar) = &bar {
                bar.finish_with_message(format!(
                    "Received {} in {}",
                    format_bytes(transferred_bytes),
                    format_duration(elapsed)
                ));
            }
            wait_for(&sender, |e| e.is_terminal() && e.file_id() == Some(&file_id)).await;
            if let Some(path) = receiver.transfer(&file_id).and_then(|d| d.full_path) {
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
        other => {
            if let Some(bar) = &bar {
                bar.abandon_with_message("Transfer failed".to_string());
            }
            Err(anyhow::anyhow!("transfer did not complete: {other:?}"))
        }
    };

    sender.close_session(&receiver_id).await;
    sender.shutdown().await;
    receiver.shutdown().await;
    sender_task.abort();
    receiver_task.abort();
    result
}
