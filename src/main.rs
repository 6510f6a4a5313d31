//! parley - Peer-to-peer voice and text chat

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use parley::{Config, Node};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Peer-to-peer voice and text chat")]
#[command(version)]
struct Cli {
    /// Display name announced to peers (defaults to $USER)
    name: Option<String>,

    #[command(flatten)]
    config: Config,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::builder()
        .with_env_var("LOG_LEVEL")
        .try_from_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let name = cli
        .name
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "anonymous".to_string());

    let node = Arc::new(Node::new(name, cli.config));
    node.set_text_callback(|name, message| println!("{}: {}", name, message));
    node.start().await?;

    println!("parley is running. Type a message and press enter; Ctrl+C to quit.");

    // Blocking stdin reader bridged into the async loop
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = line_rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = node.send_message(&line).await {
                        warn!("Send failed: {}", e);
                    }
                }
                None => break,
            }
        }
    }

    node.stop().await;
    Ok(())
}
