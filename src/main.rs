use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use driftfs::{EncryptionKey, FileServer, FileServerConfig};
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "driftfs")]
#[command(about = "A peer-to-peer distributed file store with encrypted replication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file server node
    Node {
        /// Configuration file path
        #[arg(short, long, default_value = "config/node.yaml")]
        config: PathBuf,
    },
    /// Generate a cluster encryption key (hex, for node configs)
    Keygen,
    /// Spin up a small local cluster and run a store/fetch round trip
    Demo {
        /// Directory for the demo nodes' storage roots
        #[arg(short, long, default_value = "demo-data")]
        root: PathBuf,
        /// Number of keys to store and fetch back
        #[arg(short, long, default_value_t = 5)]
        keys: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftfs=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Node { config } => run_node(config).await,
        Commands::Keygen => {
            println!("{}", EncryptionKey::generate().to_hex());
            Ok(())
        }
        Commands::Demo { root, keys } => run_demo(root, keys).await,
    }
}

async fn run_node(config_path: PathBuf) -> Result<()> {
    let config = FileServerConfig::from_file(&config_path)
        .with_context(|| format!("loading config from {:?}", config_path))?;

    let server = FileServer::new(config)?;
    server.start().await?;
    info!(
        "node {} listening on {:?}",
        server.id(),
        server.local_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop();
    Ok(())
}

/// Three nodes on loopback: two seeds holding content, plus a late joiner
/// that has to fetch every key over the network and keeps the copies it
/// pulls through.
async fn run_demo(root: PathBuf, keys: usize) -> Result<()> {
    let key = EncryptionKey::generate();
    let loopback: std::net::SocketAddr = "127.0.0.1:0".parse()?;

    let make = |dir: &str| {
        FileServerConfig::new(loopback, root.join(dir)).with_encryption_key(key.clone())
    };

    let seed1 = FileServer::new(make("node1"))?;
    seed1.start().await?;
    let seed2 = FileServer::new(make("node2"))?;
    seed2.start().await?;

    // Content lands on the seeds before the client even exists.
    for i in 0..keys {
        let file_key = format!("picture_{}.png", i);
        let data = format!("my big data file {} here!", i).into_bytes();
        seed1.store(&file_key, &mut Cursor::new(data)).await?;
    }

    let bootstrap = vec![
        seed1.local_addr().context("seed1 address")?,
        seed2.local_addr().context("seed2 address")?,
    ];
    let client = FileServer::new(make("node3").with_bootstrap_nodes(bootstrap))?;
    client.start().await?;

    // Give the bootstrap dials a moment to hand peers over.
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("client connected to {} peers", client.peer_count());

    for i in 0..keys {
        let file_key = format!("picture_{}.png", i);
        let expected = format!("my big data file {} here!", i).into_bytes();

        let fetched = client.get(&file_key).await?;
        anyhow::ensure!(fetched == expected, "round trip mismatch for {}", file_key);
        anyhow::ensure!(
            client.has(&file_key).await,
            "{} not retained after pull-through",
            file_key
        );
        println!("{}: {}", file_key, String::from_utf8_lossy(&fetched));
    }

    client.stop();
    seed2.stop();
    seed1.stop();
    Ok(())
}
