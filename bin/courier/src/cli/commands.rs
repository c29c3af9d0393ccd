use crate::{config::Config, node};
use clap::Parser;
use courier_primitives::{consts::queue::DEFAULT_BUFFER_SIZE, provider::create_http_provider, Event};
use courier_store::Store;
use ethers::providers::Middleware;
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing::info;

/// Run the engine
#[derive(Debug, Clone, Parser)]
pub struct NodeCommand {
    /// Path to the .env file; skipped when the file does not exist.
    #[clap(long, default_value = ".env")]
    pub env: PathBuf,

    /// JSON-RPC server address to listen on.
    #[clap(long = "rpc.addr", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub rpc_addr: IpAddr,

    /// JSON-RPC server port to listen on.
    #[clap(long = "rpc.port", default_value_t = 3000)]
    pub rpc_port: u16,

    /// REST/WebSocket API address to listen on.
    #[clap(long = "api.addr", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub api_addr: IpAddr,

    /// REST/WebSocket API port to listen on.
    #[clap(long = "api.port", default_value_t = 3001)]
    pub api_port: u16,

    /// Poll the chain over HTTP instead of streaming over WebSocket.
    /// Disables the indexer, which needs a streaming transport.
    #[clap(long)]
    pub polling: bool,

    /// Disable the event indexer.
    #[clap(long = "no-index")]
    pub no_index: bool,

    /// User operation queue buffer size.
    #[clap(long = "queue.buffer", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub queue_buffer: usize,

    /// Enable webhook notifications.
    #[clap(long)]
    pub notify: bool,

    /// CORS filters for the RPC server.
    #[clap(long = "rpc.cors-domain", value_delimiter = ',', default_value = "*")]
    pub cors_domain: Vec<String>,
}

impl NodeCommand {
    pub async fn execute(self) -> eyre::Result<()> {
        load_env(&self.env);
        let config = Config::from_env()?;

        node::launch(self, config).await
    }
}

/// Register a sponsor key for a paymaster contract
#[derive(Debug, Clone, Parser)]
pub struct CreateSponsorCommand {
    /// Path to the .env file; skipped when the file does not exist.
    #[clap(long, default_value = ".env")]
    pub env: PathBuf,

    /// The paymaster contract address.
    #[clap(long)]
    pub paymaster: String,

    /// The sponsor's hex-encoded private key.
    #[clap(long)]
    pub private_key: String,
}

impl CreateSponsorCommand {
    pub async fn execute(self) -> eyre::Result<()> {
        load_env(&self.env);
        let config = Config::from_env()?;

        let provider =
            Arc::new(create_http_provider(&config.rpc_url, Duration::from_millis(500)).await?);
        let chain_id = provider.get_chainid().await?;

        let store = Store::connect(
            &chain_id.to_string(),
            &config.writer_dsn(),
            &config.reader_dsn(),
            &config.db_secret,
        )
        .await?;

        store.sponsors.add_sponsor(&self.paymaster, &self.private_key).await?;
        info!(paymaster = %self.paymaster, "sponsor registered");

        Ok(())
    }
}

/// Register an event subscription for the indexer
#[derive(Debug, Clone, Parser)]
pub struct AddEventCommand {
    /// Path to the .env file; skipped when the file does not exist.
    #[clap(long, default_value = ".env")]
    pub env: PathBuf,

    /// The contract address to listen on.
    #[clap(long)]
    pub contract: String,

    /// The event signature, e.g.
    /// "Transfer(from indexed address, to indexed address, value uint256)".
    #[clap(long)]
    pub signature: String,

    /// A human-readable name for the subscription.
    #[clap(long)]
    pub name: String,
}

impl AddEventCommand {
    pub async fn execute(self) -> eyre::Result<()> {
        load_env(&self.env);
        let config = Config::from_env()?;

        let event = Event::new(&self.contract, &self.signature, &self.name);
        // Fail fast on signatures the indexer could not decode.
        let topic0 = event.topic0()?;

        let provider =
            Arc::new(create_http_provider(&config.rpc_url, Duration::from_millis(500)).await?);
        let chain_id = provider.get_chainid().await?;

        let store = Store::connect(
            &chain_id.to_string(),
            &config.writer_dsn(),
            &config.reader_dsn(),
            &config.db_secret,
        )
        .await?;

        store.events.add_event(&event).await?;
        info!(contract = %self.contract, topic0 = ?topic0, "event subscription registered");

        Ok(())
    }
}

fn load_env(path: &PathBuf) {
    if path.exists() {
        info!(path = %path.display(), "loading environment file");
        dotenv::from_path(path).ok();
    } else {
        dotenv::dotenv().ok();
    }
}
