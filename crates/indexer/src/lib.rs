//! The event indexer: one listener per configured subscription, deriving
//! idempotent log records from chain events and fanning them out.
mod listener;

pub use listener::BlockTimeCache;

use courier_fabric::ConnectionFabric;
use courier_gateway::{ChainClient, LogSubscriber};
use courier_store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Loads the event registry and runs one independent listener per
/// subscription. A listener failure is recoverable at the listener level;
/// the first error surfaces here and tears the indexer down.
pub struct Indexer {
    store: Store,
    chain: Arc<dyn ChainClient>,
    subscriber: Arc<dyn LogSubscriber>,
    fabric: Arc<ConnectionFabric>,
}

impl Indexer {
    pub fn new(
        store: Store,
        chain: Arc<dyn ChainClient>,
        subscriber: Arc<dyn LogSubscriber>,
        fabric: Arc<ConnectionFabric>,
    ) -> Self {
        Self { store, chain, subscriber, fabric }
    }

    pub async fn start(&self, cancel: CancellationToken) -> eyre::Result<()> {
        let events = self.store.events.get_events().await?;

        let (err_tx, mut err_rx) = mpsc::channel::<eyre::Report>(1);

        for event in events {
            info!(name = %event.name, contract = %event.contract, "indexing event");

            let listener = listener::Listener::new(
                event,
                self.store.clone(),
                self.chain.clone(),
                self.subscriber.clone(),
                self.fabric.clone(),
            );
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                if let Err(err) = listener.run(cancel).await {
                    let _ = err_tx.send(err).await;
                }
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            err = err_rx.recv() => match err {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}
