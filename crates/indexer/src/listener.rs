use chrono::{DateTime, Utc};
use courier_fabric::ConnectionFabric;
use courier_gateway::{ChainClient, LogSubscriber};
use courier_primitives::{
    consts::indexer::BLOCK_CACHE_TTL_SECS, parse_topics_from_log, Event, Log, LogStatus,
    WsMessageKind,
};
use courier_store::Store;
use ethers::{
    abi::RawLog,
    types::{Address, Filter, Log as EthLog, U256},
    utils::to_checksum,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Block timestamp cache. Entries are dropped once chain time moves
/// [`BLOCK_CACHE_TTL_SECS`] past the moment the block was first seen, so
/// the map stays small without a background sweeper.
#[derive(Default)]
pub struct BlockTimeCache {
    times: HashMap<u64, u64>,
    expiries: Vec<(u64, u64)>, // (expire_at, block_number)
}

impl BlockTimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block_number: u64) -> Option<u64> {
        self.times.get(&block_number).copied()
    }

    pub fn insert(&mut self, block_number: u64, timestamp: u64) {
        // Evict everything that expired before this block's time.
        let times = &mut self.times;
        self.expiries.retain(|(expire_at, block)| {
            if *expire_at < timestamp {
                times.remove(block);
                false
            } else {
                true
            }
        });

        self.times.insert(block_number, timestamp);
        self.expiries.push((timestamp + BLOCK_CACHE_TTL_SECS, block_number));
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// One listener: a restartable subscription for a single event, feeding
/// the log store and the connection fabric.
pub struct Listener {
    event: Event,
    store: Store,
    chain: Arc<dyn ChainClient>,
    subscriber: Arc<dyn LogSubscriber>,
    fabric: Arc<ConnectionFabric>,
}

impl Listener {
    pub fn new(
        event: Event,
        store: Store,
        chain: Arc<dyn ChainClient>,
        subscriber: Arc<dyn LogSubscriber>,
        fabric: Arc<ConnectionFabric>,
    ) -> Self {
        Self { event, store, chain, subscriber, fabric }
    }

    /// Indexing starts right after the block that was current at startup;
    /// the registry holds no cursor.
    async fn filter(&self) -> eyre::Result<Filter> {
        let topic0 = self.event.topic0()?;
        let contract: Address = self.event.contract.parse()?;
        let from_block = self.chain.latest_block().await? + 1;

        Ok(Filter::new().address(contract).topic0(topic0).from_block(from_block))
    }

    pub async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        let filter = self.filter().await?;

        let (tx, mut rx) = mpsc::channel::<EthLog>(256);
        {
            let subscriber = self.subscriber.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // Subscription drops are retried inside; this only returns
                // on cancellation or when the listener goes away.
                if let Err(err) = subscriber.listen_for_logs(filter, tx, cancel).await {
                    warn!(error = %err, "log subscription terminated");
                }
            });
        }

        let mut blocks = BlockTimeCache::new();

        while let Some(raw_log) = rx.recv().await {
            self.handle_log(&raw_log, &mut blocks).await?;
        }

        Ok(())
    }

    async fn handle_log(&self, raw_log: &EthLog, blocks: &mut BlockTimeCache) -> eyre::Result<()> {
        let block_number = raw_log
            .block_number
            .ok_or_else(|| eyre::eyre!("log without a block number"))?
            .as_u64();

        let timestamp = match blocks.get(block_number) {
            Some(timestamp) => timestamp,
            None => {
                let timestamp = self.chain.block_time(block_number).await?;
                blocks.insert(block_number, timestamp);
                timestamp
            }
        };

        let raw = RawLog { topics: raw_log.topics.clone(), data: raw_log.data.to_vec() };
        let data = parse_topics_from_log(&self.event, &raw)?;

        let created_at = DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
            .ok_or_else(|| eyre::eyre!("block timestamp out of range: {timestamp}"))?;

        let tx_hash = raw_log
            .transaction_hash
            .ok_or_else(|| eyre::eyre!("log without a transaction hash"))?;

        let mut log = Log {
            hash: String::new(),
            tx_hash: format!("{tx_hash:?}"),
            created_at,
            updated_at: Utc::now(),
            nonce: 0,
            sender: String::new(),
            to: to_checksum(&raw_log.address, None),
            value: U256::zero(),
            data: Some(data),
            extra_data: None,
            status: LogStatus::Success,
        };
        log.hash = log.generate_unique_hash();

        // Upsert: the confirmed record replaces an optimistic one carrying
        // the same content hash.
        self.store.logs.add_logs(std::slice::from_ref(&log)).await?;

        let stored = self.store.logs.get_log(&log.hash).await?;
        self.fabric.broadcast(WsMessageKind::Update, &stored);

        debug!(hash = %log.hash, block = block_number, "indexed log");

        // Opportunistic cleanup of optimistic records that never confirmed.
        self.store.logs.remove_old_in_progress().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_returns_known_blocks() {
        let mut cache = BlockTimeCache::new();
        assert!(cache.is_empty());

        cache.insert(100, 1_700_000_000);
        assert_eq!(cache.get(100), Some(1_700_000_000));
        assert_eq!(cache.get(101), None);
    }

    #[test]
    fn entries_expire_as_chain_time_advances() {
        let mut cache = BlockTimeCache::new();

        cache.insert(100, 1_700_000_000);
        // Within the TTL the old block survives.
        cache.insert(101, 1_700_000_000 + BLOCK_CACHE_TTL_SECS);
        assert_eq!(cache.get(100), Some(1_700_000_000));

        // One past the expiry drops block 100 but keeps 101.
        cache.insert(102, 1_700_000_000 + BLOCK_CACHE_TTL_SECS + 1);
        assert_eq!(cache.get(100), None);
        assert_eq!(cache.get(101), Some(1_700_000_000 + BLOCK_CACHE_TTL_SECS));
        assert_eq!(cache.len(), 2);
    }
}
