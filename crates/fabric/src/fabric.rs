use crate::ConnectionPool;
use courier_primitives::{Log, WsMessageKind};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::trace;

/// Registry of connection pools, keyed by `contract/topic0`.
#[derive(Default)]
pub struct ConnectionFabric {
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl ConnectionFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pool for a topic, lazily creating it (or replacing one that
    /// already shut down).
    pub fn connect(&self, topic: &str) -> Arc<ConnectionPool> {
        let topic = topic.to_lowercase();
        let mut pools = self.pools.lock();

        match pools.get(&topic) {
            Some(pool) if pool.is_open() => pool.clone(),
            _ => {
                let pool = ConnectionPool::new(&topic);
                pools.insert(topic, pool.clone());
                pool
            }
        }
    }

    /// Broadcast a record change to the pool it addresses, if any clients
    /// are listening. The critical section only covers the registry
    /// lookup; delivery happens on the pool's own loop.
    pub fn broadcast(&self, kind: WsMessageKind, log: &Log) {
        let Some(msg) = log.to_ws_message(kind) else {
            return;
        };

        let pool = {
            let pools = self.pools.lock();
            pools.get(&msg.pool_id).filter(|p| p.is_open()).cloned()
        };

        match pool {
            Some(pool) => pool.broadcast(msg),
            None => trace!(pool_id = %msg.pool_id, "no open pool for broadcast"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_primitives::LogStatus;
    use ethers::types::U256;
    use serde_json::json;
    use std::time::Duration;

    fn sample_log() -> Log {
        Log {
            hash: "0xhash".into(),
            tx_hash: "0x01".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: "0xS".into(),
            to: "0xContract".into(),
            value: U256::zero(),
            data: Some(json!({"topic": "0xTopic", "from": "0xA"})),
            extra_data: None,
            status: LogStatus::Success,
        }
    }

    #[tokio::test]
    async fn broadcast_routes_by_pool_topic() {
        let fabric = ConnectionFabric::new();

        let pool = fabric.connect("0xcontract/0xtopic");
        let mut client = pool.register("").await.unwrap();

        fabric.broadcast(WsMessageKind::New, &sample_log());

        let frame = tokio::time::timeout(Duration::from_millis(200), client.frames.recv())
            .await
            .ok()
            .flatten()
            .expect("client receives the envelope");
        assert!(frame.contains("\"pool_id\":\"0xcontract/0xtopic\""));
    }

    #[tokio::test]
    async fn closed_pools_are_recreated_on_connect() {
        let fabric = ConnectionFabric::new();

        let pool = fabric.connect("0xContract/0xTopic");
        let client = pool.register("").await.unwrap();
        pool.unregister(client.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pool.is_open());

        let fresh = fabric.connect("0xContract/0xTopic");
        assert!(fresh.is_open());
        assert!(!Arc::ptr_eq(&pool, &fresh));
    }

    #[tokio::test]
    async fn broadcast_without_listeners_is_a_no_op() {
        let fabric = ConnectionFabric::new();
        // No pool exists; must not panic or create one.
        fabric.broadcast(WsMessageKind::Update, &sample_log());
        assert!(fabric.pools.lock().is_empty());
    }
}
