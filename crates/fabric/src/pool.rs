use courier_primitives::{consts::fabric::SEND_BUFFER_SIZE, WsMessage};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

const COMMAND_BUFFER: usize = 1024;

enum PoolCommand {
    Register {
        query: String,
        frames: mpsc::Sender<String>,
        reply: oneshot::Sender<u64>,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        msg: Box<WsMessage>,
    },
}

struct PoolClient {
    query: String,
    frames: mpsc::Sender<String>,
}

/// A client registered with a pool: its id and the frame stream the
/// socket writer drains.
pub struct RegisteredClient {
    pub id: u64,
    pub frames: mpsc::Receiver<String>,
}

/// One `contract/topic0` channel of connected clients.
///
/// All pool state is owned by the run loop; the handle only pushes
/// commands. When the last client leaves, the loop exits, the pool marks
/// itself not-open, and the fabric creates a fresh pool on the next
/// connect.
pub struct ConnectionPool {
    topic: String,
    commands: mpsc::Sender<PoolCommand>,
    open: Arc<AtomicBool>,
}

impl ConnectionPool {
    /// Create the pool and spawn its run loop.
    pub fn new(topic: &str) -> Arc<Self> {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let open = Arc::new(AtomicBool::new(true));

        let pool = Arc::new(Self { topic: topic.to_string(), commands, open: open.clone() });

        tokio::spawn(run(pool.topic.clone(), rx, open));

        pool
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Register a client carrying its original URL query; returns the
    /// frame stream to pump into the socket.
    pub async fn register(&self, query: &str) -> Option<RegisteredClient> {
        let (frames_tx, frames_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(PoolCommand::Register {
                query: query.to_string(),
                frames: frames_tx,
                reply: reply_tx,
            })
            .await
            .ok()?;

        let id = reply_rx.await.ok()?;
        Some(RegisteredClient { id, frames: frames_rx })
    }

    /// Remove a client; the last one out closes the pool.
    pub async fn unregister(&self, id: u64) {
        let _ = self.commands.send(PoolCommand::Unregister { id }).await;
    }

    /// Queue an envelope for delivery to every matching client. Ordering
    /// is the order commands reach the run loop.
    pub fn broadcast(&self, msg: WsMessage) {
        if self.commands.try_send(PoolCommand::Broadcast { msg: Box::new(msg) }).is_err() {
            warn!(topic = %self.topic, "pool command buffer full, dropping broadcast");
        }
    }
}

async fn run(topic: String, mut rx: mpsc::Receiver<PoolCommand>, open: Arc<AtomicBool>) {
    let mut clients: HashMap<u64, PoolClient> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut had_client = false;

    debug!(%topic, "connection pool started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PoolCommand::Register { query, frames, reply } => {
                next_id += 1;
                clients.insert(next_id, PoolClient { query, frames });
                had_client = true;
                let _ = reply.send(next_id);
                trace!(%topic, clients = clients.len(), "client registered");
            }
            PoolCommand::Unregister { id } => {
                clients.remove(&id);
                trace!(%topic, clients = clients.len(), "client unregistered");
                if had_client && clients.is_empty() {
                    break;
                }
            }
            PoolCommand::Broadcast { msg } => {
                let payload = match serde_json::to_string(&msg) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%topic, error = %err, "failed to serialize envelope");
                        continue;
                    }
                };

                let mut stale = Vec::new();
                for (id, client) in &clients {
                    if !msg.data.matches_query(&client.query) {
                        continue;
                    }
                    // A full buffer means the client stopped draining;
                    // evict it instead of blocking the pool.
                    if client.frames.try_send(payload.clone()).is_err() {
                        stale.push(*id);
                    }
                }

                for id in stale {
                    clients.remove(&id);
                    warn!(%topic, client = id, "evicting slow client");
                }

                if had_client && clients.is_empty() {
                    break;
                }
            }
        }
    }

    // Dropping the client map releases every send buffer.
    open.store(false, Ordering::Release);
    debug!(%topic, "connection pool closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_primitives::{Log, LogStatus, WsMessageKind};
    use ethers::types::U256;
    use serde_json::json;
    use std::time::Duration;

    fn sample_log(from: &str) -> Log {
        Log {
            hash: format!("0xhash-{from}"),
            tx_hash: "0x01".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: "0xS".into(),
            to: "0xcontract".into(),
            value: U256::zero(),
            data: Some(json!({"topic": "0xtopic", "from": from, "to": "0xB"})),
            extra_data: None,
            status: LogStatus::Success,
        }
    }

    fn envelope(from: &str) -> WsMessage {
        sample_log(from).to_ws_message(WsMessageKind::Update).unwrap()
    }

    async fn recv_frame(client: &mut RegisteredClient) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(200), client.frames.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn delivers_only_to_matching_queries() {
        let pool = ConnectionPool::new("0xcontract/0xtopic");

        let mut for_a = pool.register("from=0xA").await.unwrap();
        let mut for_b = pool.register("from=0xB").await.unwrap();
        let mut for_all = pool.register("").await.unwrap();

        pool.broadcast(envelope("0xA"));

        let frame = recv_frame(&mut for_a).await.expect("matching client gets the envelope");
        assert!(frame.contains("0xhash-0xA"));

        assert!(recv_frame(&mut for_b).await.is_none(), "non-matching client gets nothing");

        assert!(recv_frame(&mut for_all).await.is_some(), "empty query matches all");
    }

    #[tokio::test]
    async fn each_broadcast_delivers_at_most_one_envelope_per_client() {
        let pool = ConnectionPool::new("0xcontract/0xtopic");
        let mut client = pool.register("").await.unwrap();

        pool.broadcast(envelope("0xA"));
        pool.broadcast(envelope("0xC"));

        assert!(recv_frame(&mut client).await.is_some());
        assert!(recv_frame(&mut client).await.is_some());
        assert!(recv_frame(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn slow_clients_are_evicted() {
        let pool = ConnectionPool::new("0xcontract/0xtopic");

        // Never drained: fills up after SEND_BUFFER_SIZE frames.
        let mut slow = pool.register("").await.unwrap();

        // Continuously drained in the background.
        let mut healthy = pool.register("").await.unwrap();
        let (drained_tx, mut drained_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = healthy.frames.recv().await {
                let _ = drained_tx.send(frame);
            }
        });

        for _ in 0..SEND_BUFFER_SIZE + 1 {
            pool.broadcast(envelope("0xA"));
        }

        // Give the run loop a moment to work through the commands.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The slow client's buffer overran, so its frame stream was
        // dropped by the pool.
        let mut slow_frames = 0;
        while slow.frames.try_recv().is_ok() {
            slow_frames += 1;
        }
        assert_eq!(slow_frames, SEND_BUFFER_SIZE);
        assert!(matches!(
            slow.frames.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // The pool stays open and keeps delivering to the healthy client.
        assert!(pool.is_open());
        pool.broadcast(envelope("0xlater"));

        let mut healthy_frames = 0;
        while tokio::time::timeout(Duration::from_millis(200), drained_rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            healthy_frames += 1;
        }
        assert_eq!(healthy_frames, SEND_BUFFER_SIZE + 2);
    }

    #[tokio::test]
    async fn pool_closes_when_the_last_client_leaves() {
        let pool = ConnectionPool::new("0xcontract/0xtopic");

        let client = pool.register("").await.unwrap();
        assert!(pool.is_open());

        pool.unregister(client.id).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pool.is_open());
    }
}
