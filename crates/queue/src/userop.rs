use crate::{FailedMessage, Message, Processor};
use async_trait::async_trait;
use chrono::Utc;
use courier_fabric::ConnectionFabric;
use courier_gateway::{handle_ops_calldata, ChainClient, GatewayError, TxOutcome};
use courier_primitives::{
    consts::gateway::TX_WAIT_SECS, parse_execute_destination, Log, LogStatus, UserOperation,
    Wallet, WsMessageKind,
};
use courier_store::{Store, StoreError, UserOpStatus};
use ethers::{
    signers::Signer,
    types::{Address, H256, U256},
    utils::{keccak256, to_checksum},
};
use eyre::Report;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// Payload of one queued user operation.
#[derive(Clone, Debug)]
pub struct UserOpMessage {
    pub entry_point: Address,
    pub paymaster: Address,
    pub user_op: UserOperation,
    /// Pre-derived event attributes of this operation, if the caller knows
    /// them; drives the optimistic log record.
    pub data: Option<Value>,
    pub extra_data: Option<Value>,
}

/// Bundles queued operations per entry point, sponsors them, and submits
/// one transaction per batch.
pub struct UserOpProcessor {
    store: Store,
    chain: Arc<dyn ChainClient>,
    fabric: Arc<ConnectionFabric>,
    /// Signed tx hashes currently being submitted, per entry point. The
    /// count rides on top of the chain nonce so concurrent batches sharing
    /// a sponsor stay ordered.
    in_flight: Arc<Mutex<HashMap<Address, Vec<H256>>>>,
}

struct GroupFailure {
    error: Report,
    retriable: bool,
}

impl UserOpProcessor {
    pub fn new(store: Store, chain: Arc<dyn ChainClient>, fabric: Arc<ConnectionFabric>) -> Self {
        Self { store, chain, fabric, in_flight: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn in_flight_count(&self, entry_point: Address) -> usize {
        self.in_flight.lock().get(&entry_point).map_or(0, Vec::len)
    }

    fn push_in_flight(&self, entry_point: Address, hash: H256) {
        self.in_flight.lock().entry(entry_point).or_default().push(hash);
    }

    fn pop_in_flight(&self, entry_point: Address, hash: H256) {
        let mut in_flight = self.in_flight.lock();
        if let Some(hashes) = in_flight.get_mut(&entry_point) {
            hashes.retain(|h| *h != hash);
        }
    }

    /// Build the optimistic `sending` records for operations whose data
    /// matches a registered event, insert them, and announce them.
    async fn insert_optimistic_logs(
        &self,
        messages: &[Message<UserOpMessage>],
        events: &[courier_primitives::Event],
        signed_tx_hash: H256,
    ) -> Vec<Log> {
        let mut inserted = Vec::new();

        for message in messages {
            let payload = &message.payload;

            // Without data there is no stable content hash to derive.
            let Some(data) = payload.data.as_ref() else {
                continue;
            };
            let Some(map) = data.as_object() else {
                continue;
            };

            if !events.iter().any(|event| event.is_valid_data(map)) {
                continue;
            }

            let Ok(dest) = parse_execute_destination(&payload.user_op.call_data) else {
                continue;
            };

            let now = Utc::now();
            let mut log = Log {
                hash: String::new(),
                tx_hash: format!("{signed_tx_hash:?}"),
                created_at: now,
                updated_at: now,
                nonce: payload.user_op.nonce.as_u64() as i64,
                sender: to_checksum(&payload.user_op.sender, None),
                to: to_checksum(&dest, None),
                value: U256::zero(),
                data: Some(data.clone()),
                extra_data: payload.extra_data.clone(),
                status: LogStatus::Sending,
            };
            log.hash = log.generate_unique_hash();

            if let Err(err) = self.store.logs.add_log(&log).await {
                error!(hash = %log.hash, error = %err, "error adding optimistic log");
                continue;
            }

            self.fabric.broadcast(WsMessageKind::New, &log);
            inserted.push(log);
        }

        inserted
    }

    async fn remove_logs(&self, logs: &[Log]) {
        for log in logs {
            if let Err(err) = self.store.logs.remove_log(&log.hash).await {
                warn!(hash = %log.hash, error = %err, "error removing optimistic log");
            }
            self.fabric.broadcast(WsMessageKind::Remove, log);
        }
    }

    async fn fail_logs(&self, logs: &mut [Log]) {
        for log in logs {
            if let Err(err) = self.store.logs.set_status(&log.hash, LogStatus::Fail).await {
                warn!(hash = %log.hash, error = %err, "error failing optimistic log");
            }
            log.status = LogStatus::Fail;
            self.fabric.broadcast(WsMessageKind::Update, log);
        }
    }

    async fn process_group(
        &self,
        entry_point: Address,
        messages: &[Message<UserOpMessage>],
        events: &[courier_primitives::Event],
    ) -> Result<(), GroupFailure> {
        let sample = &messages[0].payload;

        // The sponsor's key is looked up by the paymaster address carried
        // in the operation.
        let sponsor = self
            .store
            .sponsors
            .get_sponsor(&to_checksum(&sample.paymaster, None))
            .await
            .map_err(|err| GroupFailure {
                retriable: !matches!(err, StoreError::NotFound),
                error: Report::new(err).wrap_err("sponsor lookup failed"),
            })?;

        let wallet = Wallet::from_key(&sponsor.private_key, self.chain.chain_id().as_u64())
            .map_err(|err| GroupFailure { error: err, retriable: false })?;

        // Chain nonce plus this entry point's in-flight submissions keeps
        // nonces strictly increasing across concurrent batches.
        let mut nonce = self
            .chain
            .nonce_at(wallet.address())
            .await
            .map_err(|err| GroupFailure { error: Report::new(err), retriable: true })?;
        nonce += self.in_flight_count(entry_point) as u64;

        let ops: Vec<UserOperation> =
            messages.iter().map(|m| m.payload.user_op.clone()).collect();
        let calldata = handle_ops_calldata(ops, entry_point);

        let tx = self
            .chain
            .build_tx(wallet.address(), entry_point, calldata, nonce)
            .await
            .map_err(|err| GroupFailure { error: Report::new(err), retriable: true })?;

        let signature = wallet
            .signer
            .sign_transaction(&tx)
            .await
            .map_err(|err| GroupFailure { error: Report::new(err), retriable: false })?;
        let raw = tx.rlp_signed(&signature);
        let signed_tx_hash = H256::from(keccak256(&raw));

        self.push_in_flight(entry_point, signed_tx_hash);

        let mut inserted = self.insert_optimistic_logs(messages, events, signed_tx_hash).await;

        if let Err(err) = self.chain.send_raw_transaction(raw).await {
            return Err(self.handle_send_error(entry_point, signed_tx_hash, inserted, err).await);
        }

        info!(tx_hash = ?signed_tx_hash, ops = messages.len(), "bundle broadcast");

        // Respond with the bundle hash and move each operation to
        // submitted; the tx hash is written in the same step and never
        // cleared again.
        for message in messages {
            let _ = message.respond.send(Ok(signed_tx_hash)).await;

            if let Err(err) = self
                .store
                .userops
                .update_status_and_tx_hash(
                    &message.id,
                    UserOpStatus::Submitted,
                    &format!("{signed_tx_hash:?}"),
                )
                .await
            {
                error!(user_op = %message.id, error = %err, "error marking userop submitted");
            }
        }

        for log in &mut inserted {
            if let Err(err) = self.store.logs.set_status(&log.hash, LogStatus::Pending).await {
                warn!(hash = %log.hash, error = %err, "error marking log pending, removing");
                self.remove_logs(&[log.clone()]).await;
            } else {
                log.status = LogStatus::Pending;
            }
        }

        self.spawn_tx_waiter(
            entry_point,
            signed_tx_hash,
            messages.iter().map(|m| m.id.clone()).collect(),
            inserted,
        );

        Ok(())
    }

    async fn handle_send_error(
        &self,
        entry_point: Address,
        signed_tx_hash: H256,
        mut inserted: Vec<Log>,
        err: GatewayError,
    ) -> GroupFailure {
        self.pop_in_flight(entry_point, signed_tx_hash);

        if err.is_transient() {
            // Leave the records but flag them failed; the retry produces a
            // fresh bundle with fresh records.
            self.fail_logs(&mut inserted).await;
            GroupFailure { error: Report::new(err), retriable: true }
        } else {
            self.remove_logs(&inserted).await;
            GroupFailure { error: Report::new(err), retriable: false }
        }
    }

    /// Wait asynchronously for the bundle to be mined. Confirmed records
    /// are re-materialized by the indexer under the same content hash, so
    /// nothing needs to happen to them here; on timeout the optimistic
    /// records come out (the indexer inserts the authoritative ones if the
    /// bundle lands later).
    fn spawn_tx_waiter(
        &self,
        entry_point: Address,
        signed_tx_hash: H256,
        user_op_hashes: Vec<String>,
        inserted: Vec<Log>,
    ) {
        let store = self.store.clone();
        let chain = self.chain.clone();
        let fabric = self.fabric.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let outcome = chain
                .wait_for_tx(signed_tx_hash, Duration::from_secs(TX_WAIT_SECS))
                .await
                .unwrap_or(TxOutcome::Timeout);

            let status = match outcome {
                TxOutcome::Success => UserOpStatus::Success,
                TxOutcome::Reverted => UserOpStatus::Reverted,
                TxOutcome::Timeout => UserOpStatus::Timeout,
            };

            if outcome != TxOutcome::Success {
                for log in &inserted {
                    if let Err(err) = store.logs.remove_log(&log.hash).await {
                        warn!(hash = %log.hash, error = %err, "error removing stale log");
                    }
                    fabric.broadcast(WsMessageKind::Remove, log);
                }
            }

            for user_op_hash in &user_op_hashes {
                if let Err(err) = store.userops.update_status(user_op_hash, status).await {
                    error!(user_op = %user_op_hash, error = %err, "error updating userop status");
                }
            }

            if let Some(hashes) = in_flight.lock().get_mut(&entry_point) {
                hashes.retain(|h| *h != signed_tx_hash);
            }
        });
    }
}

#[async_trait]
impl Processor<UserOpMessage> for UserOpProcessor {
    async fn process(
        &self,
        messages: Vec<Message<UserOpMessage>>,
    ) -> Vec<FailedMessage<UserOpMessage>> {
        let mut failed = Vec::new();

        let events = match self.store.events.get_events().await {
            Ok(events) => events,
            Err(err) => {
                let text = err.to_string();
                return messages
                    .into_iter()
                    .map(|message| FailedMessage {
                        message,
                        error: eyre::eyre!("error loading events: {text}"),
                        retriable: true,
                    })
                    .collect();
            }
        };

        let mut groups: HashMap<Address, Vec<Message<UserOpMessage>>> = HashMap::new();
        for message in messages {
            groups.entry(message.payload.entry_point).or_default().push(message);
        }

        for (entry_point, group) in groups {
            if let Err(failure) = self.process_group(entry_point, &group, &events).await {
                let text = failure.error.to_string();
                for message in group {
                    failed.push(FailedMessage {
                        message,
                        error: eyre::eyre!("{text}"),
                        retriable: failure.retriable,
                    });
                }
            }
        }

        failed
    }
}
