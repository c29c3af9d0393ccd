use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_primitives::consts::queue::{BATCH_COALESCE_MS, BATCH_SIZE};
use ethers::types::H256;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A queued item: an opaque payload plus the channel its result is
/// reported on.
pub struct Message<T> {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub payload: T,
    pub respond: mpsc::Sender<eyre::Result<H256>>,
}

impl<T> Message<T> {
    pub fn new(id: &str, payload: T, respond: mpsc::Sender<eyre::Result<H256>>) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            retry_count: 0,
            payload,
            respond,
        }
    }
}

/// A message the processor could not handle, with the error and whether a
/// retry makes sense.
pub struct FailedMessage<T> {
    pub message: Message<T>,
    pub error: eyre::Report,
    pub retriable: bool,
}

/// Consumer side of the queue. Messages the processor handles are
/// responded to in place; failures come back for retry accounting.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    async fn process(&self, messages: Vec<Message<T>>) -> Vec<FailedMessage<T>>;
}

/// A bounded FIFO queue with batched processing and linear retry backoff.
pub struct Service<T> {
    name: String,
    tx: mpsc::Sender<Message<T>>,
    rx: Mutex<Option<mpsc::Receiver<Message<T>>>>,
    capacity: usize,
    max_retries: u32,
    errors: mpsc::UnboundedSender<eyre::Report>,
}

impl<T: Send + 'static> Service<T> {
    /// Create a queue service; the returned receiver carries warnings and
    /// non-retriable errors for the operator (webhook messager, logs).
    pub fn new(
        name: &str,
        max_retries: u32,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<eyre::Report>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (errors, errors_rx) = mpsc::unbounded_channel();

        let service = Arc::new(Self {
            name: name.to_string(),
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            max_retries,
            errors,
        });

        (service, errors_rx)
    }

    fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Enqueue a message. Nearing capacity raises a warning on the error
    /// channel; at capacity an error is raised but the producer still
    /// blocks until a slot frees up.
    pub async fn enqueue(&self, message: Message<T>) {
        let queued = self.queued();
        let warn_level = self.capacity - self.capacity / 5;

        if queued > warn_level {
            let _ = self.errors.send(eyre::eyre!("{} queue is almost full", self.name));
        }
        if queued == self.capacity {
            let _ = self.errors.send(eyre::eyre!("{} queue is full", self.name));
        }

        if self.tx.send(message).await.is_err() {
            warn!(queue = %self.name, "enqueue on a stopped queue");
        }
    }

    /// Run the worker until cancellation. Batches are assembled with a
    /// short coalescing wait after the first message; failed retriable
    /// items are re-enqueued up to `max_retries` with a linear backoff
    /// when nothing else is waiting.
    pub async fn start(
        self: Arc<Self>,
        processor: Arc<dyn Processor<T>>,
        cancel: CancellationToken,
    ) -> eyre::Result<()> {
        info!(queue = %self.name, "starting queue service");

        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| eyre::eyre!("queue {} already started", self.name))?;

        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(queue = %self.name, "stopping queue service");
                    return Ok(());
                }
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            tokio::time::sleep(Duration::from_millis(BATCH_COALESCE_MS)).await;

            let mut batch = Vec::with_capacity(BATCH_SIZE);
            batch.push(first);
            while batch.len() < BATCH_SIZE {
                match rx.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }

            let failed = processor.process(batch).await;
            let failed_count = failed.len();

            for mut failure in failed {
                if failure.retriable && failure.message.retry_count < self.max_retries {
                    failure.message.retry_count += 1;

                    if self.queued() == 0 && failed_count == 1 {
                        let backoff =
                            Duration::from_secs(u64::from(failure.message.retry_count));
                        tokio::time::sleep(backoff).await;
                    }

                    self.enqueue(failure.message).await;
                    continue;
                }

                // Exhausted or not worth retrying: surface the error to the
                // caller and the operator channel.
                let text = failure.error.to_string();
                let _ = failure.message.respond.send(Err(eyre::eyre!("{text}"))).await;
                let _ = self.errors.send(failure.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum TestPayload {
        Good,
        Flaky,
        Broken,
    }

    struct TestProcessor {
        processed: AtomicUsize,
    }

    #[async_trait]
    impl Processor<TestPayload> for TestProcessor {
        async fn process(
            &self,
            messages: Vec<Message<TestPayload>>,
        ) -> Vec<FailedMessage<TestPayload>> {
            let mut failed = Vec::new();

            for message in messages {
                self.processed.fetch_add(1, Ordering::SeqCst);
                match message.payload {
                    TestPayload::Good => {
                        let _ = message.respond.send(Ok(H256::zero())).await;
                    }
                    TestPayload::Flaky => failed.push(FailedMessage {
                        message,
                        error: eyre::eyre!("flaky failure"),
                        retriable: true,
                    }),
                    TestPayload::Broken => failed.push(FailedMessage {
                        message,
                        error: eyre::eyre!("broken message"),
                        retriable: false,
                    }),
                }
            }

            failed
        }
    }

    fn spawn_queue(
        capacity: usize,
    ) -> (Arc<Service<TestPayload>>, Arc<TestProcessor>, mpsc::UnboundedReceiver<eyre::Report>)
    {
        let (service, errors) = Service::new("test", 3, capacity);
        let processor = Arc::new(TestProcessor { processed: AtomicUsize::new(0) });

        let cancel = CancellationToken::new();
        tokio::spawn(service.clone().start(processor.clone(), cancel));

        (service, processor, errors)
    }

    #[tokio::test]
    async fn processes_batches_and_responds() {
        let (service, processor, _errors) = spawn_queue(16);
        let (tx, mut rx) = mpsc::channel(1);

        for i in 0..6 {
            service.enqueue(Message::new(&format!("{i}"), TestPayload::Good, tx.clone())).await;
        }

        for _ in 0..6 {
            let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("result in time")
                .expect("channel open");
            assert!(result.is_ok());
        }

        assert_eq!(processor.processed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn retriable_failures_retry_until_exhausted() {
        let (service, processor, mut errors) = spawn_queue(16);
        let (tx, mut rx) = mpsc::channel(1);

        service.enqueue(Message::new("flaky", TestPayload::Flaky, tx)).await;

        // Initial attempt plus three retries, then the error surfaces on
        // both the result channel and the queue error channel.
        let result = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("result in time")
            .expect("channel open");
        assert!(result.is_err());
        assert_eq!(processor.processed.load(Ordering::SeqCst), 4);

        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .expect("error in time")
            .expect("channel open");
        assert!(err.to_string().contains("flaky"));
    }

    #[tokio::test]
    async fn non_retriable_failures_do_not_retry() {
        let (service, processor, mut errors) = spawn_queue(16);
        let (tx, mut rx) = mpsc::channel(1);

        service.enqueue(Message::new("broken", TestPayload::Broken, tx)).await;

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("result in time")
            .expect("channel open");
        assert!(result.is_err());
        assert_eq!(processor.processed.load(Ordering::SeqCst), 1);

        assert!(errors.recv().await.is_some());
    }

    #[tokio::test]
    async fn mixed_batches_only_fail_the_bad_items() {
        let (service, processor, _errors) = spawn_queue(32);
        let (good_tx, mut good_rx) = mpsc::channel(16);
        let (bad_tx, mut bad_rx) = mpsc::channel(1);

        for i in 0..5 {
            service
                .enqueue(Message::new(&format!("g{i}"), TestPayload::Good, good_tx.clone()))
                .await;
        }
        service.enqueue(Message::new("broken", TestPayload::Broken, bad_tx)).await;

        for _ in 0..5 {
            let result = tokio::time::timeout(Duration::from_secs(2), good_rx.recv())
                .await
                .expect("result in time")
                .expect("channel open");
            assert!(result.is_ok());
        }

        let bad = tokio::time::timeout(Duration::from_secs(2), bad_rx.recv())
            .await
            .expect("result in time")
            .expect("channel open");
        assert!(bad.is_err());

        assert_eq!(processor.processed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn warns_when_nearly_full_and_errors_when_full() {
        // No worker: messages pile up in the channel.
        let (service, mut errors) = Service::<TestPayload>::new("pressure", 3, 10);
        let (tx, _rx) = mpsc::channel(1);

        for i in 0..10 {
            service.enqueue(Message::new(&format!("{i}"), TestPayload::Good, tx.clone())).await;
        }

        let warning = errors.try_recv().expect("warning raised near capacity");
        assert!(warning.to_string().contains("almost full"));

        // The 11th enqueue reports an error but still blocks the producer.
        let blocked = {
            let service = service.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                service.enqueue(Message::new("11", TestPayload::Good, tx)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let full = errors.try_recv().expect("error raised at capacity");
        assert!(full.to_string().contains("is full"));
        assert!(!blocked.is_finished());
        blocked.abort();
    }
}
