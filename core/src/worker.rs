/// Background embedding workers
use crate::scheduler::Shared;
use diversity_backend::Embedder;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{instrument, Span};

static QUEUE_SIZE_MULTIPLIER: usize = 64;

/// Outcome of an asynchronous embedding request
#[derive(Debug)]
pub enum EmbedRequest {
    /// A job was queued
    Scheduled(PendingEmbedding),
    /// The item already has a vector
    AlreadyPresent,
    /// A job for the item is already running or queued
    InFlight,
    /// Diversification is disabled, or the queue is full or closed
    Rejected,
}

impl EmbedRequest {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, EmbedRequest::Scheduled(_))
    }
}

/// Completion signal of one queued embedding job
#[derive(Debug)]
pub struct PendingEmbedding {
    id: String,
    receiver: oneshot::Receiver<bool>,
}

impl PendingEmbedding {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the job finishes. Returns whether a vector was stored.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> bool {
        self.receiver.blocking_recv().unwrap_or(false)
    }
}

struct EmbedJob {
    id: String,
    text: String,
    embedder: Arc<dyn Embedder>,
    response_tx: oneshot::Sender<bool>,
    span: Span,
}

/// Fixed-size pool of embedding threads fed through a bounded queue
pub(crate) struct BackgroundEmbedder {
    sender: async_channel::Sender<EmbedJob>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundEmbedder {
    pub(crate) fn new(workers: usize, shared: Arc<Shared>) -> Self {
        tracing::info!("Starting {workers} embedding workers");

        let (sender, receiver) = async_channel::bounded(workers * QUEUE_SIZE_MULTIPLIER);

        let handles = (0..workers)
            .map(|_| {
                let receiver_clone = receiver.clone();
                let shared_clone = shared.clone();
                std::thread::spawn(move || embedding_worker(shared_clone, receiver_clone))
            })
            .collect();

        Self {
            sender,
            handles: Mutex::new(handles),
        }
    }

    /// Queue a job without blocking. `None` when the queue is full or closed
    #[instrument(skip_all)]
    pub(crate) fn submit(
        &self,
        id: &str,
        text: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Option<PendingEmbedding> {
        let (response_tx, receiver) = oneshot::channel();
        let job = EmbedJob {
            id: id.to_string(),
            text: text.to_string(),
            embedder,
            response_tx,
            span: Span::current(),
        };

        match self.sender.try_send(job) {
            Ok(()) => Some(PendingEmbedding {
                id: id.to_string(),
                receiver,
            }),
            Err(err) => {
                let counter = metrics::counter!("di_embed_failure", "err" => "queue");
                counter.increment(1);
                tracing::warn!("Could not queue embedding for `{id}`: {err}");
                None
            }
        }
    }

    /// Stop accepting jobs and wait for the queue to drain.
    ///
    /// Workers still running after `timeout` are abandoned.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        self.sender.close();

        let mut handles = match self.handles.lock() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        let deadline = Instant::now() + timeout;
        while handles.iter().any(|handle| !handle.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut abandoned = 0;
        for handle in handles.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            tracing::warn!("Abandoned {abandoned} embedding workers still running at shutdown");
        }
    }
}

impl Drop for BackgroundEmbedder {
    fn drop(&mut self) {
        self.sender.close();
    }
}

fn embedding_worker(shared: Arc<Shared>, receiver: async_channel::Receiver<EmbedJob>) {
    // Loop until the channel is closed and drained
    while let Ok(job) = receiver.recv_blocking() {
        let EmbedJob {
            id,
            text,
            embedder,
            response_tx,
            span,
        } = job;
        span.in_scope(|| {
            let stored = embed_one(&shared, id, text, embedder.as_ref());
            // The caller may have dropped its handle
            let _ = response_tx.send(stored);
        });
    }
}

fn embed_one(shared: &Shared, id: String, text: String, embedder: &dyn Embedder) -> bool {
    let start = Instant::now();
    // A panicking embedder must not take the worker down with the in-flight slot
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        embedder.embed(std::slice::from_ref(&text))
    }));
    let vector = match result {
        Ok(Ok(mut vectors)) if vectors.len() == 1 => vectors.pop(),
        Ok(Ok(vectors)) => {
            tracing::error!(
                "Embedder returned {} vectors for `{id}`, expected 1",
                vectors.len()
            );
            None
        }
        Ok(Err(err)) => {
            tracing::error!("Embedding failed for `{id}`: {err}");
            None
        }
        Err(_) => {
            tracing::error!("Embedder panicked for `{id}`");
            None
        }
    };

    let mut state = shared.lock();
    state.in_flight.remove(&id);
    let gauge = metrics::gauge!("di_embed_inflight");
    gauge.set(state.in_flight.len() as f64);

    let stored = match vector {
        Some(vector) => state.store.insert(id, vector),
        None => false,
    };
    if stored {
        shared.persist(&state);
        let counter = metrics::counter!("di_embed_success");
        counter.increment(1);
        let histogram = metrics::histogram!("di_embed_duration");
        histogram.record(start.elapsed().as_secs_f64());
    } else {
        let counter = metrics::counter!("di_embed_failure", "err" => "embedder");
        counter.increment(1);
    }
    stored
}
