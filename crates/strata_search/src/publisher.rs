//! Replica state publisher.
//!
//! State transitions are announced to the coordination store through the
//! versioned state-updates delta blob, so every projection reader picks them
//! up without refetching the full collection document. Writes are funneled
//! through one worker that coalesces repeated publishes for the same replica
//! (latest wins) and resolves CAS races by re-reading once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use strata_coord::{paths, CoordError, CoordStore, CreateMode, RetryPolicy};
use tokio::sync::mpsc;

use crate::cluster::{encode_state_updates, parse_state_updates, ReplicaId, ReplicaState};

enum Message {
    Publish {
        collection: String,
        replica_id: ReplicaId,
        state: ReplicaState,
    },
    Shutdown,
}

/// Handle for announcing replica state transitions.
#[derive(Clone)]
pub struct StatePublisher {
    tx: mpsc::UnboundedSender<Message>,
}

impl StatePublisher {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store, rx));
        Self { tx }
    }

    /// Queue a state announcement. Also used with `ReplicaState::Leader`
    /// during election to declare leadership.
    pub fn publish(&self, collection: &str, replica_id: ReplicaId, state: ReplicaState) {
        let _ = self.tx.send(Message::Publish {
            collection: collection.to_string(),
            replica_id,
            state,
        });
    }

    pub fn close(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

async fn run_worker(store: Arc<dyn CoordStore>, mut rx: mpsc::UnboundedReceiver<Message>) {
    let retry = RetryPolicy::default();
    while let Some(first) = rx.recv().await {
        // Drain the queue and keep only the latest state per replica.
        let mut pending: HashMap<String, BTreeMap<ReplicaId, u8>> = HashMap::new();
        let mut shutdown = false;
        let mut absorb = |message: Message, stop: &mut bool| match message {
            Message::Publish {
                collection,
                replica_id,
                state,
            } => {
                pending
                    .entry(collection)
                    .or_default()
                    .insert(replica_id, state.code());
            }
            Message::Shutdown => *stop = true,
        };
        absorb(first, &mut shutdown);
        while let Ok(message) = rx.try_recv() {
            absorb(message, &mut shutdown);
        }
        drop(absorb);

        for (collection, states) in pending {
            if let Err(err) = write_delta(&store, &retry, &collection, &states).await {
                tracing::error!(
                    collection = %collection,
                    error = %err,
                    "state publish failed"
                );
            }
        }
        if shutdown {
            break;
        }
    }
    tracing::info!("state publisher terminated");
}

/// Merge `states` into the collection's delta blob with a CAS write.
/// A lost race is re-read and retried once; a second loss is surfaced.
async fn write_delta(
    store: &Arc<dyn CoordStore>,
    retry: &RetryPolicy,
    collection: &str,
    states: &BTreeMap<ReplicaId, u8>,
) -> Result<(), CoordError> {
    let path = paths::collection_state_updates(collection);
    for attempt in 0..2 {
        let current = retry
            .run(|| {
                let store = Arc::clone(store);
                let path = path.clone();
                async move { store.get(&path).await }
            })
            .await;
        let (mut blob, version) = match current {
            Ok((data, version)) => {
                let blob = parse_state_updates(&data).unwrap_or_else(|err| {
                    tracing::warn!(
                        collection,
                        error = ?err,
                        "unparseable state-updates blob, rewriting"
                    );
                    BTreeMap::new()
                });
                (blob, Some(version))
            }
            Err(CoordError::NoNode(_)) => (BTreeMap::new(), None),
            Err(err) => return Err(err),
        };

        for (&id, &code) in states {
            blob.insert(id, code);
        }
        let data = match encode_state_updates(&blob) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(collection, error = ?err, "could not encode state delta");
                return Ok(());
            }
        };

        let write = match version {
            Some(expected) => store.set_data(&path, data, Some(expected)).await.map(|_| ()),
            None => store
                .create(&path, data, CreateMode::Persistent)
                .await
                .map(|_| ()),
        };
        match write {
            Ok(()) => {
                tracing::debug!(collection, updates = states.len(), "published state delta");
                return Ok(());
            }
            Err(CoordError::VersionMismatch { .. }) | Err(CoordError::NodeExists(_))
                if attempt == 0 =>
            {
                tracing::debug!(collection, "state delta CAS lost, re-reading");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Err(CoordError::VersionMismatch {
        path,
        expected: -1,
        actual: -1,
    })
}
