//! Collection change watching with automatic reconnection.
//!
//! A watcher subscribes to a collection's change feed filtered by operation
//! type and invokes its callback once per event on a dedicated task. Any
//! stream failure is recovered locally: log a warning, pause, re-subscribe
//! with the same filter. The loop never gives up — the only exit is process
//! shutdown — and the pause between attempts is flat and configurable.
//!
//! One watcher per entity type for the process lifetime; a second
//! registration for the same collection is rejected.

use std::time::Duration;

use bson::{Document, doc};
use futures::StreamExt;
use mongodb::Collection;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Environment;
use crate::entity::{DeletedStub, Entity};
use crate::error::StoreResult;
use crate::store::Store;

/// How long a poll waits for new events before returning an empty batch.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Kinds of change a watcher can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A document was inserted.
    Insert,
    /// A document was updated in place.
    Update,
    /// A document was replaced whole.
    Replace,
    /// A document was deleted.
    Delete,
}

impl ChangeKind {
    /// All four kinds; the default watch set.
    pub const ALL: [ChangeKind; 4] = [
        ChangeKind::Insert,
        ChangeKind::Update,
        ChangeKind::Replace,
        ChangeKind::Delete,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }

    fn from_operation(operation: &OperationType) -> Option<Self> {
        match operation {
            OperationType::Insert => Some(Self::Insert),
            OperationType::Update => Some(Self::Update),
            OperationType::Replace => Some(Self::Replace),
            OperationType::Delete => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Event payload: the full post-change document, or an identifier stub when
/// the document is gone.
#[derive(Debug, Clone)]
pub enum ChangePayload<T> {
    /// The full document after the change.
    Document(T),
    /// Deletes carry only the identifier.
    Deleted(DeletedStub),
}

/// A single change-feed notification.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    /// What happened.
    pub kind: ChangeKind,
    /// The affected document or its stub.
    pub payload: ChangePayload<T>,
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Operation kinds to subscribe to.
    pub kinds: Vec<ChangeKind>,
    /// Environment override; `None` watches the current default.
    pub env: Option<Environment>,
    /// Delay between reconnect attempts; `None` uses the store's setting.
    pub retry_delay: Option<Duration>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            kinds: ChangeKind::ALL.to_vec(),
            env: None,
            retry_delay: None,
        }
    }
}

impl WatchOptions {
    /// Watch only the given kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// `$match` stage restricting a change stream to the requested kinds.
pub(crate) fn kinds_filter(kinds: &[ChangeKind]) -> Document {
    let operations: Vec<&str> = kinds.iter().copied().map(ChangeKind::as_str).collect();
    doc! { "$match": { "operationType": { "$in": operations } } }
}

fn stream_options() -> ChangeStreamOptions {
    ChangeStreamOptions::builder()
        .full_document(Some(FullDocumentType::UpdateLookup))
        .batch_size(Some(1))
        .max_await_time(Some(POLL_INTERVAL))
        .build()
}

impl Store {
    /// Watch an entity's collection on a dedicated task.
    ///
    /// Registers the collection in the watch registry — one watcher per
    /// entity type for the process lifetime — resolves the collection in the
    /// requested environment, and spawns the receive loop. The callback runs
    /// once per matching event; delete events carry only the identifier
    /// stub. Transient failures are never surfaced to the caller.
    pub fn watch<T, F>(&self, options: WatchOptions, callback: F) -> StoreResult<JoinHandle<()>>
    where
        T: Entity,
        F: Fn(ChangeEvent<T>) + Send + Sync + 'static,
    {
        self.claim_watch(T::COLLECTION)?;
        let collection = self.collection::<T>(options.env)?;
        let filter = kinds_filter(&options.kinds);
        let retry_delay = options.retry_delay.unwrap_or(self.watch_retry_delay());

        info!(collection = T::COLLECTION, "change watcher starting");
        Ok(tokio::spawn(watch_loop(
            collection,
            filter,
            retry_delay,
            callback,
        )))
    }
}

async fn watch_loop<T, F>(collection: Collection<T>, filter: Document, retry_delay: Duration, callback: F)
where
    T: Entity,
    F: Fn(ChangeEvent<T>) + Send + Sync + 'static,
{
    loop {
        match collection
            .watch(vec![filter.clone()], stream_options())
            .await
        {
            Ok(mut stream) => {
                debug!(collection = collection.name(), "change stream open");
                loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            if let Some(change) = convert_event(event) {
                                callback(change);
                            }
                        }
                        Some(Err(error)) => {
                            warn!(
                                collection = collection.name(),
                                error = %error,
                                "change stream failed, reconnecting"
                            );
                            break;
                        }
                        None => {
                            warn!(
                                collection = collection.name(),
                                "change stream closed, reconnecting"
                            );
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                warn!(
                    collection = collection.name(),
                    error = %error,
                    "change stream could not be opened, retrying"
                );
            }
        }
        tokio::time::sleep(retry_delay).await;
    }
}

fn convert_event<T: Entity>(event: ChangeStreamEvent<T>) -> Option<ChangeEvent<T>> {
    let kind = ChangeKind::from_operation(&event.operation_type)?;
    let payload = match kind {
        ChangeKind::Delete => {
            let key = event.document_key?;
            let id = key.get_object_id("_id").ok()?;
            ChangePayload::Deleted(DeletedStub { id })
        }
        _ => ChangePayload::Document(event.full_document?),
    };
    Some(ChangeEvent { kind, payload })
}
