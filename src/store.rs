//! The collection manager: typed CRUD, reads, writes and aggregation.
//!
//! [`Store`] is the central entry point. It resolves an entity type to its
//! collection in the requested environment, executes CRUD operations, and
//! composes ad-hoc filters and precompiled pipelines. Every operation is
//! generic over an [`Entity`] and accepts an optional environment override
//! defaulting to the current one; nothing is cached between calls — every
//! read re-queries the store.

use std::future::Future;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{Document, doc};
use futures::TryStreamExt;
use mongodb::Collection;
use mongodb::options::{AggregateOptions, FindOptions};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::client::EnvRouter;
use crate::config::{Environment, StoreConfig};
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::pipeline::{PipelineKey, PipelineSet};

/// Maximum identifier re-generation attempts on duplicate-key conflicts.
pub const MAX_INSERT_ATTEMPTS: u32 = 5;

/// Batch size used for every aggregation execution.
const AGGREGATE_BATCH_SIZE: u32 = 10_000;

/// A page window translated into trailing skip/limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    /// Zero-based page number.
    pub page: u64,
    /// Page size.
    pub size: u64,
}

impl PageWindow {
    /// Create a page window.
    pub fn new(page: u64, size: u64) -> Self {
        Self { page, size }
    }

    /// Documents to skip: `page * size`.
    pub fn skip(&self) -> u64 {
        self.page * self.size
    }

    /// Documents to return.
    pub fn limit(&self) -> i64 {
        self.size as i64
    }

    /// The trailing `$skip`/`$limit` stage pair.
    pub(crate) fn stages(&self) -> [Document; 2] {
        [
            doc! { "$skip": self.skip() as i64 },
            doc! { "$limit": self.limit() },
        ]
    }
}

/// One-time configuration for [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Path to the settings file.
    pub settings_path: PathBuf,
    /// Path to the credentials file.
    pub credentials_path: PathBuf,
    /// Directory holding the pipeline definition files.
    pub pipeline_dir: PathBuf,
    /// Logical pipeline names to load, in index order.
    pub pipeline_names: Vec<String>,
    /// Per-operation timeout; `None` disables it.
    pub op_timeout: Option<Duration>,
    /// Delay between watcher reconnect attempts.
    pub watch_retry_delay: Duration,
}

impl StoreOptions {
    /// Options with the default timeout policy (no per-operation timeout,
    /// 5 second watcher reconnect delay).
    pub fn new(
        settings_path: impl Into<PathBuf>,
        credentials_path: impl Into<PathBuf>,
        pipeline_dir: impl Into<PathBuf>,
        pipeline_names: Vec<String>,
    ) -> Self {
        Self {
            settings_path: settings_path.into(),
            credentials_path: credentials_path.into(),
            pipeline_dir: pipeline_dir.into(),
            pipeline_names,
            op_timeout: None,
            watch_retry_delay: Duration::from_secs(5),
        }
    }
}

static GLOBAL: OnceLock<Store> = OnceLock::new();

/// The environment-aware collection manager.
pub struct Store {
    router: EnvRouter,
    pipelines: PipelineSet,
    watched: Mutex<Vec<&'static str>>,
    op_timeout: Option<Duration>,
    watch_retry_delay: Duration,
}

impl Store {
    /// Open a store: load both config files and every pipeline definition,
    /// failing fast on the first missing or malformed input.
    pub fn open(options: StoreOptions) -> StoreResult<Self> {
        let config = StoreConfig::from_files(&options.settings_path, &options.credentials_path)?;
        let pipelines = PipelineSet::load(&options.pipeline_dir, &options.pipeline_names)?;
        Ok(Self::assemble(
            config,
            pipelines,
            options.op_timeout,
            options.watch_retry_delay,
        ))
    }

    /// Build a store from already-loaded parts.
    pub fn new(config: StoreConfig, pipelines: PipelineSet) -> Self {
        Self::assemble(config, pipelines, None, Duration::from_secs(5))
    }

    fn assemble(
        config: StoreConfig,
        pipelines: PipelineSet,
        op_timeout: Option<Duration>,
        watch_retry_delay: Duration,
    ) -> Self {
        info!(
            environment = %config.environment(),
            pipelines = pipelines.len(),
            "store configured"
        );
        Self {
            router: EnvRouter::new(config),
            pipelines,
            watched: Mutex::new(Vec::new()),
            op_timeout,
            watch_retry_delay,
        }
    }

    /// Set the per-operation timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Install the process-global store.
    ///
    /// Must run before any use of [`Store::global`]; a second call fails.
    pub fn configure(options: StoreOptions) -> StoreResult<()> {
        let store = Self::open(options)?;
        GLOBAL
            .set(store)
            .map_err(|_| StoreError::config("store already configured"))
    }

    /// The process-global store installed by [`Store::configure`].
    pub fn global() -> StoreResult<&'static Store> {
        GLOBAL.get().ok_or(StoreError::NotConfigured)
    }

    /// The environment used when a call passes no override.
    pub fn default_env(&self) -> Environment {
        self.router.default_env()
    }

    /// Switch the process-wide default environment.
    pub fn set_default_env(&self, env: Environment) {
        self.router.set_default(env);
    }

    /// The loaded pipeline table.
    pub fn pipelines(&self) -> &PipelineSet {
        &self.pipelines
    }

    pub(crate) fn watch_retry_delay(&self) -> Duration {
        self.watch_retry_delay
    }

    /// Typed collection handle for an entity in the given environment.
    pub fn collection<T: Entity>(&self, env: Option<Environment>) -> StoreResult<Collection<T>> {
        Ok(self.router.database(env)?.collection(T::COLLECTION))
    }

    /// Register a change watcher for a collection; at most one per entity
    /// type for the process lifetime.
    pub(crate) fn claim_watch(&self, collection: &'static str) -> StoreResult<()> {
        let mut watched = self.watched.lock();
        if watched.contains(&collection) {
            return Err(StoreError::AlreadyWatched(collection.to_string()));
        }
        watched.push(collection);
        Ok(())
    }

    /// Apply the per-operation timeout to a driver call.
    async fn run<R>(&self, fut: impl Future<Output = StoreResult<R>>) -> StoreResult<R> {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::Timeout(limit.as_millis() as u64))?,
            None => fut.await,
        }
    }

    // ---- counts ----

    /// Count documents matching a predicate; absent predicate counts all.
    pub async fn count<T: Entity>(
        &self,
        filter: Option<Document>,
        env: Option<Environment>,
    ) -> StoreResult<u64> {
        let collection = self.collection::<T>(env)?;
        let filter = filter.unwrap_or_default();
        debug!(collection = T::COLLECTION, filter = %filter, "count");
        self.run(async move { Ok(collection.count_documents(filter, None).await?) })
            .await
    }

    /// Whether at least one document matches.
    pub async fn exists<T: Entity>(
        &self,
        filter: Option<Document>,
        env: Option<Environment>,
    ) -> StoreResult<bool> {
        Ok(self.count::<T>(filter, env).await? > 0)
    }

    /// Whether exactly one document matches.
    pub async fn exists_unique<T: Entity>(
        &self,
        filter: Option<Document>,
        env: Option<Environment>,
    ) -> StoreResult<bool> {
        Ok(self.count::<T>(filter, env).await? == 1)
    }

    // ---- reads ----
    //
    // Every read funnels through `run_query`: absent predicate means match
    // all, sort ascending by the caller's key or `_id`, optionally inverted,
    // optionally paged.

    async fn run_query<T: Entity>(
        &self,
        query: ReadQuery,
        env: Option<Environment>,
    ) -> StoreResult<Vec<T>> {
        let collection = self.collection::<T>(env)?;
        let filter = query.filter.unwrap_or_default();

        let mut options = FindOptions::builder()
            .sort(sort_doc(query.sort_key.as_deref(), query.descending))
            .build();
        if let Some(page) = query.page {
            options.skip = Some(page.skip());
            options.limit = Some(page.limit());
        }
        if let Some(limit) = query.limit {
            options.limit = Some(limit);
        }

        debug!(collection = T::COLLECTION, filter = %filter, "find");
        self.run(async move {
            let cursor = collection.find(filter, options).await?;
            Ok(cursor.try_collect().await?)
        })
        .await
    }

    /// All documents in the collection, sorted by identifier.
    pub async fn to_list<T: Entity>(&self, env: Option<Environment>) -> StoreResult<Vec<T>> {
        self.run_query(ReadQuery::default(), env).await
    }

    /// Documents matching a predicate, ascending.
    pub async fn find<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        env: Option<Environment>,
    ) -> StoreResult<Vec<T>> {
        self.run_query(
            ReadQuery {
                filter,
                sort_key: sort_key.map(str::to_string),
                ..Default::default()
            },
            env,
        )
        .await
    }

    /// Documents matching a predicate, descending.
    pub async fn find_desc<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        env: Option<Environment>,
    ) -> StoreResult<Vec<T>> {
        self.run_query(
            ReadQuery {
                filter,
                sort_key: sort_key.map(str::to_string),
                descending: true,
                ..Default::default()
            },
            env,
        )
        .await
    }

    /// One page of documents matching a predicate.
    pub async fn find_page<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        page: PageWindow,
        env: Option<Environment>,
    ) -> StoreResult<Vec<T>> {
        self.run_query(
            ReadQuery {
                filter,
                sort_key: sort_key.map(str::to_string),
                page: Some(page),
                ..Default::default()
            },
            env,
        )
        .await
    }

    /// First matching document; not-found failure when nothing matches.
    pub async fn first<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        env: Option<Environment>,
    ) -> StoreResult<T> {
        let criteria = criteria_of(&filter);
        self.first_or_none(filter, sort_key, env)
            .await?
            .ok_or_else(|| StoreError::not_found(T::COLLECTION, criteria))
    }

    /// First matching document, or `None`.
    pub async fn first_or_none<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        env: Option<Environment>,
    ) -> StoreResult<Option<T>> {
        let mut items = self
            .run_query(
                ReadQuery {
                    filter,
                    sort_key: sort_key.map(str::to_string),
                    limit: Some(1),
                    ..Default::default()
                },
                env,
            )
            .await?;
        Ok(items.pop())
    }

    /// Last matching document; not-found failure when nothing matches.
    pub async fn last<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        env: Option<Environment>,
    ) -> StoreResult<T> {
        let criteria = criteria_of(&filter);
        self.last_or_none(filter, sort_key, env)
            .await?
            .ok_or_else(|| StoreError::not_found(T::COLLECTION, criteria))
    }

    /// Last matching document, or `None`.
    pub async fn last_or_none<T: Entity>(
        &self,
        filter: Option<Document>,
        sort_key: Option<&str>,
        env: Option<Environment>,
    ) -> StoreResult<Option<T>> {
        let mut items = self
            .run_query(
                ReadQuery {
                    filter,
                    sort_key: sort_key.map(str::to_string),
                    descending: true,
                    limit: Some(1),
                    ..Default::default()
                },
                env,
            )
            .await?;
        Ok(items.pop())
    }

    /// The only matching document; not-found when zero match, not-unique
    /// when more than one does.
    pub async fn single<T: Entity>(
        &self,
        filter: Option<Document>,
        env: Option<Environment>,
    ) -> StoreResult<T> {
        let criteria = criteria_of(&filter);
        self.single_or_none(filter, env)
            .await?
            .ok_or_else(|| StoreError::not_found(T::COLLECTION, criteria))
    }

    /// The only matching document, or `None` when zero match. More than one
    /// match is still a not-unique failure.
    pub async fn single_or_none<T: Entity>(
        &self,
        filter: Option<Document>,
        env: Option<Environment>,
    ) -> StoreResult<Option<T>> {
        let criteria = criteria_of(&filter);
        let mut items = self
            .run_query::<T>(
                ReadQuery {
                    filter,
                    limit: Some(2),
                    ..Default::default()
                },
                env,
            )
            .await?;
        if items.len() > 1 {
            return Err(StoreError::not_unique(T::COLLECTION, criteria));
        }
        Ok(items.pop())
    }

    // ---- writes ----

    /// Persist an entity: insert (with id assignment) when it is new,
    /// replace by identifier otherwise.
    pub async fn save<T: Entity>(
        &self,
        entity: &mut T,
        env: Option<Environment>,
    ) -> StoreResult<()> {
        if entity.is_new() {
            return self.insert(entity, env).await;
        }

        let collection = self.collection::<T>(env)?;
        let id = entity.id();
        debug!(collection = T::COLLECTION, id = %id, "save (replace)");

        let entity_ref = &*entity;
        let result = self
            .run(async move {
                Ok(collection
                    .replace_one(doc! { "_id": id }, entity_ref, None)
                    .await?)
            })
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::not_found(
                T::COLLECTION,
                doc! { "_id": id }.to_string(),
            ));
        }
        Ok(())
    }

    /// Insert without assigning an identifier.
    ///
    /// Only valid when the caller has confirmed the entity does not already
    /// exist; a duplicate identifier surfaces as a driver error.
    pub async fn save_unchecked<T: Entity>(
        &self,
        entity: &T,
        env: Option<Environment>,
    ) -> StoreResult<()> {
        let collection = self.collection::<T>(env)?;
        debug!(collection = T::COLLECTION, "save (unchecked insert)");
        self.run(async move {
            collection.insert_one(entity, None).await?;
            Ok(())
        })
        .await
    }

    /// Insert with a freshly generated identifier.
    ///
    /// A duplicate-key conflict regenerates the identifier and retries, up
    /// to [`MAX_INSERT_ATTEMPTS`] times; exhaustion is a conflict failure.
    /// The assigned identifier is written back into the entity.
    pub async fn insert<T: Entity>(
        &self,
        entity: &mut T,
        env: Option<Environment>,
    ) -> StoreResult<()> {
        let collection = self.collection::<T>(env)?;

        insert_with_retry(T::COLLECTION, async |id| {
            entity.set_id(id);
            debug!(collection = T::COLLECTION, id = %id, "insert");

            let entity_ref = &*entity;
            let collection = collection.clone();
            self.run(async move {
                collection
                    .insert_one(entity_ref, None)
                    .await
                    .map_err(StoreError::from)?;
                Ok(())
            })
            .await
        })
        .await
    }

    /// Replace the full document matched by the entity's identifier.
    ///
    /// Zero matched documents is a hard not-found failure.
    pub async fn update_item<T: Entity>(
        &self,
        entity: &T,
        env: Option<Environment>,
    ) -> StoreResult<()> {
        let collection = self.collection::<T>(env)?;
        let id = entity.id();
        debug!(collection = T::COLLECTION, id = %id, "update item");

        let result = self
            .run(async move {
                Ok(collection
                    .replace_one(doc! { "_id": id }, entity, None)
                    .await?)
            })
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::not_found(
                T::COLLECTION,
                doc! { "_id": id }.to_string(),
            ));
        }
        Ok(())
    }

    /// Apply an update document to every document matching the filter.
    ///
    /// Zero matched documents is a hard not-found failure. Returns the
    /// number of modified documents.
    pub async fn update_items<T: Entity>(
        &self,
        filter: Document,
        update: Document,
        env: Option<Environment>,
    ) -> StoreResult<u64> {
        let collection = self.collection::<T>(env)?;
        let criteria = filter.to_string();
        debug!(collection = T::COLLECTION, filter = %criteria, "update items");

        let result = self
            .run(async move { Ok(collection.update_many(filter, update, None).await?) })
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::not_found(T::COLLECTION, criteria));
        }
        Ok(result.modified_count)
    }

    /// Apply an update document to every document in the identifier list.
    pub async fn update_items_by_ids<T: Entity>(
        &self,
        ids: &[ObjectId],
        update: Document,
        env: Option<Environment>,
    ) -> StoreResult<u64> {
        self.update_items::<T>(doc! { "_id": { "$in": ids.to_vec() } }, update, env)
            .await
    }

    /// Delete the document with the given identifier.
    ///
    /// Zero deleted documents is a hard not-found failure.
    pub async fn delete_item<T: Entity>(
        &self,
        id: ObjectId,
        env: Option<Environment>,
    ) -> StoreResult<()> {
        let collection = self.collection::<T>(env)?;
        debug!(collection = T::COLLECTION, id = %id, "delete item");

        let result = self
            .run(async move { Ok(collection.delete_one(doc! { "_id": id }, None).await?) })
            .await?;

        if result.deleted_count == 0 {
            return Err(StoreError::not_found(
                T::COLLECTION,
                doc! { "_id": id }.to_string(),
            ));
        }
        Ok(())
    }

    /// Delete every document matching the filter.
    ///
    /// Zero deleted documents is a hard not-found failure. Returns the
    /// number of deleted documents.
    pub async fn delete_items<T: Entity>(
        &self,
        filter: Document,
        env: Option<Environment>,
    ) -> StoreResult<u64> {
        let collection = self.collection::<T>(env)?;
        let criteria = filter.to_string();
        debug!(collection = T::COLLECTION, filter = %criteria, "delete items");

        let result = self
            .run(async move { Ok(collection.delete_many(filter, None).await?) })
            .await?;

        if result.deleted_count == 0 {
            return Err(StoreError::not_found(T::COLLECTION, criteria));
        }
        Ok(result.deleted_count)
    }

    /// Delete every document in the identifier list.
    pub async fn delete_items_by_ids<T: Entity>(
        &self,
        ids: &[ObjectId],
        env: Option<Environment>,
    ) -> StoreResult<u64> {
        self.delete_items::<T>(doc! { "_id": { "$in": ids.to_vec() } }, env)
            .await
    }

    // ---- aggregation ----

    /// Run a named pipeline, optionally prefixed with a `$match` generated
    /// from the predicate and suffixed with a page window.
    pub async fn aggregate<'k, T: Entity, R: DeserializeOwned>(
        &self,
        filter: Option<Document>,
        pipeline: impl Into<PipelineKey<'k>>,
        page: Option<PageWindow>,
        env: Option<Environment>,
    ) -> StoreResult<Vec<R>> {
        let stages = self.pipelines.resolve(pipeline.into())?;
        let lead = filter.map(|f| doc! { "$match": f });
        self.run_pipeline::<T, R>(compose_pipeline(lead, stages, page), env)
            .await
    }

    /// Run a named pipeline prefixed with a caller-precomputed leading stage.
    pub async fn aggregate_with_match<'k, T: Entity, R: DeserializeOwned>(
        &self,
        match_stage: Document,
        pipeline: impl Into<PipelineKey<'k>>,
        page: Option<PageWindow>,
        env: Option<Environment>,
    ) -> StoreResult<Vec<R>> {
        let stages = self.pipelines.resolve(pipeline.into())?;
        self.run_pipeline::<T, R>(compose_pipeline(Some(match_stage), stages, page), env)
            .await
    }

    /// Run a fully custom pipeline.
    pub async fn aggregate_pipeline<T: Entity, R: DeserializeOwned>(
        &self,
        stages: Vec<Document>,
        page: Option<PageWindow>,
        env: Option<Environment>,
    ) -> StoreResult<Vec<R>> {
        self.run_pipeline::<T, R>(compose_pipeline(None, &stages, page), env)
            .await
    }

    async fn run_pipeline<T: Entity, R: DeserializeOwned>(
        &self,
        pipeline: Vec<Document>,
        env: Option<Environment>,
    ) -> StoreResult<Vec<R>> {
        let collection = self.collection::<T>(env)?;
        debug!(
            collection = T::COLLECTION,
            stages = pipeline.len(),
            "aggregate"
        );
        self.run(async move {
            let cursor = collection.aggregate(pipeline, aggregate_options()).await?;
            let documents: Vec<Document> = cursor.try_collect().await?;
            documents
                .into_iter()
                .map(|document| Ok(bson::from_document(document)?))
                .collect()
        })
        .await
    }
}

/// The filtering primitive's inputs; defaults mean "everything, by id,
/// ascending, unpaged".
#[derive(Debug, Clone, Default)]
struct ReadQuery {
    filter: Option<Document>,
    sort_key: Option<String>,
    descending: bool,
    page: Option<PageWindow>,
    limit: Option<i64>,
}

fn sort_doc(key: Option<&str>, descending: bool) -> Document {
    let mut sort = Document::new();
    sort.insert(key.unwrap_or("_id"), if descending { -1 } else { 1 });
    sort
}

fn criteria_of(filter: &Option<Document>) -> String {
    filter
        .as_ref()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "{}".to_string())
}

fn aggregate_options() -> AggregateOptions {
    AggregateOptions::builder()
        .allow_disk_use(true)
        .batch_size(AGGREGATE_BATCH_SIZE)
        .bypass_document_validation(true)
        .build()
}

fn compose_pipeline(
    lead: Option<Document>,
    stages: &[Document],
    page: Option<PageWindow>,
) -> Vec<Document> {
    let mut pipeline = Vec::with_capacity(stages.len() + 3);
    if let Some(stage) = lead {
        pipeline.push(stage);
    }
    pipeline.extend(stages.iter().cloned());
    if let Some(page) = page {
        pipeline.extend(page.stages());
    }
    pipeline
}

/// Drive one insert attempt per freshly generated identifier.
///
/// A duplicate-key failure regenerates the identifier and tries again, at
/// most [`MAX_INSERT_ATTEMPTS`] times; exhaustion is a conflict failure and
/// any other error aborts immediately.
pub(crate) async fn insert_with_retry<F>(collection: &'static str, mut attempt: F) -> StoreResult<()>
where
    F: AsyncFnMut(ObjectId) -> StoreResult<()>,
{
    for n in 1..=MAX_INSERT_ATTEMPTS {
        match attempt(ObjectId::new()).await {
            Ok(()) => return Ok(()),
            Err(StoreError::Driver(ref error)) if is_duplicate_key(error) => {
                warn!(
                    collection,
                    attempt = n,
                    "duplicate id on insert, regenerating"
                );
            }
            Err(error) => return Err(error),
        }
    }

    Err(StoreError::Conflict {
        collection: collection.to_string(),
        attempts: MAX_INSERT_ATTEMPTS,
    })
}

/// Whether a driver error is a duplicate-key write failure.
pub(crate) fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    const DUPLICATE_KEY: i32 = 11000;

    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        ErrorKind::BulkWrite(bulk) => bulk
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY)),
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        _ => false,
    }
}
