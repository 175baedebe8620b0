//! # corral
//!
//! Environment-aware data-access layer over MongoDB.
//!
//! This crate provides:
//! - An environment-aware collection manager: the same logical operation
//!   routes to Production or Test per call
//! - Typed CRUD and read families over caller-defined entity types
//! - A query and aggregation expression builder
//! - Named aggregation pipelines loaded from definition files at startup
//! - Change-stream watching with automatic reconnection
//!
//! ## Example
//!
//! ```rust,ignore
//! use corral::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     Store::configure(StoreOptions::new(
//!         "config/settings.json",
//!         "config/credentials.json",
//!         "config/pipelines",
//!         vec!["top_customers".into()],
//!     ))?;
//!     let store = Store::global()?;
//!
//!     // Insert a user; the identifier is assigned in place.
//!     let mut user = User::named("José");
//!     store.save(&mut user, None).await?;
//!
//!     // Accent- and case-insensitive search.
//!     let found: Vec<User> = store
//!         .find(Some(expr::contains("name", "jose")), None, None)
//!         .await?;
//!
//!     // The same read against the test environment.
//!     let in_test: Vec<User> = store
//!         .find(None, None, Some(Environment::Test))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Entities
//!
//! Records are plain serde types bound to a collection through the
//! [`Entity`] trait:
//!
//! ```rust,ignore
//! use bson::oid::ObjectId;
//! use corral::Entity;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct User {
//!     #[serde(rename = "_id")]
//!     id: ObjectId,
//!     name: String,
//! }
//!
//! impl Entity for User {
//!     const COLLECTION: &'static str = "User";
//!     fn id(&self) -> ObjectId { self.id }
//!     fn set_id(&mut self, id: ObjectId) { self.id = id; }
//! }
//! ```

pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod expr;
pub mod pipeline;
pub mod store;
pub mod watch;

pub use bson::oid::ObjectId;
pub use bson::{Bson, Document, doc};
pub use client::EnvRouter;
pub use config::{EnvCredentials, Environment, ReadPreference, StoreConfig, StoreSettings};
pub use entity::{DeletedStub, Entity, zero_id};
pub use error::{StoreError, StoreResult};
pub use pipeline::{PipelineKey, PipelineSet, strip_comments};
pub use store::{MAX_INSERT_ATTEMPTS, PageWindow, Store, StoreOptions};
pub use watch::{ChangeEvent, ChangeKind, ChangePayload, WatchOptions};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{Environment, ReadPreference, StoreConfig};
    pub use crate::entity::{DeletedStub, Entity};
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::expr;
    pub use crate::pipeline::{PipelineKey, PipelineSet};
    pub use crate::store::{PageWindow, Store, StoreOptions};
    pub use crate::watch::{ChangeEvent, ChangeKind, ChangePayload, WatchOptions};
    pub use bson::oid::ObjectId;
    pub use bson::{Bson, Document, doc};
}
