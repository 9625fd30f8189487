//! # Mongo Registry
//!
//! Named MongoDB clients with per-operation session leasing and a uniform
//! CRUD / query / bulk facade.
//!
//! ## Overview
//!
//! - **Descriptors** (`descriptor` module): immutable endpoint configuration
//!   merged from partial [`ConnectionOptions`]
//! - **Driver seam** (`driver` module): `Connector` / `Driver` / `Session`
//!   traits, with a `mongodb`-backed implementation and an in-memory store
//! - **Leasing** (`lease` module): every operation runs on its own scoped
//!   session, released on drop
//! - **Facade** (`client` module): find / select / update / upsert / remove /
//!   find-and-modify / paging / index management
//! - **Bulk** (`bulk` module): staged heterogeneous writes executed as one
//!   ordered batch
//! - **Registry** (`registry` module): name → client mapping with one default
//! - **Global surface** (`global` module): an init-once process registry
//! - **Settings** (`settings` module): TOML / YAML / JSON startup records
//!
//! ## Feature Flags
//!
//! - `mongodb` (default): the production driver backed by the `mongodb` crate
//! - `integration-tests`: tests against a MongoDB container
//!
//! ## Quick Example
//!
//! ```rust
//! use mongo_registry::{ConnectionOptions, Registry};
//! use mongo_registry::driver::memory::MemoryConnector;
//! use bson::doc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mongo_registry::Result<()> {
//! let registry = Registry::with_connector(MemoryConnector::new());
//! registry
//!     .setup("main", ConnectionOptions::new().address("memory:quick"), true)
//!     .await?;
//!
//! let client = registry.default_client()?;
//! client.insert("items", &[doc! { "_id": 5, "qty": 1 }]).await?;
//!
//! let inserted = client.upsert_id("items", 5, doc! { "$inc": { "qty": 1 } }).await?;
//! assert!(inserted.is_none());
//! assert_eq!(client.stats().outstanding(), 0);
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod client;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod global;
pub mod keys;
pub mod lease;
pub mod registry;
pub mod settings;

pub use bulk::{Bulk, BulkResult};
pub use client::{Client, Page, RawCollection, Target};
pub use descriptor::{
	ConnectionOptions, Credentials, Descriptor, PoolBounds, ReadMode, SafetyPolicy, Timeouts,
};
pub use driver::{Connector, Driver, Index, Namespace, Session};
pub use error::{Error, Result};
pub use lease::{LeaseStats, LeasedSession, SessionPool};
pub use registry::Registry;
pub use settings::{ClientConfig, Settings};

#[cfg(feature = "mongodb")]
pub use driver::mongo::MongoConnector;
