//! Driver seam
//!
//! The facade never talks to a wire protocol directly. It dials a
//! [`Connector`] once per registered client, which yields a long-lived
//! [`Driver`] (the shared connection pool). Every facade operation then asks
//! the driver for a fresh [`Session`], uses it for one request and drops it.
//!
//! Two implementations ship with the crate:
//!
//! - [`mongo`] (feature `mongodb`): the official driver.
//! - [`memory`]: an in-process document store with the same observable
//!   behaviour for the subset of the query language the facade uses.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::descriptor::Descriptor;
use crate::error::Result;

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

/// One collection inside one database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
	pub database: String,
	pub collection: String,
}

impl Namespace {
	pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
		Self {
			database: database.into(),
			collection: collection.into(),
		}
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.database, self.collection)
	}
}

/// A fully normalized find request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
	pub filter: Document,
	pub projection: Option<Document>,
	pub sort: Option<Document>,
	pub skip: Option<u64>,
	pub limit: Option<i64>,
}

/// Mutation applied by a find-and-modify
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
	Update { update: Document, return_new: bool },
	Upsert { update: Document, return_new: bool },
	Remove,
}

impl Change {
	pub fn returns_new(&self) -> bool {
		match self {
			Change::Update { return_new, .. } | Change::Upsert { return_new, .. } => *return_new,
			Change::Remove => false,
		}
	}
}

/// What a find-and-modify did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeOutcome {
	/// Pre- or post-image, depending on the request
	pub document: Option<Document>,
	/// Documents touched (`lastErrorObject.n`)
	pub affected: u64,
	/// An existing document was updated, as opposed to inserted
	pub updated_existing: bool,
	pub upserted_id: Option<Bson>,
}

/// Result of a single update statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
	pub matched: u64,
	pub modified: u64,
	pub upserted_id: Option<Bson>,
}

/// How an update statement is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateMode {
	pub multi: bool,
	pub upsert: bool,
}

/// One staged bulk sub-operation
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
	Insert(Document),
	Update {
		filter: Document,
		update: Document,
		multi: bool,
		upsert: bool,
	},
	Remove {
		filter: Document,
		multi: bool,
	},
}

impl BulkOp {
	/// Stable kind tag; consecutive ops of one kind share a command
	pub fn kind(&self) -> &'static str {
		match self {
			BulkOp::Insert(_) => "insert",
			BulkOp::Update { .. } => "update",
			BulkOp::Remove { .. } => "delete",
		}
	}
}

/// Aggregate counts of an executed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkCounts {
	pub inserted: u64,
	pub matched: u64,
	pub modified: u64,
	pub removed: u64,
	pub upserted: u64,
}

/// First failing sub-operation of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFailure {
	pub index: usize,
	pub code: i32,
	pub message: String,
}

/// Executed batch: counts for what was applied, plus the failure if any
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
	pub counts: BulkCounts,
	pub failure: Option<BulkFailure>,
}

/// Index description
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
	/// Key fields in order; `-` prefix for descending
	pub key: Vec<String>,
	/// Defaults to the server-generated name (`a_1_b_-1`)
	pub name: Option<String>,
	pub unique: bool,
	pub sparse: bool,
	pub expire_after: Option<std::time::Duration>,
}

/// Opens the shared pool for one descriptor
#[async_trait]
pub trait Connector: Send + Sync {
	/// Dial the endpoint; the only network-touching step of registration
	async fn connect(&self, descriptor: &Descriptor) -> Result<Arc<dyn Driver>>;
}

/// The shared connection pool of one client
#[async_trait]
pub trait Driver: Send + Sync {
	/// Cheap independent session backed by the shared pool
	async fn session(&self) -> Result<Box<dyn Session>>;

	/// Close every pooled connection
	async fn shutdown(&self);

	/// Get as Any for downcasting
	fn as_any(&self) -> &dyn Any;
}

/// One leased logical connection
///
/// Dropping the session returns it to the pool.
#[async_trait]
pub trait Session: Send {
	async fn count(&mut self, ns: &Namespace, filter: Document) -> Result<u64>;

	async fn find(&mut self, ns: &Namespace, query: FindQuery) -> Result<Vec<Document>>;

	async fn distinct(&mut self, ns: &Namespace, key: &str, filter: Document)
	-> Result<Vec<Bson>>;

	async fn find_and_modify(
		&mut self,
		ns: &Namespace,
		filter: Document,
		change: Change,
	) -> Result<ChangeOutcome>;

	async fn insert(&mut self, ns: &Namespace, docs: Vec<Document>) -> Result<()>;

	async fn update(
		&mut self,
		ns: &Namespace,
		filter: Document,
		update: Document,
		mode: UpdateMode,
	) -> Result<WriteOutcome>;

	/// Returns the number of removed documents
	async fn remove(&mut self, ns: &Namespace, filter: Document, multi: bool) -> Result<u64>;

	/// Execute an ordered batch, stopping at the first failure
	async fn bulk(&mut self, ns: &Namespace, ops: Vec<BulkOp>) -> Result<BulkOutcome>;

	async fn indexes(&mut self, ns: &Namespace) -> Result<Vec<Index>>;

	async fn ensure_index(&mut self, ns: &Namespace, index: &Index) -> Result<()>;

	async fn drop_index(&mut self, ns: &Namespace, name: &str) -> Result<()>;

	/// Raw database command
	async fn run_command(&mut self, database: &str, command: Document) -> Result<Document>;

	/// Get as Any for downcasting to the concrete session type
	fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Whether `update` is an operator document (`{$set: ...}`) rather than a
/// whole-document replacement
pub(crate) fn is_operator_update(update: &Document) -> bool {
	update.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Read a numeric reply field as `u64`
pub(crate) fn count_field(reply: &Document, key: &str) -> u64 {
	match reply.get(key) {
		Some(Bson::Int32(n)) => (*n).max(0) as u64,
		Some(Bson::Int64(n)) => (*n).max(0) as u64,
		Some(Bson::Double(n)) if *n > 0.0 => *n as u64,
		_ => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bson::doc;
	use rstest::rstest;

	#[rstest]
	#[case(doc! { "$set": { "a": 1 } }, true)]
	#[case(doc! { "a": 1 }, false)]
	#[case(doc! {}, false)]
	fn test_is_operator_update(#[case] update: Document, #[case] expected: bool) {
		assert_eq!(is_operator_update(&update), expected);
	}

	#[rstest]
	fn test_count_field_accepts_any_numeric() {
		// Arrange
		let reply = doc! { "a": 3_i32, "b": 4_i64, "c": 5.0, "d": "x", "e": -1_i32 };

		// Act / Assert
		assert_eq!(count_field(&reply, "a"), 3);
		assert_eq!(count_field(&reply, "b"), 4);
		assert_eq!(count_field(&reply, "c"), 5);
		assert_eq!(count_field(&reply, "d"), 0);
		assert_eq!(count_field(&reply, "e"), 0);
		assert_eq!(count_field(&reply, "missing"), 0);
	}

	#[rstest]
	fn test_namespace_display() {
		assert_eq!(Namespace::new("app", "users").to_string(), "app.users");
	}
}
