//! CRUD / query / bulk facade
//!
//! A [`Client`] wraps one shared driver and its [`Descriptor`]. Every
//! operation follows the same shape: lease a session, build the request,
//! execute it under the descriptor's read or write timeout, normalize the
//! reply, release the session.
//!
//! Operations address a collection through [`Target`]: a bare collection
//! name uses the client's configured database, a `(database, collection)`
//! pair names the database explicitly.
//!
//! # Example
//!
//! ```rust
//! use mongo_registry::client::Client;
//! use mongo_registry::descriptor::ConnectionOptions;
//! use mongo_registry::driver::memory::MemoryConnector;
//! use bson::doc;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct User {
//!     #[serde(rename = "_id")]
//!     id: i32,
//!     name: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mongo_registry::Result<()> {
//! let descriptor = ConnectionOptions::new().address("memory:docs").merge()?;
//! let client = Client::connect(&MemoryConnector::new(), descriptor).await?;
//!
//! client.insert("users", &[User { id: 1, name: "x".into() }]).await?;
//!
//! let found: Option<User> = client.find_one("users", doc! { "_id": 1 }).await?;
//! assert_eq!(found.map(|u| u.name), Some("x".to_string()));
//!
//! let missing: Option<User> = client.find_one("users", doc! { "_id": 99 }).await?;
//! assert!(missing.is_none());
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use bson::{Bson, Document, doc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bulk::{Bulk, BulkResult};
use crate::descriptor::Descriptor;
use crate::driver::{
	Change, Connector, Driver, FindQuery, Index, Namespace, UpdateMode, is_operator_update,
};
use crate::error::{Error, Result};
use crate::keys::{index_key_document, index_name, sort_document};
use crate::lease::{LeaseStats, LeasedSession, SessionPool};

/// Collection addressed by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target<'a> {
	/// `None` selects the client's configured database
	pub database: Option<&'a str>,
	pub collection: &'a str,
}

impl<'a> Target<'a> {
	/// Collection in the client's configured database
	pub fn collection(collection: &'a str) -> Self {
		Self {
			database: None,
			collection,
		}
	}

	/// Collection in an explicit database
	pub fn in_database(database: &'a str, collection: &'a str) -> Self {
		Self {
			database: Some(database),
			collection,
		}
	}

	/// Resolve against a default database name
	pub fn namespace(&self, default_database: &str) -> Namespace {
		Namespace::new(self.database.unwrap_or(default_database), self.collection)
	}
}

impl<'a> From<&'a str> for Target<'a> {
	fn from(collection: &'a str) -> Self {
		Target::collection(collection)
	}
}

impl<'a> From<&'a String> for Target<'a> {
	fn from(collection: &'a String) -> Self {
		Target::collection(collection)
	}
}

impl<'a> From<(&'a str, &'a str)> for Target<'a> {
	fn from((database, collection): (&'a str, &'a str)) -> Self {
		Target::in_database(database, collection)
	}
}

/// One page of a paged lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
	/// Documents matching the filter, ignoring skip and limit
	pub total: u64,
	pub items: Vec<T>,
}

/// Leased handle plus the namespace a [`Client::run_collection`] call
/// targets
pub struct RawCollection<'s> {
	pub namespace: Namespace,
	pub session: &'s mut LeasedSession,
}

/// Facade over one shared driver
pub struct Client {
	descriptor: Descriptor,
	pool: SessionPool,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client")
			.field("uri", &self.descriptor.redacted_uri())
			.field("pool", &self.pool)
			.finish()
	}
}

fn decode<T: DeserializeOwned>(doc: Document) -> Result<T> {
	Ok(bson::deserialize_from_document(doc)?)
}

fn decode_all<T: DeserializeOwned>(docs: Vec<Document>) -> Result<Vec<T>> {
	docs.into_iter().map(decode).collect()
}

fn id_filter(id: impl Into<Bson>) -> Document {
	doc! { "_id": id.into() }
}

/// Run `op` under `limit`; a zero limit disables the deadline
async fn within<T>(limit: Duration, op: impl Future<Output = Result<T>>) -> Result<T> {
	if limit.is_zero() {
		return op.await;
	}
	tokio::time::timeout(limit, op)
		.await
		.map_err(|_| Error::Timeout(limit))?
}

/// Skip and limit of zero mean "unset"
fn find_query(
	filter: Option<Document>,
	projection: Option<Document>,
	skip: u64,
	limit: u64,
	sort: &[&str],
) -> Result<FindQuery> {
	Ok(FindQuery {
		filter: filter.unwrap_or_default(),
		projection,
		sort: sort_document(sort)?,
		skip: (skip > 0).then_some(skip),
		limit: (limit > 0).then(|| i64::try_from(limit).unwrap_or(i64::MAX)),
	})
}

impl Client {
	/// Dial through `connector` and wrap the resulting driver
	pub async fn connect(connector: &dyn Connector, descriptor: Descriptor) -> Result<Self> {
		tracing::debug!(uri = %descriptor.redacted_uri(), "dialing");
		let driver = connector.connect(&descriptor).await?;
		Ok(Self::with_driver(descriptor, driver))
	}

	pub fn with_driver(descriptor: Descriptor, driver: std::sync::Arc<dyn Driver>) -> Self {
		let pool = SessionPool::new(driver, &descriptor.pool);
		Self { descriptor, pool }
	}

	pub fn descriptor(&self) -> &Descriptor {
		&self.descriptor
	}

	/// Configured database used by bare collection targets
	pub fn database(&self) -> &str {
		&self.descriptor.database
	}

	pub fn pool(&self) -> &SessionPool {
		&self.pool
	}

	pub fn stats(&self) -> &LeaseStats {
		self.pool.stats()
	}

	/// Close the shared driver
	pub async fn shutdown(&self) {
		self.pool.driver().shutdown().await;
	}

	fn namespace<'a>(&self, target: impl Into<Target<'a>>) -> Namespace {
		target.into().namespace(&self.descriptor.database)
	}

	async fn read<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
		within(self.descriptor.timeouts.read, op).await
	}

	async fn write<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
		within(self.descriptor.timeouts.write, op).await
	}

	/// Round trip to the server
	pub async fn ping(&self) -> Result<()> {
		let mut session = self.pool.lease().await?;
		self.read(session.run_command("admin", doc! { "ping": 1 }))
			.await?;
		Ok(())
	}

	/// Documents in the collection
	pub async fn count<'a>(&self, target: impl Into<Target<'a>>) -> Result<u64> {
		self.count_where(target, None).await
	}

	/// Documents matching `filter`
	pub async fn count_where<'a>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
	) -> Result<u64> {
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		self.read(session.count(&ns, filter.into().unwrap_or_default()))
			.await
	}

	pub async fn indexes<'a>(&self, target: impl Into<Target<'a>>) -> Result<Vec<Index>> {
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		self.read(session.indexes(&ns)).await
	}

	/// Create `index` unless an identical one exists
	pub async fn ensure_index<'a>(&self, target: impl Into<Target<'a>>, index: &Index) -> Result<()> {
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		self.write(session.ensure_index(&ns, index)).await
	}

	/// Create a plain index over `keys` (`-field` for descending)
	pub async fn ensure_index_key<'a>(&self, target: impl Into<Target<'a>>, keys: &[&str]) -> Result<()> {
		let index = Index {
			key: keys.iter().map(|k| k.to_string()).collect(),
			..Index::default()
		};
		self.ensure_index(target, &index).await
	}

	/// Drop the index over `keys`, located by its default name
	pub async fn drop_index<'a>(&self, target: impl Into<Target<'a>>, keys: &[&str]) -> Result<()> {
		let name = index_name(&index_key_document(keys)?);
		self.drop_index_name(target, &name).await
	}

	pub async fn drop_index_name<'a>(&self, target: impl Into<Target<'a>>, name: &str) -> Result<()> {
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		self.write(session.drop_index(&ns, name)).await
	}

	async fn fetch(&self, ns: &Namespace, query: FindQuery) -> Result<Vec<Document>> {
		let mut session = self.pool.lease().await?;
		self.read(session.find(ns, query)).await
	}

	async fn fetch_one<T: DeserializeOwned>(
		&self,
		ns: &Namespace,
		filter: Option<Document>,
		projection: Option<Document>,
	) -> Result<Option<T>> {
		let query = find_query(filter, projection, 0, 1, &[])?;
		let doc = self.fetch(ns, query).await?.into_iter().next();
		doc.map(decode).transpose()
	}

	async fn fetch_page<T: DeserializeOwned>(&self, ns: &Namespace, query: FindQuery) -> Result<Page<T>> {
		let mut session = self.pool.lease().await?;
		let total = self.read(session.count(ns, query.filter.clone())).await?;
		let docs = self.read(session.find(ns, query)).await?;
		Ok(Page {
			total,
			items: decode_all(docs)?,
		})
	}

	/// First document matching `filter`; `Ok(None)` when nothing matches
	pub async fn find_one<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
	) -> Result<Option<T>> {
		let ns = self.namespace(target);
		self.fetch_one(&ns, filter.into(), None).await
	}

	pub async fn find_id<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		id: impl Into<Bson>,
	) -> Result<Option<T>> {
		let ns = self.namespace(target);
		self.fetch_one(&ns, Some(id_filter(id)), None).await
	}

	pub async fn find_all<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		sort: &[&str],
	) -> Result<Vec<T>> {
		self.find_range(target, filter, 0, 0, sort).await
	}

	pub async fn find_range<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		skip: u64,
		limit: u64,
		sort: &[&str],
	) -> Result<Vec<T>> {
		let ns = self.namespace(target);
		let query = find_query(filter.into(), None, skip, limit, sort)?;
		decode_all(self.fetch(&ns, query).await?)
	}

	/// Total match count plus the bounded page, on one lease
	pub async fn find_page<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		skip: u64,
		limit: u64,
		sort: &[&str],
	) -> Result<Page<T>> {
		let ns = self.namespace(target);
		let query = find_query(filter.into(), None, skip, limit, sort)?;
		self.fetch_page(&ns, query).await
	}

	/// Distinct values of `key` among matching documents
	///
	/// Takes no sort and has no projecting `select_distinct` twin: the server
	/// returns distinct values unordered and a projection cannot change them.
	/// Sort the returned `Vec` when order matters.
	pub async fn find_distinct<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		key: &str,
	) -> Result<Vec<T>> {
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		let values = self
			.read(session.distinct(&ns, key, filter.into().unwrap_or_default()))
			.await?;
		values
			.into_iter()
			.map(|v| bson::deserialize_from_bson(v).map_err(Error::from))
			.collect()
	}

	pub async fn select_one<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		projection: impl Into<Option<Document>>,
	) -> Result<Option<T>> {
		let ns = self.namespace(target);
		self.fetch_one(&ns, filter.into(), projection.into()).await
	}

	pub async fn select_id<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		id: impl Into<Bson>,
		projection: impl Into<Option<Document>>,
	) -> Result<Option<T>> {
		let ns = self.namespace(target);
		self.fetch_one(&ns, Some(id_filter(id)), projection.into())
			.await
	}

	pub async fn select_all<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		projection: impl Into<Option<Document>>,
		sort: &[&str],
	) -> Result<Vec<T>> {
		self.select_range(target, filter, projection, 0, 0, sort)
			.await
	}

	pub async fn select_range<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		projection: impl Into<Option<Document>>,
		skip: u64,
		limit: u64,
		sort: &[&str],
	) -> Result<Vec<T>> {
		let ns = self.namespace(target);
		let query = find_query(filter.into(), projection.into(), skip, limit, sort)?;
		decode_all(self.fetch(&ns, query).await?)
	}

	pub async fn select_page<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		projection: impl Into<Option<Document>>,
		skip: u64,
		limit: u64,
		sort: &[&str],
	) -> Result<Page<T>> {
		let ns = self.namespace(target);
		let query = find_query(filter.into(), projection.into(), skip, limit, sort)?;
		self.fetch_page(&ns, query).await
	}

	async fn modify(
		&self,
		ns: &Namespace,
		filter: Option<Document>,
		change: Change,
	) -> Result<crate::driver::ChangeOutcome> {
		let mut session = self.pool.lease().await?;
		self.write(session.find_and_modify(ns, filter.unwrap_or_default(), change))
			.await
	}

	/// Update the first match and return the document as it was
	///
	/// Unlike the other find-and-modify operations, matching nothing is an
	/// error: [`Error::NotFound`].
	pub async fn find_and_update<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		update: Document,
	) -> Result<(Option<T>, u64)> {
		let ns = self.namespace(target);
		let change = Change::Update {
			update,
			return_new: false,
		};
		let outcome = self.modify(&ns, filter.into(), change).await?;
		if outcome.affected == 0 {
			return Err(Error::NotFound);
		}
		Ok((outcome.document.map(decode).transpose()?, outcome.affected))
	}

	/// Update the first match and return the document as it is now;
	/// `(None, 0)` when nothing matches
	pub async fn find_and_update_rn<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		update: Document,
	) -> Result<(Option<T>, u64)> {
		let ns = self.namespace(target);
		let change = Change::Update {
			update,
			return_new: true,
		};
		let outcome = self.modify(&ns, filter.into(), change).await?;
		if outcome.affected == 0 {
			return Ok((None, 0));
		}
		Ok((outcome.document.map(decode).transpose()?, outcome.affected))
	}

	/// Update or insert, returning the previous document (`None` when
	/// inserted) and the generated id when an insert happened
	pub async fn find_and_upsert<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		upsert: Document,
	) -> Result<(Option<T>, Option<Bson>)> {
		let ns = self.namespace(target);
		let change = Change::Upsert {
			update: upsert,
			return_new: false,
		};
		let outcome = self.modify(&ns, filter.into(), change).await?;
		Ok((outcome.document.map(decode).transpose()?, outcome.upserted_id))
	}

	pub async fn find_and_upsert_rn<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
		upsert: Document,
	) -> Result<(Option<T>, Option<Bson>)> {
		let ns = self.namespace(target);
		let change = Change::Upsert {
			update: upsert,
			return_new: true,
		};
		let outcome = self.modify(&ns, filter.into(), change).await?;
		Ok((outcome.document.map(decode).transpose()?, outcome.upserted_id))
	}

	/// Remove the first match and return it; `(None, 0)` when nothing matches
	pub async fn find_and_remove<'a, T: DeserializeOwned>(
		&self,
		target: impl Into<Target<'a>>,
		filter: impl Into<Option<Document>>,
	) -> Result<(Option<T>, u64)> {
		let ns = self.namespace(target);
		let outcome = self.modify(&ns, filter.into(), Change::Remove).await?;
		if outcome.affected == 0 {
			return Ok((None, 0));
		}
		Ok((outcome.document.map(decode).transpose()?, outcome.affected))
	}

	/// Insert one or more documents
	///
	/// # Errors
	///
	/// [`Error::InvalidArgument`] for an empty slice.
	pub async fn insert<'a, T: Serialize>(&self, target: impl Into<Target<'a>>, docs: &[T]) -> Result<()> {
		if docs.is_empty() {
			return Err(Error::InvalidArgument(
				"insert needs at least one document".to_string(),
			));
		}
		let docs = docs
			.iter()
			.map(|d| bson::serialize_to_document(d).map_err(Error::from))
			.collect::<Result<Vec<_>>>()?;
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		self.write(session.insert(&ns, docs)).await
	}

	async fn remove(&self, ns: &Namespace, selector: Option<Document>, multi: bool) -> Result<u64> {
		let mut session = self.pool.lease().await?;
		self.write(session.remove(ns, selector.unwrap_or_default(), multi))
			.await
	}

	/// Whether a document was removed
	pub async fn remove_one<'a>(
		&self,
		target: impl Into<Target<'a>>,
		selector: impl Into<Option<Document>>,
	) -> Result<bool> {
		let ns = self.namespace(target);
		Ok(self.remove(&ns, selector.into(), false).await? > 0)
	}

	pub async fn remove_id<'a>(&self, target: impl Into<Target<'a>>, id: impl Into<Bson>) -> Result<bool> {
		let ns = self.namespace(target);
		Ok(self.remove(&ns, Some(id_filter(id)), false).await? > 0)
	}

	/// Number of removed documents
	pub async fn remove_all<'a>(
		&self,
		target: impl Into<Target<'a>>,
		selector: impl Into<Option<Document>>,
	) -> Result<u64> {
		let ns = self.namespace(target);
		self.remove(&ns, selector.into(), true).await
	}

	async fn apply(
		&self,
		ns: &Namespace,
		selector: Option<Document>,
		update: Document,
		mode: UpdateMode,
	) -> Result<crate::driver::WriteOutcome> {
		let mut session = self.pool.lease().await?;
		self.write(session.update(ns, selector.unwrap_or_default(), update, mode))
			.await
	}

	/// Whether a document matched
	pub async fn update_one<'a>(
		&self,
		target: impl Into<Target<'a>>,
		selector: impl Into<Option<Document>>,
		update: Document,
	) -> Result<bool> {
		let ns = self.namespace(target);
		let outcome = self
			.apply(&ns, selector.into(), update, UpdateMode::default())
			.await?;
		Ok(outcome.matched > 0)
	}

	pub async fn update_id<'a>(
		&self,
		target: impl Into<Target<'a>>,
		id: impl Into<Bson>,
		update: Document,
	) -> Result<bool> {
		let ns = self.namespace(target);
		let outcome = self
			.apply(&ns, Some(id_filter(id)), update, UpdateMode::default())
			.await?;
		Ok(outcome.matched > 0)
	}

	/// Number of modified documents
	///
	/// # Errors
	///
	/// [`Error::InvalidArgument`] when `update` is a replacement document
	/// rather than an operator update.
	pub async fn update_all<'a>(
		&self,
		target: impl Into<Target<'a>>,
		selector: impl Into<Option<Document>>,
		update: Document,
	) -> Result<u64> {
		if !is_operator_update(&update) {
			return Err(Error::InvalidArgument(
				"update_all needs an operator update, not a replacement document".to_string(),
			));
		}
		let ns = self.namespace(target);
		let mode = UpdateMode {
			multi: true,
			upsert: false,
		};
		let outcome = self.apply(&ns, selector.into(), update, mode).await?;
		Ok(outcome.modified)
	}

	/// Update or insert; the id is `Some` only when a document was inserted
	pub async fn upsert_one<'a>(
		&self,
		target: impl Into<Target<'a>>,
		selector: impl Into<Option<Document>>,
		update: Document,
	) -> Result<Option<Bson>> {
		let ns = self.namespace(target);
		let mode = UpdateMode {
			multi: false,
			upsert: true,
		};
		let outcome = self.apply(&ns, selector.into(), update, mode).await?;
		Ok(outcome.upserted_id)
	}

	pub async fn upsert_id<'a>(
		&self,
		target: impl Into<Target<'a>>,
		id: impl Into<Bson>,
		update: Document,
	) -> Result<Option<Bson>> {
		self.upsert_one(target, id_filter(id), update).await
	}

	/// Stage writes with `build`, then execute them as one ordered batch
	///
	/// # Errors
	///
	/// [`Error::Bulk`] when a sub-operation fails; its `applied` field counts
	/// what the store applied before stopping. Errors returned by `build`
	/// are passed through and nothing is executed.
	pub async fn run_bulk<'a, F>(&self, target: impl Into<Target<'a>>, build: F) -> Result<BulkResult>
	where
		F: FnOnce(&mut Bulk) -> Result<()>,
	{
		let ns = self.namespace(target);
		let mut session = self.pool.lease().await?;
		let mut bulk = Bulk::new();
		build(&mut bulk)?;
		self.write(bulk.execute(&mut *session, &ns)).await
	}

	/// Hand the leased session and resolved namespace to `f`
	///
	/// The lease is released once the returned future completes, whatever
	/// its outcome. No read or write timeout applies.
	pub async fn run_collection<'a, T, F>(&self, target: impl Into<Target<'a>>, f: F) -> Result<T>
	where
		F: for<'s> FnOnce(RawCollection<'s>) -> BoxFuture<'s, Result<T>>,
	{
		let namespace = self.namespace(target);
		let mut session = self.pool.lease().await?;
		f(RawCollection {
			namespace,
			session: &mut session,
		})
		.await
	}

	/// Hand the leased session to `f`
	pub async fn run_session<T, F>(&self, f: F) -> Result<T>
	where
		F: for<'s> FnOnce(&'s mut LeasedSession) -> BoxFuture<'s, Result<T>>,
	{
		let mut session = self.pool.lease().await?;
		f(&mut session).await
	}
}
