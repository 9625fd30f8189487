//! In-process document store
//!
//! [`MemoryConnector`] dials "servers" that live inside the process. Two
//! descriptors with the same address list reach the same store, so several
//! registered clients can share data exactly as they would against one real
//! deployment. The store enforces `_id` uniqueness and unique indexes with
//! the server's duplicate-key code, which makes partial bulk failures
//! reproducible without a server.
//!
//! # Example
//!
//! ```rust
//! use mongo_registry::descriptor::ConnectionOptions;
//! use mongo_registry::driver::Connector;
//! use mongo_registry::driver::memory::MemoryConnector;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mongo_registry::Result<()> {
//! let connector = MemoryConnector::new();
//! let descriptor = ConnectionOptions::new().address("memory:1").merge()?;
//! let driver = connector.connect(&descriptor).await?;
//! let _session = driver.session().await?;
//! # Ok(())
//! # }
//! ```

mod query;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use parking_lot::Mutex;

use super::{
	BulkCounts, BulkFailure, BulkOp, BulkOutcome, Change, ChangeOutcome, Connector, Driver,
	FindQuery, Index, Namespace, Session, UpdateMode, WriteOutcome, is_operator_update,
};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::keys::{index_key_document, index_key_fields, index_name};

/// Server code for duplicate key violations
pub const DUPLICATE_KEY: i32 = 11000;

const ID_INDEX: &str = "_id_";

/// A write rejected by the store
#[derive(Debug)]
struct WriteError {
	code: i32,
	message: String,
}

impl WriteError {
	fn into_error(self) -> Error {
		Error::Database(format!("{} (code {})", self.message, self.code))
	}
}

impl From<Error> for WriteError {
	fn from(err: Error) -> Self {
		WriteError {
			code: 2,
			message: err.to_string(),
		}
	}
}

/// A multi-document update that stopped partway; `applied` counts the
/// documents already changed
#[derive(Debug)]
struct PartialUpdate {
	applied: WriteOutcome,
	error: WriteError,
}

impl From<WriteError> for PartialUpdate {
	fn from(error: WriteError) -> Self {
		PartialUpdate {
			applied: WriteOutcome::default(),
			error,
		}
	}
}

impl From<Error> for PartialUpdate {
	fn from(err: Error) -> Self {
		WriteError::from(err).into()
	}
}

#[derive(Debug, Clone)]
struct StoredIndex {
	name: String,
	keys: Document,
	unique: bool,
	sparse: bool,
	expire_after: Option<std::time::Duration>,
}

impl StoredIndex {
	fn to_index(&self) -> Index {
		Index {
			key: index_key_fields(&self.keys),
			name: Some(self.name.clone()),
			unique: self.unique,
			sparse: self.sparse,
			expire_after: self.expire_after,
		}
	}
}

#[derive(Debug)]
struct Collection {
	docs: Vec<Document>,
	indexes: Vec<StoredIndex>,
}

impl Default for Collection {
	fn default() -> Self {
		Self {
			docs: Vec::new(),
			indexes: vec![StoredIndex {
				name: ID_INDEX.to_string(),
				keys: doc! { "_id": 1 },
				unique: true,
				sparse: false,
				expire_after: None,
			}],
		}
	}
}

impl Collection {
	/// Check unique indexes for `candidate`, ignoring the document at `skip`
	fn check_unique(
		&self,
		ns: &Namespace,
		candidate: &Document,
		skip: Option<usize>,
	) -> std::result::Result<(), WriteError> {
		for index in self.indexes.iter().filter(|i| i.unique) {
			let Some(tuple) = query::index_tuple(candidate, &index.keys, index.sparse) else {
				continue;
			};
			let clash = self.docs.iter().enumerate().any(|(pos, other)| {
				Some(pos) != skip
					&& query::index_tuple(other, &index.keys, index.sparse)
						.is_some_and(|t| query::tuples_equal(&t, &tuple))
			});
			if clash {
				return Err(WriteError {
					code: DUPLICATE_KEY,
					message: format!(
						"E11000 duplicate key error collection: {} index: {} dup key: {:?}",
						ns, index.name, tuple
					),
				});
			}
		}
		Ok(())
	}

	fn insert(&mut self, ns: &Namespace, mut doc: Document) -> std::result::Result<Bson, WriteError> {
		if !doc.contains_key("_id") {
			let mut with_id = doc! { "_id": ObjectId::new() };
			with_id.extend(doc);
			doc = with_id;
		}
		self.check_unique(ns, &doc, None)?;
		let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
		self.docs.push(doc);
		Ok(id)
	}

	fn positions(&self, filter: &Document) -> Result<Vec<usize>> {
		let mut found = Vec::new();
		for (pos, doc) in self.docs.iter().enumerate() {
			if query::matches(doc, filter)? {
				found.push(pos);
			}
		}
		Ok(found)
	}

	/// Apply `update` to the document at `pos`; returns whether it changed
	fn modify(
		&mut self,
		ns: &Namespace,
		pos: usize,
		update: &Document,
	) -> std::result::Result<bool, WriteError> {
		let mut changed = self.docs[pos].clone();
		query::apply_update(&mut changed, update, false)?;
		if changed.get("_id") != self.docs[pos].get("_id") {
			return Err(WriteError {
				code: 66,
				message: "Performing an update on the path '_id' would modify the immutable field '_id'"
					.to_string(),
			});
		}
		if changed == self.docs[pos] {
			return Ok(false);
		}
		self.check_unique(ns, &changed, Some(pos))?;
		self.docs[pos] = changed;
		Ok(true)
	}

	/// Insert the document an upsert produces when nothing matched
	fn upsert(
		&mut self,
		ns: &Namespace,
		filter: &Document,
		update: &Document,
	) -> std::result::Result<(Bson, Document), WriteError> {
		let mut seed = query::upsert_seed(filter)?;
		if is_operator_update(update) {
			query::apply_update(&mut seed, update, true)?;
		} else {
			let id = seed.get("_id").cloned();
			seed = update.clone();
			if let Some(id) = id
				&& !seed.contains_key("_id")
			{
				seed.insert("_id", id);
			}
		}
		let id = self.insert(ns, seed)?;
		let pos = self.docs.len() - 1;
		Ok((id, self.docs[pos].clone()))
	}

	fn update(
		&mut self,
		ns: &Namespace,
		filter: &Document,
		update: &Document,
		mode: UpdateMode,
	) -> std::result::Result<WriteOutcome, PartialUpdate> {
		if mode.multi && !is_operator_update(update) {
			return Err(WriteError {
				code: 9,
				message: "multi update is not supported for replacement-style update".to_string(),
			}
			.into());
		}
		let mut targets = self.positions(filter)?;
		if !mode.multi {
			targets.truncate(1);
		}
		if targets.is_empty() {
			if mode.upsert {
				let (id, _) = self.upsert(ns, filter, update)?;
				return Ok(WriteOutcome {
					matched: 0,
					modified: 0,
					upserted_id: Some(id),
				});
			}
			return Ok(WriteOutcome::default());
		}
		let mut outcome = WriteOutcome::default();
		for pos in targets {
			match self.modify(ns, pos, update) {
				Ok(changed) => {
					outcome.matched += 1;
					if changed {
						outcome.modified += 1;
					}
				}
				Err(error) => {
					return Err(PartialUpdate {
						applied: outcome,
						error,
					});
				}
			}
		}
		Ok(outcome)
	}

	fn remove(&mut self, filter: &Document, multi: bool) -> Result<u64> {
		let mut targets = self.positions(filter)?;
		if !multi {
			targets.truncate(1);
		}
		for pos in targets.iter().rev() {
			self.docs.remove(*pos);
		}
		Ok(targets.len() as u64)
	}
}

#[derive(Debug, Default)]
struct Store {
	collections: HashMap<Namespace, Collection>,
}

impl Store {
	fn collection(&self, ns: &Namespace) -> Option<&Collection> {
		self.collections.get(ns)
	}

	fn collection_mut(&mut self, ns: &Namespace) -> &mut Collection {
		self.collections.entry(ns.clone()).or_default()
	}
}

/// Dials in-process stores keyed by address list
#[derive(Clone, Default)]
pub struct MemoryConnector {
	stores: Arc<Mutex<HashMap<String, Arc<Mutex<Store>>>>>,
	refused: Arc<Mutex<HashSet<String>>>,
	dials: Arc<AtomicUsize>,
}

impl MemoryConnector {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make every dial that includes `address` fail with a connection error
	pub fn refuse(self, address: impl Into<String>) -> Self {
		self.refused.lock().insert(address.into());
		self
	}

	/// Number of successful dials so far
	pub fn dials(&self) -> usize {
		self.dials.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Connector for MemoryConnector {
	async fn connect(&self, descriptor: &Descriptor) -> Result<Arc<dyn Driver>> {
		{
			let refused = self.refused.lock();
			if let Some(address) = descriptor.addresses.iter().find(|a| refused.contains(*a)) {
				return Err(Error::Connection(format!(
					"no reachable servers (connection refused by {})",
					address
				)));
			}
		}

		let key = descriptor.addresses.join(",");
		let store = Arc::clone(self.stores.lock().entry(key).or_default());
		self.dials.fetch_add(1, Ordering::SeqCst);
		Ok(Arc::new(MemoryDriver {
			store,
			closed: Arc::new(AtomicBool::new(false)),
		}))
	}
}

/// Shared handle to one in-process store
pub struct MemoryDriver {
	store: Arc<Mutex<Store>>,
	closed: Arc<AtomicBool>,
}

impl MemoryDriver {
	/// Whether [`Driver::shutdown`] has run
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Driver for MemoryDriver {
	async fn session(&self) -> Result<Box<dyn Session>> {
		if self.is_closed() {
			return Err(Error::Connection("client has been shut down".to_string()));
		}
		Ok(Box::new(MemorySession {
			store: Arc::clone(&self.store),
		}))
	}

	async fn shutdown(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Session over an in-process store
pub struct MemorySession {
	store: Arc<Mutex<Store>>,
}

impl MemorySession {
	/// Snapshot of every document in `ns`, in insertion order
	pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
		self.store
			.lock()
			.collection(ns)
			.map(|c| c.docs.clone())
			.unwrap_or_default()
	}
}

#[async_trait]
impl Session for MemorySession {
	async fn count(&mut self, ns: &Namespace, filter: Document) -> Result<u64> {
		let store = self.store.lock();
		match store.collection(ns) {
			Some(coll) => Ok(coll.positions(&filter)?.len() as u64),
			None => Ok(0),
		}
	}

	async fn find(&mut self, ns: &Namespace, request: FindQuery) -> Result<Vec<Document>> {
		let store = self.store.lock();
		let Some(coll) = store.collection(ns) else {
			return Ok(Vec::new());
		};

		let mut docs = Vec::new();
		for doc in &coll.docs {
			if query::matches(doc, &request.filter)? {
				docs.push(doc.clone());
			}
		}
		if let Some(sort) = &request.sort {
			query::sort(&mut docs, sort);
		}

		let skip = request.skip.unwrap_or(0) as usize;
		let limit = request.limit.map(|l| l.unsigned_abs() as usize).filter(|&l| l > 0);
		let page = docs.into_iter().skip(skip).take(limit.unwrap_or(usize::MAX));

		match &request.projection {
			Some(projection) => page.map(|doc| query::project(&doc, projection)).collect(),
			None => Ok(page.collect()),
		}
	}

	async fn distinct(&mut self, ns: &Namespace, key: &str, filter: Document) -> Result<Vec<Bson>> {
		let store = self.store.lock();
		let Some(coll) = store.collection(ns) else {
			return Ok(Vec::new());
		};
		let mut matching = Vec::new();
		for doc in &coll.docs {
			if query::matches(doc, &filter)? {
				matching.push(doc);
			}
		}
		Ok(query::distinct(matching.into_iter(), key))
	}

	async fn find_and_modify(
		&mut self,
		ns: &Namespace,
		filter: Document,
		change: Change,
	) -> Result<ChangeOutcome> {
		let mut store = self.store.lock();
		let coll = store.collection_mut(ns);
		let found = coll.positions(&filter)?.first().copied();

		match (change, found) {
			(Change::Remove, Some(pos)) => Ok(ChangeOutcome {
				document: Some(coll.docs.remove(pos)),
				affected: 1,
				..ChangeOutcome::default()
			}),
			(Change::Update { update, return_new } | Change::Upsert { update, return_new }, Some(pos)) => {
				let old = coll.docs[pos].clone();
				coll.modify(ns, pos, &update).map_err(WriteError::into_error)?;
				let document = if return_new { coll.docs[pos].clone() } else { old };
				Ok(ChangeOutcome {
					document: Some(document),
					affected: 1,
					updated_existing: true,
					upserted_id: None,
				})
			}
			(Change::Upsert { update, return_new }, None) => {
				let (id, inserted) = coll
					.upsert(ns, &filter, &update)
					.map_err(WriteError::into_error)?;
				Ok(ChangeOutcome {
					document: return_new.then_some(inserted),
					affected: 1,
					updated_existing: false,
					upserted_id: Some(id),
				})
			}
			(Change::Update { .. } | Change::Remove, None) => Ok(ChangeOutcome::default()),
		}
	}

	async fn insert(&mut self, ns: &Namespace, docs: Vec<Document>) -> Result<()> {
		let mut store = self.store.lock();
		let coll = store.collection_mut(ns);
		for doc in docs {
			coll.insert(ns, doc).map_err(WriteError::into_error)?;
		}
		Ok(())
	}

	async fn update(
		&mut self,
		ns: &Namespace,
		filter: Document,
		update: Document,
		mode: UpdateMode,
	) -> Result<WriteOutcome> {
		let mut store = self.store.lock();
		store
			.collection_mut(ns)
			.update(ns, &filter, &update, mode)
			.map_err(|partial| partial.error.into_error())
	}

	async fn remove(&mut self, ns: &Namespace, filter: Document, multi: bool) -> Result<u64> {
		let mut store = self.store.lock();
		match store.collections.get_mut(ns) {
			Some(coll) => coll.remove(&filter, multi),
			None => Ok(0),
		}
	}

	async fn bulk(&mut self, ns: &Namespace, ops: Vec<BulkOp>) -> Result<BulkOutcome> {
		let mut store = self.store.lock();
		let coll = store.collection_mut(ns);
		let mut counts = BulkCounts::default();

		for (index, op) in ops.into_iter().enumerate() {
			let applied = match op {
				BulkOp::Insert(doc) => coll.insert(ns, doc).map(|_| counts.inserted += 1),
				BulkOp::Update {
					filter,
					update,
					multi,
					upsert,
				} => match coll.update(ns, &filter, &update, UpdateMode { multi, upsert }) {
					Ok(outcome) => {
						counts.matched += outcome.matched;
						counts.modified += outcome.modified;
						if outcome.upserted_id.is_some() {
							counts.upserted += 1;
						}
						Ok(())
					}
					Err(partial) => {
						counts.matched += partial.applied.matched;
						counts.modified += partial.applied.modified;
						Err(partial.error)
					}
				},
				BulkOp::Remove { filter, multi } => coll
					.remove(&filter, multi)
					.map(|n| counts.removed += n)
					.map_err(WriteError::from),
			};
			if let Err(err) = applied {
				return Ok(BulkOutcome {
					counts,
					failure: Some(BulkFailure {
						index,
						code: err.code,
						message: err.message,
					}),
				});
			}
		}
		Ok(BulkOutcome {
			counts,
			failure: None,
		})
	}

	async fn indexes(&mut self, ns: &Namespace) -> Result<Vec<Index>> {
		let store = self.store.lock();
		Ok(store
			.collection(ns)
			.map(|c| c.indexes.iter().map(StoredIndex::to_index).collect())
			.unwrap_or_default())
	}

	async fn ensure_index(&mut self, ns: &Namespace, index: &Index) -> Result<()> {
		let keys = index_key_document(&index.key)?;
		let name = index.name.clone().unwrap_or_else(|| index_name(&keys));
		let mut store = self.store.lock();
		let coll = store.collection_mut(ns);

		if let Some(existing) = coll.indexes.iter().find(|i| i.name == name) {
			if existing.keys == keys {
				return Ok(());
			}
			return Err(Error::Database(format!(
				"An existing index has the same name as the requested index: {}",
				name
			)));
		}

		let stored = StoredIndex {
			name,
			keys,
			unique: index.unique,
			sparse: index.sparse,
			expire_after: index.expire_after,
		};
		if stored.unique {
			let mut seen: Vec<Vec<Bson>> = Vec::new();
			for doc in &coll.docs {
				let Some(tuple) = query::index_tuple(doc, &stored.keys, stored.sparse) else {
					continue;
				};
				if seen.iter().any(|t| query::tuples_equal(t, &tuple)) {
					return Err(WriteError {
						code: DUPLICATE_KEY,
						message: format!(
							"E11000 duplicate key error collection: {} index: {}",
							ns, stored.name
						),
					}
					.into_error());
				}
				seen.push(tuple);
			}
		}
		coll.indexes.push(stored);
		Ok(())
	}

	async fn drop_index(&mut self, ns: &Namespace, name: &str) -> Result<()> {
		if name == ID_INDEX {
			return Err(Error::Database("cannot drop _id index".to_string()));
		}
		let mut store = self.store.lock();
		let Some(coll) = store.collections.get_mut(ns) else {
			return Err(Error::Database(format!("ns not found: {}", ns)));
		};
		let before = coll.indexes.len();
		coll.indexes.retain(|i| i.name != name);
		if coll.indexes.len() == before {
			return Err(Error::Database(format!("index not found with name [{}]", name)));
		}
		Ok(())
	}

	async fn run_command(&mut self, _database: &str, command: Document) -> Result<Document> {
		match command.keys().next().map(String::as_str) {
			Some("ping") => Ok(doc! { "ok": 1.0 }),
			Some(other) => Err(Error::Unsupported(format!("command {}", other))),
			None => Err(Error::InvalidArgument("empty command document".to_string())),
		}
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}
