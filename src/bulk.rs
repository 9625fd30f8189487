//! Staged heterogeneous writes
//!
//! A [`Bulk`] collects inserts, updates, upserts and removals in call order.
//! [`Client::run_bulk`](crate::client::Client::run_bulk) executes the staged
//! batch ordered on one lease: it stops at the first failing sub-operation
//! and nothing already applied is rolled back.
//!
//! # Example
//!
//! ```rust
//! use mongo_registry::bulk::Bulk;
//! use bson::doc;
//!
//! let mut bulk = Bulk::new();
//! bulk.insert(&doc! { "_id": 1, "qty": 5 })
//!     .unwrap()
//!     .update_one(doc! { "_id": 1 }, doc! { "$inc": { "qty": 1 } })
//!     .remove_all(doc! { "qty": 0 });
//! assert_eq!(bulk.len(), 3);
//! ```

use bson::Document;
use serde::Serialize;

use crate::driver::{BulkCounts, BulkOp, Namespace, Session};
use crate::error::{Error, Result};

/// Aggregate counts of an executed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkResult {
	/// Documents matched by update and upsert statements, upserts excluded
	pub matched: u64,
	/// Documents actually changed; never more than `matched`
	pub modified: u64,
	pub inserted: u64,
	pub removed: u64,
}

impl From<BulkCounts> for BulkResult {
	fn from(counts: BulkCounts) -> Self {
		Self {
			matched: counts.matched,
			modified: counts.modified,
			inserted: counts.inserted,
			removed: counts.removed,
		}
	}
}

/// Ordered batch under construction
#[derive(Debug, Clone, Default)]
pub struct Bulk {
	ops: Vec<BulkOp>,
}

impl Bulk {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stage one insert
	///
	/// # Errors
	///
	/// [`Error::Serialization`] when `doc` does not serialize to a document.
	pub fn insert<T: Serialize>(&mut self, doc: &T) -> Result<&mut Self> {
		self.ops.push(BulkOp::Insert(bson::serialize_to_document(doc)?));
		Ok(self)
	}

	/// Stage an update of the first match, inserting when nothing matches
	pub fn upsert(
		&mut self,
		selector: impl Into<Option<Document>>,
		update: Document,
	) -> &mut Self {
		self.push_update(selector, update, false, true)
	}

	pub fn update_one(
		&mut self,
		selector: impl Into<Option<Document>>,
		update: Document,
	) -> &mut Self {
		self.push_update(selector, update, false, false)
	}

	pub fn update_all(
		&mut self,
		selector: impl Into<Option<Document>>,
		update: Document,
	) -> &mut Self {
		self.push_update(selector, update, true, false)
	}

	pub fn remove_one(&mut self, selector: impl Into<Option<Document>>) -> &mut Self {
		self.ops.push(BulkOp::Remove {
			filter: selector.into().unwrap_or_default(),
			multi: false,
		});
		self
	}

	pub fn remove_all(&mut self, selector: impl Into<Option<Document>>) -> &mut Self {
		self.ops.push(BulkOp::Remove {
			filter: selector.into().unwrap_or_default(),
			multi: true,
		});
		self
	}

	fn push_update(
		&mut self,
		selector: impl Into<Option<Document>>,
		update: Document,
		multi: bool,
		upsert: bool,
	) -> &mut Self {
		self.ops.push(BulkOp::Update {
			filter: selector.into().unwrap_or_default(),
			update,
			multi,
			upsert,
		});
		self
	}

	pub fn len(&self) -> usize {
		self.ops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	/// Staged sub-operations in execution order
	pub fn ops(&self) -> &[BulkOp] {
		&self.ops
	}

	/// Execute on `session`; an empty batch makes no round trip
	pub(crate) async fn execute(self, session: &mut dyn Session, ns: &Namespace) -> Result<BulkResult> {
		if self.ops.is_empty() {
			return Ok(BulkResult::default());
		}

		let staged = self.ops.len();
		let outcome = session.bulk(ns, self.ops).await?;
		let applied = BulkResult::from(outcome.counts);

		match outcome.failure {
			None => {
				tracing::debug!(namespace = %ns, staged, ?applied, "bulk applied");
				Ok(applied)
			}
			Some(failure) => {
				tracing::warn!(
					namespace = %ns,
					index = failure.index,
					code = failure.code,
					staged,
					"bulk stopped at failing operation: {}",
					failure.message
				);
				Err(Error::Bulk {
					index: failure.index,
					code: failure.code,
					message: failure.message,
					applied,
				})
			}
		}
	}
}
