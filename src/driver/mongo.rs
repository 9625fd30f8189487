//! Production driver backed by the official `mongodb` crate
//!
//! A [`MongoDriver`] owns one `mongodb::Client`, which is the shared
//! connection pool. Each lease starts a `ClientSession` and threads it
//! through every command issued on that lease. Sessions are causally
//! consistent, which is what monotonic reads rely on.
//!
//! Find-and-modify and bulk writes go through raw commands so that the full
//! server reply (`lastErrorObject`, per-statement `writeErrors`) is
//! available to the facade.

use std::any::Any;
use std::sync::Arc;

use ::mongodb::error::ErrorKind;
use ::mongodb::options::{
	ClientOptions, FindOptions, IndexOptions, ReplaceOptions, UpdateOptions,
};
use ::mongodb::{Client, ClientSession, Collection, IndexModel};
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::stream::TryStreamExt;

use super::{
	BulkCounts, BulkFailure, BulkOp, BulkOutcome, Change, ChangeOutcome, Connector, Driver,
	FindQuery, Index, Namespace, Session, UpdateMode, WriteOutcome, count_field,
	is_operator_update,
};
use crate::descriptor::{Descriptor, SafetyPolicy};
use crate::error::{Error, Result};
use crate::keys::{index_key_document, index_key_fields};

/// Statements per raw write command
const MAX_BATCH: usize = 1000;

/// Dials real deployments
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
	async fn connect(&self, descriptor: &Descriptor) -> Result<Arc<dyn Driver>> {
		Ok(Arc::new(MongoDriver::connect(descriptor).await?))
	}
}

/// One shared `mongodb::Client`
pub struct MongoDriver {
	client: Client,
	safety: SafetyPolicy,
}

impl MongoDriver {
	/// Build the pool and verify at least one member answers `ping` within
	/// the connect timeout
	pub async fn connect(descriptor: &Descriptor) -> Result<Self> {
		let options = ClientOptions::parse(descriptor.connection_uri())
			.await
			.map_err(|e| Error::Connection(e.to_string()))?;

		let client =
			Client::with_options(options).map_err(|e| Error::Connection(e.to_string()))?;

		client
			.database("admin")
			.run_command(doc! { "ping": 1 })
			.await
			.map_err(|e| {
				Error::Connection(format!(
					"{} unreachable: {}",
					descriptor.redacted_uri(),
					e
				))
			})?;

		Ok(Self {
			client,
			safety: descriptor.safety.clone(),
		})
	}

	/// The underlying driver client
	pub fn client(&self) -> &Client {
		&self.client
	}
}

#[async_trait]
impl Driver for MongoDriver {
	async fn session(&self) -> Result<Box<dyn Session>> {
		let session = self.client.start_session().await.map_err(|e| {
			Error::Connection(format!("Failed to start MongoDB session: {}", e))
		})?;
		Ok(Box::new(MongoSession {
			client: self.client.clone(),
			session,
			safety: self.safety.clone(),
		}))
	}

	async fn shutdown(&self) {
		self.client.clone().shutdown().await;
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// A leased `ClientSession` plus the client it belongs to
pub struct MongoSession {
	client: Client,
	session: ClientSession,
	safety: SafetyPolicy,
}

impl MongoSession {
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// The driver session every call on this lease runs in
	pub fn client_session(&mut self) -> &mut ClientSession {
		&mut self.session
	}

	pub fn collection(&self, ns: &Namespace) -> Collection<Document> {
		self.client
			.database(&ns.database)
			.collection::<Document>(&ns.collection)
	}

	fn write_command(&self, mut command: Document) -> Document {
		command.insert("writeConcern", self.safety.write_concern());
		command
	}

	async fn run_group(
		&mut self,
		ns: &Namespace,
		ops: &[BulkOp],
		offset: usize,
		counts: &mut BulkCounts,
	) -> Result<Option<BulkFailure>> {
		let kind = ops[0].kind();
		let statements: Vec<Document> = ops
			.iter()
			.map(|op| match op {
				BulkOp::Insert(doc) => doc.clone(),
				BulkOp::Update {
					filter,
					update,
					multi,
					upsert,
				} => doc! {
					"q": filter.clone(),
					"u": update.clone(),
					"multi": *multi,
					"upsert": *upsert,
				},
				BulkOp::Remove { filter, multi } => {
					let limit = if *multi { 0 } else { 1 };
					doc! { "q": filter.clone(), "limit": limit }
				}
			})
			.collect();

		let field = match kind {
			"insert" => "documents",
			"update" => "updates",
			_ => "deletes",
		};
		let mut command = Document::new();
		command.insert(kind, ns.collection.as_str());
		command.insert(field, statements);
		command.insert("ordered", true);
		let command = self.write_command(command);

		let reply = self.run_command(&ns.database, command).await?;
		let n = count_field(&reply, "n");
		match kind {
			"insert" => counts.inserted += n,
			"update" => {
				let upserted = reply
					.get("upserted")
					.and_then(Bson::as_array)
					.map_or(0, |u| u.len() as u64);
				counts.upserted += upserted;
				counts.matched += n.saturating_sub(upserted);
				counts.modified += count_field(&reply, "nModified");
			}
			_ => counts.removed += n,
		}

		if let Some(first) = reply
			.get("writeErrors")
			.and_then(Bson::as_array)
			.and_then(|errors| errors.first())
			.and_then(Bson::as_document)
		{
			return Ok(Some(BulkFailure {
				index: offset + count_field(first, "index") as usize,
				code: first.get_i32("code").unwrap_or_default(),
				message: first.get_str("errmsg").unwrap_or_default().to_string(),
			}));
		}
		if let Some(wc) = reply.get("writeConcernError").and_then(Bson::as_document) {
			return Ok(Some(BulkFailure {
				index: offset + ops.len() - 1,
				code: wc.get_i32("code").unwrap_or_default(),
				message: wc.get_str("errmsg").unwrap_or_default().to_string(),
			}));
		}
		Ok(None)
	}
}

/// Failure for a write group whose command itself errored, attributed to
/// the group's first operation. Codes are taken from server command errors;
/// anything else (network, selection) reports code 0.
fn command_failure(index: usize, err: &Error) -> BulkFailure {
	let code = match err {
		Error::Driver(driver) => match driver.kind.as_ref() {
			ErrorKind::Command(command) => command.code,
			_ => 0,
		},
		_ => 0,
	};
	BulkFailure {
		index,
		code,
		message: err.to_string(),
	}
}

fn index_from_model(model: IndexModel) -> Index {
	let options = model.options.unwrap_or_default();
	Index {
		key: index_key_fields(&model.keys),
		name: options.name,
		unique: options.unique.unwrap_or(false),
		sparse: options.sparse.unwrap_or(false),
		expire_after: options.expire_after,
	}
}

#[async_trait]
impl Session for MongoSession {
	async fn count(&mut self, ns: &Namespace, filter: Document) -> Result<u64> {
		let coll = self.collection(ns);
		Ok(coll.count_documents(filter).session(&mut self.session).await?)
	}

	async fn find(&mut self, ns: &Namespace, query: FindQuery) -> Result<Vec<Document>> {
		let coll = self.collection(ns);

		let mut mongo_options = FindOptions::default();
		mongo_options.limit = query.limit;
		mongo_options.skip = query.skip;
		mongo_options.sort = query.sort;
		mongo_options.projection = query.projection;

		let mut cursor = coll
			.find(query.filter)
			.with_options(mongo_options)
			.session(&mut self.session)
			.await?;

		Ok(cursor.stream(&mut self.session).try_collect().await?)
	}

	async fn distinct(&mut self, ns: &Namespace, key: &str, filter: Document) -> Result<Vec<Bson>> {
		let coll = self.collection(ns);
		Ok(coll.distinct(key, filter).session(&mut self.session).await?)
	}

	async fn find_and_modify(
		&mut self,
		ns: &Namespace,
		filter: Document,
		change: Change,
	) -> Result<ChangeOutcome> {
		let mut command = doc! {
			"findAndModify": ns.collection.as_str(),
			"query": filter,
		};
		match change {
			Change::Update { update, return_new } => {
				command.insert("update", update);
				command.insert("new", return_new);
			}
			Change::Upsert { update, return_new } => {
				command.insert("update", update);
				command.insert("new", return_new);
				command.insert("upsert", true);
			}
			Change::Remove => {
				command.insert("remove", true);
			}
		}
		let command = self.write_command(command);
		let reply = self.run_command(&ns.database, command).await?;

		let last = reply
			.get("lastErrorObject")
			.and_then(Bson::as_document)
			.cloned()
			.unwrap_or_default();
		let document = match reply.get("value") {
			Some(Bson::Document(value)) => Some(value.clone()),
			_ => None,
		};

		Ok(ChangeOutcome {
			document,
			affected: count_field(&last, "n"),
			updated_existing: last.get_bool("updatedExisting").unwrap_or(false),
			upserted_id: last.get("upserted").cloned(),
		})
	}

	async fn insert(&mut self, ns: &Namespace, docs: Vec<Document>) -> Result<()> {
		let coll = self.collection(ns);
		coll.insert_many(docs).session(&mut self.session).await?;
		Ok(())
	}

	async fn update(
		&mut self,
		ns: &Namespace,
		filter: Document,
		update: Document,
		mode: UpdateMode,
	) -> Result<WriteOutcome> {
		let coll = self.collection(ns);

		let result = if is_operator_update(&update) {
			let mut options = UpdateOptions::default();
			options.upsert = Some(mode.upsert);
			if mode.multi {
				coll.update_many(filter, update)
					.with_options(options)
					.session(&mut self.session)
					.await?
			} else {
				coll.update_one(filter, update)
					.with_options(options)
					.session(&mut self.session)
					.await?
			}
		} else {
			if mode.multi {
				return Err(Error::InvalidArgument(
					"replacement documents apply to a single document".to_string(),
				));
			}
			let mut options = ReplaceOptions::default();
			options.upsert = Some(mode.upsert);
			coll.replace_one(filter, update)
				.with_options(options)
				.session(&mut self.session)
				.await?
		};

		Ok(WriteOutcome {
			matched: result.matched_count,
			modified: result.modified_count,
			upserted_id: result.upserted_id,
		})
	}

	async fn remove(&mut self, ns: &Namespace, filter: Document, multi: bool) -> Result<u64> {
		let coll = self.collection(ns);
		let result = if multi {
			coll.delete_many(filter).session(&mut self.session).await?
		} else {
			coll.delete_one(filter).session(&mut self.session).await?
		};
		Ok(result.deleted_count)
	}

	async fn bulk(&mut self, ns: &Namespace, ops: Vec<BulkOp>) -> Result<BulkOutcome> {
		let mut counts = BulkCounts::default();
		let mut start = 0;

		while start < ops.len() {
			let kind = ops[start].kind();
			let mut end = start + 1;
			while end < ops.len() && end - start < MAX_BATCH && ops[end].kind() == kind {
				end += 1;
			}

			let failure = match self.run_group(ns, &ops[start..end], start, &mut counts).await {
				Ok(failure) => failure,
				// Earlier groups were applied by the server; report them
				Err(err) => Some(command_failure(start, &err)),
			};
			if let Some(failure) = failure {
				return Ok(BulkOutcome {
					counts,
					failure: Some(failure),
				});
			}
			start = end;
		}

		Ok(BulkOutcome {
			counts,
			failure: None,
		})
	}

	async fn indexes(&mut self, ns: &Namespace) -> Result<Vec<Index>> {
		let coll = self.collection(ns);
		let mut cursor = coll.list_indexes().session(&mut self.session).await?;
		let models: Vec<IndexModel> = cursor.stream(&mut self.session).try_collect().await?;
		Ok(models.into_iter().map(index_from_model).collect())
	}

	async fn ensure_index(&mut self, ns: &Namespace, index: &Index) -> Result<()> {
		let keys = index_key_document(&index.key)?;

		let mut options = IndexOptions::default();
		options.name = index.name.clone();
		options.unique = index.unique.then_some(true);
		options.sparse = index.sparse.then_some(true);
		options.expire_after = index.expire_after;

		let model = IndexModel::builder().keys(keys).options(options).build();
		let coll = self.collection(ns);
		coll.create_index(model).session(&mut self.session).await?;
		Ok(())
	}

	async fn drop_index(&mut self, ns: &Namespace, name: &str) -> Result<()> {
		let coll = self.collection(ns);
		coll.drop_index(name).session(&mut self.session).await?;
		Ok(())
	}

	async fn run_command(&mut self, database: &str, command: Document) -> Result<Document> {
		Ok(self
			.client
			.database(database)
			.run_command(command)
			.session(&mut self.session)
			.await?)
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_command_failure_points_at_group_start() {
		// Arrange
		let err = Error::Connection("connection reset by peer".to_string());

		// Act
		let failure = command_failure(2, &err);

		// Assert
		assert_eq!(failure.index, 2);
		assert_eq!(failure.code, 0);
		assert!(failure.message.contains("connection reset"));
	}
}
