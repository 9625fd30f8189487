//! Process-wide registry
//!
//! One [`Registry`] can be installed for the whole process. The free
//! functions in this module route to its default client, so application code
//! can call `global::find_one("users", ...)` without threading a client
//! through every layer.
//!
//! Installation happens once; there is no way to replace or remove the
//! installed registry.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongo_registry::global;
//! use mongo_registry::settings::Settings;
//! use bson::doc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mongo_registry::Result<()> {
//! let settings = Settings::from_path("config/mongo.toml")?;
//! global::init_from_settings(&settings).await?;
//!
//! let users: Vec<bson::Document> = global::find_all("users", doc! { "active": true }, &["-created"]).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bson::{Bson, Document};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bulk::{Bulk, BulkResult};
use crate::client::{Client, Page, RawCollection, Target};
use crate::driver::{Connector, Index};
use crate::error::{Error, Result};
use crate::lease::LeasedSession;
use crate::registry::Registry;
use crate::settings::Settings;

static REGISTRY: OnceCell<Registry> = OnceCell::new();

/// Install `registry` for the process
///
/// # Errors
///
/// [`Error::Config`] when a registry is already installed; `registry` is
/// dropped in that case.
pub fn install(registry: Registry) -> Result<&'static Registry> {
	REGISTRY
		.set(registry)
		.map_err(|_| Error::Config("a global registry is already installed".to_string()))?;
	tracing::info!("global registry installed");
	registry_ref()
}

fn registry_ref() -> Result<&'static Registry> {
	REGISTRY
		.get()
		.ok_or_else(|| Error::Config("no global registry installed".to_string()))
}

/// The installed registry
pub fn registry() -> Result<&'static Registry> {
	registry_ref()
}

pub fn is_installed() -> bool {
	REGISTRY.get().is_some()
}

/// Client registered under `name` in the installed registry
pub fn get(name: &str) -> Option<Arc<Client>> {
	REGISTRY.get().and_then(|r| r.get(name))
}

/// # Errors
///
/// [`Error::NoDefault`] when nothing is installed or no registration asked
/// to be the default.
pub fn default_client() -> Result<Arc<Client>> {
	REGISTRY
		.get()
		.ok_or(Error::NoDefault)
		.and_then(Registry::default_client)
}

/// Register every configured client against real deployments, then install
#[cfg(feature = "mongodb")]
pub async fn init_from_settings(settings: &Settings) -> Result<&'static Registry> {
	init_from_settings_with(Arc::new(crate::driver::mongo::MongoConnector), settings).await
}

/// Register every configured client through `connector`, then install
///
/// Nothing is installed when a registration fails.
pub async fn init_from_settings_with(
	connector: Arc<dyn Connector>,
	settings: &Settings,
) -> Result<&'static Registry> {
	if is_installed() {
		return Err(Error::Config(
			"a global registry is already installed".to_string(),
		));
	}
	let registry = Registry::with_shared_connector(connector);
	if let Err(e) = registry.setup_all(settings).await {
		registry.shutdown().await;
		return Err(e);
	}
	install(registry)
}

pub async fn ping() -> Result<()> {
	default_client()?.ping().await
}

pub async fn count<'a>(target: impl Into<Target<'a>>) -> Result<u64> {
	default_client()?.count(target).await
}

pub async fn count_where<'a>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
) -> Result<u64> {
	default_client()?.count_where(target, filter).await
}

pub async fn indexes<'a>(target: impl Into<Target<'a>>) -> Result<Vec<Index>> {
	default_client()?.indexes(target).await
}

pub async fn ensure_index<'a>(target: impl Into<Target<'a>>, index: &Index) -> Result<()> {
	default_client()?.ensure_index(target, index).await
}

pub async fn ensure_index_key<'a>(target: impl Into<Target<'a>>, keys: &[&str]) -> Result<()> {
	default_client()?.ensure_index_key(target, keys).await
}

pub async fn drop_index<'a>(target: impl Into<Target<'a>>, keys: &[&str]) -> Result<()> {
	default_client()?.drop_index(target, keys).await
}

pub async fn drop_index_name<'a>(target: impl Into<Target<'a>>, name: &str) -> Result<()> {
	default_client()?.drop_index_name(target, name).await
}

pub async fn find_one<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
) -> Result<Option<T>> {
	default_client()?.find_one(target, filter).await
}

pub async fn find_id<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	id: impl Into<Bson>,
) -> Result<Option<T>> {
	default_client()?.find_id(target, id).await
}

pub async fn find_all<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	sort: &[&str],
) -> Result<Vec<T>> {
	default_client()?.find_all(target, filter, sort).await
}

pub async fn find_range<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	skip: u64,
	limit: u64,
	sort: &[&str],
) -> Result<Vec<T>> {
	default_client()?
		.find_range(target, filter, skip, limit, sort)
		.await
}

pub async fn find_page<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	skip: u64,
	limit: u64,
	sort: &[&str],
) -> Result<Page<T>> {
	default_client()?
		.find_page(target, filter, skip, limit, sort)
		.await
}

pub async fn find_distinct<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	key: &str,
) -> Result<Vec<T>> {
	default_client()?.find_distinct(target, filter, key).await
}

pub async fn select_one<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	projection: impl Into<Option<Document>>,
) -> Result<Option<T>> {
	default_client()?
		.select_one(target, filter, projection)
		.await
}

pub async fn select_id<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	id: impl Into<Bson>,
	projection: impl Into<Option<Document>>,
) -> Result<Option<T>> {
	default_client()?.select_id(target, id, projection).await
}

pub async fn select_all<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	projection: impl Into<Option<Document>>,
	sort: &[&str],
) -> Result<Vec<T>> {
	default_client()?
		.select_all(target, filter, projection, sort)
		.await
}

pub async fn select_range<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	projection: impl Into<Option<Document>>,
	skip: u64,
	limit: u64,
	sort: &[&str],
) -> Result<Vec<T>> {
	default_client()?
		.select_range(target, filter, projection, skip, limit, sort)
		.await
}

pub async fn select_page<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	projection: impl Into<Option<Document>>,
	skip: u64,
	limit: u64,
	sort: &[&str],
) -> Result<Page<T>> {
	default_client()?
		.select_page(target, filter, projection, skip, limit, sort)
		.await
}

pub async fn find_and_update<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	update: Document,
) -> Result<(Option<T>, u64)> {
	default_client()?
		.find_and_update(target, filter, update)
		.await
}

pub async fn find_and_update_rn<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	update: Document,
) -> Result<(Option<T>, u64)> {
	default_client()?
		.find_and_update_rn(target, filter, update)
		.await
}

pub async fn find_and_upsert<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	upsert: Document,
) -> Result<(Option<T>, Option<Bson>)> {
	default_client()?
		.find_and_upsert(target, filter, upsert)
		.await
}

pub async fn find_and_upsert_rn<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
	upsert: Document,
) -> Result<(Option<T>, Option<Bson>)> {
	default_client()?
		.find_and_upsert_rn(target, filter, upsert)
		.await
}

pub async fn find_and_remove<'a, T: DeserializeOwned>(
	target: impl Into<Target<'a>>,
	filter: impl Into<Option<Document>>,
) -> Result<(Option<T>, u64)> {
	default_client()?.find_and_remove(target, filter).await
}

pub async fn insert<'a, T: Serialize>(target: impl Into<Target<'a>>, docs: &[T]) -> Result<()> {
	default_client()?.insert(target, docs).await
}

pub async fn remove_one<'a>(
	target: impl Into<Target<'a>>,
	selector: impl Into<Option<Document>>,
) -> Result<bool> {
	default_client()?.remove_one(target, selector).await
}

pub async fn remove_id<'a>(target: impl Into<Target<'a>>, id: impl Into<Bson>) -> Result<bool> {
	default_client()?.remove_id(target, id).await
}

pub async fn remove_all<'a>(
	target: impl Into<Target<'a>>,
	selector: impl Into<Option<Document>>,
) -> Result<u64> {
	default_client()?.remove_all(target, selector).await
}

pub async fn update_one<'a>(
	target: impl Into<Target<'a>>,
	selector: impl Into<Option<Document>>,
	update: Document,
) -> Result<bool> {
	default_client()?.update_one(target, selector, update).await
}

pub async fn update_id<'a>(
	target: impl Into<Target<'a>>,
	id: impl Into<Bson>,
	update: Document,
) -> Result<bool> {
	default_client()?.update_id(target, id, update).await
}

pub async fn update_all<'a>(
	target: impl Into<Target<'a>>,
	selector: impl Into<Option<Document>>,
	update: Document,
) -> Result<u64> {
	default_client()?.update_all(target, selector, update).await
}

pub async fn upsert_one<'a>(
	target: impl Into<Target<'a>>,
	selector: impl Into<Option<Document>>,
	update: Document,
) -> Result<Option<Bson>> {
	default_client()?.upsert_one(target, selector, update).await
}

pub async fn upsert_id<'a>(
	target: impl Into<Target<'a>>,
	id: impl Into<Bson>,
	update: Document,
) -> Result<Option<Bson>> {
	default_client()?.upsert_id(target, id, update).await
}

pub async fn run_bulk<'a, F>(target: impl Into<Target<'a>>, build: F) -> Result<BulkResult>
where
	F: FnOnce(&mut Bulk) -> Result<()>,
{
	default_client()?.run_bulk(target, build).await
}

pub async fn run_collection<'a, T, F>(target: impl Into<Target<'a>>, f: F) -> Result<T>
where
	F: for<'s> FnOnce(RawCollection<'s>) -> BoxFuture<'s, Result<T>>,
{
	default_client()?.run_collection(target, f).await
}

pub async fn run_session<T, F>(f: F) -> Result<T>
where
	F: for<'s> FnOnce(&'s mut LeasedSession) -> BoxFuture<'s, Result<T>>,
{
	default_client()?.run_session(f).await
}
