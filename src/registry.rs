//! Client registry
//!
//! Maps client names to shared [`Client`] handles and tracks one default.
//! Each name goes from unregistered to registered exactly once; there is no
//! update or deregistration. Registrations are serialized, lookups only take
//! a read lock.
//!
//! # Example
//!
//! ```rust
//! use mongo_registry::descriptor::ConnectionOptions;
//! use mongo_registry::driver::memory::MemoryConnector;
//! use mongo_registry::registry::Registry;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mongo_registry::Result<()> {
//! let registry = Registry::with_connector(MemoryConnector::new());
//! let options = ConnectionOptions::new().address("memory:registry");
//! let client = registry.setup("main, reporting", options, true).await?;
//!
//! assert!(Arc::ptr_eq(&registry.get("reporting").unwrap(), &client));
//! assert!(Arc::ptr_eq(&registry.default_client()?, &client));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::Client;
use crate::descriptor::ConnectionOptions;
use crate::driver::Connector;
use crate::error::{Error, Result};
use crate::settings::Settings;

/// Name → client mapping with one optional default
pub struct Registry {
	clients: RwLock<HashMap<String, Arc<Client>>>,
	default: RwLock<Option<Arc<Client>>>,
	registration: tokio::sync::Mutex<()>,
	connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for Registry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Registry")
			.field("names", &self.names())
			.field("has_default", &self.default.read().is_some())
			.finish()
	}
}

#[cfg(feature = "mongodb")]
impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

/// Split a comma-separated alias list: trimmed, blanks dropped, first
/// occurrence kept
fn split_names(names: &str) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();
	for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
		if !out.iter().any(|seen| seen == name) {
			out.push(name.to_string());
		}
	}
	out
}

impl Registry {
	/// Registry dialing real deployments
	#[cfg(feature = "mongodb")]
	pub fn new() -> Self {
		Self::with_connector(crate::driver::mongo::MongoConnector)
	}

	/// Registry dialing through `connector`
	pub fn with_connector(connector: impl Connector + 'static) -> Self {
		Self::with_shared_connector(Arc::new(connector))
	}

	pub fn with_shared_connector(connector: Arc<dyn Connector>) -> Self {
		Self {
			clients: RwLock::new(HashMap::new()),
			default: RwLock::new(None),
			registration: tokio::sync::Mutex::new(()),
			connector,
		}
	}

	/// Register one client under every alias in `names`
	///
	/// `names` is a comma-separated alias list. The options are merged, the
	/// endpoint is dialed once, and the resulting client is shared by all
	/// aliases. With `make_default` the client also becomes the default.
	///
	/// # Errors
	///
	/// - [`Error::Config`] when `names` holds no alias or the options do not
	///   merge;
	/// - [`Error::DuplicateName`] when any alias is already registered;
	/// - any dial error from the connector.
	///
	/// On error nothing is registered and the default is unchanged.
	pub async fn setup(
		&self,
		names: &str,
		options: ConnectionOptions,
		make_default: bool,
	) -> Result<Arc<Client>> {
		let aliases = split_names(names);
		if aliases.is_empty() {
			return Err(Error::Config(format!("no client name in {:?}", names)));
		}

		let _guard = self.registration.lock().await;

		{
			let clients = self.clients.read();
			if let Some(taken) = aliases.iter().find(|a| clients.contains_key(*a)) {
				return Err(Error::DuplicateName(taken.clone()));
			}
		}

		let descriptor = options.merge()?;
		let uri = descriptor.redacted_uri();
		let client = Arc::new(Client::connect(self.connector.as_ref(), descriptor).await?);

		{
			let mut clients = self.clients.write();
			for alias in &aliases {
				clients.insert(alias.clone(), Arc::clone(&client));
			}
		}
		if make_default {
			*self.default.write() = Some(Arc::clone(&client));
		}

		tracing::info!(
			names = %aliases.join(","),
			uri = %uri,
			default = make_default,
			"client registered"
		);
		Ok(client)
	}

	/// Register every configured record, stopping at the first failure
	pub async fn setup_all(&self, settings: &Settings) -> Result<()> {
		for config in &settings.mongo {
			self.setup(&config.key, config.options()?, config.default)
				.await?;
		}
		Ok(())
	}

	/// Client registered under `name`; `""` resolves to the default
	pub fn get(&self, name: &str) -> Option<Arc<Client>> {
		if name.is_empty() {
			return self.default.read().clone();
		}
		self.clients.read().get(name).cloned()
	}

	/// # Errors
	///
	/// [`Error::NoDefault`] when no registration asked to be the default.
	pub fn default_client(&self) -> Result<Arc<Client>> {
		self.default.read().clone().ok_or(Error::NoDefault)
	}

	/// Registered names, sorted
	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
		names.sort();
		names
	}

	/// Shut every distinct client down once
	///
	/// Registrations stay in place; later operations on a shut-down client
	/// fail with a connection error.
	pub async fn shutdown(&self) {
		let mut distinct: Vec<Arc<Client>> = Vec::new();
		for client in self.clients.read().values() {
			if !distinct.iter().any(|c| Arc::ptr_eq(c, client)) {
				distinct.push(Arc::clone(client));
			}
		}
		for client in distinct {
			client.shutdown().await;
		}
		tracing::info!("registry shut down");
	}
}
