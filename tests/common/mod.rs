//! Shared fixtures for the in-memory test-suite

#![allow(dead_code)]

use std::sync::Arc;

use mongo_registry::driver::memory::MemoryConnector;
use mongo_registry::{Client, ConnectionOptions, Registry};
use rstest::fixture;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
	#[serde(rename = "_id")]
	pub id: i32,
	pub name: String,
	pub qty: i32,
}

impl Item {
	pub fn new(id: i32, name: &str, qty: i32) -> Self {
		Self {
			id,
			name: name.to_string(),
			qty,
		}
	}
}

/// `count` items with ids `1..=count` and `qty == id`
pub fn items(count: i32) -> Vec<Item> {
	(1..=count)
		.map(|i| Item::new(i, &format!("item-{}", i), i))
		.collect()
}

/// Registry over a fresh in-memory connector
pub fn memory_registry() -> (MemoryConnector, Registry) {
	let connector = MemoryConnector::new();
	let registry = Registry::with_connector(connector.clone());
	(connector, registry)
}

/// Client with its own in-memory store and database `app`
#[fixture]
pub async fn client() -> Arc<Client> {
	let (_, registry) = memory_registry();
	registry
		.setup(
			"main",
			ConnectionOptions::new()
				.address("memory:fixture")
				.database("app"),
			true,
		)
		.await
		.unwrap()
}

/// Client whose lease pool holds at most `max` sessions
pub async fn bounded_client(max: u32, wait: std::time::Duration) -> Arc<Client> {
	let (_, registry) = memory_registry();
	registry
		.setup(
			"bounded",
			ConnectionOptions::new()
				.address("memory:bounded")
				.max_pool_size(max)
				.max_pool_wait(wait),
			true,
		)
		.await
		.unwrap()
}
