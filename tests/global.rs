//! Process-wide registry surface
//!
//! The installed registry lives for the whole test binary, so every test
//! here is serialized and installs through [`installed`].

mod common;

use std::sync::Arc;

use bson::{Bson, Document, doc};
use common::{Item, items};
use mongo_registry::driver::memory::MemoryConnector;
use mongo_registry::{ConnectionOptions, Error, Page, Registry, Settings, global};
use rstest::rstest;
use serial_test::serial;

async fn installed() -> &'static Registry {
	if let Ok(registry) = global::registry() {
		return registry;
	}
	let registry = Registry::with_connector(MemoryConnector::new());
	registry
		.setup(
			"main,primary",
			ConnectionOptions::new()
				.address("memory:global")
				.database("app"),
			true,
		)
		.await
		.unwrap();
	registry
		.setup("side", ConnectionOptions::new().address("memory:side"), false)
		.await
		.unwrap();
	global::install(registry).unwrap()
}

#[rstest]
#[serial]
#[tokio::test]
async fn test_free_functions_route_to_default() {
	// Arrange
	installed().await;
	global::remove_all("g_items", None).await.unwrap();

	// Act
	global::insert("g_items", &items(4)).await.unwrap();
	let found: Option<Item> = global::find_id("g_items", 2).await.unwrap();
	let page: Page<Item> = global::find_page("g_items", None, 1, 2, &["-qty"])
		.await
		.unwrap();
	let upserted = global::upsert_id("g_items", 9, doc! { "$set": { "qty": 9 } })
		.await
		.unwrap();

	// Assert
	assert_eq!(found.map(|i| i.name), Some("item-2".to_string()));
	assert_eq!(page.total, 4);
	assert_eq!(page.items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![3, 2]);
	assert_eq!(upserted, Some(Bson::Int32(9)));
	let default = global::default_client().unwrap();
	assert_eq!(
		default.count(("app", "g_items")).await.unwrap(),
		global::count("g_items").await.unwrap()
	);
	assert_eq!(default.stats().outstanding(), 0);
}

#[rstest]
#[serial]
#[tokio::test]
async fn test_find_and_modify_through_global() {
	// Arrange
	installed().await;
	global::remove_all("g_counters", None).await.unwrap();
	global::insert("g_counters", &[doc! { "_id": "hits", "n": 1 }])
		.await
		.unwrap();

	// Act
	let (after, _): (Option<Document>, u64) =
		global::find_and_update_rn("g_counters", doc! { "_id": "hits" }, doc! { "$inc": { "n": 1 } })
			.await
			.unwrap();
	let missing: Result<(Option<Document>, u64), _> =
		global::find_and_update("g_counters", doc! { "_id": "nope" }, doc! { "$inc": { "n": 1 } })
			.await;
	let bulk = global::run_bulk("g_counters", |bulk| {
		bulk.update_all(None, doc! { "$inc": { "n": 10 } });
		Ok(())
	})
	.await
	.unwrap();

	// Assert
	assert_eq!(after, Some(doc! { "_id": "hits", "n": 2 }));
	assert!(matches!(missing, Err(Error::NotFound)));
	assert_eq!(bulk.modified, 1);
}

#[rstest]
#[serial]
#[tokio::test]
async fn test_aliases_resolve_through_global() {
	// Arrange
	installed().await;

	// Act
	let main = global::get("main").unwrap();
	let primary = global::get("primary").unwrap();
	let side = global::get("side").unwrap();
	let default = global::get("").unwrap();

	// Assert
	assert!(Arc::ptr_eq(&main, &primary));
	assert!(Arc::ptr_eq(&main, &default));
	assert!(!Arc::ptr_eq(&main, &side));
	assert!(global::get("unknown").is_none());
}

#[rstest]
#[serial]
#[tokio::test]
async fn test_second_install_is_rejected() {
	// Arrange
	let first = installed().await;

	// Act
	let again = global::install(Registry::with_connector(MemoryConnector::new()));
	let from_settings = global::init_from_settings_with(
		Arc::new(MemoryConnector::new()),
		&Settings::default(),
	)
	.await;

	// Assert
	assert!(matches!(again, Err(Error::Config(_))));
	assert!(matches!(from_settings, Err(Error::Config(_))));
	assert!(std::ptr::eq(global::registry().unwrap(), first));
	assert!(global::is_installed());
}
