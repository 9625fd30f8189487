//! Staged batches executed through the facade

mod common;

use std::sync::Arc;

use bson::{Document, doc};
use common::{Item, client, items};
use mongo_registry::driver::memory::DUPLICATE_KEY;
use mongo_registry::{BulkResult, Client, Error, Index};
use rstest::rstest;

#[rstest]
#[case(3, 0)]
#[case(5, 2)]
#[case(1, 4)]
#[tokio::test]
async fn test_inserts_with_non_matching_updates(
	#[future] client: Arc<Client>,
	#[case] inserts: i32,
	#[case] updates: i32,
) {
	// Arrange
	let client = client.await;
	let staged = items(inserts);

	// Act
	let result = client
		.run_bulk("items", |bulk| {
			for item in &staged {
				bulk.insert(item)?;
			}
			for n in 0..updates {
				bulk.update_one(doc! { "_id": 1000 + n }, doc! { "$set": { "qty": 0 } });
			}
			Ok(())
		})
		.await
		.unwrap();

	// Assert
	assert_eq!(result.inserted, inserts as u64);
	assert_eq!(result.matched, 0);
	assert!(result.modified <= result.matched);
	for item in &staged {
		let found: Option<Item> = client.find_id("items", item.id).await.unwrap();
		assert_eq!(found.as_ref(), Some(item));
	}
	assert_eq!(client.stats().outstanding(), 0);
}

#[rstest]
#[tokio::test]
async fn test_mixed_batch_counts(#[future] client: Arc<Client>) {
	// Arrange
	let client = client.await;
	client.insert("items", &items(4)).await.unwrap();

	// Act
	let result = client
		.run_bulk("items", |bulk| {
			bulk.insert(&Item::new(5, "five", 5))?
				.update_one(doc! { "_id": 1 }, doc! { "$inc": { "qty": 1 } })
				.update_all(doc! { "qty": { "$gte": 3 } }, doc! { "$set": { "name": "big" } })
				.upsert(doc! { "_id": 6 }, doc! { "$set": { "qty": 6 } })
				.remove_one(doc! { "_id": 2 })
				.remove_all(doc! { "qty": { "$gt": 100 } });
			Ok(())
		})
		.await
		.unwrap();

	// Assert
	// qty >= 3 after the first update: ids 3, 4, 5
	assert_eq!(
		result,
		BulkResult {
			matched: 4,
			modified: 4,
			inserted: 1,
			removed: 1,
		}
	);
	assert_eq!(client.count("items").await.unwrap(), 5);
	let upserted: Option<Document> = client.find_id("items", 6).await.unwrap();
	assert_eq!(upserted, Some(doc! { "_id": 6, "qty": 6 }));
}

#[rstest]
#[tokio::test]
async fn test_failure_reports_index_and_applied_prefix(#[future] client: Arc<Client>) {
	// Arrange
	let client = client.await;
	client.insert("items", &items(1)).await.unwrap();

	// Act
	let result = client
		.run_bulk("items", |bulk| {
			bulk.insert(&Item::new(2, "two", 2))?
				.update_one(doc! { "_id": 2 }, doc! { "$set": { "qty": 20 } });
			bulk.insert(&Item::new(1, "again", 1))?;
			bulk.insert(&Item::new(3, "never", 3))?;
			Ok(())
		})
		.await;

	// Assert
	match result {
		Err(Error::Bulk {
			index,
			code,
			applied,
			..
		}) => {
			assert_eq!(index, 2);
			assert_eq!(code, DUPLICATE_KEY);
			assert_eq!(applied.inserted, 1);
			assert_eq!(applied.matched, 1);
			assert_eq!(applied.modified, 1);
		}
		other => panic!("expected bulk failure, got {:?}", other),
	}
	let applied: Option<Item> = client.find_id("items", 2).await.unwrap();
	let skipped: Option<Item> = client.find_id("items", 3).await.unwrap();
	assert_eq!(applied.map(|i| i.qty), Some(20));
	assert_eq!(skipped, None);
	assert_eq!(client.stats().outstanding(), 0);
}

#[rstest]
#[tokio::test]
async fn test_multi_update_failure_counts_documents_already_changed(
	#[future] client: Arc<Client>,
) {
	// Arrange
	let client = client.await;
	let unique = Index {
		key: vec!["u".to_string()],
		unique: true,
		..Index::default()
	};
	client.ensure_index("slots", &unique).await.unwrap();
	client
		.insert("slots", &[doc! { "_id": 1, "u": 1 }, doc! { "_id": 2, "u": 2 }])
		.await
		.unwrap();

	// Act
	let result = client
		.run_bulk("slots", |bulk| {
			bulk.update_all(None, doc! { "$set": { "u": 5 } });
			Ok(())
		})
		.await;

	// Assert
	match result {
		Err(Error::Bulk {
			index,
			code,
			applied,
			..
		}) => {
			assert_eq!(index, 0);
			assert_eq!(code, DUPLICATE_KEY);
			assert_eq!(applied.matched, 1);
			assert_eq!(applied.modified, 1);
		}
		other => panic!("expected bulk failure, got {:?}", other),
	}
	let first: Option<Document> = client.find_id("slots", 1).await.unwrap();
	let second: Option<Document> = client.find_id("slots", 2).await.unwrap();
	assert_eq!(first, Some(doc! { "_id": 1, "u": 5 }));
	assert_eq!(second, Some(doc! { "_id": 2, "u": 2 }));
}

#[rstest]
#[tokio::test]
async fn test_replacement_multi_update_fails_in_batch(#[future] client: Arc<Client>) {
	// Arrange
	let client = client.await;
	client.insert("items", &items(2)).await.unwrap();

	// Act
	let result = client
		.run_bulk("items", |bulk| {
			bulk.update_all(None, doc! { "name": "replaced" });
			Ok(())
		})
		.await;

	// Assert
	assert!(matches!(result, Err(Error::Bulk { index: 0, .. })));
}

#[rstest]
#[tokio::test]
async fn test_empty_batch_is_noop(#[future] client: Arc<Client>) {
	// Arrange
	let client = client.await;

	// Act
	let result = client.run_bulk("items", |_| Ok(())).await.unwrap();

	// Assert
	assert_eq!(result, BulkResult::default());
	assert_eq!(client.count("items").await.unwrap(), 0);
}

#[rstest]
#[tokio::test]
async fn test_batch_targets_explicit_database(#[future] client: Arc<Client>) {
	// Arrange
	let client = client.await;

	// Act
	client
		.run_bulk(("audit", "events"), |bulk| {
			bulk.insert(&doc! { "_id": 1 })?
				.insert(&doc! { "_id": 2 })?;
			Ok(())
		})
		.await
		.unwrap();

	// Assert
	assert_eq!(client.count(("audit", "events")).await.unwrap(), 2);
	assert_eq!(client.count("events").await.unwrap(), 0);
}
