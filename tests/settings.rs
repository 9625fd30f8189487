//! Startup from configuration files

mod common;

use std::time::Duration;

use common::memory_registry;
use mongo_registry::{Error, ReadMode, Settings};
use rstest::rstest;

const TOML: &str = r#"
[[mongo]]
key = "main"
address = ["memory:toml"]
database = "app"
username = "svc"
password = "hunter2"
source = "admin"
mode = "strong"
connectTimeout = "5s"
readTimeout = "250ms"
writeTimeout = 0
keepalive = "1m"
maxPoolSize = 8
maxPoolWaitTimeMS = 100
default = true

[[mongo]]
key = "legacy"
address = "memory:legacy"
mode = 1

[mongo.safe]
W = 2
WTimeout = 3000
J = true
"#;

#[rstest]
#[tokio::test]
async fn test_registry_from_toml_file() {
	// Arrange
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("mongo.toml");
	std::fs::write(&path, TOML).unwrap();
	let (_, registry) = memory_registry();

	// Act
	let settings = Settings::from_path(&path).unwrap();
	registry.setup_all(&settings).await.unwrap();

	// Assert
	let main = registry.default_client().unwrap();
	let descriptor = main.descriptor();
	assert_eq!(descriptor.database, "app");
	assert_eq!(descriptor.mode, ReadMode::Strong);
	assert_eq!(descriptor.timeouts.connect, Duration::from_secs(5));
	assert_eq!(descriptor.timeouts.read, Duration::from_millis(250));
	assert_eq!(descriptor.timeouts.write, Duration::ZERO);
	assert_eq!(descriptor.keepalive, Duration::from_secs(60));
	assert_eq!(descriptor.pool.max_size, Some(8));
	assert_eq!(descriptor.pool.max_wait, Some(Duration::from_millis(100)));
	assert!(!descriptor.redacted_uri().contains("hunter2"));

	let legacy = registry.get("legacy").unwrap();
	let descriptor = legacy.descriptor();
	assert_eq!(descriptor.mode, ReadMode::Monotonic);
	assert_eq!(descriptor.database, "test");
	assert_eq!(descriptor.safety.w, Some(2));
	assert_eq!(descriptor.safety.wtimeout, Some(Duration::from_secs(3)));
	assert!(descriptor.safety.journal);
	assert_eq!(descriptor.pool.max_size, Some(16));
}

#[rstest]
#[tokio::test]
async fn test_zero_write_timeout_still_writes() {
	// Arrange
	let settings = Settings::from_toml_str(TOML).unwrap();
	let (_, registry) = memory_registry();
	registry.setup_all(&settings).await.unwrap();
	let main = registry.get("main").unwrap();

	// Act
	let result = main.insert("items", &[bson::doc! { "_id": 1 }]).await;

	// Assert
	assert!(result.is_ok());
}

#[rstest]
#[case("[[mongo]]\nkey = \"k\"\naddress = [\"h:1\"]\nreadTimeout = \"soon\"\n")]
#[case("[[mongo]]\naddress = [\"h:1\"]\n")]
#[case("mongo = 5\n")]
fn test_malformed_toml_is_config_error(#[case] text: &str) {
	let result = Settings::from_toml_str(text);
	assert!(matches!(result, Err(Error::Config(_))));
}

#[rstest]
fn test_missing_file_is_config_error() {
	// Arrange
	let dir = tempfile::tempdir().unwrap();

	// Act
	let result = Settings::from_path(dir.path().join("absent.yaml"));

	// Assert
	assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("absent.yaml")));
}
