//! Startup configuration records
//!
//! Clients are declared under a top-level `mongo` list. Every record becomes
//! one [`Registry::setup`](crate::registry::Registry::setup) call.
//!
//! ```yaml
//! mongo:
//!   - key: main,reporting
//!     address: ["db1:27017", "db2:27017"]
//!     database: app
//!     username: svc
//!     password: s3cret
//!     source: admin
//!     safe: { wmode: majority, wtimeout: 5000, j: true }
//!     mode: secondaryPreferred
//!     connectTimeout: 10s
//!     readTimeout: 30s
//!     maxPoolSize: 32
//!     maxPoolWaitTimeMS: 2000
//!     default: true
//! ```
//!
//! Durations accept humantime strings (`"1m"`, `"250ms"`) or integer
//! milliseconds. `mode` accepts a name or a numeric code.

use std::path::Path;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::descriptor::{ConnectionOptions, ReadMode, SafetyPolicy};
use crate::error::{Error, Result};

/// Pool size applied when a record leaves `maxPoolSize` out
pub const DEFAULT_MAX_POOL_SIZE: u32 = 16;

fn default_max_pool_size() -> u32 {
	DEFAULT_MAX_POOL_SIZE
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
	Millis(u64),
	Text(String),
}

fn optional_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
	D: Deserializer<'de>,
{
	match Option::<RawDuration>::deserialize(deserializer)? {
		None => Ok(None),
		Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
		Some(RawDuration::Text(text)) => humantime::parse_duration(text.trim())
			.map(Some)
			.map_err(D::Error::custom),
	}
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
	One(String),
	Many(Vec<String>),
}

fn addresses<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(match OneOrMany::deserialize(deserializer)? {
		OneOrMany::One(address) => vec![address],
		OneOrMany::Many(list) => list,
	})
}

/// Read mode as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ModeSpec {
	Code(i64),
	Name(String),
}

impl ModeSpec {
	pub fn to_mode(&self) -> Result<ReadMode> {
		match self {
			ModeSpec::Code(code) => ReadMode::from_code(*code),
			ModeSpec::Name(name) => name.parse(),
		}
	}
}

/// The `safe` map; capitalized keys are accepted as aliases
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SafeConfig {
	#[serde(default, alias = "W")]
	pub w: Option<u32>,
	#[serde(default, alias = "WMode")]
	pub wmode: Option<String>,
	#[serde(default, alias = "RMode")]
	pub rmode: Option<String>,
	#[serde(default, alias = "WTimeout", deserialize_with = "optional_duration")]
	pub wtimeout: Option<Duration>,
	#[serde(default, alias = "FSync")]
	pub fsync: bool,
	#[serde(default, alias = "J")]
	pub j: bool,
}

impl From<SafeConfig> for SafetyPolicy {
	fn from(safe: SafeConfig) -> Self {
		SafetyPolicy {
			w: safe.w,
			wmode: safe.wmode,
			rmode: safe.rmode,
			wtimeout: safe.wtimeout,
			fsync: safe.fsync,
			journal: safe.j,
		}
	}
}

/// One `mongo` record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
	/// Comma-separated aliases
	pub key: String,
	#[serde(default, deserialize_with = "addresses")]
	pub address: Vec<String>,
	#[serde(default)]
	pub database: Option<String>,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub source: Option<String>,
	#[serde(default)]
	pub safe: Option<SafeConfig>,
	#[serde(default)]
	pub mode: Option<ModeSpec>,
	#[serde(default, deserialize_with = "optional_duration")]
	pub keepalive: Option<Duration>,
	#[serde(default, deserialize_with = "optional_duration")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, deserialize_with = "optional_duration")]
	pub read_timeout: Option<Duration>,
	#[serde(default, deserialize_with = "optional_duration")]
	pub write_timeout: Option<Duration>,
	#[serde(default)]
	pub min_pool_size: Option<u32>,
	#[serde(default = "default_max_pool_size")]
	pub max_pool_size: u32,
	#[serde(default, rename = "maxPoolWaitTimeMS")]
	pub max_pool_wait_time_ms: Option<u64>,
	#[serde(default, rename = "maxPoolIdleTimeMS")]
	pub max_pool_idle_time_ms: Option<u64>,
	#[serde(default)]
	pub default: bool,
}

impl ClientConfig {
	/// Partial connection options for this record
	///
	/// # Errors
	///
	/// [`Error::UnknownMode`] for a read mode name or code that does not
	/// exist.
	pub fn options(&self) -> Result<ConnectionOptions> {
		let mut options = ConnectionOptions {
			addresses: self.address.clone(),
			database: self.database.clone(),
			safety: self.safe.clone().map(SafetyPolicy::from),
			mode: self.mode.as_ref().map(ModeSpec::to_mode).transpose()?,
			connect_timeout: self.connect_timeout,
			read_timeout: self.read_timeout,
			write_timeout: self.write_timeout,
			keepalive: self.keepalive,
			min_pool_size: self.min_pool_size,
			max_pool_size: Some(self.max_pool_size),
			max_pool_wait: self.max_pool_wait_time_ms.map(Duration::from_millis),
			max_pool_idle: self.max_pool_idle_time_ms.map(Duration::from_millis),
			..ConnectionOptions::default()
		};
		if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
			options = options.credentials(
				username,
				self.password.clone().unwrap_or_default(),
				self.source.as_deref(),
			);
		}
		Ok(options)
	}
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub mongo: Vec<ClientConfig>,
}

impl Settings {
	pub fn from_toml_str(text: &str) -> Result<Self> {
		toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML settings: {}", e)))
	}

	pub fn from_yaml_str(text: &str) -> Result<Self> {
		serde_yaml::from_str(text).map_err(|e| Error::Config(format!("invalid YAML settings: {}", e)))
	}

	pub fn from_json_str(text: &str) -> Result<Self> {
		serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid JSON settings: {}", e)))
	}

	/// Load a file; the format follows the extension (`toml`, `yaml`/`yml`,
	/// `json`)
	pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path)
			.map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

		match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => Self::from_toml_str(&text),
			Some("yaml" | "yml") => Self::from_yaml_str(&text),
			Some("json") => Self::from_json_str(&text),
			_ => Err(Error::Config(format!(
				"unsupported settings format: {}",
				path.display()
			))),
		}
	}
}
