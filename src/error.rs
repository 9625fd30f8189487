//! Error types
//!
//! Every fallible operation in this crate returns [`Result`], whose error is
//! the single [`Error`] enum below. Driver errors are passed through
//! unchanged; the only outcomes that are deliberately *not* errors are the
//! documented "not found" normalizations of the facade.

use std::time::Duration;

use crate::bulk::BulkResult;

/// Result type for registry and facade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Structurally invalid configuration
	#[error("Configuration error: {0}")]
	Config(String),

	/// A client name is already registered
	#[error("Duplicate client name: {0}")]
	DuplicateName(String),

	/// Read preference mode name or code that does not exist
	#[error("Invalid mode name: {0}")]
	UnknownMode(String),

	/// No default client has been installed
	#[error("No default client configured")]
	NoDefault,

	/// Dialing or talking to the server failed
	#[error("Connection error: {0}")]
	Connection(String),

	/// No pooled session became available within the configured wait
	#[error("Timed out after {0:?} waiting for a pooled session")]
	PoolTimeout(Duration),

	/// The operation did not complete within its read or write timeout
	#[error("Operation timed out after {0:?}")]
	Timeout(Duration),

	/// Find-and-update matched nothing
	#[error("Not found")]
	NotFound,

	/// Caller supplied an unusable argument
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Document could not be converted to or from BSON
	#[error("Serialization error: {0}")]
	Serialization(String),

	/// A staged batch stopped at `index`; `applied` counts what the store
	/// had already written before the failure
	#[error("Bulk write failed at operation {index} (code {code}): {message}")]
	Bulk {
		index: usize,
		code: i32,
		message: String,
		applied: BulkResult,
	},

	/// Store-level failure reported in a command reply
	#[error("Database error: {0}")]
	Database(String),

	/// The driver in use cannot perform this operation
	#[error("Unsupported feature: {0}")]
	Unsupported(String),

	/// Error raised by the MongoDB driver
	#[cfg(feature = "mongodb")]
	#[error(transparent)]
	Driver(#[from] mongodb::error::Error),
}

impl Error {
	/// Whether this is the find-and-update "nothing matched" outcome
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound)
	}
}

// In bson v3.x, both ser::Error and de::Error are type aliases for bson::error::Error
impl From<bson::error::Error> for Error {
	fn from(err: bson::error::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_not_found_is_distinguishable() {
		// Arrange
		let not_found = Error::NotFound;
		let other = Error::Database("boom".to_string());

		// Act / Assert
		assert!(not_found.is_not_found());
		assert!(!other.is_not_found());
	}

	#[rstest]
	fn test_bulk_error_message_names_failing_index() {
		// Arrange
		let err = Error::Bulk {
			index: 3,
			code: 11000,
			message: "duplicate key".to_string(),
			applied: BulkResult::default(),
		};

		// Act
		let rendered = err.to_string();

		// Assert
		assert_eq!(
			rendered,
			"Bulk write failed at operation 3 (code 11000): duplicate key"
		);
	}
}
