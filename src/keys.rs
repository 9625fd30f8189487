//! Field-list specifications
//!
//! Sorts and index keys are written as field names: `-name` for descending,
//! `name` or `+name` for ascending. Index keys additionally accept a
//! `$kind:field` form (`$text:body`, `$2dsphere:loc`) for special index
//! types.

use bson::{Bson, Document};

use crate::error::{Error, Result};

/// Split one field spec into the field name and its sort direction
fn parse_field(spec: &str) -> Result<(&str, i32)> {
	let spec = spec.trim();
	let (field, direction) = if let Some(stripped) = spec.strip_prefix('-') {
		(stripped, -1)
	} else if let Some(stripped) = spec.strip_prefix('+') {
		(stripped, 1)
	} else {
		(spec, 1)
	};

	if field.is_empty() {
		return Err(Error::InvalidArgument(format!(
			"empty field name in sort/key spec {:?}",
			spec
		)));
	}
	Ok((field, direction))
}

/// Build a sort document; `None` for an empty list
///
/// # Examples
///
/// ```rust
/// use mongo_registry::keys::sort_document;
/// use bson::doc;
///
/// let sort = sort_document(&["-age", "+name"]).unwrap();
/// assert_eq!(sort, Some(doc! { "age": -1, "name": 1 }));
/// assert_eq!(sort_document::<&str>(&[]).unwrap(), None);
/// assert!(sort_document(&["-"]).is_err());
/// ```
pub fn sort_document<S: AsRef<str>>(fields: &[S]) -> Result<Option<Document>> {
	if fields.is_empty() {
		return Ok(None);
	}
	let mut sort = Document::new();
	for spec in fields {
		let (field, direction) = parse_field(spec.as_ref())?;
		sort.insert(field, direction);
	}
	Ok(Some(sort))
}

/// Build an index key document from its field list
pub fn index_key_document<S: AsRef<str>>(fields: &[S]) -> Result<Document> {
	if fields.is_empty() {
		return Err(Error::InvalidArgument(
			"index key needs at least one field".to_string(),
		));
	}
	let mut keys = Document::new();
	for spec in fields {
		let spec = spec.as_ref().trim();
		if let Some(rest) = spec.strip_prefix('$')
			&& let Some((kind, field)) = rest.split_once(':')
		{
			if kind.is_empty() || field.is_empty() {
				return Err(Error::InvalidArgument(format!("malformed index key {:?}", spec)));
			}
			keys.insert(field, kind);
			continue;
		}
		let (field, direction) = parse_field(spec)?;
		keys.insert(field, direction);
	}
	Ok(keys)
}

/// Render a key document back into its field list
pub fn index_key_fields(keys: &Document) -> Vec<String> {
	keys.iter()
		.map(|(field, value)| match value {
			Bson::String(kind) => format!("${}:{}", kind, field),
			Bson::Int32(n) if *n < 0 => format!("-{}", field),
			Bson::Int64(n) if *n < 0 => format!("-{}", field),
			Bson::Double(n) if *n < 0.0 => format!("-{}", field),
			_ => field.clone(),
		})
		.collect()
}

/// Server-style default index name (`a_1_b_-1`)
pub fn index_name(keys: &Document) -> String {
	keys.iter()
		.map(|(field, value)| {
			let suffix = match value {
				Bson::String(kind) => kind.clone(),
				Bson::Int32(n) => n.to_string(),
				Bson::Int64(n) => n.to_string(),
				Bson::Double(n) => (*n as i64).to_string(),
				other => other.to_string(),
			};
			format!("{}_{}", field, suffix)
		})
		.collect::<Vec<_>>()
		.join("_")
}

#[cfg(test)]
mod tests {
	use super::*;
	use bson::doc;
	use rstest::rstest;

	#[rstest]
	#[case(&["name"], doc! { "name": 1 })]
	#[case(&["+name"], doc! { "name": 1 })]
	#[case(&["-name"], doc! { "name": -1 })]
	#[case(&["a", "-b", "+c"], doc! { "a": 1, "b": -1, "c": 1 })]
	fn test_sort_document(#[case] fields: &[&str], #[case] expected: Document) {
		assert_eq!(sort_document(fields).unwrap(), Some(expected));
	}

	#[rstest]
	#[case("")]
	#[case("-")]
	#[case("+")]
	#[case("  ")]
	fn test_sort_document_rejects_empty_field(#[case] spec: &str) {
		// Act
		let result = sort_document(&[spec]);

		// Assert
		assert!(matches!(result, Err(Error::InvalidArgument(_))));
	}

	#[rstest]
	fn test_index_key_document_supports_special_kinds() {
		// Arrange
		let fields = ["$text:body", "-created"];

		// Act
		let keys = index_key_document(&fields).unwrap();

		// Assert
		assert_eq!(keys, doc! { "body": "text", "created": -1 });
		assert_eq!(index_key_fields(&keys), vec!["$text:body", "-created"]);
	}

	#[rstest]
	fn test_index_key_document_rejects_empty_list() {
		let fields: [&str; 0] = [];
		assert!(index_key_document(&fields).is_err());
	}

	#[rstest]
	#[case(doc! { "a": 1, "b": -1 }, "a_1_b_-1")]
	#[case(doc! { "_id": 1 }, "_id_1")]
	#[case(doc! { "body": "text" }, "body_text")]
	fn test_index_name(#[case] keys: Document, #[case] expected: &str) {
		assert_eq!(index_name(&keys), expected);
	}
}
