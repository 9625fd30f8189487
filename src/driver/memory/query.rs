//! Document evaluation for the in-memory store
//!
//! Filters support dotted paths, implicit equality (including array
//! membership), `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//! `$exists`, and the logical `$and` / `$or` / `$nor`. Updates support
//! `$set`, `$unset`, `$inc`, `$push` and `$setOnInsert`, or whole-document
//! replacement.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::driver::is_operator_update;
use crate::error::{Error, Result};

/// Resolve a dotted path; numeric segments index into arrays
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
	let mut segments = path.split('.');
	let mut current = doc.get(segments.next()?)?;
	for segment in segments {
		current = match current {
			Bson::Document(inner) => inner.get(segment)?,
			Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
			_ => return None,
		};
	}
	Some(current)
}

/// Set a dotted path, creating intermediate documents
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
	match path.split_once('.') {
		None => {
			doc.insert(path, value);
			Ok(())
		}
		Some((head, rest)) => {
			if !doc.contains_key(head) {
				doc.insert(head, Document::new());
			}
			match doc.get_mut(head) {
				Some(Bson::Document(inner)) => set_path(inner, rest, value),
				_ => Err(Error::Database(format!(
					"Cannot create field '{}' in element {{{}: ...}}",
					rest, head
				))),
			}
		}
	}
}

/// Remove a dotted path; returns whether something was removed
pub(crate) fn remove_path(doc: &mut Document, path: &str) -> bool {
	match path.split_once('.') {
		None => doc.remove(path).is_some(),
		Some((head, rest)) => match doc.get_mut(head) {
			Some(Bson::Document(inner)) => remove_path(inner, rest),
			_ => false,
		},
	}
}

fn as_f64(value: &Bson) -> Option<f64> {
	match value {
		Bson::Int32(n) => Some(f64::from(*n)),
		Bson::Int64(n) => Some(*n as f64),
		Bson::Double(n) => Some(*n),
		_ => None,
	}
}

/// Canonical BSON type order used by sorts
fn type_rank(value: Option<&Bson>) -> u8 {
	match value {
		None | Some(Bson::Null) | Some(Bson::Undefined) => 1,
		Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)) => 2,
		Some(Bson::String(_) | Bson::Symbol(_)) => 3,
		Some(Bson::Document(_)) => 4,
		Some(Bson::Array(_)) => 5,
		Some(Bson::Binary(_)) => 6,
		Some(Bson::ObjectId(_)) => 7,
		Some(Bson::Boolean(_)) => 8,
		Some(Bson::DateTime(_)) => 9,
		Some(Bson::Timestamp(_)) => 10,
		Some(Bson::RegularExpression(_)) => 11,
		Some(_) => 12,
	}
}

/// Ordering of two values of comparable types; `None` across types
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
	if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
		return x.partial_cmp(&y);
	}
	match (a, b) {
		(Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
		(Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
		(Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
		(Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
		(Bson::Timestamp(x), Bson::Timestamp(y)) => Some((x.time, x.increment).cmp(&(y.time, y.increment))),
		(Bson::Null, Bson::Null) => Some(Ordering::Equal),
		_ => None,
	}
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
	compare(a, b) == Some(Ordering::Equal) || a == b
}

/// Total order for sorting, falling back to the type order
fn sort_cmp(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
	match (a, b) {
		(Some(x), Some(y)) => compare(x, y).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b))),
		_ => type_rank(a).cmp(&type_rank(b)),
	}
}

fn eq_match(value: Option<&Bson>, arg: &Bson) -> bool {
	match value {
		None => matches!(arg, Bson::Null),
		Some(Bson::Array(items)) if !matches!(arg, Bson::Array(_)) => {
			items.iter().any(|item| values_equal(item, arg))
		}
		Some(v) => values_equal(v, arg),
	}
}

fn range_match(value: Option<&Bson>, arg: &Bson, accept: fn(Ordering) -> bool) -> bool {
	match value {
		None => false,
		Some(Bson::Array(items)) => items
			.iter()
			.any(|item| compare(item, arg).is_some_and(accept)),
		Some(v) => compare(v, arg).is_some_and(accept),
	}
}

fn in_list<'a>(op: &str, arg: &'a Bson) -> Result<&'a Vec<Bson>> {
	match arg {
		Bson::Array(items) => Ok(items),
		_ => Err(Error::Database(format!("{} needs an array", op))),
	}
}

fn is_operator_doc(value: &Bson) -> bool {
	matches!(value, Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')))
}

fn operator_match(value: Option<&Bson>, ops: &Document) -> Result<bool> {
	for (op, arg) in ops {
		let ok = match op.as_str() {
			"$eq" => eq_match(value, arg),
			"$ne" => !eq_match(value, arg),
			"$gt" => range_match(value, arg, Ordering::is_gt),
			"$gte" => range_match(value, arg, Ordering::is_ge),
			"$lt" => range_match(value, arg, Ordering::is_lt),
			"$lte" => range_match(value, arg, Ordering::is_le),
			"$in" => in_list(op, arg)?.iter().any(|item| eq_match(value, item)),
			"$nin" => !in_list(op, arg)?.iter().any(|item| eq_match(value, item)),
			"$exists" => {
				let wanted = match arg {
					Bson::Boolean(b) => *b,
					other => as_f64(other).is_some_and(|n| n != 0.0),
				};
				value.is_some() == wanted
			}
			other => return Err(Error::Unsupported(format!("query operator {}", other))),
		};
		if !ok {
			return Ok(false);
		}
	}
	Ok(true)
}

fn clauses<'a>(op: &str, arg: &'a Bson) -> Result<Vec<&'a Document>> {
	let items = match arg {
		Bson::Array(items) if !items.is_empty() => items,
		_ => return Err(Error::Database(format!("{} must be a nonempty array", op))),
	};
	items
		.iter()
		.map(|item| match item {
			Bson::Document(d) => Ok(d),
			_ => Err(Error::Database(format!("{} entries must be documents", op))),
		})
		.collect()
}

/// Whether `doc` satisfies `filter`
pub(crate) fn matches(doc: &Document, filter: &Document) -> Result<bool> {
	for (key, cond) in filter {
		let ok = match key.as_str() {
			"$and" => {
				let mut all = true;
				for clause in clauses(key, cond)? {
					if !matches(doc, clause)? {
						all = false;
						break;
					}
				}
				all
			}
			"$or" | "$nor" => {
				let mut any = false;
				for clause in clauses(key, cond)? {
					if matches(doc, clause)? {
						any = true;
						break;
					}
				}
				if key == "$or" { any } else { !any }
			}
			op if op.starts_with('$') => {
				return Err(Error::Unsupported(format!("query operator {}", op)));
			}
			path => {
				let value = lookup(doc, path);
				match cond {
					Bson::Document(ops) if is_operator_doc(cond) => operator_match(value, ops)?,
					_ => eq_match(value, cond),
				}
			}
		};
		if !ok {
			return Ok(false);
		}
	}
	Ok(true)
}

fn add_numbers(current: Option<&Bson>, delta: &Bson) -> Result<Bson> {
	let current = current.unwrap_or(&Bson::Int32(0));
	let overflow = || {
		Error::Database(format!(
			"Failed to apply $inc operations: result of {} + {} overflows a 64-bit integer",
			current, delta
		))
	};
	let sum = match (current, delta) {
		(Bson::Int32(a), Bson::Int32(b)) => a
			.checked_add(*b)
			.map(Bson::Int32)
			.unwrap_or(Bson::Int64(i64::from(*a) + i64::from(*b))),
		(Bson::Int32(a), Bson::Int64(b)) => {
			Bson::Int64(i64::from(*a).checked_add(*b).ok_or_else(overflow)?)
		}
		(Bson::Int64(a), Bson::Int32(b)) => {
			Bson::Int64(a.checked_add(i64::from(*b)).ok_or_else(overflow)?)
		}
		(Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a.checked_add(*b).ok_or_else(overflow)?),
		(a, b) => match (as_f64(a), as_f64(b)) {
			(Some(x), Some(y)) => Bson::Double(x + y),
			_ => {
				return Err(Error::Database(
					"Cannot apply $inc to a value of non-numeric type".to_string(),
				));
			}
		},
	};
	Ok(sum)
}

fn operator_fields<'a>(op: &str, arg: &'a Bson) -> Result<&'a Document> {
	match arg {
		Bson::Document(fields) => Ok(fields),
		_ => Err(Error::Database(format!("Modifiers operate on fields but {} got a scalar", op))),
	}
}

/// Apply an update document in place
///
/// `inserting` enables `$setOnInsert`. Replacement updates keep `_id`.
pub(crate) fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<()> {
	if !is_operator_update(update) {
		let id = doc.get("_id").cloned();
		*doc = update.clone();
		if let Some(id) = id {
			let mut replaced = Document::new();
			replaced.insert("_id", id);
			replaced.extend(doc.clone());
			*doc = replaced;
		}
		return Ok(());
	}

	for (op, arg) in update {
		match op.as_str() {
			"$set" => {
				for (path, value) in operator_fields(op, arg)? {
					set_path(doc, path, value.clone())?;
				}
			}
			"$setOnInsert" => {
				if inserting {
					for (path, value) in operator_fields(op, arg)? {
						set_path(doc, path, value.clone())?;
					}
				}
			}
			"$unset" => {
				for (path, _) in operator_fields(op, arg)? {
					remove_path(doc, path);
				}
			}
			"$inc" => {
				for (path, delta) in operator_fields(op, arg)? {
					let sum = add_numbers(lookup(doc, path), delta)?;
					set_path(doc, path, sum)?;
				}
			}
			"$push" => {
				for (path, value) in operator_fields(op, arg)? {
					let mut items = match lookup(doc, path) {
						None => Vec::new(),
						Some(Bson::Array(items)) => items.clone(),
						Some(_) => {
							return Err(Error::Database(format!(
								"The field '{}' must be an array",
								path
							)));
						}
					};
					items.push(value.clone());
					set_path(doc, path, Bson::Array(items))?;
				}
			}
			other => return Err(Error::Unsupported(format!("update operator {}", other))),
		}
	}
	Ok(())
}

/// Seed document for an upsert: the filter's equality fields
pub(crate) fn upsert_seed(filter: &Document) -> Result<Document> {
	let mut seed = Document::new();
	for (key, cond) in filter {
		if key.starts_with('$') {
			continue;
		}
		match cond {
			Bson::Document(ops) if is_operator_doc(cond) => {
				if let Some(value) = ops.get("$eq") {
					set_path(&mut seed, key, value.clone())?;
				}
			}
			value => set_path(&mut seed, key, value.clone())?,
		}
	}
	Ok(seed)
}

/// Sort in place by a `{field: 1|-1}` document
pub(crate) fn sort(docs: &mut [Document], order: &Document) {
	docs.sort_by(|a, b| {
		for (field, direction) in order {
			let descending = as_f64(direction).is_some_and(|d| d < 0.0);
			let ordering = sort_cmp(lookup(a, field), lookup(b, field));
			let ordering = if descending { ordering.reverse() } else { ordering };
			if ordering != Ordering::Equal {
				return ordering;
			}
		}
		Ordering::Equal
	});
}

fn truthy(value: &Bson) -> bool {
	match value {
		Bson::Boolean(b) => *b,
		other => as_f64(other).is_none_or(|n| n != 0.0),
	}
}

/// Apply an inclusion or exclusion projection
pub(crate) fn project(doc: &Document, projection: &Document) -> Result<Document> {
	let inclusive = projection
		.iter()
		.any(|(field, value)| field != "_id" && truthy(value));

	if inclusive {
		let mut out = Document::new();
		let keep_id = projection.get("_id").is_none_or(truthy);
		if keep_id && let Some(id) = doc.get("_id") {
			out.insert("_id", id.clone());
		}
		for (field, value) in projection {
			if field == "_id" || !truthy(value) {
				continue;
			}
			if let Some(found) = lookup(doc, field) {
				set_path(&mut out, field, found.clone())?;
			}
		}
		Ok(out)
	} else {
		let mut out = doc.clone();
		for (field, _) in projection {
			remove_path(&mut out, field);
		}
		Ok(out)
	}
}

/// Collect distinct values of `key`, flattening arrays
pub(crate) fn distinct<'a>(docs: impl Iterator<Item = &'a Document>, key: &str) -> Vec<Bson> {
	let mut values: Vec<Bson> = Vec::new();
	let mut push = |value: &Bson| {
		if !values.iter().any(|seen| values_equal(seen, value)) {
			values.push(value.clone());
		}
	};
	for doc in docs {
		match lookup(doc, key) {
			Some(Bson::Array(items)) => items.iter().for_each(&mut push),
			Some(value) => push(value),
			None => {}
		}
	}
	values
}

/// Key tuple a unique index sees for `doc`; `None` when a sparse index
/// skips it
pub(crate) fn index_tuple(doc: &Document, keys: &Document, sparse: bool) -> Option<Vec<Bson>> {
	let tuple: Vec<Option<&Bson>> = keys.keys().map(|field| lookup(doc, field)).collect();
	if sparse && tuple.iter().all(Option::is_none) {
		return None;
	}
	Some(tuple.into_iter().map(|v| v.cloned().unwrap_or(Bson::Null)).collect())
}

/// Tuple equality with numeric cross-type comparison
pub(crate) fn tuples_equal(a: &[Bson], b: &[Bson]) -> bool {
	a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
}

#[cfg(test)]
mod tests {
	use super::*;
	use bson::doc;
	use rstest::rstest;

	fn sample() -> Document {
		doc! {
			"_id": 1,
			"name": "alice",
			"age": 30,
			"tags": ["a", "b"],
			"address": { "city": "Paris", "zip": "75001" },
		}
	}

	#[rstest]
	#[case(doc! {}, true)]
	#[case(doc! { "name": "alice" }, true)]
	#[case(doc! { "name": "bob" }, false)]
	#[case(doc! { "age": 30.0 }, true)]
	#[case(doc! { "age": 30_i64 }, true)]
	#[case(doc! { "tags": "b" }, true)]
	#[case(doc! { "address.city": "Paris" }, true)]
	#[case(doc! { "missing": null }, true)]
	#[case(doc! { "age": { "$gt": 18, "$lte": 30 } }, true)]
	#[case(doc! { "age": { "$lt": 30 } }, false)]
	#[case(doc! { "age": { "$ne": 30 } }, false)]
	#[case(doc! { "name": { "$in": ["bob", "alice"] } }, true)]
	#[case(doc! { "name": { "$nin": ["bob", "alice"] } }, false)]
	#[case(doc! { "missing": { "$exists": false } }, true)]
	#[case(doc! { "name": { "$exists": true } }, true)]
	#[case(doc! { "$or": [{ "name": "bob" }, { "age": 30 }] }, true)]
	#[case(doc! { "$and": [{ "name": "alice" }, { "age": 31 }] }, false)]
	#[case(doc! { "$nor": [{ "name": "bob" }] }, true)]
	#[case(doc! { "age": { "$gt": "x" } }, false)]
	fn test_matches(#[case] filter: Document, #[case] expected: bool) {
		assert_eq!(matches(&sample(), &filter).unwrap(), expected);
	}

	#[rstest]
	fn test_matches_rejects_unknown_operator() {
		// Act
		let result = matches(&sample(), &doc! { "name": { "$regex": "^a" } });

		// Assert
		assert!(matches!(result, Err(Error::Unsupported(_))));
	}

	#[rstest]
	fn test_apply_update_operators() {
		// Arrange
		let mut doc = sample();
		let update = doc! {
			"$set": { "address.city": "Lyon", "nested.deep": true },
			"$unset": { "tags": "" },
			"$inc": { "age": 1, "visits": 2 },
			"$push": { "log": "created" },
		};

		// Act
		apply_update(&mut doc, &update, false).unwrap();

		// Assert
		assert_eq!(lookup(&doc, "address.city"), Some(&Bson::String("Lyon".into())));
		assert_eq!(lookup(&doc, "nested.deep"), Some(&Bson::Boolean(true)));
		assert_eq!(doc.get("tags"), None);
		assert_eq!(doc.get("age"), Some(&Bson::Int32(31)));
		assert_eq!(doc.get("visits"), Some(&Bson::Int32(2)));
		assert_eq!(doc.get("log"), Some(&Bson::Array(vec![Bson::String("created".into())])));
	}

	#[rstest]
	fn test_apply_update_replacement_keeps_id() {
		// Arrange
		let mut doc = sample();

		// Act
		apply_update(&mut doc, &doc! { "name": "carol" }, false).unwrap();

		// Assert
		assert_eq!(doc, doc! { "_id": 1, "name": "carol" });
	}

	#[rstest]
	fn test_set_on_insert_only_when_inserting() {
		// Arrange
		let update = doc! { "$setOnInsert": { "created": 1 } };
		let mut existing = doc! { "_id": 1 };
		let mut inserted = doc! { "_id": 2 };

		// Act
		apply_update(&mut existing, &update, false).unwrap();
		apply_update(&mut inserted, &update, true).unwrap();

		// Assert
		assert!(existing.get("created").is_none());
		assert_eq!(inserted.get("created"), Some(&Bson::Int32(1)));
	}

	#[rstest]
	fn test_inc_rejects_non_numeric() {
		let mut doc = sample();
		let result = apply_update(&mut doc, &doc! { "$inc": { "name": 1 } }, false);
		assert!(result.is_err());
	}

	#[rstest]
	#[case(Bson::Int64(i64::MAX), Bson::Int64(1))]
	#[case(Bson::Int64(i64::MAX), Bson::Int32(1))]
	#[case(Bson::Int32(1), Bson::Int64(i64::MAX))]
	#[case(Bson::Int64(i64::MIN), Bson::Int64(-1))]
	fn test_inc_overflow_is_an_error(#[case] start: Bson, #[case] delta: Bson) {
		// Arrange
		let mut doc = doc! { "_id": 1, "n": start.clone() };

		// Act
		let result = apply_update(&mut doc, &doc! { "$inc": { "n": delta } }, false);

		// Assert
		assert!(matches!(result, Err(Error::Database(msg)) if msg.contains("$inc")));
		assert_eq!(doc.get("n"), Some(&start));
	}

	#[rstest]
	fn test_inc_widens_int32_overflow() {
		let mut doc = doc! { "n": i32::MAX };
		apply_update(&mut doc, &doc! { "$inc": { "n": 1 } }, false).unwrap();
		assert_eq!(doc.get("n"), Some(&Bson::Int64(i64::from(i32::MAX) + 1)));
	}

	#[rstest]
	fn test_upsert_seed_uses_equality_fields() {
		// Arrange
		let filter = doc! { "_id": 5, "kind": { "$eq": "x" }, "age": { "$gt": 3 }, "$or": [] };

		// Act
		let seed = upsert_seed(&filter).unwrap();

		// Assert
		assert_eq!(seed, doc! { "_id": 5, "kind": "x" });
	}

	#[rstest]
	fn test_sort_orders_mixed_types() {
		// Arrange
		let mut docs = vec![
			doc! { "v": "b" },
			doc! { "v": 2 },
			doc! {},
			doc! { "v": 1.5 },
			doc! { "v": "a" },
		];

		// Act
		sort(&mut docs, &doc! { "v": 1 });

		// Assert
		let values: Vec<Option<&Bson>> = docs.iter().map(|d| d.get("v")).collect();
		assert_eq!(
			values,
			vec![
				None,
				Some(&Bson::Double(1.5)),
				Some(&Bson::Int32(2)),
				Some(&Bson::String("a".into())),
				Some(&Bson::String("b".into())),
			]
		);
	}

	#[rstest]
	#[case(doc! { "name": 1 }, doc! { "_id": 1, "name": "alice" })]
	#[case(doc! { "name": 1, "_id": 0 }, doc! { "name": "alice" })]
	#[case(doc! { "address.city": 1, "_id": false }, doc! { "address": { "city": "Paris" } })]
	#[case(
		doc! { "tags": 0, "address": 0 },
		doc! { "_id": 1, "name": "alice", "age": 30 }
	)]
	fn test_project(#[case] projection: Document, #[case] expected: Document) {
		assert_eq!(project(&sample(), &projection).unwrap(), expected);
	}

	#[rstest]
	fn test_distinct_flattens_arrays() {
		// Arrange
		let docs = [
			doc! { "t": ["a", "b"] },
			doc! { "t": "b" },
			doc! { "t": 1 },
			doc! { "t": 1.0 },
			doc! {},
		];

		// Act
		let values = distinct(docs.iter(), "t");

		// Assert
		assert_eq!(
			values,
			vec![Bson::String("a".into()), Bson::String("b".into()), Bson::Int32(1)]
		);
	}
}
