//! Query filter evaluation for the memory store.

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex_lite::RegexBuilder;

use crate::document::DocumentExt;
use crate::error::{StoreError, StoreResult};

/// Whether `doc` satisfies `filter`.
pub(crate) fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_clauses(condition)?
                .iter()
                .try_fold(true, |acc, clause| Ok::<_, StoreError>(acc && matches(doc, clause)?))?,
            "$or" => {
                let mut any = false;
                for clause in all_clauses(condition)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in all_clauses(condition)? {
                    if matches(doc, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(StoreError::unsupported(format!("top-level operator {op}")));
            }
            path => field_matches(doc.get_path(path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_clauses(condition: &Bson) -> StoreResult<Vec<&Document>> {
    match condition {
        Bson::Array(items) => items
            .iter()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc),
                other => Err(StoreError::invalid_command(format!(
                    "logical clause must be a document, got {other}"
                ))),
            })
            .collect(),
        other => Err(StoreError::invalid_command(format!(
            "logical operator needs an array, got {other}"
        ))),
    }
}

/// Whether a field value satisfies a condition (literal or operator document).
pub(crate) fn field_matches(value: Option<&Bson>, condition: &Bson) -> StoreResult<bool> {
    match condition {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => {
            let options = ops.get_str("$options").unwrap_or("");
            for (op, operand) in ops {
                if !operator_matches(value, op, operand, options)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(eq_match(value, literal)),
    }
}

fn operator_matches(
    value: Option<&Bson>,
    op: &str,
    operand: &Bson,
    options: &str,
) -> StoreResult<bool> {
    Ok(match op {
        "$eq" => eq_match(value, operand),
        "$ne" => !eq_match(value, operand),
        "$gt" => range_match(value, operand, |o| o == Ordering::Greater),
        "$gte" => range_match(value, operand, |o| o != Ordering::Less),
        "$lt" => range_match(value, operand, |o| o == Ordering::Less),
        "$lte" => range_match(value, operand, |o| o != Ordering::Greater),
        "$in" => in_list(operand)?.iter().any(|candidate| eq_match(value, candidate)),
        "$nin" => !in_list(operand)?.iter().any(|candidate| eq_match(value, candidate)),
        "$exists" => value.is_some() == truthy(operand),
        "$not" => !field_matches(value, operand)?,
        "$size" => match (value, as_i64(operand)) {
            (Some(Bson::Array(items)), Some(n)) => items.len() as i64 == n,
            _ => false,
        },
        "$regex" => regex_match(value, operand, options)?,
        "$options" => true,
        other => return Err(StoreError::unsupported(format!("query operator {other}"))),
    })
}

fn in_list(operand: &Bson) -> StoreResult<&Vec<Bson>> {
    match operand {
        Bson::Array(items) => Ok(items),
        other => Err(StoreError::invalid_command(format!("$in needs an array, got {other}"))),
    }
}

fn regex_match(value: Option<&Bson>, operand: &Bson, options: &str) -> StoreResult<bool> {
    let pattern = match operand {
        Bson::String(s) => s.as_str(),
        Bson::RegularExpression(re) => re.pattern.as_str(),
        other => {
            return Err(StoreError::invalid_command(format!("$regex needs a string, got {other}")));
        }
    };
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .build()
        .map_err(|e| StoreError::invalid_command(e.to_string()))?;
    Ok(match value {
        Some(Bson::String(s)) => re.is_match(s),
        Some(Bson::Array(items)) => items
            .iter()
            .any(|item| matches!(item, Bson::String(s) if re.is_match(s))),
        _ => false,
    })
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).is_none_or(|n| n != 0.0),
    }
}

/// Equality with array fan-out: a scalar condition matches an array field
/// that contains it; a missing field equals `null`.
pub(crate) fn eq_match(value: Option<&Bson>, condition: &Bson) -> bool {
    match value {
        None => matches!(condition, Bson::Null),
        Some(Bson::Array(items)) if !matches!(condition, Bson::Array(_)) => {
            items.iter().any(|item| bson_eq(item, condition))
        }
        Some(v) => bson_eq(v, condition),
    }
}

fn range_match(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Bson::Array(items)) => items
            .iter()
            .any(|item| compare(item, operand).is_some_and(&accept)),
        Some(v) => compare(v, operand).is_some_and(accept),
        None => false,
    }
}

/// Value equality, treating numeric types as one.
pub(crate) fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between two values of the same type class.
pub(crate) fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            Some(as_i64(a)?.cmp(&as_i64(b)?))
        }
        _ if as_f64(a).is_some() && as_f64(b).is_some() => as_f64(a)?.partial_cmp(&as_f64(b)?),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used by `$sort`: type class first, then value.
pub(crate) fn sort_cmp(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let a = a.unwrap_or(&Bson::Null);
    let b = b.unwrap_or(&Bson::Null);
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare(a, b).unwrap_or(Ordering::Equal))
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    fn sample() -> Document {
        doc! {
            "name": "Ana",
            "age": 31,
            "status": "active",
            "tags": ["vip", "mx"],
            "address": { "city": "Monterrey" },
        }
    }

    #[test]
    fn test_equality_and_paths() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "name": "Ana" }).unwrap());
        assert!(matches(&doc, &doc! { "address.city": "Monterrey" }).unwrap());
        assert!(matches(&doc, &doc! { "age": 31_i64 }).unwrap());
        assert!(matches(&doc, &doc! { "tags": "vip" }).unwrap());
        assert!(matches(&doc, &doc! { "missing": Bson::Null }).unwrap());
        assert!(!matches(&doc, &doc! { "name": "Bea" }).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "age": { "$gte": 30, "$lt": 40 } }).unwrap());
        assert!(!matches(&doc, &doc! { "age": { "$gt": 31 } }).unwrap());
        assert!(matches(&doc, &doc! { "status": { "$ne": "deleted" } }).unwrap());
        assert!(matches(&doc, &doc! { "deleted_at": { "$exists": false } }).unwrap());
        assert!(matches(&doc, &doc! { "tags": { "$in": ["mx", "us"] } }).unwrap());
        assert!(matches(&doc, &doc! { "tags": { "$size": 2 } }).unwrap());
        assert!(matches(&doc, &doc! { "name": { "$regex": "^an", "$options": "i" } }).unwrap());
        assert!(matches(&doc, &doc! { "age": { "$not": { "$gt": 40 } } }).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let doc = sample();
        assert!(matches(&doc, &doc! { "$or": [{ "name": "Bea" }, { "age": 31 }] }).unwrap());
        assert!(!matches(&doc, &doc! { "$and": [{ "name": "Ana" }, { "age": 1 }] }).unwrap());
        assert!(matches(&doc, &doc! { "$nor": [{ "name": "Bea" }] }).unwrap());
        assert!(matches(&doc, &doc! { "$where": "1" }).is_err());
    }

    #[test]
    fn test_object_id_equality() {
        let oid = ObjectId::new();
        let doc = doc! { "_id": oid };
        assert!(matches(&doc, &doc! { "_id": oid }).unwrap());
        assert!(!matches(&doc, &doc! { "_id": oid.to_hex() }).unwrap());
    }

    #[test]
    fn test_sort_order() {
        let one = Bson::Int32(1);
        let text = Bson::String("a".into());
        assert_eq!(sort_cmp(None, Some(&one)), Ordering::Less);
        assert_eq!(sort_cmp(Some(&one), Some(&text)), Ordering::Less);
        assert_eq!(sort_cmp(Some(&Bson::Double(2.5)), Some(&one)), Ordering::Greater);
    }
}
