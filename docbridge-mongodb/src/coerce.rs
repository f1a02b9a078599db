//! Coercion of identifier- and date-shaped fields into native BSON types.
//!
//! Callers hand documents over with identifiers as 24-character hex strings
//! and timestamps as ISO-8601 strings or epoch milliseconds. Before anything
//! reaches the store, fields whose *names* match the [`NamingConvention`] are
//! rewritten to [`ObjectId`] and [`bson::DateTime`] respectively.
//!
//! Operator keys (`$set`, `$inc`, `$in`, ...) are never treated as data
//! fields: their values are walked and the key is kept verbatim, so the same
//! pass works on filters and on update documents.
//!
//! ```rust
//! use docbridge_mongodb::coerce::Coercer;
//! use bson::{doc, Bson};
//!
//! let coercer = Coercer::default();
//! let update = coercer
//!     .coerce_ids(doc! { "$set": { "owner_id": "507f1f77bcf86cd799439011" } })
//!     .unwrap();
//! let owner = update.get_document("$set").unwrap().get("owner_id").unwrap();
//! assert!(matches!(owner, Bson::ObjectId(_)));
//! ```

use std::sync::Arc;

use bson::{Bson, Document, oid::ObjectId};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{DocbridgeError, DocbridgeResult};
use crate::naming::NamingConvention;

/// Operators whose operands are never identifiers or dates.
const PASSTHROUGH_OPERATORS: &[&str] =
    &["$exists", "$type", "$size", "$regex", "$options", "$mod"];

/// Update operators whose operands are placeholders or field names.
const VERBATIM_UPDATE_OPERATORS: &[&str] = &["$unset", "$rename"];

/// Which coercions a command applies to a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coercion {
    /// Raw pass-through.
    #[default]
    None,
    /// Identifier fields only.
    Ids,
    /// Identifier fields, then temporal fields.
    IdsAndDates,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Id,
    Date,
}

/// Rewrites documents according to a [`NamingConvention`].
#[derive(Debug, Clone, Default)]
pub struct Coercer {
    naming: Arc<NamingConvention>,
}

impl Coercer {
    /// Create a coercer for the given convention.
    pub fn new(naming: NamingConvention) -> Self {
        Self {
            naming: Arc::new(naming),
        }
    }

    /// The convention in use.
    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    /// Rewrite identifier fields to [`ObjectId`].
    pub fn coerce_ids(&self, doc: Document) -> DocbridgeResult<Document> {
        self.walk_document(doc, Rule::Id)
    }

    /// Rewrite temporal fields to [`bson::DateTime`].
    pub fn coerce_dates(&self, doc: Document) -> DocbridgeResult<Document> {
        self.walk_document(doc, Rule::Date)
    }

    /// Apply a coercion policy to one document.
    pub fn apply(&self, doc: Document, coercion: Coercion) -> DocbridgeResult<Document> {
        match coercion {
            Coercion::None => Ok(doc),
            Coercion::Ids => self.coerce_ids(doc),
            Coercion::IdsAndDates => self.coerce_dates(self.coerce_ids(doc)?),
        }
    }

    /// Apply a coercion policy to every document of a batch.
    pub fn apply_all(
        &self,
        docs: Vec<Document>,
        coercion: Coercion,
    ) -> DocbridgeResult<Vec<Document>> {
        docs.into_iter().map(|doc| self.apply(doc, coercion)).collect()
    }

    fn matches(&self, rule: Rule, key: &str) -> bool {
        match rule {
            Rule::Id => self.naming.is_id_field(key),
            Rule::Date => self.naming.is_datetime_field(key),
        }
    }

    fn walk_document(&self, doc: Document, rule: Rule) -> DocbridgeResult<Document> {
        let mut out = Document::new();
        for (key, value) in doc {
            let value = if VERBATIM_UPDATE_OPERATORS.contains(&key.as_str()) {
                value
            } else if self.matches(rule, &key) {
                self.coerce_field(&key, value, rule)?
            } else {
                self.walk_value(value, rule)?
            };
            out.insert(key, value);
        }
        Ok(out)
    }

    fn walk_value(&self, value: Bson, rule: Rule) -> DocbridgeResult<Bson> {
        match value {
            Bson::Document(doc) => Ok(Bson::Document(self.walk_document(doc, rule)?)),
            Bson::Array(items) => items
                .into_iter()
                .map(|item| self.walk_value(item, rule))
                .collect::<DocbridgeResult<Vec<_>>>()
                .map(Bson::Array),
            leaf => Ok(leaf),
        }
    }

    fn coerce_field(&self, field: &str, value: Bson, rule: Rule) -> DocbridgeResult<Bson> {
        match value {
            Bson::Null => Ok(Bson::Null),
            Bson::Array(items) => items
                .into_iter()
                .map(|item| self.coerce_field(field, item, rule))
                .collect::<DocbridgeResult<Vec<_>>>()
                .map(Bson::Array),
            Bson::Document(doc) if self.is_operator_document(&doc) => {
                self.coerce_operands(field, doc, rule).map(Bson::Document)
            }
            Bson::Document(doc) => self.walk_document(doc, rule).map(Bson::Document),
            leaf => match rule {
                Rule::Id => coerce_object_id(field, leaf),
                Rule::Date => coerce_datetime(field, leaf),
            },
        }
    }

    /// `{ "$in": [...], "$ne": ... }` under a matching field.
    fn coerce_operands(&self, field: &str, doc: Document, rule: Rule) -> DocbridgeResult<Document> {
        let mut out = Document::new();
        for (op, operand) in doc {
            let operand = if PASSTHROUGH_OPERATORS.contains(&op.as_str()) {
                operand
            } else {
                self.coerce_field(field, operand, rule)?
            };
            out.insert(op, operand);
        }
        Ok(out)
    }

    fn is_operator_document(&self, doc: &Document) -> bool {
        doc.keys().next().is_some_and(|key| self.naming.is_operator(key))
    }
}

/// Rewrite identifier fields using the default convention.
pub fn coerce_ids(doc: Document) -> DocbridgeResult<Document> {
    Coercer::default().coerce_ids(doc)
}

/// Rewrite temporal fields using the default convention.
pub fn coerce_dates(doc: Document) -> DocbridgeResult<Document> {
    Coercer::default().coerce_dates(doc)
}

/// Whether `s` is the 24-hex-character form of an [`ObjectId`].
pub fn is_hex24(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse an identifier string, naming `field` on failure.
pub fn parse_object_id(field: &str, s: &str) -> DocbridgeResult<ObjectId> {
    if !is_hex24(s) {
        return Err(DocbridgeError::coercion(
            field,
            format!("expected a 24-character hex string, got {s:?}"),
        ));
    }
    ObjectId::parse_str(s).map_err(|e| DocbridgeError::coercion(field, e.to_string()))
}

/// ISO-8601 layouts carrying a numeric offset (`+01:00`, `+0100`).
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y%m%dT%H%M%S%.f%z",
    "%Y%m%dT%H%M%z",
];

/// ISO-8601 layouts without an offset, read as UTC. Also used for the
/// `Z`-suffixed forms once the suffix is stripped.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y%m%dT%H%M%S%.f",
    "%Y%m%dT%H%M",
];

/// Parse a boundary timestamp.
///
/// Accepts RFC 3339, ISO-8601 extended and basic formats with a `Z` or
/// numeric offset, minute precision, naive date-times (UTC) and plain dates
/// (`2024-03-01`, `20240301`).
pub fn parse_datetime(s: &str) -> Option<bson::DateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(bson::DateTime::from_chrono(dt.with_timezone(&Utc)));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(bson::DateTime::from_chrono(dt.with_timezone(&Utc)));
        }
    }
    let naive = s
        .strip_suffix('Z')
        .or_else(|| s.strip_suffix('z'))
        .unwrap_or(s);
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(bson::DateTime::from_chrono(dt.and_utc()));
        }
    }
    ["%Y-%m-%d", "%Y%m%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| bson::DateTime::from_chrono(dt.and_utc()))
}

fn coerce_object_id(field: &str, value: Bson) -> DocbridgeResult<Bson> {
    match value {
        Bson::ObjectId(oid) => Ok(Bson::ObjectId(oid)),
        Bson::String(s) => parse_object_id(field, &s).map(Bson::ObjectId),
        other => Err(DocbridgeError::coercion(
            field,
            format!(
                "expected a 24-character hex string, found {:?}",
                other.element_type()
            ),
        )),
    }
}

fn coerce_datetime(field: &str, value: Bson) -> DocbridgeResult<Bson> {
    match value {
        Bson::DateTime(dt) => Ok(Bson::DateTime(dt)),
        Bson::String(s) => parse_datetime(&s)
            .map(Bson::DateTime)
            .ok_or_else(|| DocbridgeError::coercion(field, format!("unparseable timestamp {s:?}"))),
        Bson::Int32(millis) => Ok(Bson::DateTime(bson::DateTime::from_millis(millis.into()))),
        Bson::Int64(millis) => Ok(Bson::DateTime(bson::DateTime::from_millis(millis))),
        Bson::Double(millis) if millis.is_finite() => {
            Ok(Bson::DateTime(bson::DateTime::from_millis(millis as i64)))
        }
        other => Err(DocbridgeError::coercion(
            field,
            format!("expected a timestamp, found {:?}", other.element_type()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    const HEX: &str = "507f1f77bcf86cd799439011";
    const HEX2: &str = "507f191e810c19729de860ea";

    fn oid(hex: &str) -> ObjectId {
        ObjectId::parse_str(hex).unwrap()
    }

    #[test]
    fn test_coerce_ids_scalar() {
        let out = coerce_ids(doc! { "customer_id": HEX, "name": HEX }).unwrap();
        assert_eq!(out.get_object_id("customer_id").unwrap(), oid(HEX));
        assert_eq!(out.get("customer_id").unwrap(), &Bson::ObjectId(oid(HEX)));
        // Non-identifier fields keep their hex strings.
        assert_eq!(out.get_str("name").unwrap(), HEX);
        assert_eq!(oid(HEX).bytes(), out.get_object_id("customer_id").unwrap().bytes());
    }

    #[test]
    fn test_coerce_ids_idempotent() {
        let input = doc! {
            "_id": HEX,
            "tags_id": [HEX, HEX2],
            "$set": { "ownerId": HEX2 },
            "nested": { "parent_id": HEX },
        };
        let once = coerce_ids(input).unwrap();
        let twice = coerce_ids(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_coerce_ids_mixed_array() {
        let out = coerce_ids(doc! { "member_id": [oid(HEX), HEX2] }).unwrap();
        assert_eq!(
            out.get_array("member_id").unwrap(),
            &vec![Bson::ObjectId(oid(HEX)), Bson::ObjectId(oid(HEX2))]
        );
    }

    #[test]
    fn test_operator_keys_preserved() {
        let input = doc! {
            "$set": { "owner_id": HEX, "label": "x" },
            "$inc": { "visits": 1 },
        };
        let out = coerce_ids(input).unwrap();
        let keys: Vec<&String> = out.keys().collect();
        assert_eq!(keys, vec!["$set", "$inc"]);
        assert_eq!(
            out,
            doc! {
                "$set": { "owner_id": oid(HEX), "label": "x" },
                "$inc": { "visits": 1 },
            }
        );
    }

    #[test]
    fn test_unset_and_rename_operands_untouched() {
        let input = doc! {
            "$set": { "owner_id": HEX },
            "$unset": { "owner_id": "", "seen_datetime": 1 },
            "$rename": { "old_id": "new_id", "born_datetime": "birth_datetime" },
        };
        let out = Coercer::default().apply(input, Coercion::IdsAndDates).unwrap();
        assert_eq!(
            out,
            doc! {
                "$set": { "owner_id": oid(HEX) },
                "$unset": { "owner_id": "", "seen_datetime": 1 },
                "$rename": { "old_id": "new_id", "born_datetime": "birth_datetime" },
            }
        );
    }

    #[test]
    fn test_operator_operands_under_id_field() {
        let input = doc! {
            "_id": { "$in": [HEX, HEX2] },
            "owner_id": { "$exists": true },
            "$or": [{ "parent_id": HEX }, { "name": "a" }],
        };
        let out = coerce_ids(input).unwrap();
        assert_eq!(
            out,
            doc! {
                "_id": { "$in": [oid(HEX), oid(HEX2)] },
                "owner_id": { "$exists": true },
                "$or": [{ "parent_id": oid(HEX) }, { "name": "a" }],
            }
        );
    }

    #[test]
    fn test_malformed_id_names_field() {
        let err = coerce_ids(doc! { "$set": { "customer_id": "not-an-id" } }).unwrap_err();
        assert!(err.is_coercion());
        assert_eq!(err.field(), Some("customer_id"));

        let err = coerce_ids(doc! { "order_id": 42 }).unwrap_err();
        assert_eq!(err.field(), Some("order_id"));
    }

    #[test]
    fn test_null_passes_through() {
        let out = coerce_ids(doc! { "parent_id": Bson::Null }).unwrap();
        assert_eq!(out.get("parent_id"), Some(&Bson::Null));
    }

    #[test]
    fn test_coerce_dates() {
        let out = coerce_dates(doc! {
            "start_datetime": "2024-03-01T10:00:00Z",
            "end_datetime": 1_709_287_200_000_i64,
            "day_datetime": "2024-03-01",
            "created_at": "2024-03-01T10:00:00Z",
        })
        .unwrap();
        let expected = bson::DateTime::from_millis(1_709_287_200_000);
        assert_eq!(out.get_datetime("start_datetime").unwrap(), &expected);
        assert_eq!(out.get_datetime("end_datetime").unwrap(), &expected);
        assert_eq!(
            out.get_datetime("day_datetime").unwrap(),
            &bson::DateTime::from_millis(1_709_251_200_000)
        );
        assert!(out.get_str("created_at").is_ok());
    }

    #[test]
    fn test_coerce_dates_arrays_and_operators() {
        let out = coerce_dates(doc! {
            "slots_datetime": ["2024-03-01T10:00:00+00:00", 0_i64],
            "$set": { "seen_datetime": "2024-03-01T10:00:00.500" },
            "due_datetime": { "$gte": "2024-01-01", "$exists": true },
        })
        .unwrap();
        let slots = out.get_array("slots_datetime").unwrap();
        assert!(slots.iter().all(|v| matches!(v, Bson::DateTime(_))));
        let seen = out.get_document("$set").unwrap().get_datetime("seen_datetime").unwrap();
        assert_eq!(seen.timestamp_millis(), 1_709_287_200_500);
        let due = out.get_document("due_datetime").unwrap();
        assert!(matches!(due.get("$gte"), Some(Bson::DateTime(_))));
        assert_eq!(due.get("$exists"), Some(&Bson::Boolean(true)));
    }

    #[test]
    fn test_coerce_dates_iso8601_variants() {
        let ten = bson::DateTime::from_millis(1_709_287_200_000);
        let cases = [
            ("2024-03-01T10:00:00+0000", 0),
            ("2024-03-01T12:00:00+02:00", 0),
            ("2024-03-01T05:00:00-0500", 0),
            ("2024-03-01T12:00:00.5+0200", 500),
            ("2024-03-01T10:00Z", 0),
            ("20240301T100000Z", 0),
            ("20240301T110000+0100", 0),
            ("20240301T1000Z", 0),
            ("2024-03-01T10:00:00.000+01:00", -3_600_000),
        ];
        for (input, offset_millis) in cases {
            let out = coerce_dates(doc! { "due_datetime": input }).unwrap();
            assert_eq!(
                out.get_datetime("due_datetime").unwrap().timestamp_millis(),
                ten.timestamp_millis() + offset_millis,
                "{input}"
            );
        }

        let day = coerce_dates(doc! { "day_datetime": "20240301" }).unwrap();
        assert_eq!(
            day.get_datetime("day_datetime").unwrap(),
            &bson::DateTime::from_millis(1_709_251_200_000)
        );
    }

    #[test]
    fn test_malformed_date() {
        let err = coerce_dates(doc! { "due_datetime": "yesterday" }).unwrap_err();
        assert_eq!(err.field(), Some("due_datetime"));
    }

    #[test]
    fn test_apply_policies() {
        let coercer = Coercer::default();
        let input = doc! { "user_id": HEX, "login_datetime": "2024-03-01" };

        let raw = coercer.apply(input.clone(), Coercion::None).unwrap();
        assert_eq!(raw, input);

        let ids = coercer.apply(input.clone(), Coercion::Ids).unwrap();
        assert!(ids.get_object_id("user_id").is_ok());
        assert!(ids.get_str("login_datetime").is_ok());

        let both = coercer.apply(input, Coercion::IdsAndDates).unwrap();
        assert!(both.get_datetime("login_datetime").is_ok());
    }
}
