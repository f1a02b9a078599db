//! Document access and conversion helpers.

use bson::{Bson, Document, oid::ObjectId};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreResult;

/// Extension trait for BSON documents.
pub trait DocumentExt {
    /// Resolve a dotted path (`address.city`, `items.0.sku`).
    fn get_path(&self, path: &str) -> Option<&Bson>;

    /// Set a dotted path, creating intermediate documents.
    ///
    /// Returns `false` when an intermediate segment exists but is not a
    /// document.
    fn set_path(&mut self, path: &str, value: impl Into<Bson>) -> bool;

    /// Remove a dotted path, returning the previous value.
    fn remove_path(&mut self, path: &str) -> Option<Bson>;

    /// Top-level field names in insertion order.
    fn field_names(&self) -> Vec<&str>;

    /// Get the `_id` field as an ObjectId.
    fn object_id(&self) -> Option<ObjectId>;

    /// Convert to a typed struct.
    fn to_struct<T: DeserializeOwned>(&self) -> StoreResult<T>;
}

impl DocumentExt for Document {
    fn get_path(&self, path: &str) -> Option<&Bson> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Bson::Document(doc) => doc.get(segment)?,
                Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn set_path(&mut self, path: &str, value: impl Into<Bson>) -> bool {
        let value = value.into();
        match path.split_once('.') {
            None => {
                self.insert(path, value);
                true
            }
            Some((head, rest)) => {
                if !self.contains_key(head) {
                    self.insert(head, Document::new());
                }
                match self.get_mut(head) {
                    Some(Bson::Document(child)) => child.set_path(rest, value),
                    _ => false,
                }
            }
        }
    }

    fn remove_path(&mut self, path: &str) -> Option<Bson> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head) {
                Some(Bson::Document(child)) => child.remove_path(rest),
                _ => None,
            },
        }
    }

    fn field_names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }

    fn object_id(&self) -> Option<ObjectId> {
        self.get_object_id("_id").ok()
    }

    fn to_struct<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(bson::from_document(self.clone())?)
    }
}

/// Convert a struct to a BSON document.
pub fn to_document<T: Serialize>(value: &T) -> StoreResult<Document> {
    Ok(bson::to_document(value)?)
}

/// Convert a BSON document to a struct.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> StoreResult<T> {
    Ok(bson::from_document(doc)?)
}

/// Render a value the way string concatenation would: strings bare,
/// identifiers as hex, dates as RFC 3339, everything else as relaxed JSON.
pub fn plain_string(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Null => "null".to_string(),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_get_path() {
        let doc = doc! {
            "address": { "city": "Monterrey" },
            "items": [{ "sku": "A-1" }, { "sku": "B-2" }],
        };
        assert_eq!(doc.get_path("address.city"), Some(&Bson::String("Monterrey".into())));
        assert_eq!(doc.get_path("items.1.sku"), Some(&Bson::String("B-2".into())));
        assert_eq!(doc.get_path("address.zip"), None);
        assert_eq!(doc.get_path("items.x"), None);
    }

    #[test]
    fn test_set_and_remove_path() {
        let mut doc = doc! { "name": "x", "flat": 1 };
        assert!(doc.set_path("profile.tier", "gold"));
        assert_eq!(doc, doc! { "name": "x", "flat": 1, "profile": { "tier": "gold" } });
        assert!(!doc.set_path("flat.inner", 2));

        assert_eq!(doc.remove_path("profile.tier"), Some(Bson::String("gold".into())));
        assert_eq!(doc.remove_path("missing.path"), None);
    }

    #[test]
    fn test_to_struct_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct User {
            name: String,
            age: i32,
        }

        let doc = to_document(&User { name: "Bob".into(), age: 25 }).unwrap();
        assert_eq!(doc.get_str("name").unwrap(), "Bob");
        let user: User = doc.to_struct().unwrap();
        assert_eq!(user, User { name: "Bob".into(), age: 25 });
    }

    #[test]
    fn test_plain_string() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        assert_eq!(plain_string(&Bson::ObjectId(oid)), "507f1f77bcf86cd799439011");
        assert_eq!(plain_string(&Bson::String("RFC-1".into())), "RFC-1");
        assert_eq!(plain_string(&Bson::Int64(9)), "9");
    }
}
