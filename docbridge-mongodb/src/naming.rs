//! Field naming conventions that drive coercion, populate and soft delete.
//!
//! Every rule that inspects a field *name* goes through [`NamingConvention`],
//! so swapping the convention never means hunting for string checks.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// How a field name is matched against the identifier suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMatch {
    /// The name must end with one of the suffixes.
    #[default]
    Suffix,
    /// The name must contain one of the suffixes anywhere.
    Contains,
}

/// Naming convention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConvention {
    /// Suffixes that mark identifier fields (`_id`, `Id`).
    pub id_suffixes: Vec<SmolStr>,
    /// Suffix matching mode.
    pub id_match: IdMatch,
    /// Marker that denotes a temporal field.
    pub datetime_marker: SmolStr,
    /// Primary key field.
    pub primary_key: SmolStr,
    /// Leading character of update and query operators.
    pub operator_sigil: char,
    /// Field carrying the logical status of a document.
    pub status_field: SmolStr,
    /// Status value of a soft-deleted document.
    pub deleted_marker: SmolStr,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            id_suffixes: vec![SmolStr::new_static("_id"), SmolStr::new_static("Id")],
            id_match: IdMatch::Suffix,
            datetime_marker: SmolStr::new_static("_datetime"),
            primary_key: SmolStr::new_static("_id"),
            operator_sigil: '$',
            status_field: SmolStr::new_static("status"),
            deleted_marker: SmolStr::new_static("deleted"),
        }
    }
}

impl NamingConvention {
    /// Create the default convention.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the identifier matching mode.
    pub fn with_id_match(mut self, id_match: IdMatch) -> Self {
        self.id_match = id_match;
        self
    }

    /// Replace the identifier suffixes.
    pub fn with_id_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.id_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the datetime marker.
    pub fn with_datetime_marker(mut self, marker: impl Into<SmolStr>) -> Self {
        self.datetime_marker = marker.into();
        self
    }

    /// Whether `key` is an operator (`$set`, `$in`, ...).
    #[inline]
    pub fn is_operator(&self, key: &str) -> bool {
        key.starts_with(self.operator_sigil)
    }

    /// Whether `key` names an identifier field.
    pub fn is_id_field(&self, key: &str) -> bool {
        if self.is_operator(key) {
            return false;
        }
        if key == self.primary_key.as_str() {
            return true;
        }
        self.id_suffixes.iter().any(|suffix| match self.id_match {
            // A bare suffix ("Id") is not a reference to anything.
            IdMatch::Suffix => key.len() > suffix.len() && key.ends_with(suffix.as_str()),
            IdMatch::Contains => key.contains(suffix.as_str()),
        })
    }

    /// Whether `key` names a temporal field.
    pub fn is_datetime_field(&self, key: &str) -> bool {
        !self.is_operator(key) && key.contains(self.datetime_marker.as_str())
    }

    /// Whether `key` is the primary key.
    #[inline]
    pub fn is_primary_key(&self, key: &str) -> bool {
        key == self.primary_key.as_str()
    }

    /// The collection a foreign-key field points at.
    ///
    /// `customer_id` and `customerId` both resolve to `customer`. Returns
    /// `None` for the primary key and for names that are not identifiers.
    pub fn related_collection(&self, key: &str) -> Option<String> {
        if self.is_primary_key(key) || !self.is_id_field(key) {
            return None;
        }
        for suffix in &self.id_suffixes {
            if let Some(stripped) = key.strip_suffix(suffix.as_str()) {
                if !stripped.is_empty() {
                    return Some(stripped.to_string());
                }
            }
        }
        // Contains mode: drop the first occurrence of the marker.
        self.id_suffixes.iter().find_map(|suffix| {
            key.find(suffix.as_str()).map(|pos| {
                let mut name = String::with_capacity(key.len());
                name.push_str(&key[..pos]);
                name.push_str(&key[pos + suffix.len()..]);
                name
            })
        })
    }

    /// The local field a manual join on `collection` reads from.
    pub fn foreign_key_for(&self, collection: &str) -> String {
        let suffix = self
            .id_suffixes
            .first()
            .map(SmolStr::as_str)
            .unwrap_or("_id");
        format!("{collection}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_fields() {
        let naming = NamingConvention::default();
        assert!(naming.is_id_field("_id"));
        assert!(naming.is_id_field("customer_id"));
        assert!(naming.is_id_field("ownerId"));
        assert!(!naming.is_id_field("Id"));
        assert!(!naming.is_id_field("identity"));
        assert!(!naming.is_id_field("user_identity"));
        assert!(!naming.is_id_field("$id"));
    }

    #[test]
    fn test_contains_mode() {
        let naming = NamingConvention::default().with_id_match(IdMatch::Contains);
        assert!(naming.is_id_field("user_identity"));
        assert_eq!(
            naming.related_collection("user_identity").as_deref(),
            Some("userentity")
        );
    }

    #[test]
    fn test_datetime_fields() {
        let naming = NamingConvention::default();
        assert!(naming.is_datetime_field("created_datetime"));
        assert!(naming.is_datetime_field("start_datetime_local"));
        assert!(!naming.is_datetime_field("created_at"));
        assert!(!naming.is_datetime_field("$_datetime"));
    }

    #[test]
    fn test_related_collection() {
        let naming = NamingConvention::default();
        assert_eq!(naming.related_collection("customer_id").as_deref(), Some("customer"));
        assert_eq!(naming.related_collection("customerId").as_deref(), Some("customer"));
        assert_eq!(naming.related_collection("_id"), None);
        assert_eq!(naming.related_collection("name"), None);
        assert_eq!(naming.foreign_key_for("customer"), "customer_id");
    }

    #[test]
    fn test_custom_markers() {
        let naming = NamingConvention::default()
            .with_id_suffixes(["_ref"])
            .with_datetime_marker("_at");
        assert!(naming.is_id_field("author_ref"));
        assert!(!naming.is_id_field("author_id"));
        assert!(naming.is_datetime_field("created_at"));
    }
}
