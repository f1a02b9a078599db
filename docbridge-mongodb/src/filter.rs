//! Filter building utilities.

use bson::{Bson, Document, doc};

use crate::naming::NamingConvention;

/// Builder for filter documents.
///
/// # Example
///
/// ```rust
/// use docbridge_mongodb::FilterBuilder;
///
/// let filter = FilterBuilder::new()
///     .eq("tenant", "acme")
///     .ne("status", "deleted")
///     .build();
///
/// assert_eq!(filter.get_str("tenant").unwrap(), "acme");
/// ```
#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    doc: Document,
}

impl FilterBuilder {
    /// Create a new empty filter builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter builder from an existing document.
    pub fn from_doc(doc: Document) -> Self {
        Self { doc }
    }

    /// Add an equality condition.
    pub fn eq(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.doc.insert(field, value.into());
        self
    }

    /// Add a not-equal condition.
    pub fn ne(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.doc.insert(field, doc! { "$ne": value.into() });
        self
    }

    /// Add an `$in` condition.
    pub fn in_array(mut self, field: &str, values: Vec<impl Into<Bson>>) -> Self {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        self.doc.insert(field, doc! { "$in": values });
        self
    }

    /// Add an existence check.
    pub fn exists(mut self, field: &str, exists: bool) -> Self {
        self.doc.insert(field, doc! { "$exists": exists });
        self
    }

    /// Exclude soft-deleted documents.
    ///
    /// When the filter already constrains the status field, both
    /// conditions are kept under `$and`.
    pub fn not_deleted(self, naming: &NamingConvention) -> Self {
        let condition = doc! {
            naming.status_field.as_str(): { "$ne": naming.deleted_marker.as_str() }
        };
        if self.doc.contains_key(naming.status_field.as_str()) {
            Self::from_doc(doc! { "$and": [self.doc, condition] })
        } else {
            self.merge(condition)
        }
    }

    /// Merge another filter into this one.
    pub fn merge(mut self, other: Document) -> Self {
        for (k, v) in other {
            self.doc.insert(k, v);
        }
        self
    }

    /// Build the filter document.
    pub fn build(self) -> Document {
        self.doc
    }

    /// Check if the filter is empty.
    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }
}

/// Filter on the primary key.
pub fn by_id(naming: &NamingConvention, id: impl Into<Bson>) -> Document {
    let id: Bson = id.into();
    doc! { naming.primary_key.as_str(): id }
}

/// Filter on a set of primary keys.
pub fn by_ids(naming: &NamingConvention, ids: Vec<impl Into<Bson>>) -> Document {
    FilterBuilder::new()
        .in_array(naming.primary_key.as_str(), ids)
        .build()
}

/// `filter` restricted to documents that are not soft-deleted.
pub fn not_deleted(naming: &NamingConvention, filter: Document) -> Document {
    FilterBuilder::from_doc(filter).not_deleted(naming).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_builder_eq() {
        let filter = FilterBuilder::new()
            .eq("name", "Alice")
            .eq("age", 30)
            .build();

        assert_eq!(filter.get_str("name").unwrap(), "Alice");
        assert_eq!(filter.get_i32("age").unwrap(), 30);
    }

    #[test]
    fn test_filter_builder_in_array() {
        let filter = FilterBuilder::new()
            .in_array("status", vec!["active", "pending"])
            .build();

        let status = filter.get_document("status").unwrap();
        assert!(status.contains_key("$in"));
    }

    #[test]
    fn test_not_deleted_merges() {
        let naming = NamingConvention::default();
        let filter = not_deleted(&naming, doc! { "tenant": "acme" });
        assert_eq!(
            filter,
            doc! { "tenant": "acme", "status": { "$ne": "deleted" } }
        );
    }

    #[test]
    fn test_not_deleted_keeps_existing_status() {
        let naming = NamingConvention::default();
        let filter = not_deleted(&naming, doc! { "status": "active" });
        assert_eq!(
            filter,
            doc! { "$and": [{ "status": "active" }, { "status": { "$ne": "deleted" } }] }
        );
    }

    #[test]
    fn test_id_helpers() {
        let naming = NamingConvention::default();
        assert_eq!(by_id(&naming, 7), doc! { "_id": 7 });
        assert_eq!(by_ids(&naming, vec![1, 2]), doc! { "_id": { "$in": [1, 2] } });
    }
}
