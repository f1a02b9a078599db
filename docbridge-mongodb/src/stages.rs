//! Aggregation pipeline stage helpers.

use bson::{Document, doc};

/// Create a $match stage.
pub fn match_stage(filter: Document) -> Document {
    doc! { "$match": filter }
}

/// Create a $lookup stage (left join).
pub fn lookup_stage(
    from: &str,
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
) -> Document {
    doc! {
        "$lookup": {
            "from": from,
            "localField": local_field,
            "foreignField": foreign_field,
            "as": as_field
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_stage() {
        let stage = lookup_stage("customer", "customer_id", "_id", "customer");
        let lookup = stage.get_document("$lookup").unwrap();
        assert_eq!(lookup.get_str("localField").unwrap(), "customer_id");
        assert_eq!(lookup.get_str("as").unwrap(), "customer");
    }

    #[test]
    fn test_match_stage() {
        assert_eq!(match_stage(doc! { "a": 1 }), doc! { "$match": { "a": 1 } });
    }
}
