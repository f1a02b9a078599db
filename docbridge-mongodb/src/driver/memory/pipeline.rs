//! Aggregation stages supported by the memory store.

use std::cmp::Ordering;

use bson::{Bson, Document};

use super::matcher::{self, as_i64, eq_match, sort_cmp};
use crate::document::DocumentExt;
use crate::error::{StoreError, StoreResult};

/// Run `pipeline` over `input`. `source` yields the documents of another
/// collection in the same database, for `$lookup`.
pub(crate) fn run(
    mut docs: Vec<Document>,
    pipeline: &[Document],
    source: &dyn Fn(&str) -> Vec<Document>,
) -> StoreResult<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = match stage.iter().next() {
            Some((name, spec)) if stage.len() == 1 => (name.as_str(), spec),
            _ => {
                return Err(StoreError::invalid_command(
                    "a pipeline stage must have exactly one field",
                ));
            }
        };
        docs = match name {
            "$match" => {
                let filter = as_document(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matcher::matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$lookup" => lookup(docs, as_document(name, spec)?, source)?,
            "$sort" => {
                sort(&mut docs, as_document(name, spec)?);
                docs
            }
            "$limit" => {
                let n = non_negative(name, spec)?;
                docs.into_iter().take(n).collect()
            }
            "$skip" => {
                let n = non_negative(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$project" => project(docs, as_document(name, spec)?)?,
            "$unwind" => unwind(docs, spec)?,
            "$count" => match spec {
                Bson::String(_) if docs.is_empty() => Vec::new(),
                Bson::String(field) => {
                    let mut out = Document::new();
                    out.insert(field.as_str(), docs.len() as i64);
                    vec![out]
                }
                other => {
                    return Err(StoreError::invalid_command(format!(
                        "$count needs a field name, got {other}"
                    )));
                }
            },
            other => return Err(StoreError::unsupported(format!("aggregation stage {other}"))),
        };
    }
    Ok(docs)
}

/// Sort in place by a `{ field: 1 | -1 }` specification.
pub(crate) fn sort(docs: &mut [Document], spec: &Document) {
    docs.sort_by(|a, b| {
        for (field, direction) in spec {
            let ordering = sort_cmp(a.get_path(field), b.get_path(field));
            let ordering = if as_i64(direction).is_some_and(|d| d < 0) {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn as_document<'a>(stage: &str, spec: &'a Bson) -> StoreResult<&'a Document> {
    match spec {
        Bson::Document(doc) => Ok(doc),
        other => Err(StoreError::invalid_command(format!(
            "{stage} needs a document, got {other}"
        ))),
    }
}

fn non_negative(stage: &str, spec: &Bson) -> StoreResult<usize> {
    as_i64(spec)
        .filter(|n| *n >= 0)
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::invalid_command(format!("{stage} needs a non-negative integer")))
}

fn lookup(
    docs: Vec<Document>,
    spec: &Document,
    source: &dyn Fn(&str) -> Vec<Document>,
) -> StoreResult<Vec<Document>> {
    let field = |name: &str| {
        spec.get_str(name)
            .map_err(|_| StoreError::invalid_command(format!("$lookup needs '{name}'")))
    };
    let from = field("from")?;
    let local_field = field("localField")?;
    let foreign_field = field("foreignField")?;
    let as_field = field("as")?;

    let foreign = source(from);
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let locals: Vec<Bson> = match doc.get_path(local_field) {
            Some(Bson::Array(items)) => items.clone(),
            Some(value) => vec![value.clone()],
            None => vec![Bson::Null],
        };
        let joined: Vec<Bson> = foreign
            .iter()
            .filter(|candidate| {
                let value = candidate.get_path(foreign_field);
                locals.iter().any(|local| eq_match(value, local))
            })
            .cloned()
            .map(Bson::Document)
            .collect();
        if !doc.set_path(as_field, Bson::Array(joined)) {
            return Err(StoreError::invalid_command(format!(
                "cannot write $lookup output to '{as_field}'"
            )));
        }
        out.push(doc);
    }
    Ok(out)
}

fn project(docs: Vec<Document>, spec: &Document) -> StoreResult<Vec<Document>> {
    let flag = |value: &Bson| match value {
        Bson::Boolean(b) => Some(*b),
        other => as_i64(other).map(|n| n != 0),
    };
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut keep_id = true;
    for (field, value) in spec {
        let on = flag(value).ok_or_else(|| {
            StoreError::unsupported(format!("computed $project field '{field}'"))
        })?;
        match (field.as_str(), on) {
            ("_id", on) => keep_id = on,
            (_, true) => include.push(field.as_str()),
            (_, false) => exclude.push(field.as_str()),
        }
    }
    if !include.is_empty() && !exclude.is_empty() {
        return Err(StoreError::invalid_command(
            "cannot mix inclusion and exclusion in $project",
        ));
    }

    Ok(docs
        .into_iter()
        .map(|doc| {
            let mut out = Document::new();
            if include.is_empty() {
                for (key, value) in doc {
                    if !exclude.contains(&key.as_str()) && (keep_id || key != "_id") {
                        out.insert(key, value);
                    }
                }
            } else {
                if keep_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id", id.clone());
                    }
                }
                for field in &include {
                    if let Some(value) = doc.get_path(field) {
                        out.set_path(field, value.clone());
                    }
                }
            }
            out
        })
        .collect())
}

fn unwind(docs: Vec<Document>, spec: &Bson) -> StoreResult<Vec<Document>> {
    let (path, preserve) = match spec {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(opts) => (
            opts.get_str("path")
                .map_err(|_| StoreError::invalid_command("$unwind needs 'path'"))?,
            opts.get_bool("preserveNullAndEmptyArrays").unwrap_or(false),
        ),
        other => {
            return Err(StoreError::invalid_command(format!(
                "$unwind needs a path, got {other}"
            )));
        }
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| StoreError::invalid_command("$unwind path must start with '$'"))?;

    let mut out = Vec::new();
    for doc in docs {
        match doc.get_path(path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    copy.set_path(path, item);
                    out.push(copy);
                }
            }
            Some(Bson::Array(_)) | None | Some(Bson::Null) => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn customers(name: &str) -> Vec<Document> {
        match name {
            "customer" => vec![
                doc! { "_id": 1, "name": "Ana" },
                doc! { "_id": 2, "name": "Bea" },
            ],
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_match_then_lookup() {
        let orders = vec![
            doc! { "_id": 10, "customer_id": 1, "total": 5 },
            doc! { "_id": 11, "customer_id": 3, "total": 9 },
        ];
        let pipeline = vec![
            doc! { "$match": { "total": { "$gt": 1 } } },
            doc! { "$lookup": {
                "from": "customer",
                "localField": "customer_id",
                "foreignField": "_id",
                "as": "customer",
            } },
        ];
        let out = run(orders, &pipeline, &customers).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get_array("customer").unwrap().len(), 1);
        assert!(out[1].get_array("customer").unwrap().is_empty());
    }

    #[test]
    fn test_sort_skip_limit_count() {
        let docs: Vec<Document> = (1..=5).map(|n| doc! { "_id": n }).collect();
        let pipeline = vec![
            doc! { "$sort": { "_id": -1 } },
            doc! { "$skip": 1 },
            doc! { "$limit": 2 },
        ];
        let out = run(docs.clone(), &pipeline, &customers).unwrap();
        assert_eq!(out, vec![doc! { "_id": 4 }, doc! { "_id": 3 }]);

        let out = run(docs, &[doc! { "$count": "n" }], &customers).unwrap();
        assert_eq!(out, vec![doc! { "n": 5_i64 }]);
    }

    #[test]
    fn test_project_and_unwind() {
        let docs = vec![doc! { "_id": 1, "name": "a", "tags": ["x", "y"], "secret": 1 }];
        let out = run(docs.clone(), &[doc! { "$project": { "name": 1, "_id": 0 } }], &customers)
            .unwrap();
        assert_eq!(out, vec![doc! { "name": "a" }]);

        let out = run(docs, &[doc! { "$unwind": "$tags" }], &customers).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].get_str("tags").unwrap(), "y");
    }

    #[test]
    fn test_unknown_stage() {
        let err = run(vec![], &[doc! { "$facet": {} }], &customers).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }
}
