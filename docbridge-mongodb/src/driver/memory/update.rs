//! Update document application for the memory store.

use bson::{Bson, Document, oid::ObjectId};

use super::matcher::{self, as_f64, bson_eq};
use crate::document::DocumentExt;
use crate::error::{StoreError, StoreResult};

/// Whether `update` is made of operators rather than a replacement.
pub(crate) fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Apply `update` to `doc` in place. Returns whether anything changed.
pub(crate) fn apply(doc: &mut Document, update: &Document, inserting: bool) -> StoreResult<bool> {
    let before = doc.clone();

    if !is_operator_update(update) {
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id", id);
        }
        return Ok(*doc != before);
    }

    for (op, fields) in update {
        let fields = match fields {
            Bson::Document(fields) => fields,
            other => {
                return Err(StoreError::invalid_command(format!(
                    "{op} needs a document, got {other}"
                )));
            }
        };
        for (path, operand) in fields {
            match op.as_str() {
                "$set" => set(doc, path, operand.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set(doc, path, operand.clone())?;
                    }
                }
                "$unset" => {
                    doc.remove_path(path);
                }
                "$inc" => inc(doc, path, operand)?,
                "$push" => push(doc, path, operand, false)?,
                "$addToSet" => push(doc, path, operand, true)?,
                "$pull" => pull(doc, path, operand)?,
                "$rename" => rename(doc, path, operand)?,
                other => {
                    return Err(StoreError::unsupported(format!("update operator {other}")));
                }
            }
        }
    }

    if doc.get("_id") != before.get("_id") && !inserting {
        return Err(StoreError::invalid_command("the _id field is immutable"));
    }
    Ok(*doc != before)
}

/// Seed document for an upsert: the filter's plain equality fields.
pub(crate) fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        let is_condition = matches!(
            value,
            Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$'))
        );
        if !is_condition {
            seed.set_path(key, value.clone());
        }
    }
    seed
}

/// Build the document an upsert inserts.
pub(crate) fn upsert_document(filter: &Document, update: &Document) -> StoreResult<Document> {
    let mut doc = if is_operator_update(update) {
        upsert_seed(filter)
    } else {
        let mut replacement = update.clone();
        if let Some(id) = upsert_seed(filter).get("_id") {
            replacement.insert("_id", id.clone());
        }
        replacement
    };
    if is_operator_update(update) {
        apply(&mut doc, update, true)?;
    }
    if !doc.contains_key("_id") {
        let mut with_id = Document::new();
        with_id.insert("_id", ObjectId::new());
        with_id.extend(doc);
        doc = with_id;
    }
    Ok(doc)
}

fn set(doc: &mut Document, path: &str, value: Bson) -> StoreResult<()> {
    if doc.set_path(path, value) {
        Ok(())
    } else {
        Err(StoreError::invalid_command(format!(
            "cannot create field along path '{path}'"
        )))
    }
}

fn inc(doc: &mut Document, path: &str, operand: &Bson) -> StoreResult<()> {
    let delta = as_f64(operand)
        .ok_or_else(|| StoreError::invalid_command(format!("cannot $inc by {operand}")))?;
    let next = match (doc.get_path(path), operand) {
        (None, _) => operand.clone(),
        (Some(Bson::Int32(n)), Bson::Int32(d)) => n
            .checked_add(*d)
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(i64::from(*n) + i64::from(*d))),
        (Some(Bson::Int32(n)), Bson::Int64(d)) => Bson::Int64(i64::from(*n) + d),
        (Some(Bson::Int64(n)), Bson::Int32(d)) => Bson::Int64(n + i64::from(*d)),
        (Some(Bson::Int64(n)), Bson::Int64(d)) => Bson::Int64(n + d),
        (Some(current), _) => match as_f64(current) {
            Some(n) => Bson::Double(n + delta),
            None => {
                return Err(StoreError::invalid_command(format!(
                    "cannot $inc non-numeric field '{path}'"
                )));
            }
        },
    };
    set(doc, path, next)
}

fn push(doc: &mut Document, path: &str, operand: &Bson, unique: bool) -> StoreResult<()> {
    let values = match operand {
        Bson::Document(spec) if spec.contains_key("$each") => match spec.get("$each") {
            Some(Bson::Array(items)) => items.clone(),
            _ => return Err(StoreError::invalid_command("$each needs an array")),
        },
        single => vec![single.clone()],
    };
    let mut items = match doc.get_path(path) {
        None => Vec::new(),
        Some(Bson::Array(items)) => items.clone(),
        Some(_) => {
            return Err(StoreError::invalid_command(format!(
                "field '{path}' is not an array"
            )));
        }
    };
    for value in values {
        if !unique || !items.iter().any(|existing| bson_eq(existing, &value)) {
            items.push(value);
        }
    }
    set(doc, path, Bson::Array(items))
}

fn pull(doc: &mut Document, path: &str, condition: &Bson) -> StoreResult<()> {
    let items = match doc.get_path(path) {
        Some(Bson::Array(items)) => items.clone(),
        _ => return Ok(()),
    };
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        let remove = match (condition, &item) {
            (Bson::Document(cond), _) if is_operator_update(cond) => {
                matcher::field_matches(Some(&item), condition)?
            }
            (Bson::Document(cond), Bson::Document(sub)) => matcher::matches(sub, cond)?,
            (literal, _) => bson_eq(&item, literal),
        };
        if !remove {
            kept.push(item);
        }
    }
    set(doc, path, Bson::Array(kept))
}

fn rename(doc: &mut Document, path: &str, target: &Bson) -> StoreResult<()> {
    let target = match target {
        Bson::String(s) => s.as_str(),
        other => {
            return Err(StoreError::invalid_command(format!(
                "$rename target must be a string, got {other}"
            )));
        }
    };
    if let Some(value) = doc.remove_path(path) {
        set(doc, target, value)?;
    }
    Ok(())
}
