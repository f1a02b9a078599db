//! Integration tests for the store verbs against the in-memory backend.
//!
//! These tests drive the public API end to end: lazy connection, coercion,
//! populate and soft delete.

use std::sync::Arc;

use docbridge::mongodb::{
    Bson, ConnectionManager, DocStore, MemoryConnector, ObjectId, PopulateOptions,
    StaticSchemaProbe, doc,
};
use pretty_assertions::assert_eq;

const CUSTOMER: &str = "507f1f77bcf86cd799439011";
const ORDER: &str = "65e1a3c0f1d2c3b4a5968778";

fn oid(hex: &str) -> ObjectId {
    ObjectId::parse_str(hex).expect("valid object id")
}

fn store(connector: &Arc<MemoryConnector>, database: &str) -> DocStore {
    DocStore::builder()
        .uri("memory://integration")
        .database(database)
        .connector(connector.clone())
        .build()
}

/// Looking a document up by a hex string id connects lazily and finds it.
#[tokio::test]
async fn test_find_id_one_with_hex_string() {
    let connector = Arc::new(MemoryConnector::new());
    connector
        .store()
        .seed("d1", "c1", vec![doc! { "_id": oid(CUSTOMER), "name": "Ana" }])
        .expect("seed");
    let store = store(&connector, "d1");

    assert!(!store.is_connected());
    let found = store.find_id_one(CUSTOMER, "c1", None).await.expect("find");
    assert_eq!(found, doc! { "_id": oid(CUSTOMER), "name": "Ana" });
    assert!(store.is_connected());
    assert_eq!(connector.connect_count(), 1);
}

/// Orders are joined with the customer their `customer_id` points at.
#[tokio::test]
async fn test_populate_by_foreign_key() {
    let connector = Arc::new(MemoryConnector::new());
    let store = store(&connector, "billing");

    store
        .save(doc! { "_id": CUSTOMER, "name": "Ana" }, "customer", None)
        .await
        .expect("save customer");
    store
        .save(
            doc! { "_id": ORDER, "customer_id": CUSTOMER, "total": 42 },
            "orders",
            None,
        )
        .await
        .expect("save order");

    let orders = store.populate_auto(doc! {}, "orders", None).await.expect("populate");
    assert_eq!(
        orders,
        vec![doc! {
            "_id": oid(ORDER),
            "customer_id": oid(CUSTOMER),
            "total": 42,
            "customer": [{ "_id": oid(CUSTOMER), "name": "Ana" }],
        }]
    );

    let manual = store
        .populate(doc! { "_id": ORDER }, &["customer"], "orders", None)
        .await
        .expect("populate manual");
    assert_eq!(manual, orders);
}

/// A caller-supplied probe drives the join without sampling the collection.
#[tokio::test]
async fn test_populate_with_static_probe() {
    let connector = Arc::new(MemoryConnector::new());
    let store = store(&connector, "billing");
    store
        .save(doc! { "_id": CUSTOMER, "name": "Ana" }, "customer", None)
        .await
        .expect("save customer");
    store
        .save(doc! { "customer_id": CUSTOMER }, "orders", None)
        .await
        .expect("save order");

    let probe = StaticSchemaProbe::new(["customer_id"]);
    let orders = store
        .populate_with("report", doc! {}, &PopulateOptions::auto(), &probe, "orders", None)
        .await
        .expect("populate");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].get_array("customer").expect("joined").len(), 1);
}

/// A soft-deleted product releases its unique code for a new product.
#[tokio::test]
async fn test_soft_delete_then_reinsert_same_code() {
    let connector = Arc::new(MemoryConnector::new());
    let store = store(&connector, "catalog");

    store
        .create_unique_index(doc! { "code": 1 }, "product", None)
        .await
        .expect("index");
    let id = store
        .save(doc! { "code": "SKU-1", "label": "Pen" }, "product", None)
        .await
        .expect("save")
        .expect("inserted");

    // Duplicate rejected while the original is live.
    let duplicate = store
        .save(doc! { "code": "SKU-1" }, "product", None)
        .await
        .expect("save");
    assert_eq!(duplicate, None);

    let report = store
        .soft_delete(id.clone(), "product", None)
        .await
        .expect("soft delete")
        .expect("report");
    assert_eq!(report.tombstoned, vec!["code".to_string()]);

    let deleted = store.find_id_one(id, "product", None).await.expect("find");
    assert_eq!(deleted.get_str("status").expect("status"), "deleted");
    assert!(deleted.get_str("code").expect("code").starts_with("Deleted"));
    assert!(deleted.get_str("code").expect("code").ends_with("-SKU-1"));

    let reinserted = store
        .save(doc! { "code": "SKU-1", "label": "Pen v2" }, "product", None)
        .await
        .expect("save");
    assert!(reinserted.is_some());

    let live = store.nd_find_many(doc! {}, None, "product", None).await.expect("nd find");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].get_str("label").expect("label"), "Pen v2");
}

/// Stores built over one manager share one session and one handle per database.
#[tokio::test]
async fn test_shared_handles() {
    let connector = Arc::new(MemoryConnector::new());
    let manager = Arc::new(ConnectionManager::new(connector.clone()));
    let first = DocStore::builder()
        .uri("memory://integration")
        .database("d1")
        .manager(manager.clone())
        .build();
    let second = DocStore::builder()
        .uri("memory://integration")
        .database("d1")
        .manager(manager.clone())
        .build();

    let (a, b) = tokio::join!(
        first.save(doc! { "n": 1 }, "c1", None),
        second.save(doc! { "n": 2 }, "c1", None),
    );
    assert!(a.expect("save").is_some());
    assert!(b.expect("save").is_some());

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(manager.cached_databases(), vec!["d1".to_string()]);
    let h1 = manager.get_database("d1").expect("handle");
    let h2 = manager.get_database("d1").expect("handle");
    assert!(h1.same_as(&h2));
    assert_eq!(first.count(doc! {}, "c1", None).await.expect("count"), Some(2));
}

/// Coercion only rewrites string identifiers; stored ObjectIds stay put.
#[tokio::test]
async fn test_coercion_is_idempotent() {
    let connector = Arc::new(MemoryConnector::new());
    let store = store(&connector, "d1");

    store
        .save(doc! { "owner_id": CUSTOMER }, "c1", None)
        .await
        .expect("save");
    store
        .save(doc! { "owner_id": oid(CUSTOMER) }, "c1", None)
        .await
        .expect("save");

    let docs = connector.store().documents("d1", "c1");
    assert_eq!(docs[0].get("owner_id"), docs[1].get("owner_id"));
    assert_eq!(docs[0].get("owner_id"), Some(&Bson::ObjectId(oid(CUSTOMER))));
}

/// An offline store answers with empty results instead of errors.
#[tokio::test]
async fn test_offline_store_returns_sentinels() {
    let connector = Arc::new(MemoryConnector::new());
    let store = store(&connector, "d1");
    store.connect().await.expect("connect");
    connector.store().set_offline(true);

    assert!(store.find_many(doc! {}, "c1", None).await.expect("find").is_empty());
    assert!(store.find_id_one(CUSTOMER, "c1", None).await.expect("find").is_empty());
    assert_eq!(store.count(doc! {}, "c1", None).await.expect("count"), None);
    assert_eq!(store.soft_delete(CUSTOMER, "c1", None).await.expect("soft delete"), None);
    assert!(store.aggregate(vec![], "c1", None).await.expect("aggregate").is_empty());
}

/// Without a default database, a verb that names none is a configuration error.
#[tokio::test]
async fn test_missing_database_is_config_error() {
    let connector = Arc::new(MemoryConnector::new());
    let store = DocStore::builder()
        .uri("memory://integration")
        .connector(connector.clone())
        .build();

    let err = store.find_many(doc! {}, "c1", None).await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(connector.connect_count(), 0);
}

/// Closing drops every handle; the next verb needs an explicit reconnect.
#[tokio::test]
async fn test_close_and_reconnect() {
    let connector = Arc::new(MemoryConnector::new());
    let store = store(&connector, "d1");
    store.save(doc! { "n": 1 }, "c1", None).await.expect("save");

    store.close().await;
    assert!(!store.is_connected());
    assert!(store.manager().cached_databases().is_empty());
    assert!(store.find_many(doc! {}, "c1", None).await.unwrap_err().is_not_connected());

    store.connect().await.expect("reconnect");
    assert_eq!(store.find_many(doc! {}, "c1", None).await.expect("find").len(), 1);
    assert_eq!(connector.connect_count(), 2);
}
