//! Integration tests for the storage controller.

mod common;

use common::{TestController, body, items, quota, request};
use http::StatusCode;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde_json::json;
use weave_core::{ItemUpdate, Timestamp};
use weave_server::error::{WEAVE_INVALID_WBO, WEAVE_MALFORMED_JSON, WEAVE_OVER_QUOTA};
use weave_server::request::{X_CONFIRM_DELETE, X_IF_UNMODIFIED_SINCE};
use weave_server::response::{X_WEAVE_QUOTA_REMAINING, X_WEAVE_RECORDS, X_WEAVE_TIMESTAMP};
use weave_server::{ControllerError, StorageController};

fn at(secs: i64) -> Timestamp {
    Timestamp::from_secs(secs)
}

#[tokio::test]
async fn test_batch_over_count_is_partially_refused() {
    let t = TestController::new().await;
    let response = t.post("history", items("h", 105, 10), at(1_000)).await;
    let result = body(&response);

    assert_eq!(result["success"].as_array().unwrap().len(), 100);
    let failed = result["failed"].as_object().unwrap();
    assert_eq!(failed.len(), 5);
    for n in 100..105 {
        assert_eq!(failed[&format!("h{n}")], json!(["retry wbo"]));
    }
    assert_eq!(result["modified"], json!("1000.00"));
    assert_eq!(response.header(&X_WEAVE_TIMESTAMP), Some("1000.00"));

    let counts = t.storage.get_collection_counts(1).await.unwrap();
    assert_eq!(counts["history"], 100);
}

#[tokio::test]
async fn test_batch_over_bytes_is_partially_refused() {
    let t = TestController::new().await;
    let result = body(&t.post("forms", items("f", 5, 210 * 1024), at(1_000)).await);

    assert_eq!(result["success"], json!(["f0", "f1", "f2", "f3"]));
    assert_eq!(result["failed"], json!({"f4": ["retry bytes"]}));
}

#[tokio::test]
async fn test_batch_reports_invalid_items() {
    let t = TestController::new().await;
    let batch = json!([
        {"id": "good", "payload": "x"},
        {"id": "bad", "payload": 5},
        {"id": "huge", "sortindex": 1_000_000_000},
        {"payload": "no id"},
        "not an object",
    ]);
    let result = body(&t.post("prefs", batch, at(1_000)).await);

    assert_eq!(result["success"], json!(["good"]));
    let failed = result["failed"].as_object().unwrap();
    assert_eq!(failed["bad"], json!(["payload needs to be a json string"]));
    assert_eq!(failed["huge"], json!(["invalid sortindex"]));
    // Both anonymous failures share the empty key; the last one wins.
    assert_eq!(failed[""], json!(["invalid wbo"]));
}

#[tokio::test]
async fn test_batch_of_one() {
    let t = TestController::new().await;
    let single = request("bookmarks")
        .body(json!({"id": "solo", "payload": "x"}).to_string())
        .at(at(1_000));
    let response = t.controller.set_collection(&single).await.unwrap();
    assert_eq!(body(&response), json!("1000.00"));
    assert!(t.storage.item_exists(1, "bookmarks", "solo").await.unwrap().is_some());

    let single = request("bookmarks").body(json!({"payload": "x"}).to_string());
    let err = t.controller.set_collection(&single).await.unwrap_err();
    assert_eq!(err.weave_code(), Some(WEAVE_INVALID_WBO));

    let single = request("bookmarks").body(json!({"id": "a/b"}).to_string());
    let err = t.controller.set_collection(&single).await.unwrap_err();
    assert_eq!(err.weave_code(), Some(WEAVE_INVALID_WBO));
}

#[tokio::test]
async fn test_malformed_and_invalid_bodies() {
    let t = TestController::new().await;
    let bad_json = request("bookmarks").item("a").body("{not json");
    let err = t.controller.set_item(&bad_json).await.unwrap_err();
    assert!(matches!(err, ControllerError::MalformedJson));
    let response = err.into_response();
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(&response.body[..], WEAVE_MALFORMED_JSON.to_string().as_bytes());

    let bad_wbo = request("bookmarks").item("a").body(r#"{"ttl": -1}"#);
    let err = t.controller.set_item(&bad_wbo).await.unwrap_err();
    assert_eq!(err.weave_code(), Some(WEAVE_INVALID_WBO));

    let bad_batch = request("bookmarks").body("[1, 2");
    let err = t.controller.set_collection(&bad_batch).await.unwrap_err();
    assert!(matches!(err, ControllerError::MalformedJson));
}

#[tokio::test]
async fn test_set_and_get_item() {
    let t = TestController::new().await;
    let put = request("bookmarks")
        .item("b1")
        .body(json!({"payload": "hello", "sortindex": 5, "parentid": "root"}).to_string())
        .at(at(1_234));
    let response = t.controller.set_item(&put).await.unwrap();
    assert_eq!(body(&response), json!("1234.00"));

    let get = request("bookmarks").item("b1");
    let wbo = body(&t.controller.get_item(&get).await.unwrap());
    assert_eq!(wbo["id"], "b1");
    assert_eq!(wbo["payload"], "hello");
    assert_eq!(wbo["sortindex"], 5);
    assert_eq!(wbo["parentid"], "root");
    assert_eq!(wbo["modified"], "1234.00");

    let missing = request("bookmarks").item("nope");
    let err = t.controller.get_item(&missing).await.unwrap_err();
    assert!(matches!(err, ControllerError::NotFound));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unmodified_since_guards_writes() {
    let t = TestController::new().await;
    t.post("bookmarks", items("b", 2, 10), at(1_000)).await;

    let stale = request("bookmarks")
        .item("b0")
        .header(X_IF_UNMODIFIED_SINCE, "999.50")
        .at(at(1_100));
    let err = t.controller.delete_item(&stale).await.unwrap_err();
    assert!(matches!(err, ControllerError::PreconditionFailed(_)));
    assert_eq!(err.into_response().status, StatusCode::PRECONDITION_FAILED);

    let stale_batch = request("bookmarks")
        .header(X_IF_UNMODIFIED_SINCE, "999.50")
        .body(items("c", 1, 10).to_string());
    assert!(t.controller.set_collection(&stale_batch).await.is_err());

    let fresh = request("bookmarks")
        .item("b0")
        .header(X_IF_UNMODIFIED_SINCE, "1000.00")
        .at(at(1_100));
    let response = t.controller.delete_item(&fresh).await.unwrap();
    assert_eq!(body(&response), json!("1100.00"));

    // A collection that was never written has nothing to conflict with.
    let empty = request("history")
        .header(X_IF_UNMODIFIED_SINCE, "1.00")
        .body(items("h", 1, 10).to_string());
    assert!(t.controller.set_collection(&empty).await.is_ok());
}

#[tokio::test]
async fn test_quota_warning_and_rejection() {
    let t = TestController::with_quota(quota(2)).await;

    let first = request("bookmarks")
        .item("a")
        .body(json!({"payload": "x".repeat(1024)}).to_string());
    let response = t.controller.set_item(&first).await.unwrap();
    assert_eq!(response.header(&X_WEAVE_QUOTA_REMAINING), Some("2.00"));

    let second = request("bookmarks")
        .item("b")
        .body(json!({"payload": "x".repeat(1024)}).to_string());
    let response = t.controller.set_item(&second).await.unwrap();
    assert_eq!(response.header(&X_WEAVE_QUOTA_REMAINING), Some("1.00"));

    let third = request("bookmarks")
        .item("c")
        .body(json!({"payload": "x"}).to_string());
    let err = t.controller.set_item(&third).await.unwrap_err();
    assert!(matches!(err, ControllerError::QuotaExceeded));
    assert_eq!(&err.into_response().body[..], WEAVE_OVER_QUOTA.to_string().as_bytes());

    let batch = request("bookmarks").body(items("d", 1, 1).to_string());
    assert!(matches!(
        t.controller.set_collection(&batch).await,
        Err(ControllerError::QuotaExceeded)
    ));

    let quota = body(&t.controller.get_quota(&request("bookmarks")).await.unwrap());
    assert_eq!(quota, json!([2.0, 2]));
}

#[tokio::test]
async fn test_quota_enforced_when_cache_lost_the_counter() {
    let t = TestController::cached_with_quota(quota(5120)).await;
    let sql = t.sql.clone().unwrap();
    let history: Vec<_> = (0..30)
        .map(|n| ItemUpdate::with_id(format!("h{n}")).payload("x".repeat(200 * 1024)))
        .collect();
    sql.set_items(1, "history", &history, None).await.unwrap();

    let write = request("bookmarks")
        .item("a")
        .body(json!({"payload": "x"}).to_string());
    let err = t.controller.set_item(&write).await.unwrap_err();
    assert!(matches!(err, ControllerError::QuotaExceeded));
}

#[tokio::test]
async fn test_quota_off_reports_no_limit() {
    let t = TestController::new().await;
    t.post("bookmarks", items("b", 1, 512), at(1_000)).await;
    let quota = body(&t.controller.get_quota(&request("bookmarks")).await.unwrap());
    assert_eq!(quota, json!([0.5, null]));

    let response = t.controller.get_collection_usage(&request("bookmarks")).await.unwrap();
    assert_eq!(body(&response), json!({"bookmarks": 0.5}));
}

#[tokio::test]
async fn test_collection_listing_and_formats() {
    let t = TestController::new().await;
    let batch = json!([
        {"id": "a", "payload": "1", "sortindex": 3},
        {"id": "b", "payload": "2", "sortindex": 1},
        {"id": "c", "payload": "3", "sortindex": 2},
    ]);
    t.post("bookmarks", batch, at(1_000)).await;

    let ids = request("bookmarks").param("sort", "index");
    let response = t.controller.get_collection(&ids).await.unwrap();
    assert_eq!(body(&response), json!(["a", "c", "b"]));
    assert_eq!(response.header(&X_WEAVE_RECORDS), Some("3"));

    let full = request("bookmarks")
        .param("full", "1")
        .param("ids", "b")
        .header(ACCEPT, "application/newlines");
    let response = t.controller.get_collection(&full).await.unwrap();
    assert_eq!(response.header(&CONTENT_TYPE), Some("application/newlines"));
    let text = String::from_utf8(response.body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    let wbo: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(wbo["id"], "b");
    assert_eq!(wbo["payload"], "2");
    assert_eq!(wbo["modified"], "1000.00");

    let paged = request("bookmarks")
        .param("sort", "index")
        .param("limit", "1")
        .param("offset", "1")
        .header(ACCEPT, "application/whoisi");
    let response = t.controller.get_collection(&paged).await.unwrap();
    assert_eq!(&response.body[..], b"\x00\x00\x00\x03\"c\"");

    let bad = request("bookmarks").param("newer", "tomorrow");
    let err = t.controller.get_collection(&bad).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_info_collections_and_counts() {
    let t = TestController::new().await;
    t.post("bookmarks", items("b", 2, 10), at(1_000)).await;
    t.post("history", items("h", 3, 10), at(1_050)).await;

    let response = t.controller.get_collections(&request("bookmarks")).await.unwrap();
    assert_eq!(
        body(&response),
        json!({"bookmarks": "1000.00", "history": "1050.00"})
    );
    assert_eq!(response.header(&X_WEAVE_RECORDS), Some("2"));

    let response = t.controller.get_collection_counts(&request("bookmarks")).await.unwrap();
    assert_eq!(body(&response), json!({"bookmarks": 2, "history": 3}));
}

#[tokio::test]
async fn test_delete_collection_with_filters() {
    let t = TestController::new().await;
    t.post("history", items("old", 2, 10), at(1_000)).await;
    t.post("history", items("new", 2, 10), at(2_000)).await;

    let delete = request("history").param("older", "1500").at(at(3_000));
    let response = t.controller.delete_collection(&delete).await.unwrap();
    assert_eq!(body(&response), json!("3000.00"));

    let listing = t.controller.get_collection(&request("history")).await.unwrap();
    let mut ids: Vec<String> = serde_json::from_value(body(&listing)).unwrap();
    ids.sort();
    assert_eq!(ids, ["new0", "new1"]);

    let everything = request("history");
    t.controller.delete_collection(&everything).await.unwrap();
    let listing = t.controller.get_collection(&request("history")).await.unwrap();
    assert_eq!(body(&listing), json!([]));
}

#[tokio::test]
async fn test_delete_storage_needs_confirmation() {
    let t = TestController::new().await;
    t.post("bookmarks", items("b", 2, 10), at(1_000)).await;

    let unconfirmed = weave_server::SyncRequest::new(1);
    let err = t.controller.delete_storage(&unconfirmed).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidWrite));
    assert_eq!(t.storage.get_collection_counts(1).await.unwrap().len(), 1);

    let confirmed = weave_server::SyncRequest::new(1).header(X_CONFIRM_DELETE, "1");
    t.controller.delete_storage(&confirmed).await.unwrap();
    assert!(t.storage.get_collection_counts(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tabs_fail_while_cache_is_down() {
    let t = TestController::cached().await;
    t.post("tabs", items("t", 2, 10), at(1_000)).await;
    t.post("bookmarks", items("b", 1, 10), at(1_000)).await;

    t.cache().go_down();

    let err = t.controller.get_collection(&request("tabs")).await.unwrap_err();
    let response = err.into_response();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!String::from_utf8_lossy(&response.body).contains("offline"));

    // Batch groups that hit the failing backend are reported per item.
    let result = body(&t.post("tabs", items("u", 3, 10), at(1_100)).await);
    assert_eq!(result["success"], json!([]));
    assert_eq!(
        result["failed"],
        json!({"u0": ["db error"], "u1": ["db error"], "u2": ["db error"]})
    );

    // SQL collections keep working.
    let listing = t.controller.get_collection(&request("bookmarks")).await.unwrap();
    assert_eq!(body(&listing), json!(["b0"]));
}

#[tokio::test]
async fn test_invalid_routing_is_a_bad_request() {
    let t = TestController::new().await;
    let err = t
        .controller
        .get_collection(&request("not a name!"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::BadRequest(_)));

    let response = StorageController::respond(Err(err));
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}
