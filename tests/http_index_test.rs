//! HTTP search index client against a local stub server: bulk bodies,
//! dual-write, retry behavior, and the version round trip through the index.

use chrono::{Duration, TimeZone, Utc};
use searchsync_rs::config::{RetryPolicy, SearchConfig};
use searchsync_rs::error::Error;
use searchsync_rs::index::{HttpSearchIndex, SearchIndex};
use searchsync_rs::model::{Disposition, Entity, EntityId, IndexDocument, PrimaryStatus};
use searchsync_rs::reconcile::classify;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Stub server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    /// Header names lowercased.
    headers: HashMap<String, String>,
    body: String,
}

type Handler = dyn Fn(&Request) -> (u16, String) + Send + Sync;

struct StubServer {
    url: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl StubServer {
    async fn start(handler: impl Fn(&Request) -> (u16, String) + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = respond(stream, handler, log).await;
                });
            }
        });

        Self { url, requests }
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

async fn respond(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<Request>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    let request = Request {
        method,
        path,
        headers,
        body,
    };
    let (status, response_body) = handler(&request);
    log.lock().unwrap().push(request);

    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// A minimal Elasticsearch: `_bulk` index actions and `_search` ids queries.
fn fake_elasticsearch() -> impl Fn(&Request) -> (u16, String) + Send + Sync + 'static {
    let docs: Mutex<HashMap<(String, String), Value>> = Mutex::new(HashMap::new());
    move |request: &Request| {
        let mut docs = docs.lock().unwrap();
        if request.path == "/_bulk" {
            let lines: Vec<Value> = request
                .body
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect();
            let mut items = Vec::new();
            for pair in lines.chunks(2) {
                let action = &pair[0]["index"];
                let index = action["_index"].as_str().unwrap().to_string();
                let id = action["_id"].as_str().unwrap().to_string();
                docs.insert((index, id.clone()), pair[1].clone());
                items.push(json!({"index": {"_id": id, "status": 201}}));
            }
            (200, json!({"errors": false, "items": items}).to_string())
        } else if let Some(index) = request
            .path
            .strip_prefix('/')
            .and_then(|p| p.strip_suffix("/_search"))
        {
            let query: Value = serde_json::from_str(&request.body).unwrap();
            let hits: Vec<Value> = query["query"]["ids"]["values"]
                .as_array()
                .unwrap()
                .iter()
                .filter_map(|id| {
                    let id = id.as_str()?.to_string();
                    let source = docs.get(&(index.to_string(), id.clone()))?;
                    let mut filtered = serde_json::Map::new();
                    for field in ["updated", "deleted"] {
                        if let Some(v) = source.get(field) {
                            filtered.insert(field.to_string(), v.clone());
                        }
                    }
                    Some(json!({"_id": id, "_source": filtered}))
                })
                .collect();
            (200, json!({"hits": {"hits": hits}}).to_string())
        } else {
            (404, json!({"error": "no handler"}).to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        interval_start: std::time::Duration::from_millis(1),
        interval_step: std::time::Duration::from_millis(1),
        interval_max: std::time::Duration::from_millis(5),
    }
}

fn client(url: &str, retry: RetryPolicy) -> HttpSearchIndex {
    HttpSearchIndex::new(SearchConfig {
        url: url.to_string(),
        index: "annotation".to_string(),
        api_key: None,
        reindex_target: None,
        retry,
    })
    .unwrap()
}

fn document(id: EntityId) -> IndexDocument {
    let updated = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        + Duration::microseconds(654_321);
    let mut body = serde_json::Map::new();
    body.insert("text".to_string(), json!("hello"));
    IndexDocument::from_entity(&Entity {
        id,
        updated,
        deleted: false,
        body,
    })
}

fn bulk_ok() -> (u16, String) {
    (200, json!({"errors": false, "items": []}).to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upserted_version_reads_back_as_already_consistent() {
    let server = StubServer::start(fake_elasticsearch()).await;
    let index = client(&server.url, RetryPolicy::none());

    let id = EntityId(Uuid::new_v4());
    let doc = document(id);
    index.upsert(std::slice::from_ref(&doc)).await.unwrap();

    let index_status = index.fetch_status(&[id]).await.unwrap();
    let primary_status = HashMap::from([(
        id,
        PrimaryStatus {
            updated: doc.updated,
            deleted: false,
        },
    )]);
    assert_eq!(index_status[&id].updated, Some(doc.updated));
    assert_eq!(
        classify(&id, &primary_status, &index_status),
        Disposition::AlreadyConsistent
    );

    // A tombstone overwrites the version, so a live entity re-indexes.
    index.tombstone(&[id]).await.unwrap();
    let index_status = index.fetch_status(&[id]).await.unwrap();
    assert!(index_status[&id].deleted);
    assert_eq!(index_status[&id].updated, None);
    assert_eq!(
        classify(&id, &primary_status, &index_status),
        Disposition::NeedsIndex
    );
}

#[tokio::test]
async fn unknown_ids_are_absent_from_status() {
    let server = StubServer::start(fake_elasticsearch()).await;
    let index = client(&server.url, RetryPolicy::none());

    let statuses = index.fetch_status(&[EntityId(Uuid::new_v4())]).await.unwrap();
    assert!(statuses.is_empty());

    let request = &server.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/annotation/_search");
    let query: Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(query["_source"], json!(["updated", "deleted"]));
}

#[tokio::test]
async fn bulk_body_is_ndjson_written_to_both_indices_during_reindex() {
    let server = StubServer::start(fake_elasticsearch()).await;
    let index = HttpSearchIndex::new(SearchConfig {
        url: server.url.clone(),
        index: "annotation".to_string(),
        api_key: Some(SecretString::from("s3cret".to_string())),
        reindex_target: Some("annotation-next".to_string()),
        retry: RetryPolicy::none(),
    })
    .unwrap();

    let (a, b) = (EntityId(Uuid::new_v4()), EntityId(Uuid::new_v4()));
    index.upsert(&[document(a), document(b)]).await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.path, "/_bulk");
    assert_eq!(request.headers["content-type"], "application/x-ndjson");
    assert_eq!(request.headers["authorization"], "ApiKey s3cret");
    assert!(request.body.ends_with('\n'));

    let lines: Vec<Value> = request
        .body
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 8);
    let targets: Vec<(&str, &str)> = lines
        .iter()
        .step_by(2)
        .map(|action| {
            (
                action["index"]["_index"].as_str().unwrap(),
                action["index"]["_id"].as_str().unwrap(),
            )
        })
        .collect();
    let (a, b) = (a.to_string(), b.to_string());
    assert_eq!(
        targets,
        vec![
            ("annotation", a.as_str()),
            ("annotation", b.as_str()),
            ("annotation-next", a.as_str()),
            ("annotation-next", b.as_str()),
        ]
    );

    let source = &lines[1];
    assert_eq!(source["id"], a);
    assert_eq!(source["updated"], "2024-05-01T12:00:00.654321Z");
    assert_eq!(source["deleted"], false);
    assert_eq!(source["text"], "hello");
}

#[tokio::test]
async fn empty_writes_send_nothing() {
    let server = StubServer::start(fake_elasticsearch()).await;
    let index = client(&server.url, RetryPolicy::none());

    index.upsert(&[]).await.unwrap();
    index.tombstone(&[]).await.unwrap();
    assert!(index.fetch_status(&[]).await.unwrap().is_empty());
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = StubServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            (503, "unavailable".to_string())
        } else {
            bulk_ok()
        }
    })
    .await;
    let index = client(&server.url, fast_retries(2));

    index
        .upsert(&[document(EntityId(Uuid::new_v4()))])
        .await
        .unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.body == requests[0].body));
}

#[tokio::test]
async fn retries_stop_after_max_retries() {
    let server = StubServer::start(|_| (429, "slow down".to_string())).await;
    let index = client(&server.url, fast_retries(2));

    let err = index
        .tombstone(&[EntityId(Uuid::new_v4())])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Index { status: 429, .. }), "got {err:?}");
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = StubServer::start(|_| (400, "mapper_parsing_exception".to_string())).await;
    let index = client(&server.url, fast_retries(5));

    let err = index
        .upsert(&[document(EntityId(Uuid::new_v4()))])
        .await
        .unwrap_err();

    match err {
        Error::Index { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "mapper_parsing_exception");
        }
        other => panic!("expected Index error, got {other:?}"),
    }
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn rejected_bulk_items_fail_the_batch_without_retrying() {
    let (ok, bad) = (EntityId(Uuid::new_v4()), EntityId(Uuid::new_v4()));
    let bad_id = bad.to_string();
    let server = StubServer::start(move |_| {
        let body = json!({
            "errors": true,
            "items": [
                {"index": {"_id": ok.to_string(), "status": 201}},
                {"index": {"_id": bad_id, "status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        });
        (200, body.to_string())
    })
    .await;
    let index = client(&server.url, fast_retries(3));

    let err = index
        .upsert(&[document(ok), document(bad)])
        .await
        .unwrap_err();

    match err {
        Error::PartialBatchFailure { failed } => assert_eq!(failed, vec![bad]),
        other => panic!("expected PartialBatchFailure, got {other:?}"),
    }
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn unreachable_index_is_transient() {
    // Reserve a port, then close it so connections are refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let index = client(&url, fast_retries(1));
    let err = index
        .fetch_status(&[EntityId(Uuid::new_v4())])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Http(_)), "got {err:?}");
    assert!(err.is_transient());
}
