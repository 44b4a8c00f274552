//! Router tests for the replication API, driven through `tower::ServiceExt::oneshot`.

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use snapferry_storage::driver::{StreamReader, StreamWriter};
use snapferry_storage::{
    Dataset, DatasetType, DestroyFlags, DriverError, DriverResult, ListOptions, MemoryDriver,
    ReceiveOptions, SendOptions, StorageDriver,
};
use snapferry_transport::protocol::{HEADER_AUTH, HEADER_RESUME_TOKEN};
use snapferry_transport::{router, HttpConfig, TransportState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;

const TOKEN: &str = "secret";

fn config(parent: &str, max_concurrent_receives: usize) -> HttpConfig {
    HttpConfig {
        parent_dataset: parent.to_string(),
        auth_tokens: vec![TOKEN.to_string()],
        max_concurrent_receives,
        ..HttpConfig::default()
    }
}

fn app(driver: Arc<MemoryDriver>, parent: &str, gate: usize) -> (Arc<TransportState>, Router) {
    let state = Arc::new(TransportState::new(driver, config(parent, gate)));
    (state.clone(), router(state))
}

async fn source() -> Arc<MemoryDriver> {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    driver.write_content("pool/fs", &vec![5u8; 300_000]).unwrap();
    driver.create_snapshot("pool/fs", "s1", false).await.unwrap();
    driver
}

fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(HEADER_AUTH, TOKEN)
        .body(body)
        .unwrap()
}

async fn bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn full_stream(src: &Router) -> Bytes {
    let response = src
        .clone()
        .oneshot(request("GET", "/filesystems/fs/snapshots/s1", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    bytes(response).await
}

/// Memory driver whose sends write `cut` bytes and then fail.
struct FailingSend {
    inner: Arc<MemoryDriver>,
    cut: usize,
}

#[async_trait]
impl StorageDriver for FailingSend {
    async fn list_datasets(&self, opts: ListOptions) -> DriverResult<Vec<Dataset>> {
        self.inner.list_datasets(opts).await
    }

    async fn list_with_property(
        &self,
        dataset_type: DatasetType,
        parent: &str,
        property: &str,
    ) -> DriverResult<HashMap<String, String>> {
        self.inner
            .list_with_property(dataset_type, parent, property)
            .await
    }

    async fn get_dataset(&self, name: &str, extra_props: &[String]) -> DriverResult<Dataset> {
        self.inner.get_dataset(name, extra_props).await
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> DriverResult<()> {
        self.inner.set_property(dataset, key, value).await
    }

    async fn inherit_property(&self, dataset: &str, key: &str) -> DriverResult<()> {
        self.inner.inherit_property(dataset, key).await
    }

    async fn create_snapshot(
        &self,
        dataset: &str,
        name: &str,
        recursive: bool,
    ) -> DriverResult<Dataset> {
        self.inner.create_snapshot(dataset, name, recursive).await
    }

    async fn destroy_dataset(&self, dataset: &str, flags: DestroyFlags) -> DriverResult<()> {
        self.inner.destroy_dataset(dataset, flags).await
    }

    async fn send_stream(
        &self,
        snapshot: &str,
        writer: &mut StreamWriter<'_>,
        opts: SendOptions,
    ) -> DriverResult<()> {
        let mut full: Vec<u8> = Vec::new();
        self.inner.send_stream(snapshot, &mut full, opts).await?;
        writer.write_all(&full[..self.cut.min(full.len())]).await?;
        Err(DriverError::stream("device went away"))
    }

    async fn receive_stream(
        &self,
        reader: &mut StreamReader<'_>,
        name: &str,
        opts: ReceiveOptions,
    ) -> DriverResult<Dataset> {
        self.inner.receive_stream(reader, name, opts).await
    }

    async fn resume_send(&self, writer: &mut StreamWriter<'_>, token: &str) -> DriverResult<()> {
        self.inner.resume_send(writer, token).await
    }

    async fn children(&self, dataset: &str, depth: u64) -> DriverResult<Vec<Dataset>> {
        self.inner.children(dataset, depth).await
    }
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/filesystems")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/filesystems")
                .header(HEADER_AUTH, "guess")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_query_token_accepted_and_names_are_logical() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/filesystems?authToken=secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let list: Vec<Dataset> = serde_json::from_slice(&bytes(response).await).unwrap();
    let names: Vec<&str> = list.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["fs"]);
}

#[tokio::test]
async fn test_create_and_list_snapshots() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .clone()
        .oneshot(request("POST", "/filesystems/fs/snapshots/s2", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(request("GET", "/filesystems/fs/snapshots", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list: Vec<Dataset> = serde_json::from_slice(&bytes(response).await).unwrap();
    let names: Vec<&str> = list.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["fs@s1", "fs@s2"]);

    let response = app
        .oneshot(request("GET", "/filesystems/nope/snapshots", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_patch_properties_echoes_requested() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/filesystems/fs?extraProperties=x:y")
                .header(HEADER_AUTH, TOKEN)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"set":{"x:y":"1"}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ds: Dataset = serde_json::from_slice(&bytes(response).await).unwrap();
    assert_eq!(ds.prop("x:y"), Some("1"));

    let response = app
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/filesystems/fs?extraProperties=x:y")
                .header(HEADER_AUTH, TOKEN)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"unset":["x:y"]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let ds: Dataset = serde_json::from_slice(&bytes(response).await).unwrap();
    assert_eq!(ds.prop("x:y"), None);
}

#[tokio::test]
async fn test_send_missing_snapshot_is_404_before_streaming() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .oneshot(request("GET", "/filesystems/fs/snapshots/nope", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_send_then_receive() {
    let (_, src) = app(source().await, "pool", 2);
    let dst_driver = Arc::new(MemoryDriver::with_root("backup").unwrap());
    let (_, dst) = app(dst_driver.clone(), "backup", 2);

    let response = src
        .oneshot(request("GET", "/filesystems/fs/snapshots/s1", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stream = bytes(response).await;

    let response = dst
        .oneshot(request(
            "PUT",
            "/filesystems/fs/snapshots?receiveProperties=%7B%22x%3Ay%22%3A%22z%22%7D",
            Body::from(stream),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let ds: Dataset = serde_json::from_slice(&bytes(response).await).unwrap();
    assert_eq!(ds.name, "fs@s1");
    assert_eq!(dst_driver.read_content("backup/fs@s1").unwrap(), vec![5u8; 300_000]);
    let fs = dst_driver
        .get_dataset("backup/fs", &["x:y".to_string()])
        .await
        .unwrap();
    assert_eq!(fs.prop("x:y"), Some("z"));
}

#[tokio::test]
async fn test_incremental_send_onto_existing_base() {
    let src_driver = source().await;
    src_driver.write_content("pool/fs", b"changed").unwrap();
    src_driver.create_snapshot("pool/fs", "s2", false).await.unwrap();
    let (_, src) = app(src_driver, "pool", 2);
    let dst_driver = Arc::new(MemoryDriver::with_root("backup").unwrap());
    let (_, dst) = app(dst_driver.clone(), "backup", 2);

    let full = bytes(
        src.clone()
            .oneshot(request("GET", "/filesystems/fs/snapshots/s1", Body::empty()))
            .await
            .unwrap(),
    )
    .await;
    let response = dst
        .clone()
        .oneshot(request("PUT", "/filesystems/fs/snapshots/s1", Body::from(full)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = src
        .oneshot(request(
            "GET",
            "/filesystems/fs/snapshots/s2/incremental/s1",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let incr = bytes(response).await;

    let response = dst
        .oneshot(request("PUT", "/filesystems/fs/snapshots/s2", Body::from(incr)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let ds: Dataset = serde_json::from_slice(&bytes(response).await).unwrap();
    assert_eq!(ds.name, "fs@s2");
    assert_eq!(dst_driver.read_content("backup/fs@s2").unwrap(), b"changed");
}

#[tokio::test]
async fn test_interrupted_receive_resumes_by_token() {
    let (_, src) = app(source().await, "pool", 2);
    let dst_driver = Arc::new(MemoryDriver::with_root("backup").unwrap());
    let (_, dst) = app(dst_driver.clone(), "backup", 2);

    let stream = bytes(
        src.clone()
            .oneshot(request("GET", "/filesystems/fs/snapshots/s1", Body::empty()))
            .await
            .unwrap(),
    )
    .await;

    let response = dst
        .clone()
        .oneshot(request(
            "PUT",
            "/filesystems/fs/snapshots/s1?resumable=true",
            Body::from(stream.slice(..100_000)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let token = response.headers()[HEADER_RESUME_TOKEN]
        .to_str()
        .unwrap()
        .to_string();

    let response = dst
        .clone()
        .oneshot(request("GET", "/filesystems/fs/resume-token", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()[HEADER_RESUME_TOKEN], token.as_str());

    let response = src
        .oneshot(request("GET", &format!("/snapshot/resume/{}", token), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rest = bytes(response).await;
    assert!(rest.len() < stream.len());

    let response = dst
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/filesystems/fs/snapshots/s1")
                .header(HEADER_AUTH, TOKEN)
                .header(HEADER_RESUME_TOKEN, token.as_str())
                .body(Body::from(rest))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(dst_driver.read_content("backup/fs@s1").unwrap(), vec![5u8; 300_000]);

    let response = dst
        .oneshot(request("GET", "/filesystems/fs/resume-token", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_saturated_gate_rejects_with_429() {
    let (_, src) = app(source().await, "pool", 2);
    let stream = full_stream(&src).await;
    let driver = Arc::new(MemoryDriver::with_root("pool").unwrap());
    let (state, app) = app(driver.clone(), "pool", 1);

    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, std::io::Error>>();
    tx.unbounded_send(Ok(stream.slice(..100_000))).unwrap();
    let first = tokio::spawn(app.clone().oneshot(request(
        "PUT",
        "/filesystems/bla1/snapshots/s1",
        Body::from_stream(rx),
    )));
    while state.gate().in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut too_many = 0;
    for name in ["bla2", "bla3", "bla4"] {
        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/filesystems/{}/snapshots/s1", name),
                Body::from(stream.clone()),
            ))
            .await
            .unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            too_many += 1;
        }
    }
    assert_eq!(too_many, 3);

    tx.unbounded_send(Ok(stream.slice(100_000..))).unwrap();
    drop(tx);
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(state.gate().in_flight(), 0);
    assert_eq!(driver.read_content("pool/bla1@s1").unwrap(), vec![5u8; 300_000]);
    assert!(driver.get_dataset("pool/bla2", &[]).await.is_err());

    // The freed slot admits the next receive.
    let response = app
        .oneshot(request(
            "PUT",
            "/filesystems/bla2/snapshots/s1",
            Body::from(stream),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_receive_hits_the_deadline_and_frees_the_gate() {
    let (_, src) = app(source().await, "pool", 2);
    let stream = full_stream(&src).await;
    let driver = Arc::new(MemoryDriver::with_root("backup").unwrap());
    let config = HttpConfig {
        request_timeout_secs: Some(1),
        ..config("backup", 1)
    };
    let state = Arc::new(TransportState::new(driver.clone(), config));
    let dst = router(state.clone());

    let head = stream.slice(..100_000);
    let stalled = futures::stream::once(async move { Ok::<_, std::io::Error>(head) })
        .chain(futures::stream::pending());
    let started = tokio::time::Instant::now();
    let response = dst
        .clone()
        .oneshot(request(
            "PUT",
            "/filesystems/fs/snapshots/s1?resumable=true",
            Body::from_stream(stalled),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(response.headers().contains_key(HEADER_RESUME_TOKEN));
    assert_eq!(state.gate().in_flight(), 0);

    let response = dst
        .oneshot(request(
            "PUT",
            "/filesystems/other/snapshots/s1",
            Body::from(stream),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(driver.read_content("backup/other@s1").unwrap(), vec![5u8; 300_000]);
}

#[tokio::test]
async fn test_send_failure_mid_stream_cuts_the_body() {
    let driver = FailingSend {
        inner: source().await,
        cut: 1000,
    };
    let state = Arc::new(TransportState::new(Arc::new(driver), config("pool", 2)));
    let response = router(state)
        .oneshot(request("GET", "/filesystems/fs/snapshots/s1", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await;
    assert!(body.is_err());
}

#[tokio::test]
async fn test_send_failure_before_any_byte_keeps_a_status() {
    let driver = FailingSend {
        inner: source().await,
        cut: 0,
    };
    let state = Arc::new(TransportState::new(Arc::new(driver), config("pool", 2)));
    let response = router(state)
        .oneshot(request("GET", "/filesystems/fs/snapshots/s1", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_destroy_snapshot_and_filesystem() {
    let (_, app) = app(source().await, "pool", 2);
    let response = app
        .clone()
        .oneshot(request("DELETE", "/filesystems/fs", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = app
        .clone()
        .oneshot(request("DELETE", "/filesystems/fs/snapshots/s1", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request("DELETE", "/filesystems/fs", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
