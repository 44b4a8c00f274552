//! HTTP client for a remote replication server.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use snapferry_storage::{Dataset, DriverError, SendOptions, StorageDriver};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    encode_segment, HEADER_AUTH, HEADER_RESUME_TOKEN, QUERY_EXTRA_PROPERTIES,
    QUERY_RECEIVE_PROPERTIES, QUERY_RESUMABLE,
};
use crate::throttle::{ThrottledReader, Throttle};

const PIPE_SIZE: usize = 64 * 1024;
const MAX_ERROR_BODY: usize = 512;

/// Where the bytes of a push come from.
#[derive(Debug, Clone)]
pub enum PushSource {
    /// A fresh full or incremental send of a local snapshot.
    Snapshot {
        /// Full local snapshot name.
        name: String,
        /// Send options, including the incremental base.
        opts: SendOptions,
    },
    /// Continuation of an interrupted transfer.
    Resume {
        /// Token the remote reported for its partial state.
        token: String,
    },
}

/// Destination of a push on the remote side.
#[derive(Debug, Clone, Default)]
pub struct ReceiveRequest {
    /// Remote filesystem, relative to the remote's parent dataset.
    pub filesystem: String,
    /// Snapshot name; `None` takes it from the stream.
    pub snapshot: Option<String>,
    /// Ask the remote to keep partial state on interruption.
    pub resumable: bool,
    /// Properties to set on the received dataset.
    pub properties: HashMap<String, String>,
    /// Token of the partial state this push continues.
    pub resume_token: Option<String>,
}

/// Client of the replication HTTP surface.
#[derive(Debug, Clone)]
pub struct TransportClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    throttle: Arc<Throttle>,
    push_timeout: Option<Duration>,
}

impl TransportClient {
    /// Creates a client for `base_url` (`http://host:port[/prefix]`).
    pub fn new(base_url: &str, token: Option<String>) -> TransportResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TransportError::InvalidUrl {
                url: base_url,
                reason: "scheme must be http or https".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
            throttle: Arc::new(Throttle::unlimited()),
            push_timeout: None,
        })
    }

    /// Bounds the bytes per second of every push made through this client.
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Gives up on a push that has not completed within `limit`.
    pub fn with_push_timeout(mut self, limit: Duration) -> Self {
        self.push_timeout = Some(limit);
        self
    }

    /// Base URL requests go to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.header(HEADER_AUTH, token),
            None => builder,
        }
    }

    async fn check(response: Response) -> TransportResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::TooManyRequests);
        }
        let url = response.url().to_string();
        let resume_token = response
            .headers()
            .get(HEADER_RESUME_TOKEN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(MAX_ERROR_BODY);
        Err(TransportError::Status {
            status: status.as_u16(),
            url,
            body,
            resume_token,
        })
    }

    /// Lists the remote's filesystems.
    pub async fn list_filesystems(&self, extra_props: &[String]) -> TransportResult<Vec<Dataset>> {
        let mut req = self.request(Method::GET, "/filesystems");
        if !extra_props.is_empty() {
            req = req.query(&[(QUERY_EXTRA_PROPERTIES, extra_props.join(","))]);
        }
        let response = Self::check(req.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Lists the snapshots of a remote filesystem, `None` if it does not exist.
    pub async fn list_snapshots(
        &self,
        filesystem: &str,
        extra_props: &[String],
    ) -> TransportResult<Option<Vec<Dataset>>> {
        let path = format!("/filesystems/{}/snapshots", encode_segment(filesystem));
        let mut req = self.request(Method::GET, &path);
        if !extra_props.is_empty() {
            req = req.query(&[(QUERY_EXTRA_PROPERTIES, extra_props.join(","))]);
        }
        match Self::check(req.send().await?).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resume token of an interrupted receive on a remote filesystem.
    pub async fn resume_token(&self, filesystem: &str) -> TransportResult<Option<String>> {
        let path = format!("/filesystems/{}/resume-token", encode_segment(filesystem));
        match Self::check(self.request(Method::GET, &path).send().await?).await {
            Ok(response) => Ok(response
                .headers()
                .get(HEADER_RESUME_TOKEN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates a snapshot on the remote.
    pub async fn create_snapshot(&self, filesystem: &str, snapshot: &str) -> TransportResult<Dataset> {
        let path = format!(
            "/filesystems/{}/snapshots/{}",
            encode_segment(filesystem),
            encode_segment(snapshot)
        );
        let response = Self::check(self.request(Method::POST, &path).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Destroys a snapshot on the remote.
    pub async fn destroy_snapshot(&self, filesystem: &str, snapshot: &str) -> TransportResult<()> {
        let path = format!(
            "/filesystems/{}/snapshots/{}",
            encode_segment(filesystem),
            encode_segment(snapshot)
        );
        Self::check(self.request(Method::DELETE, &path).send().await?).await?;
        Ok(())
    }

    /// Uploads a stream body into a remote receive.
    pub async fn receive_snapshot(
        &self,
        target: &ReceiveRequest,
        body: reqwest::Body,
    ) -> TransportResult<Dataset> {
        let mut path = format!("/filesystems/{}/snapshots", encode_segment(&target.filesystem));
        if let Some(snapshot) = &target.snapshot {
            path.push('/');
            path.push_str(&encode_segment(snapshot));
        }
        let mut req = self.request(Method::PUT, &path).body(body);
        if target.resumable {
            req = req.query(&[(QUERY_RESUMABLE, "true")]);
        }
        if !target.properties.is_empty() {
            let encoded = serde_json::to_string(&target.properties).unwrap_or_default();
            req = req.query(&[(QUERY_RECEIVE_PROPERTIES, encoded)]);
        }
        if let Some(token) = &target.resume_token {
            req = req.header(HEADER_RESUME_TOKEN, token);
        }
        let response = Self::check(req.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Streams a local send straight into a remote receive.
    ///
    /// The local driver writes on its own task; its bytes pass through this
    /// client's throttle on their way into the request body. With a push
    /// timeout set, the whole transfer including the remote's answer must
    /// finish within it.
    pub async fn push(
        &self,
        driver: Arc<dyn StorageDriver>,
        source: PushSource,
        target: &ReceiveRequest,
    ) -> TransportResult<Dataset> {
        let (mut writer, pipe) = tokio::io::duplex(PIPE_SIZE);
        let task = tokio::spawn(async move {
            let result = match &source {
                PushSource::Snapshot { name, opts } => {
                    driver.send_stream(name, &mut writer, opts.clone()).await
                }
                PushSource::Resume { token } => driver.resume_send(&mut writer, token).await,
            };
            drop(writer);
            result
        });

        let deadline = self.push_timeout.map(|limit| Instant::now() + limit);
        let reader = ThrottledReader::new(pipe, self.throttle.clone(), deadline);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        debug!(url = %self.base_url, filesystem = %target.filesystem, "push started");
        let remote = match self.push_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.receive_snapshot(target, body)).await {
                    Ok(result) => result,
                    Err(_) => {
                        task.abort();
                        warn!(
                            url = %self.base_url,
                            filesystem = %target.filesystem,
                            "push timed out"
                        );
                        return Err(TransportError::Timeout(limit));
                    }
                }
            }
            None => self.receive_snapshot(target, body).await,
        };
        let local = task
            .await
            .map_err(|e| DriverError::Command { msg: e.to_string() });

        match (remote, local) {
            (Ok(ds), Ok(Ok(()))) => {
                info!(remote = %ds.name, "push complete");
                Ok(ds)
            }
            (Err(e), _) if e.resume_token().is_some() => Err(e),
            (_, Ok(Err(e))) | (_, Err(e)) => Err(TransportError::Driver(e)),
            (Err(e), Ok(Ok(()))) => Err(e),
        }
    }
}
