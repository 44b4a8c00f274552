//! Request handlers.
//!
//! Wire names are relative to the configured parent dataset. Stream handlers
//! check everything they can before the status line goes out; once the body
//! is flowing a driver failure can only cut the response short.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream, StreamExt, TryStreamExt};
use snapferry_storage::{
    driver::PROPERTY_RECEIVE_RESUME_TOKEN, Dataset, DatasetType, DestroyFlags, DriverError,
    ListOptions, ReceiveOptions, SendOptions,
};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::protocol::{ExtraPropsQuery, PropertyPatch, ReceiveQuery, HEADER_RESUME_TOKEN};
use crate::server::TransportState;
use crate::throttle::ThrottledReader;

type AppState = State<Arc<TransportState>>;

const PIPE_SIZE: usize = 64 * 1024;

pub(crate) async fn list_filesystems(
    State(state): AppState,
    Query(query): Query<ExtraPropsQuery>,
) -> Result<Json<Vec<Dataset>>, ApiError> {
    let parent = state.config.parent_dataset.clone();
    let list = state
        .driver
        .list_datasets(
            ListOptions::recursive(DatasetType::Filesystem, parent.clone()).with_props(query.names()),
        )
        .await?;
    Ok(Json(
        list.into_iter()
            .filter(|ds| ds.name != parent)
            .map(|ds| state.to_wire(ds))
            .collect(),
    ))
}

pub(crate) async fn get_filesystem(
    State(state): AppState,
    Path(fs): Path<String>,
    Query(query): Query<ExtraPropsQuery>,
) -> Result<Json<Dataset>, ApiError> {
    let name = state.filesystem(&fs)?;
    let ds = state.driver.get_dataset(&name, &query.names()).await?;
    Ok(Json(state.to_wire(ds)))
}

async fn apply_patch(
    state: &TransportState,
    name: &str,
    patch: &PropertyPatch,
    extra: &[String],
) -> Result<Dataset, ApiError> {
    for (key, value) in &patch.set {
        state.driver.set_property(name, key, value).await?;
    }
    for key in &patch.unset {
        state.driver.inherit_property(name, key).await?;
    }
    let ds = state.driver.get_dataset(name, extra).await?;
    Ok(state.to_wire(ds))
}

pub(crate) async fn patch_filesystem(
    State(state): AppState,
    Path(fs): Path<String>,
    Query(query): Query<ExtraPropsQuery>,
    Json(patch): Json<PropertyPatch>,
) -> Result<Json<Dataset>, ApiError> {
    let name = state.filesystem(&fs)?;
    Ok(Json(apply_patch(&state, &name, &patch, &query.names()).await?))
}

pub(crate) async fn destroy_filesystem(
    State(state): AppState,
    Path(fs): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = state.filesystem(&fs)?;
    state
        .driver
        .destroy_dataset(&name, DestroyFlags::default())
        .await?;
    info!(dataset = %name, "filesystem destroyed");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn resume_token(
    State(state): AppState,
    Path(fs): Path<String>,
) -> Result<Response, ApiError> {
    let name = state.filesystem(&fs)?;
    let ds = state
        .driver
        .get_dataset(&name, &[PROPERTY_RECEIVE_RESUME_TOKEN.to_string()])
        .await?;
    let token = ds
        .prop(PROPERTY_RECEIVE_RESUME_TOKEN)
        .ok_or_else(|| ApiError::NotFound(format!("no resume token on {}", fs)))?;
    let value = HeaderValue::from_str(token)
        .map_err(|_| ApiError::Driver(DriverError::stream("unprintable resume token")))?;
    Ok((StatusCode::NO_CONTENT, [(HEADER_RESUME_TOKEN, value)]).into_response())
}

pub(crate) async fn list_snapshots(
    State(state): AppState,
    Path(fs): Path<String>,
    Query(query): Query<ExtraPropsQuery>,
) -> Result<Json<Vec<Dataset>>, ApiError> {
    let name = state.filesystem(&fs)?;
    state.driver.get_dataset(&name, &[]).await?;
    let list = state
        .driver
        .list_datasets(
            ListOptions::recursive(DatasetType::Snapshot, name.clone()).with_props(query.names()),
        )
        .await?;
    Ok(Json(
        list.into_iter()
            .filter(|ds| ds.filesystem_name() == name)
            .map(|ds| state.to_wire(ds))
            .collect(),
    ))
}

pub(crate) async fn create_snapshot(
    State(state): AppState,
    Path((fs, snap)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Dataset>), ApiError> {
    let name = state.filesystem(&fs)?;
    state.snapshot(&fs, &snap)?;
    let ds = state.driver.create_snapshot(&name, &snap, false).await?;
    info!(snapshot = %ds.name, "snapshot created");
    Ok((StatusCode::CREATED, Json(state.to_wire(ds))))
}

pub(crate) async fn patch_snapshot(
    State(state): AppState,
    Path((fs, snap)): Path<(String, String)>,
    Query(query): Query<ExtraPropsQuery>,
    Json(patch): Json<PropertyPatch>,
) -> Result<Json<Dataset>, ApiError> {
    let name = state.snapshot(&fs, &snap)?;
    Ok(Json(apply_patch(&state, &name, &patch, &query.names()).await?))
}

pub(crate) async fn destroy_snapshot(
    State(state): AppState,
    Path((fs, snap)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let name = state.snapshot(&fs, &snap)?;
    let ds = state.driver.get_dataset(&name, &[]).await?;
    if !ds.is_snapshot() {
        return Err(DriverError::NotASnapshot { name }.into());
    }
    state
        .driver
        .destroy_dataset(&name, DestroyFlags::default())
        .await?;
    info!(snapshot = %name, "snapshot destroyed");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn receive_filesystem(
    State(state): AppState,
    Path(fs): Path<String>,
    Query(query): Query<ReceiveQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<Dataset>), ApiError> {
    let name = state.filesystem(&fs)?;
    receive(&state, name, &fs, query, &headers, body).await
}

pub(crate) async fn receive_snapshot(
    State(state): AppState,
    Path((fs, snap)): Path<(String, String)>,
    Query(query): Query<ReceiveQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<Dataset>), ApiError> {
    let name = state.snapshot(&fs, &snap)?;
    receive(&state, name, &fs, query, &headers, body).await
}

async fn receive(
    state: &TransportState,
    name: String,
    fs: &str,
    query: ReceiveQuery,
    headers: &HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<Dataset>), ApiError> {
    let properties = query
        .properties()
        .map_err(|e| ApiError::BadRequest(format!("receiveProperties: {}", e)))?;

    let _permit = state.gate.try_admit().ok_or(ApiError::TooManyRequests)?;

    let presented = headers
        .get(HEADER_RESUME_TOKEN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(presented) = presented {
        let filesystem = state.filesystem(fs)?;
        let current = state
            .driver
            .get_dataset(&filesystem, &[PROPERTY_RECEIVE_RESUME_TOKEN.to_string()])
            .await?;
        if current.prop(PROPERTY_RECEIVE_RESUME_TOKEN) != Some(presented) {
            return Err(ApiError::BadRequest(format!(
                "resume token does not match the partial state of {}",
                fs
            )));
        }
    }

    let opts = ReceiveOptions {
        resumable: query.is_resumable() || presented.is_some(),
        properties,
    };
    info!(dataset = %name, resumable = opts.resumable, "receiving stream");

    let body = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut reader = ThrottledReader::new(
        StreamReader::new(body),
        state.throttle.clone(),
        state.deadline(),
    );
    let ds = state.driver.receive_stream(&mut reader, &name, opts).await?;
    info!(dataset = %ds.name, "stream received");
    Ok((StatusCode::CREATED, Json(state.to_wire(ds))))
}

/// What a send task streams.
enum SendSource {
    Snapshot { name: String, opts: SendOptions },
    Resume { token: String },
}

pub(crate) async fn send_snapshot(
    State(state): AppState,
    Path((fs, snap)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let name = state.snapshot(&fs, &snap)?;
    check_snapshot(&state, &name).await?;
    stream_response(
        &state,
        SendSource::Snapshot {
            name,
            opts: SendOptions::default(),
        },
    )
    .await
}

pub(crate) async fn send_incremental(
    State(state): AppState,
    Path((fs, snap, base)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let name = state.snapshot(&fs, &snap)?;
    let base = state.snapshot(&fs, &base)?;
    check_snapshot(&state, &name).await?;
    check_snapshot(&state, &base).await?;
    stream_response(
        &state,
        SendSource::Snapshot {
            name,
            opts: SendOptions {
                incremental_base: Some(base),
                ..Default::default()
            },
        },
    )
    .await
}

pub(crate) async fn resume_send(
    State(state): AppState,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    stream_response(&state, SendSource::Resume { token }).await
}

async fn check_snapshot(state: &TransportState, name: &str) -> Result<(), ApiError> {
    let ds = state.driver.get_dataset(name, &[]).await?;
    if !ds.is_snapshot() {
        return Err(DriverError::NotASnapshot {
            name: name.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Runs the driver's send on its own task and streams its output.
///
/// The first chunk is awaited before answering: a driver that fails without
/// writing anything still gets a proper status code.
async fn stream_response(state: &TransportState, source: SendSource) -> Result<Response, ApiError> {
    let (mut writer, pipe) = tokio::io::duplex(PIPE_SIZE);
    let driver = state.driver.clone();
    let task = tokio::spawn(async move {
        let result = match &source {
            SendSource::Snapshot { name, opts } => {
                driver.send_stream(name, &mut writer, opts.clone()).await
            }
            SendSource::Resume { token } => driver.resume_send(&mut writer, token).await,
        };
        drop(writer);
        result
    });

    let mut reader = ThrottledReader::new(pipe, state.throttle.clone(), state.deadline());
    let mut first = vec![0u8; PIPE_SIZE];
    let read = reader.read(&mut first).await.map_err(DriverError::Io)?;
    if read == 0 {
        return match task.await {
            Ok(Ok(())) => Ok(octet_stream(Body::empty())),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(DriverError::Command { msg: e.to_string() }.into()),
        };
    }
    first.truncate(read);

    // Surfaces a failed send task as a body error so the client sees a cut stream.
    let outcome = stream::once(async move {
        match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "send stream failed mid-transfer");
                Some(Err::<Bytes, _>(io::Error::new(
                    io::ErrorKind::Other,
                    e.to_string(),
                )))
            }
            Err(e) => Some(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))),
        }
    })
    .filter_map(futures::future::ready);

    let body = stream::once(futures::future::ready(Ok::<_, io::Error>(Bytes::from(first))))
        .chain(ReaderStream::new(reader))
        .chain(outcome);

    Ok(octet_stream(Body::from_stream(body)))
}

fn octet_stream(body: Body) -> Response {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )],
        body,
    )
        .into_response()
}
