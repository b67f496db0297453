//! HTTP query surface.
//!
//! Two routes:
//! - `GET /logs/{app}` streams buffered (and, with `follow=true`, live)
//!   messages for one application as octet-counted frames, the same framing
//!   the syslog listener accepts. Query parameters: `lines` (negative means
//!   all, default), `follow`, `proc_id`, `contains`.
//! - `GET /healthz` reports liveness and the current replication role.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::controller::Role;
use crate::filter::Filter;
use crate::message::Message;
use crate::syslog;

#[derive(Clone)]
struct ApiState {
    aggregator: Arc<Aggregator>,
    role: watch::Receiver<Role>,
    shutdown: CancellationToken,
}

pub fn router(
    aggregator: Arc<Aggregator>,
    role: watch::Receiver<Role>,
    shutdown: CancellationToken,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/logs/{app}", get(read_logs))
        .with_state(ApiState {
            aggregator,
            role,
            shutdown,
        })
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "all_lines")]
    lines: i64,
    #[serde(default)]
    follow: bool,
    proc_id: Option<String>,
    contains: Option<String>,
}

fn all_lines() -> i64 {
    -1
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let role = match &*state.role.borrow() {
        Role::Unknown => "unknown",
        Role::Leader => "leader",
        Role::Follower(_) => "follower",
    };
    Json(serde_json::json!({ "status": "ok", "role": role }))
}

async fn read_logs(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let mut filters = Vec::new();
    if let Some(proc_id) = query.proc_id {
        filters.push(Filter::ProcId(proc_id));
    }
    if let Some(needle) = query.contains {
        filters.push(Filter::Contains(needle));
    }

    // server shutdown cancels the stream; a client disconnect drops the
    // body and the producer stops on its closed channel
    let done = state.shutdown.child_token();
    let messages = if query.follow {
        state
            .aggregator
            .read_last_n_and_subscribe(&app, query.lines, filters, done)
    } else {
        state.aggregator.read_last_n(&app, query.lines, filters, done)
    };

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(frame_stream(messages)),
    )
        .into_response()
}

fn frame_stream(
    messages: mpsc::Receiver<Arc<Message>>,
) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    futures_util::stream::unfold(messages, |mut messages| async move {
        let message = messages.recv().await?;
        Some((Ok(syslog::encode_frame(&message)), messages))
    })
}
