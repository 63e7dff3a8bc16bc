use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use velo_consensus::{ApplyOutcome, Cluster, Role};
use velo_storage::BikeStore;

use crate::{ApiError, AppState};

/// Marks a request relayed by a follower. A non-leader that receives the
/// marker answers 503 instead of forwarding again, so a misconfigured
/// cluster cannot loop a write around itself.
pub const FORWARDED_HEADER: &str = "x-velodrome-forwarded";

/// POST /bikes — the write path.
///
/// Every mutation is linearised through the replicated log regardless of
/// which node receives it: the leader proposes the payload locally and
/// answers with the applied bike; a follower relays method, path, and body
/// to the leader's API address and streams the answer back verbatim.
pub async fn post_bike<C: Cluster, B: BikeStore>(
    State(app): State<AppState<C, B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if app.cluster.role().await == Role::Leader {
        return apply_local(&app, body).await;
    }

    if headers.contains_key(FORWARDED_HEADER) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "forwarded write reached a non-leader; retry later",
        )
            .into_response();
    }

    match app.cluster.leader_api_addr().await {
        Some(leader) => forward(&app, &leader, body).await,
        None => {
            (StatusCode::SERVICE_UNAVAILABLE, "no leader elected; retry later").into_response()
        }
    }
}

async fn apply_local<C: Cluster, B: BikeStore>(app: &AppState<C, B>, body: Bytes) -> Response {
    match app.cluster.apply(body.to_vec(), app.apply_timeout).await {
        Ok(ApplyOutcome::Applied(bike)) => axum::Json(bike).into_response(),
        Ok(ApplyOutcome::Rejected(reason)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
        }
        Ok(ApplyOutcome::Noop) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "command produced no result",
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn forward<C: Cluster, B: BikeStore>(
    app: &AppState<C, B>,
    leader: &str,
    body: Bytes,
) -> Response {
    let url = format!("http://{leader}/bikes");
    tracing::debug!(%url, "forwarding write to leader");

    let sent = app
        .http
        .post(&url)
        .header(FORWARDED_HEADER, "1")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;

    match sent {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            match resp.bytes().await {
                Ok(bytes) => (
                    status,
                    [(header::CONTENT_TYPE, "application/json")],
                    bytes,
                )
                    .into_response(),
                Err(e) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, format!("reading leader reply: {e}"))
                        .into_response()
                }
            }
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("forwarding to leader: {e}"),
        )
            .into_response(),
    }
}
