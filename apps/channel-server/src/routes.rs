use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::{rejection::QueryRejection, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use channel_proto::{
    decode_maps, error_codes, BackChannelMode, ConnectRequest, ConnectResponse, SessionId,
    NETWORK_TEST_FIRST, NETWORK_TEST_SECOND, PROTOCOL_VERSION, TERMINATE_QUERY_TYPE,
};
use futures_util::{stream, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    session::{SessionError, SessionRegistry, SessionSnapshot},
};

pub struct AppState {
    registry: SessionRegistry,
    metrics: Option<PrometheusHandle>,
    network_test_delay: Duration,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        metrics: Option<PrometheusHandle>,
        network_test_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics,
            network_test_delay,
        })
    }

    async fn stats(&self) -> StatsResponse {
        let sessions = self.registry.snapshot().await;
        StatsResponse {
            active_sessions: sessions.len(),
            sessions,
        }
    }

    fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ForwardQuery {
    sid: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackQuery {
    sid: String,
    since: Option<u64>,
    #[serde(default)]
    mode: BackChannelMode,
}

#[derive(Debug, Deserialize)]
struct NetworkTestQuery {
    ver: u16,
}

#[derive(Debug)]
pub enum ApiError {
    UnknownSession,
    BadMap(String),
    UnsupportedVersion(u16),
    BadRequest(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::UnknownSession => error_codes::UNKNOWN_SESSION,
            ApiError::BadMap(_) => error_codes::BAD_MAP,
            ApiError::UnsupportedVersion(_) => error_codes::UNSUPPORTED_VERSION,
            ApiError::BadRequest(_) => error_codes::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::UnknownSession => "unknown or expired session".into(),
            ApiError::BadMap(reason) => reason.clone(),
            ApiError::UnsupportedVersion(version) => format!(
                "protocol version {version} is not supported (server speaks {PROTOCOL_VERSION})"
            ),
            ApiError::BadRequest(reason) => reason.clone(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownSession(_) | SessionError::Closed(_) => ApiError::UnknownSession,
            SessionError::BadMap(err) => ApiError::BadMap(err.to_string()),
            err @ SessionError::ArrayTooLarge { .. } => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code(), "message": self.message() });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let paths = &config.paths;
    let router = if paths.shared() {
        Router::new().route(&paths.forward, post(forward_handler).get(back_handler))
    } else {
        Router::new()
            .route(&paths.forward, post(forward_handler))
            .route(&paths.back, get(back_handler))
    };

    let cors = match &config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.clone())
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
        None => CorsLayer::permissive(),
    };

    router
        .route(&paths.test, get(network_test_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats().await)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Handshake (no `sid`), terminate (`type=terminate`) or a batch of maps.
async fn forward_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ForwardQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let Some(sid) = query.sid else {
        return handshake(&state, &body).map(IntoResponse::into_response);
    };
    let session_id = parse_session(&sid)?;

    match query.kind.as_deref() {
        Some(TERMINATE_QUERY_TYPE) => {
            state.registry.terminate(session_id).await?;
            info!(%session_id, "session terminated by client");
            return Ok(Json(json!({ "status": "terminated" })).into_response());
        }
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unsupported request type {other:?}"
            )))
        }
        None => {}
    }

    let batch = decode_maps(&body).map_err(|err| {
        warn!(%session_id, error = %err, "malformed forward body");
        counter!("channel_server_bad_map_batches_total", 1);
        ApiError::BadMap(err.to_string())
    })?;
    let status = state.registry.post(session_id, batch).await?;
    Ok(Json(status).into_response())
}

fn handshake(state: &AppState, body: &[u8]) -> Result<Json<ConnectResponse>, ApiError> {
    let request: ConnectRequest = serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid handshake body: {err}")))?;
    if request.protocol_version != PROTOCOL_VERSION {
        counter!("channel_server_handshakes_total", 1, "outcome" => "unsupported_version");
        return Err(ApiError::UnsupportedVersion(request.protocol_version));
    }

    let session_id = state.registry.handshake(request.client_version);
    counter!("channel_server_handshakes_total", 1, "outcome" => "ok");
    debug!(%session_id, base_url = %request.base_url, "handshake complete");
    Ok(Json(ConnectResponse {
        session_id,
        protocol_version: PROTOCOL_VERSION,
    }))
}

async fn back_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<BackQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let session_id = parse_session(&query.sid)?;
    let rx = state
        .registry
        .attach_back_channel(session_id, query.since, query.mode)
        .await?;
    debug!(%session_id, since = ?query.since, mode = query.mode.as_str(), "back channel attached");

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-store, max-age=0"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Writes the first half of the test body at once and the second after
/// `network_test_delay`; clients compare how the two arrive.
async fn network_test_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NetworkTestQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    if query.ver != PROTOCOL_VERSION {
        return Err(ApiError::UnsupportedVersion(query.ver));
    }
    counter!("channel_server_network_tests_total", 1);

    let delay = state.network_test_delay;
    let first = stream::once(async { Bytes::from_static(NETWORK_TEST_FIRST.as_bytes()) });
    let second = stream::once(async move {
        tokio::time::sleep(delay).await;
        Bytes::from_static(NETWORK_TEST_SECOND.as_bytes())
    });
    let body = first.chain(second).map(Ok::<Bytes, Infallible>);
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-store, max-age=0"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

fn parse_session(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse().map_err(|_| ApiError::UnknownSession)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ChannelPaths, session::SessionConfig};
    use axum::http::Request;
    use channel_proto::{encode_maps, BackFrame, ChunkDecoder, Map, SessionStatus};
    use tower::ServiceExt;

    fn app() -> (Router, SessionRegistry) {
        let registry = SessionRegistry::new(SessionConfig::default());
        let state = AppState::new(registry.clone(), None, Duration::from_millis(10));
        (router(state, &ServerConfig::default()), registry)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn handshake_request(version: u16) -> Request<Body> {
        let mut request = ConnectRequest::new("cv1", "http://localhost/");
        request.protocol_version = version;
        Request::post("/channel/bind")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&request).expect("encode")))
            .expect("request")
    }

    #[tokio::test]
    async fn handshake_returns_a_session() {
        let (app, registry) = app();
        let response = app
            .oneshot(handshake_request(PROTOCOL_VERSION))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let reply: ConnectResponse = serde_json::from_value(body).expect("connect response");
        assert_eq!(reply.protocol_version, PROTOCOL_VERSION);
        assert_eq!(registry.len(), 1);
        let accepted = registry.accept().await.expect("accepted");
        assert_eq!(accepted.session_id(), reply.session_id);
    }

    #[tokio::test]
    async fn handshake_with_other_version_is_rejected() {
        let (app, registry) = app();
        let response = app.oneshot(handshake_request(7)).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "unsupported_version");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn maps_are_posted_with_offsets() {
        let (app, registry) = app();
        let (sid, mut channel) = registry.open("cv1");
        let maps = vec![Map::new().with("id", "1").expect("scalar")];
        let request = Request::post(format!("/channel/bind?sid={sid}"))
            .body(Body::from(encode_maps(0, &maps).expect("encode")))
            .expect("request");

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let status: SessionStatus =
            serde_json::from_value(body_json(response).await).expect("status");
        assert!(!status.back_channel);
        assert_eq!(channel.next_map().await.expect("map").get_str("id"), Some("1"));
    }

    #[tokio::test]
    async fn malformed_maps_are_bad_map() {
        let (app, registry) = app();
        let (sid, _channel) = registry.open("cv1");
        let request = Request::post(format!("/channel/bind?sid={sid}"))
            .body(Body::from(r#"{"ofs":0,"maps":[{"list":[1,2]}]}"#))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "bad_map");
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let (app, _registry) = app();
        let request = Request::post(format!("/channel/bind?sid={}", SessionId::new_random()))
            .body(Body::from(r#"{"ofs":0,"maps":[]}"#))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(body_json(response).await["error"], "unknown_session");

        let request = Request::get("/channel/bind?sid=not-a-session")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "unknown_session");
    }

    #[tokio::test]
    async fn back_channel_streams_open_frame() {
        let (app, registry) = app();
        let (sid, _channel) = registry.open("cv1");
        let request = Request::get(format!("/channel/bind?sid={sid}&mode=poll"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, max-age=0"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let mut decoder = ChunkDecoder::new();
        decoder.push(&bytes);
        let frames = decoder.next_chunk().expect("decode").expect("chunk");
        assert_eq!(
            frames,
            vec![BackFrame::Open {
                session_id: sid,
                version: PROTOCOL_VERSION
            }]
        );
    }

    #[tokio::test]
    async fn terminate_forgets_the_session() {
        let (app, registry) = app();
        let (sid, _channel) = registry.open("cv1");
        let request = Request::post(format!("/channel/bind?sid={sid}&type=terminate"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn split_paths_route_by_method() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let config = ServerConfig {
            paths: ChannelPaths::new("fwd", "back", "check").expect("paths"),
            ..ServerConfig::default()
        };
        let app = router(
            AppState::new(registry.clone(), None, Duration::from_millis(10)),
            &config,
        );
        let (sid, _channel) = registry.open("cv1");

        let request = Request::get(format!("/back?sid={sid}&mode=poll"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::get(format!("/fwd?sid={sid}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn network_test_writes_both_halves() {
        let (app, _registry) = app();
        let request = Request::get(format!("/channel/test?ver={PROTOCOL_VERSION}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.expect("first half").expect("bytes");
        assert_eq!(&first[..], NETWORK_TEST_FIRST.as_bytes());
        let second = body.next().await.expect("second half").expect("bytes");
        assert_eq!(&second[..], NETWORK_TEST_SECOND.as_bytes());
        assert!(body.next().await.is_none());

        let request = Request::get("/channel/test?ver=7")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(body_json(response).await["error"], "unsupported_version");

        let request = Request::get("/channel/test").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(body_json(response).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn ops_endpoints_respond() {
        let (app, registry) = app();
        let _ = registry.open("cv1");
        let response = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(body_json(response).await["status"], "ok");

        let response = app
            .clone()
            .oneshot(Request::get("/debug/stats").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(body_json(response).await["active_sessions"], 1);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
