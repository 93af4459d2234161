use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
    Json, Router,
};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::NegotiateError;
use crate::metrics;
use crate::signaling::{decode_offer, SdpPayload};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    metrics::register();
    Router::new()
        .route("/", get_service(ServeFile::new(state.index_path())))
        .route("/sdp", post(answer_offer))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], metrics::gather())
}

/// Body is taken raw so malformed JSON of any shape maps to a plain 400.
async fn answer_offer(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SdpPayload>, ApiError> {
    let offer = decode_offer(&body)?;
    debug!(offer_len = offer.sdp.len(), "received offer");
    let answer = state.signaling().negotiate(offer).await?;
    Ok(Json(SdpPayload { sdp: answer.sdp }))
}

/// HTTP-facing error; the body is the plain-text diagnostic.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<NegotiateError> for ApiError {
    fn from(err: NegotiateError) -> Self {
        if err.is_client_error() {
            ApiError::BadRequest(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::signaling::{SignalingConfig, SignalingHandler};
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use rtc_engine::MemoryEngine;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn app(engine: &Arc<MemoryEngine>) -> Router {
        let signaling = SignalingHandler::new(
            engine.clone(),
            SignalingConfig::default(),
            ConnectionRegistry::new(),
            CancellationToken::new(),
        );
        let index = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("static/index.html");
        router(AppState::new(Arc::new(signaling), index))
    }

    fn post_sdp(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/sdp")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn content_type(response: &Response) -> String {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn valid_offer_gets_json_answer() {
        let engine = MemoryEngine::new();
        let body = serde_json::json!({ "sdp": OFFER }).to_string();
        let response = app(&engine).oneshot(post_sdp(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(content_type(&response).starts_with("application/json"));

        let text = body_text(response).await;
        let answer: SdpPayload = serde_json::from_str(&text).unwrap();
        assert!(answer.sdp.starts_with("v=0"));
        assert!(answer.sdp.contains("a=candidate:"));
    }

    #[tokio::test]
    async fn empty_offer_is_a_server_error() {
        let engine = MemoryEngine::new();
        let response = app(&engine)
            .oneshot(post_sdp(r#"{"sdp":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(content_type(&response).starts_with("text/plain"));
        let text = body_text(response).await;
        assert!(text.contains("invalid remote description"), "{text}");
    }

    #[tokio::test]
    async fn non_json_body_is_rejected_before_negotiation() {
        let engine = MemoryEngine::new();
        let response = app(&engine)
            .oneshot(post_sdp("this is not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(content_type(&response).starts_with("text/plain"));
        let text = body_text(response).await;
        assert!(text.starts_with("malformed signaling payload"), "{text}");
        assert!(engine.peers().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_is_a_server_error() {
        let engine = MemoryEngine::new();
        engine.fail_at(rtc_engine::Stage::Create);
        let body = serde_json::json!({ "sdp": OFFER }).to_string();
        let response = app(&engine).oneshot(post_sdp(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_text(response).await;
        assert!(text.starts_with("failed to create peer connection"), "{text}");
    }

    #[tokio::test]
    async fn serves_index_and_health() {
        let engine = MemoryEngine::new();
        let app = app(&engine);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("/sdp"));

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn metrics_listed_before_any_handshake() {
        let engine = MemoryEngine::new();
        let response = app(&engine)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("sdp_bridge_active_connections"), "{text}");
        assert!(text.contains("sdp_bridge_channels_opened_total"), "{text}");
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let engine = MemoryEngine::new();
        let app = app(&engine);
        let body = serde_json::json!({ "sdp": OFFER }).to_string();
        let response = app.clone().oneshot(post_sdp(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("sdp_bridge_handshakes_total"));
    }
}
