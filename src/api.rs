//! ==============================================================================
//! api.rs - http/json surface of the hub
//! ==============================================================================
//!
//! routes:
//!     GET  /                health check, never touches the store
//!     POST /sensor-data     upsert count + distance       -> 201 {message, data}
//!     GET  /datos-actuales  current reading or a default  -> 200 Reading
//!     POST /estado-tapa     upsert lidOpen                -> 201 {message, data}
//!
//! layers (outermost first):
//!     cors (any origin) -> request log -> panic catcher -> body limit
//!
//! bodies are json or application/x-www-form-urlencoded. anything else is
//! read as json, so a missing content type or an empty body still reaches
//! the presence checks. a body that cannot be read or parsed is an
//! internal error.
//!
//! ==============================================================================

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    async_trait,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};

use crate::config::HubConfig;
use crate::domain::{LidStateRequest, Reading, SensorDataRequest};
use crate::error::ApiError;
use crate::store::ReadingStore;

// ==============================================================================
// shared state
// ==============================================================================
// handed to every handler. the store is opened once at startup and shared;
// tests swap in their own ReadingStore.

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadingStore>,
    /// fixed key of the singleton reading
    pub record_id: Arc<str>,
    /// echo received payloads to the log
    pub show_sensor_data: bool,
}

impl AppState {
    pub fn new(store: Arc<dyn ReadingStore>, config: &HubConfig) -> Self {
        Self {
            store,
            record_id: Arc::from(config.storage.record_id.as_str()),
            show_sensor_data: config.logging.show_sensor_data,
        }
    }
}

#[derive(Serialize)]
struct WriteResponse {
    message: &'static str,
    data: Reading,
}

// ==============================================================================
// router
// ==============================================================================

pub fn router(state: AppState, body_limit: usize) -> Router {
    with_layers(routes(), state, body_limit)
}

/// the hub's routes without middleware
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health_handler))
        .route("/sensor-data", post(sensor_data_handler))
        .route("/datos-actuales", get(current_reading_handler))
        .route("/estado-tapa", post(lid_state_handler))
        .fallback(not_found_handler)
}

/// wrap routes in the hub's middleware stack and bind the state
pub fn with_layers(routes: Router<AppState>, state: AppState, body_limit: usize) -> Router {
    routes
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(log_request))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// one line per request; the subscriber adds the timestamp
async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(req).await;

    tracing::info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// global fallback: a panicking handler becomes a 500 instead of a dropped connection
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    ApiError::Internal(details).into_response()
}

// ==============================================================================
// handlers
// ==============================================================================

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "message": "smart bin hub is running" }))
}

async fn sensor_data_handler(
    State(state): State<AppState>,
    Payload(payload): Payload,
) -> Result<(StatusCode, Json<WriteResponse>), ApiError> {
    if state.show_sensor_data {
        tracing::info!(%payload, "sensor data received");
    }
    let req = SensorDataRequest::from_payload(&payload)?;

    let at = Utc::now();
    let reading = with_store(&state, "could not save sensor data", move |store, id| {
        store.upsert_measurement(id, req.count, req.distance, at)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(WriteResponse { message: "sensor data updated", data: reading }),
    ))
}

async fn current_reading_handler(State(state): State<AppState>) -> Result<Json<Reading>, ApiError> {
    let stored = with_store(&state, "could not load current reading", |store, id| store.fetch(id)).await?;
    Ok(Json(stored.unwrap_or_else(|| Reading::placeholder(&state.record_id, Utc::now()))))
}

async fn lid_state_handler(
    State(state): State<AppState>,
    Payload(payload): Payload,
) -> Result<(StatusCode, Json<WriteResponse>), ApiError> {
    if state.show_sensor_data {
        tracing::info!(%payload, "lid update received");
    }
    let req = LidStateRequest::from_payload(&payload)?;

    let at = Utc::now();
    let reading = with_store(&state, "could not update lid state", move |store, id| {
        store.upsert_lid(id, req.lid_open, at)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(WriteResponse { message: "lid state updated", data: reading }),
    ))
}

async fn not_found_handler(uri: Uri) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found", "path": uri.path() })))
}

// ==============================================================================
// helpers
// ==============================================================================

/// request body as a json value; form fields become string members
pub struct Payload(pub Value);

#[async_trait]
impl<S> FromRequest<S> for Payload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if is_form(req.headers()) {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::Internal(rejection.body_text()))?;
            let object = fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            return Ok(Payload(Value::Object(object)));
        }

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::Internal(rejection.body_text()))?;
        parse_json(&bytes).map(Payload)
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// empty body reads as `{}` so it fails the presence check, not the parser
fn parse_json(bytes: &[u8]) -> Result<Value, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|e| ApiError::Internal(format!("invalid JSON body: {e}")))
}

/// run a blocking store call off the async workers.
/// store errors are StorageFailure; a panicked or cancelled task is Internal.
async fn with_store<T, F>(state: &AppState, message: &'static str, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ReadingStore, &str) -> anyhow::Result<T> + Send + 'static,
{
    let store = state.store.clone();
    let id = state.record_id.clone();

    tokio::task::spawn_blocking(move || op(store.as_ref(), &*id))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(|e| ApiError::storage(message, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_body_parses_as_empty_object() {
        assert_eq!(parse_json(b"").unwrap(), json!({}));
        assert_eq!(parse_json(b" \n").unwrap(), json!({}));
    }

    #[test]
    fn malformed_body_is_internal() {
        let err = parse_json(b"{\"count\": 1,").unwrap_err();
        assert!(matches!(err, ApiError::Internal(ref d) if d.starts_with("invalid JSON body")));
    }

    #[test]
    fn form_content_type_is_detected() {
        let mut headers = HeaderMap::new();
        assert!(!is_form(&headers));

        headers.insert(header::CONTENT_TYPE, "application/x-www-form-urlencoded; charset=UTF-8".parse().unwrap());
        assert!(is_form(&headers));

        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(!is_form(&headers));
    }

    #[test]
    fn panic_payload_is_reported() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = panic_response(Box::new(String::from("owned boom")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
