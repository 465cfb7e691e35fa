use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, BoxStream, Stream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::SecurityConfig;
use crate::engine::{ExecutionEngine, ExecutionEvent, ExecutionRequest, RunTarget};
use crate::error::{GatewayError, Result};
use crate::models::{ModelListCache, ModelSelection, DEFAULT_TEMPERATURE};
use crate::registry::LessonRegistry;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Configuration { .. } | GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::Load { .. } | GatewayError::MissingEntryPoint(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct Gateway {
    engine: ExecutionEngine,
    models: Arc<ModelListCache>,
    security: SecurityConfig,
}

impl Gateway {
    pub fn new(engine: ExecutionEngine, models: Arc<ModelListCache>, security: SecurityConfig) -> Self {
        Self {
            engine,
            models,
            security,
        }
    }

    fn cors(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .security
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if origins.is_empty() {
            layer.allow_origin(Any)
        } else {
            layer.allow_origin(AllowOrigin::list(origins))
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/catalog", get(catalog))
            .route("/run", post(run_agent))
            .route("/models", delete(clear_models))
            .route("/models/:provider", get(list_models).delete(clear_provider_models))
            .route("/api/v1/modules", get(list_modules))
            .route("/api/v1/lessons/:module/:lesson", get(lesson_detail))
            .route("/api/v1/lessons/:module/:lesson/code", get(lesson_code))
            .route("/ws/api/v1/agents/:module/:lesson/run", get(run_lesson_ws))
            .route("/events", get(stream_events))
            .layer(self.cors())
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, lessons = self.engine.registry().len(), "gateway listening");
        axum::serve(listener, self.router().into_make_service())
            .await
            .map_err(|err| GatewayError::Protocol(format!("server error: {err}")))?;
        Ok(())
    }
}

async fn catalog(State(state): State<Gateway>) -> impl IntoResponse {
    Json(state.engine.catalog().entries().to_vec())
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    agent_id: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn sse_event(event: &ExecutionEvent) -> std::result::Result<Event, axum::Error> {
    Event::default().event(event.name()).json_data(event)
}

async fn run_agent(State(state): State<Gateway>, Json(req): Json<RunRequest>) -> Response {
    let request = ExecutionRequest {
        target: RunTarget::Catalog {
            agent_id: req.agent_id,
        },
        selection: ModelSelection {
            provider: req.provider,
            model: req.model,
            temperature: Some(req.temperature),
            max_tokens: None,
        },
        params: req.params,
        message: None,
    };
    let run = match state.engine.prepare(request) {
        Ok(run) => run,
        Err(err) => return err.into_response(),
    };
    let events = state.engine.execute(run).map(|event| sse_event(&event));
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn list_models(State(state): State<Gateway>, Path(provider): Path<String>) -> Response {
    match state.models.models(&provider).await {
        Ok(models) => Json(json!({ "provider": provider, "models": models.as_slice() })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn clear_models(State(state): State<Gateway>) -> impl IntoResponse {
    state.models.invalidate(None);
    Json(json!({ "status": "cleared" }))
}

async fn clear_provider_models(State(state): State<Gateway>, Path(provider): Path<String>) -> impl IntoResponse {
    state.models.invalidate(Some(&provider));
    Json(json!({ "status": "cleared", "provider": provider }))
}

async fn list_modules(State(state): State<Gateway>) -> impl IntoResponse {
    Json(state.engine.registry().modules())
}

async fn lesson_detail(
    State(state): State<Gateway>,
    Path((module, lesson)): Path<(String, String)>,
) -> Response {
    match lesson_payload(state.engine.registry(), &format!("{module}/{lesson}")) {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

fn lesson_payload(registry: &LessonRegistry, key: &str) -> Result<Value> {
    let entry = registry.get(key)?;
    let readme = registry.readme(key)?;
    Ok(json!({ "lesson": entry, "readme": readme }))
}

async fn lesson_code(
    State(state): State<Gateway>,
    Path((module, lesson)): Path<(String, String)>,
) -> Response {
    let key = format!("{module}/{lesson}");
    match state.engine.registry().source(&key) {
        Ok(code) => Json(json!({ "key": key, "code": code })).into_response(),
        Err(err) => err.into_response(),
    }
}

/// First text frame of a portal run.
#[derive(Debug, Default, Deserialize)]
struct PortalRunConfig {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

async fn run_lesson_ws(
    ws: WebSocketUpgrade,
    State(state): State<Gateway>,
    Path((module, lesson)): Path<(String, String)>,
) -> Response {
    ws.on_upgrade(move |socket| run_lesson_socket(socket, state, module, lesson))
}

async fn run_lesson_socket(socket: WebSocket, state: Gateway, module: String, lesson: String) {
    let (mut sender, mut receiver) = socket.split();

    let config = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<PortalRunConfig>(&text),
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "websocket receive failed");
                return;
            }
        }
    };

    let prepared = config
        .map_err(|err| GatewayError::Protocol(format!("invalid run configuration: {err}")))
        .and_then(|cfg| {
            state.engine.prepare(ExecutionRequest {
                target: RunTarget::Lesson {
                    module: module.clone(),
                    lesson: lesson.clone(),
                },
                selection: ModelSelection {
                    provider: cfg.provider,
                    model: cfg.model,
                    temperature: cfg.temperature,
                    max_tokens: cfg.max_tokens,
                },
                params: cfg.params,
                message: cfg.message,
            })
        });
    let mut events: BoxStream<'static, ExecutionEvent> = match prepared {
        Ok(run) => state.engine.execute(run).boxed(),
        Err(err) => stream::once(async move { ExecutionEvent::from_error(&err) }).boxed(),
    };

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    break;
                };
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            incoming = receiver.next() => {
                if matches!(incoming, Some(Ok(Message::Close(_))) | Some(Err(_)) | None) {
                    tracing::debug!(%module, %lesson, "websocket closed by client");
                    return;
                }
            }
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

async fn stream_events(
    State(state): State<Gateway>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.engine.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => Event::default()
                .event(event.topic.clone())
                .json_data(&event)
                .ok()
                .map(Ok::<Event, Infallible>),
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        let status = |err: GatewayError| err.into_response().status();
        assert_eq!(status(GatewayError::NotFound("agent `x`".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(GatewayError::configuration("Unknown provider: x", "Available: openai")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(GatewayError::MissingEntryPoint("dynamic_main_x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status(GatewayError::Timeout(5)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(GatewayError::execution("boom")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
