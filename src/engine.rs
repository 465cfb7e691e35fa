//! Streaming execution of one lesson agent per request.
//!
//! Each run moves `Idle -> Loading -> Instantiated -> Streaming -> Completed`, or to
//! `Errored` from any non-terminal state. The stream a caller receives holds zero or
//! more `chunk` events followed by exactly one `complete` or `error` event.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::agent::{RunChunk, RunContext, RunInput};
use crate::catalog::Catalog;
use crate::config::{RunnerConfig, WorkdirPolicy};
use crate::error::{GatewayError, Result};
use crate::metrics::{MetricsEstimator, RunMetrics};
use crate::models::ModelSelection;
use crate::registry::LessonRegistry;
use crate::workdir::WorkdirGuard;

pub const DEFAULT_QUERY: &str = "Hello!";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunTarget {
    Catalog { agent_id: String },
    Lesson { module: String, lesson: String },
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTarget::Catalog { agent_id } => write!(f, "{agent_id}"),
            RunTarget::Lesson { module, lesson } => write!(f, "{module}/{lesson}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub target: RunTarget,
    pub selection: ModelSelection,
    pub params: BTreeMap<String, Value>,
    /// Free-text query for lesson runs; catalog runs derive it from `params`.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Chunk {
        content: String,
    },
    Complete {
        content: String,
        metrics: RunMetrics,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Chunk { .. } => "chunk",
            ExecutionEvent::Complete { .. } => "complete",
            ExecutionEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionEvent::Chunk { .. })
    }

    pub fn from_error(err: &GatewayError) -> Self {
        ExecutionEvent::Error {
            message: err.to_string(),
            traceback: Some(err.traceback()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Start,
    Complete,
    Error,
}

/// Broadcast on the `/events` feed.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub topic: String,
    pub run_id: Uuid,
    pub target: String,
    pub phase: RunPhase,
}

/// A request whose target has been resolved; only runtime failures remain.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: Uuid,
    pub label: String,
    pub path: PathBuf,
    pub base_dir: PathBuf,
    pub query: Option<String>,
    pub kwargs: BTreeMap<String, Value>,
    pub selection: ModelSelection,
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<LessonRegistry>,
    catalog: Arc<Catalog>,
    estimator: MetricsEstimator,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
    workdir: WorkdirPolicy,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<LessonRegistry>,
        catalog: Arc<Catalog>,
        estimator: MetricsEstimator,
        runner: &RunnerConfig,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(256);
        Self {
            registry,
            catalog,
            estimator,
            permits: Arc::new(Semaphore::new(runner.max_concurrency.max(1))),
            timeout: runner.timeout_secs.map(Duration::from_secs),
            workdir: runner.workdir,
            lifecycle,
        }
    }

    pub fn registry(&self) -> &LessonRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Resolves the target. Unknown ids fail here, before any stream exists.
    pub fn prepare(&self, request: ExecutionRequest) -> Result<PreparedRun> {
        let label = request.target.to_string();
        let (path, base_dir, query, kwargs) = match &request.target {
            RunTarget::Catalog { agent_id } => {
                let entry = self.catalog.get(agent_id)?;
                let mut query = DEFAULT_QUERY.to_string();
                let mut kwargs = BTreeMap::new();
                for param in &entry.params {
                    let supplied = request
                        .params
                        .get(&param.name)
                        .filter(|v| value_text(v).is_some());
                    let default = (!param.default.is_empty()).then(|| param.default.clone());
                    if param.is_positional {
                        if let Some(text) = supplied.and_then(value_text).or(default) {
                            query = text;
                        }
                    } else if let Some(value) = supplied {
                        kwargs.insert(param.name.clone(), value.clone());
                    } else if let Some(default) = default {
                        kwargs.insert(param.name.clone(), Value::String(default));
                    }
                }
                (
                    self.registry.resolve(&entry.path),
                    self.registry.resolve(&entry.dir),
                    Some(query),
                    kwargs,
                )
            }
            RunTarget::Lesson { module, lesson } => {
                let entry = self.registry.lesson(module, lesson)?;
                let kwargs = request
                    .params
                    .iter()
                    .filter(|(_, v)| value_text(v).is_some())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (
                    self.registry.resolve(&entry.entry.path),
                    self.registry.resolve(&entry.entry.dir),
                    request.message.clone().filter(|m| !m.trim().is_empty()),
                    kwargs,
                )
            }
        };
        Ok(PreparedRun {
            run_id: Uuid::new_v4(),
            label,
            path,
            base_dir,
            query,
            kwargs,
            selection: request.selection,
        })
    }

    /// Starts the run on its own task. Dropping the returned stream cancels it.
    pub fn execute(&self, run: PreparedRun) -> ReceiverStream<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(64);
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(run, tx).await });
        ReceiverStream::new(rx)
    }

    fn publish(&self, run: &PreparedRun, phase: RunPhase) {
        let suffix = match phase {
            RunPhase::Start => "start",
            RunPhase::Complete => "complete",
            RunPhase::Error => "error",
        };
        // No subscribers is fine.
        let _ = self.lifecycle.send(LifecycleEvent {
            topic: format!("run:{}:{suffix}", run.run_id),
            run_id: run.run_id,
            target: run.label.clone(),
            phase,
        });
    }

    async fn drive(self, run: PreparedRun, tx: mpsc::Sender<ExecutionEvent>) {
        self.publish(&run, RunPhase::Start);
        tracing::debug!(run = %run.run_id, target = %run.label, "idle -> loading");

        let attempt = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.attempt(&run, &tx))
                    .await
                    .unwrap_or_else(|_| Err(GatewayError::Timeout(limit.as_secs()))),
                None => self.attempt(&run, &tx).await,
            }
        };
        let outcome = tokio::select! {
            _ = tx.closed() => Ok(None),
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Some((content, metrics))) => {
                tracing::info!(
                    run = %run.run_id,
                    target = %run.label,
                    output_tokens = metrics.output_tokens,
                    estimated = metrics.estimated,
                    "run completed"
                );
                self.publish(&run, RunPhase::Complete);
                let _ = tx.send(ExecutionEvent::Complete { content, metrics }).await;
            }
            Ok(None) => {
                tracing::debug!(run = %run.run_id, "client disconnected, run abandoned");
                self.publish(&run, RunPhase::Error);
            }
            Err(err) => {
                tracing::error!(run = %run.run_id, target = %run.label, error = %err, "run failed");
                self.publish(&run, RunPhase::Error);
                let _ = tx.send(ExecutionEvent::from_error(&err)).await;
            }
        }
    }

    /// `Ok(None)` means the receiver went away mid-stream.
    async fn attempt(
        &self,
        run: &PreparedRun,
        tx: &mpsc::Sender<ExecutionEvent>,
    ) -> Result<Option<(String, RunMetrics)>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GatewayError::execution("execution engine is shutting down"))?;

        let query = run
            .query
            .clone()
            .ok_or_else(|| GatewayError::execution("A non-empty message is required"))?;

        let registry = self.registry.clone();
        let path = run.path.clone();
        let selection = run.selection.clone();
        let loaded = tokio::task::spawn_blocking(move || registry.instantiate(&path, &selection))
            .await
            .map_err(|err| GatewayError::execution(format!("loader task failed: {err}")))??;
        tracing::debug!(run = %run.run_id, model = %loaded.model.id, "loading -> instantiated");

        let _cwd = match self.workdir {
            WorkdirPolicy::Process => Some(WorkdirGuard::enter(&run.base_dir).await?),
            WorkdirPolicy::Explicit => None,
        };

        let mut usage = self
            .estimator
            .start_run(&loaded.model.provider, &loaded.model.id, &query);
        let input = RunInput {
            query,
            kwargs: run.kwargs.clone(),
        };
        let mut stream = loaded.agent.run(input, RunContext::new(&run.base_dir))?;
        tracing::debug!(run = %run.run_id, "instantiated -> streaming");

        while let Some(item) = stream.next().await {
            let RunChunk { content, metrics } = item?;
            usage.observe(content.as_deref(), metrics.as_ref());
            let Some(content) = content.filter(|c| !c.is_empty()) else {
                continue;
            };
            if tx.send(ExecutionEvent::Chunk { content }).await.is_err() {
                return Ok(None);
            }
        }
        drop(stream);

        tracing::debug!(run = %run.run_id, "streaming -> completed");
        Ok(Some(usage.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let chunk = serde_json::to_value(ExecutionEvent::Chunk {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(chunk, serde_json::json!({"event": "chunk", "content": "hi"}));

        let err = serde_json::to_value(ExecutionEvent::Error {
            message: "boom".into(),
            traceback: None,
        })
        .unwrap();
        assert_eq!(err, serde_json::json!({"event": "error", "message": "boom"}));
    }

    #[test]
    fn value_text_skips_empty_and_null() {
        assert_eq!(value_text(&Value::Null), None);
        assert_eq!(value_text(&Value::String(String::new())), None);
        assert_eq!(value_text(&serde_json::json!(3)).as_deref(), Some("3"));
    }
}
