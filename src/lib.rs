//! Discovery and streaming execution gateway for a catalog of lesson agents.
//!
//! The crate provides:
//! - A static catalog builder over lesson scripts (`CatalogBuilder`).
//! - A runtime lesson index (`LessonRegistry`) and subprocess-isolated loader (`ScriptLoader`).
//! - A streaming execution engine with usage and cost accounting (`ExecutionEngine`).
//! - An axum HTTP surface with SSE and WebSocket transports (`Gateway`, feature `server`).

pub mod agent;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod registry;
#[cfg(feature = "server")]
pub mod server;
pub mod telemetry;
pub mod workdir;

pub use agent::{ChunkMetrics, ChunkStream, LessonAgent, LessonModule, ModuleLoader, RunChunk, RunContext, RunInput};
pub use catalog::{Catalog, CatalogBuilder, CatalogEntry, CatalogReport, Param, ParamType, UiType};
pub use config::{load_secrets_file, AppConfig, LessonsConfig, RunnerConfig, WorkdirPolicy};
pub use engine::{ExecutionEngine, ExecutionEvent, ExecutionRequest, LifecycleEvent, PreparedRun, RunTarget};
pub use error::{GatewayError, Result};
pub use loader::{ScriptLoader, ScriptModule};
pub use metrics::{MetricsEstimator, Price, PriceTable, RunMetrics, Tokenizer};
pub use models::{ModelHandle, ModelListCache, ModelResolver, ModelSelection, ModelSource, ProviderTable, RemoteModelSource};
pub use registry::{LessonEntry, LessonRegistry, LoadedAgent, ModuleSummary};
#[cfg(feature = "server")]
pub use server::Gateway;
pub use telemetry::{init_tracing, RetryPolicy};
