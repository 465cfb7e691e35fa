//! Script loader: each lesson file becomes an isolated module instance whose agent
//! runs in a child process.
//!
//! Child protocol, one JSON object per line. The gateway writes a single request
//! on stdin; the runner answers on stdout with
//!
//! ```text
//! {"event":"ready"}
//! {"event":"chunk","content":"...","metrics":{"input_tokens":10,"output_tokens":3}}
//! {"event":"error","kind":"runtime","message":"...","traceback":"..."}
//! {"event":"done"}
//! ```
//!
//! Anything on stdout that is not a protocol line is ignored; stderr is kept as
//! the traceback of a crashed runner.
//!
//! With empty `runner.args` the bundled runner (`runner.py`) is passed to the
//! interpreter with `-c`. It executes the lesson file as a fresh module in its own
//! process, applies overridden globals after the module body ran, and streams
//! `agent.run(query, stream=True, **kwargs)`.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::agent::{ChunkMetrics, ChunkStream, LessonAgent, LessonModule, ModuleLoader, RunChunk, RunContext, RunInput};
use crate::catalog::source::{EntryPoint, ScriptSource};
use crate::config::RunnerConfig;
use crate::error::{GatewayError, Result};
use crate::models::ModelHandle;

const ENTRY_POINT: &str = "get_agent";

/// Runner used when no explicit runner arguments are configured.
pub const BUNDLED_RUNNER: &str = include_str!("runner.py");

/// Arguments the configured program is started with.
pub fn runner_args(runner: &RunnerConfig) -> Vec<OsString> {
    if runner.args.is_empty() {
        return ["-u", "-c", BUNDLED_RUNNER].iter().map(OsString::from).collect();
    }
    runner.args.iter().map(OsString::from).collect()
}

/// `dynamic_<stem>_<parent>`, so every `main.py` gets a distinct name.
pub fn module_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path
        .parent()
        .and_then(Path::file_name)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("dynamic_{stem}_{parent}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Clone)]
pub struct ScriptLoader {
    runner: Arc<RunnerConfig>,
    project_root: PathBuf,
}

impl ScriptLoader {
    pub fn new(runner: RunnerConfig, project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        Self {
            runner: Arc::new(runner),
            project_root: root.canonicalize().unwrap_or(root),
        }
    }

    /// Reads and parses `path` into a fresh module instance. Two calls for the same
    /// path never share state.
    pub fn load_script(&self, path: &Path) -> Result<ScriptModule> {
        let load_error = |reason: String| GatewayError::Load {
            path: path.to_path_buf(),
            reason,
        };
        let path = path.canonicalize().map_err(|err| load_error(err.to_string()))?;
        let text = fs::read_to_string(&path).map_err(|err| load_error(err.to_string()))?;
        let source = ScriptSource::parse(text).map_err(load_error)?;
        if let Some(line) = source.syntax_error_line() {
            return Err(load_error(format!("invalid syntax at line {line}")));
        }

        let module = ScriptModule {
            name: module_name(&path),
            instance_id: Uuid::new_v4(),
            entry: source.entry_point(ENTRY_POINT),
            defaults: Arc::new(source.literal_globals()),
            globals: source.literal_globals(),
            path,
            runner: self.runner.clone(),
            project_root: self.project_root.clone(),
        };
        tracing::debug!(module = %module.name, instance = %module.instance_id, "module loaded");
        Ok(module)
    }
}

impl ModuleLoader for ScriptLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn LessonModule>> {
        Ok(Box::new(self.load_script(path)?))
    }
}

pub struct ScriptModule {
    name: String,
    instance_id: Uuid,
    path: PathBuf,
    entry: Option<EntryPoint>,
    defaults: Arc<BTreeMap<String, Value>>,
    globals: BTreeMap<String, Value>,
    runner: Arc<RunnerConfig>,
    project_root: PathBuf,
}

impl ScriptModule {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module-level literal bindings as parsed from the file.
    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    /// Changes made here are applied to this instance's namespace only.
    pub fn globals_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.globals
    }

    /// Bindings that differ from the file's own literals.
    fn overrides(&self) -> BTreeMap<String, Value> {
        self.globals
            .iter()
            .filter(|(key, value)| self.defaults.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl LessonModule for ScriptModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_entry_point(&self) -> bool {
        self.entry.is_some_and(|entry| entry.is_usable())
    }

    fn get_agent(&self, model: Option<ModelHandle>) -> Result<Box<dyn LessonAgent>> {
        let entry = self
            .entry
            .filter(EntryPoint::is_usable)
            .ok_or_else(|| GatewayError::MissingEntryPoint(self.name.clone()))?;
        let model = model.filter(|_| entry.accepts_model());
        Ok(Box::new(ScriptAgent {
            module_name: self.name.clone(),
            instance_id: self.instance_id,
            path: self.path.clone(),
            entry_arity: usize::from(model.is_some()),
            model,
            globals: self.overrides(),
            runner: self.runner.clone(),
            project_root: self.project_root.clone(),
        }))
    }
}

struct ScriptAgent {
    module_name: String,
    instance_id: Uuid,
    path: PathBuf,
    entry_arity: usize,
    model: Option<ModelHandle>,
    globals: BTreeMap<String, Value>,
    runner: Arc<RunnerConfig>,
    project_root: PathBuf,
}

#[derive(Serialize)]
struct RunnerRequest<'a> {
    module_name: &'a str,
    instance_id: String,
    path: &'a Path,
    base_dir: &'a Path,
    project_root: &'a Path,
    entry_arity: usize,
    model: Option<&'a ModelHandle>,
    query: &'a str,
    kwargs: &'a BTreeMap<String, Value>,
    globals: &'a BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RunnerEvent {
    Ready,
    Chunk {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        metrics: Option<ChunkMetrics>,
    },
    Error {
        #[serde(default)]
        kind: ErrorKind,
        message: String,
        #[serde(default)]
        hint: Option<String>,
        #[serde(default)]
        traceback: Option<String>,
    },
    Done,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ErrorKind {
    Load,
    EntryPoint,
    Configuration,
    #[default]
    Runtime,
}

impl ScriptAgent {
    fn search_path(&self) -> Result<OsString> {
        let existing = std::env::var_os(&self.runner.search_path_env).unwrap_or_default();
        let paths = std::iter::once(self.project_root.clone()).chain(std::env::split_paths(&existing));
        std::env::join_paths(paths).map_err(|err| GatewayError::Protocol(err.to_string()))
    }

    fn runner_error(&self, kind: ErrorKind, message: String, hint: Option<String>, traceback: Option<String>) -> GatewayError {
        match kind {
            ErrorKind::Load => GatewayError::Load {
                path: self.path.clone(),
                reason: message,
            },
            ErrorKind::EntryPoint => GatewayError::MissingEntryPoint(self.module_name.clone()),
            ErrorKind::Configuration => GatewayError::Configuration {
                message,
                hint: hint.unwrap_or_default(),
            },
            ErrorKind::Runtime => GatewayError::Execution { message, traceback },
        }
    }
}

impl LessonAgent for ScriptAgent {
    fn run(self: Box<Self>, input: RunInput, ctx: RunContext) -> Result<ChunkStream> {
        let request = serde_json::to_string(&RunnerRequest {
            module_name: &self.module_name,
            instance_id: self.instance_id.to_string(),
            path: &self.path,
            base_dir: ctx.base_dir(),
            project_root: &self.project_root,
            entry_arity: self.entry_arity,
            model: self.model.as_ref(),
            query: &input.query,
            kwargs: &input.kwargs,
            globals: &self.globals,
        })?;

        let mut cmd = Command::new(&self.runner.program);
        cmd.args(runner_args(&self.runner))
            .current_dir(ctx.base_dir())
            .env(&self.runner.search_path_env, self.search_path()?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|err| GatewayError::Load {
            path: self.path.clone(),
            reason: format!("failed to start runner `{}`: {err}", self.runner.program),
        })?;
        tracing::debug!(module = %self.module_name, pid = child.id(), "runner started");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(err) = self.pump(child, request, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

impl ScriptAgent {
    /// Feeds the request and relays events until `done`, an error, or the receiver goes
    /// away. Returning drops `child`, which kills it if still running.
    async fn pump(
        &self,
        mut child: Child,
        request: String,
        tx: &mpsc::Sender<Result<RunChunk>>,
    ) -> Result<()> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Protocol("runner stdin unavailable".into()))?;
        stdin.write_all(request.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Protocol("runner stdout unavailable".into()))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut finished = false;
        loop {
            let line = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(module = %self.module_name, "consumer gone, stopping runner");
                    return Ok(());
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let event = match serde_json::from_str::<RunnerEvent>(&line) {
                Ok(event) => event,
                Err(_) => {
                    tracing::debug!(module = %self.module_name, line = %line, "ignoring runner output");
                    continue;
                }
            };
            match event {
                RunnerEvent::Ready => tracing::debug!(module = %self.module_name, "runner ready"),
                RunnerEvent::Chunk { content, metrics } => {
                    if tx.send(Ok(RunChunk { content, metrics })).await.is_err() {
                        return Ok(());
                    }
                }
                RunnerEvent::Error {
                    kind,
                    message,
                    hint,
                    traceback,
                } => return Err(self.runner_error(kind, message, hint, traceback)),
                RunnerEvent::Done => {
                    finished = true;
                    break;
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(GatewayError::Execution {
                message: format!("runner exited with {status}"),
                traceback: Some(stderr),
            });
        }
        if !finished {
            return Err(GatewayError::Protocol("runner closed its output without finishing".into()));
        }
        Ok(())
    }
}
