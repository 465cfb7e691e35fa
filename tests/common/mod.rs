#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lesson_gateway::config::ModelsConfig;
use lesson_gateway::{
    Catalog, CatalogBuilder, ChunkStream, ExecutionEngine, ExecutionEvent, ExecutionRequest,
    GatewayError, LessonAgent, LessonModule, LessonRegistry, MetricsEstimator, ModelHandle,
    ModelSelection, ModuleLoader, PriceTable, ProviderTable, Result, RunChunk, RunContext, RunInput,
    RunTarget, RunnerConfig, Tokenizer,
};

pub fn fixture_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/lessons")
}

/// One scripted action of a stub agent.
#[derive(Debug, Clone)]
pub enum Step {
    Say(&'static str),
    Usage(&'static str, u64, u64),
    /// Reads a file relative to the run's base directory.
    ReadFile(&'static str),
    /// Reads a file relative to the process working directory.
    ReadCwdFile(&'static str),
    EchoInput,
    Sleep(u64),
    Fail(&'static str),
}

pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count(&self, text: &str) -> std::result::Result<u64, String> {
        Ok(text.split_whitespace().count() as u64)
    }
}

/// Loader whose agents replay scripted steps, keyed by lesson directory name.
/// Lessons without a script have no entry point.
#[derive(Clone, Default)]
pub struct StubLoader {
    scripts: HashMap<String, Vec<Step>>,
    pub dropped: Arc<AtomicUsize>,
}

impl StubLoader {
    pub fn script(mut self, lesson: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(lesson.to_string(), steps);
        self
    }

    pub fn dropped_streams(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for StubLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn LessonModule>> {
        if !path.is_file() {
            return Err(GatewayError::Load {
                path: path.to_path_buf(),
                reason: "no such file".into(),
            });
        }
        let lesson = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Box::new(StubModule {
            name: format!("dynamic_main_{lesson}"),
            steps: self.scripts.get(&lesson).cloned(),
            dropped: self.dropped.clone(),
        }))
    }
}

struct StubModule {
    name: String,
    steps: Option<Vec<Step>>,
    dropped: Arc<AtomicUsize>,
}

impl LessonModule for StubModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_entry_point(&self) -> bool {
        self.steps.is_some()
    }

    fn get_agent(&self, _model: Option<ModelHandle>) -> Result<Box<dyn LessonAgent>> {
        let steps = self
            .steps
            .clone()
            .ok_or_else(|| GatewayError::MissingEntryPoint(self.name.clone()))?;
        Ok(Box::new(StubAgent {
            steps,
            dropped: self.dropped.clone(),
        }))
    }
}

struct StubAgent {
    steps: Vec<Step>,
    dropped: Arc<AtomicUsize>,
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl LessonAgent for StubAgent {
    fn run(self: Box<Self>, input: RunInput, ctx: RunContext) -> Result<ChunkStream> {
        let state = (
            self.steps.into_iter(),
            input,
            ctx,
            DropCounter(self.dropped.clone()),
        );
        let stream = futures::stream::unfold(state, |(mut steps, input, ctx, counter)| async move {
            let step = steps.next()?;
            let item = match step {
                Step::Say(text) => Ok(RunChunk::text(text)),
                Step::Usage(text, input_tokens, output_tokens) => {
                    Ok(RunChunk::text(text).with_usage(input_tokens, output_tokens))
                }
                Step::ReadFile(rel) => std::fs::read_to_string(ctx.base_dir().join(rel))
                    .map(|s| RunChunk::text(s.trim()))
                    .map_err(GatewayError::from),
                Step::ReadCwdFile(rel) => std::fs::read_to_string(rel)
                    .map(|s| RunChunk::text(s.trim()))
                    .map_err(GatewayError::from),
                Step::EchoInput => Ok(RunChunk::text(format!(
                    "{}|{}",
                    input.query,
                    serde_json::to_string(&input.kwargs).unwrap_or_default()
                ))),
                Step::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(RunChunk::default())
                }
                Step::Fail(message) => Err(GatewayError::Execution {
                    message: message.to_string(),
                    traceback: Some(format!("Traceback (most recent call last):\nRuntimeError: {message}")),
                }),
            };
            Some((item, (steps, input, ctx, counter)))
        });
        Ok(stream.boxed())
    }
}

pub fn provider_table(with_keys: bool) -> ProviderTable {
    ProviderTable::from_config(&ModelsConfig::default())
        .with_env(move |_| with_keys.then(|| "test-key".to_string()))
}

pub fn engine_with(loader: StubLoader, runner: RunnerConfig, with_keys: bool) -> ExecutionEngine {
    let builder = CatalogBuilder::new(fixture_root());
    let registry = LessonRegistry::scan(&builder, Arc::new(loader), Arc::new(provider_table(with_keys)));
    let report = builder.build(&[PathBuf::from("00_getting_started"), PathBuf::from("07_real_world")]);
    let estimator = MetricsEstimator::new(PriceTable::default(), Some(Arc::new(WordTokenizer)));
    ExecutionEngine::new(
        Arc::new(registry),
        Arc::new(Catalog::from_entries(report.entries)),
        estimator,
        &runner,
    )
}

pub fn engine(loader: StubLoader) -> ExecutionEngine {
    engine_with(loader, RunnerConfig::default(), true)
}

pub fn lesson_request(lesson: &str, message: Option<&str>) -> ExecutionRequest {
    ExecutionRequest {
        target: RunTarget::Lesson {
            module: "00_getting_started".into(),
            lesson: lesson.into(),
        },
        selection: ModelSelection {
            provider: Some("openai".into()),
            ..Default::default()
        },
        params: BTreeMap::new(),
        message: message.map(str::to_string),
    }
}

pub async fn run_to_end(engine: &ExecutionEngine, request: ExecutionRequest) -> Vec<ExecutionEvent> {
    let run = engine.prepare(request).expect("target resolves");
    engine.execute(run).collect().await
}
