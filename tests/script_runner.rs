//! Subprocess runs against a shell stand-in for the lesson runner.
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use lesson_gateway::{
    Catalog, CatalogBuilder, ExecutionEngine, ExecutionEvent, ExecutionRequest, GatewayError,
    LessonModule, LessonRegistry, MetricsEstimator, ModelSelection, PriceTable, ProviderTable,
    Result, RunChunk, RunContext, RunInput, RunTarget, RunnerConfig, ScriptLoader,
};
use lesson_gateway::config::ModelsConfig;
use tempfile::TempDir;

const LESSON: &str = "\"\"\"Lesson 01: Shell\"\"\"\n\nMODE = \"demo\"\n\ndef get_agent(model=None):\n    return None\n";

fn runner() -> RunnerConfig {
    let script = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_runner.sh");
    RunnerConfig {
        program: "sh".into(),
        args: vec![script.to_string_lossy().into_owned()],
        search_path_env: "LESSON_PATH".into(),
        ..RunnerConfig::default()
    }
}

fn project() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let lesson = dir.path().join("01_basics/01_shell");
    fs::create_dir_all(&lesson).unwrap();
    fs::write(lesson.join("main.py"), LESSON).unwrap();
    let lesson = lesson.canonicalize().unwrap();
    (dir, lesson)
}

async fn run(loader: &ScriptLoader, lesson: &Path, query: &str) -> Vec<Result<RunChunk>> {
    let module = loader.load_script(&lesson.join("main.py")).unwrap();
    let agent = module.get_agent(None).unwrap();
    let input = RunInput {
        query: query.into(),
        ..RunInput::default()
    };
    agent
        .run(input, RunContext::new(lesson))
        .unwrap()
        .collect()
        .await
}

fn text(items: &[Result<RunChunk>]) -> String {
    items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .filter_map(|chunk| chunk.content.clone())
        .collect()
}

#[tokio::test]
async fn relays_chunks_and_ignores_stray_output() {
    let (dir, lesson) = project();
    let loader = ScriptLoader::new(runner(), dir.path());
    let items = run(&loader, &lesson, "hello").await;

    assert_eq!(items.len(), 2);
    assert_eq!(text(&items), "Hello");
    let last = items[1].as_ref().unwrap();
    assert_eq!(last.metrics.and_then(|m| m.output_tokens), Some(2));
}

#[tokio::test]
async fn child_runs_in_lesson_dir_with_project_on_search_path() {
    let (dir, lesson) = project();
    let loader = ScriptLoader::new(runner(), dir.path());
    let out = text(&run(&loader, &lesson, "where").await);

    let (cwd, search) = out.split_once('|').unwrap();
    assert_eq!(Path::new(cwd), lesson);
    let root = dir.path().canonicalize().unwrap();
    assert_eq!(std::env::split_paths(search).next().unwrap(), root);
}

#[tokio::test]
async fn runtime_errors_keep_the_traceback() {
    let (dir, lesson) = project();
    let loader = ScriptLoader::new(runner(), dir.path());
    let items = run(&loader, &lesson, "fail").await;

    assert_eq!(text(&items), "partial");
    match items.last() {
        Some(Err(GatewayError::Execution { message, traceback })) => {
            assert_eq!(message, "agent blew up");
            assert!(traceback.as_deref().unwrap().contains("ValueError"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn crashed_runner_reports_stderr() {
    let (dir, lesson) = project();
    let loader = ScriptLoader::new(runner(), dir.path());
    let items = run(&loader, &lesson, "crash").await;

    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(GatewayError::Execution { message, traceback }) => {
            assert!(message.contains("exited"));
            assert!(traceback.as_deref().unwrap().contains("ZeroDivisionError"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn error_kinds_map_to_gateway_errors() {
    let (dir, lesson) = project();
    let loader = ScriptLoader::new(runner(), dir.path());

    let nokey = run(&loader, &lesson, "nokey").await;
    match nokey.last() {
        Some(Err(err @ GatewayError::Configuration { .. })) => {
            assert!(err.to_string().contains("GROQ_API_KEY"));
        }
        other => panic!("expected configuration error, got {other:?}"),
    }

    let noentry = run(&loader, &lesson, "noentry").await;
    assert!(matches!(noentry.last(), Some(Err(GatewayError::MissingEntryPoint(_)))));

    let truncated = run(&loader, &lesson, "truncated").await;
    assert_eq!(text(&truncated), "cut");
    assert!(matches!(truncated.last(), Some(Err(GatewayError::Protocol(_)))));
}

#[tokio::test]
async fn engine_streams_a_script_lesson() {
    let (dir, _lesson) = project();
    let builder = CatalogBuilder::new(dir.path());
    let loader = Arc::new(ScriptLoader::new(runner(), dir.path()));
    let resolver = Arc::new(
        ProviderTable::from_config(&ModelsConfig::default()).with_env(|_| Some("test-key".into())),
    );
    let registry = LessonRegistry::scan(&builder, loader, resolver);
    assert_eq!(registry.len(), 1);

    let engine = ExecutionEngine::new(
        Arc::new(registry),
        Arc::new(Catalog::default()),
        MetricsEstimator::new(PriceTable::default(), None),
        &runner(),
    );
    let run = engine
        .prepare(ExecutionRequest {
            target: RunTarget::Lesson {
                module: "01_basics".into(),
                lesson: "01_shell".into(),
            },
            selection: ModelSelection::default(),
            params: Default::default(),
            message: Some("hello".into()),
        })
        .unwrap();
    let events: Vec<_> = engine.execute(run).collect().await;

    assert_eq!(events.len(), 3);
    match events.last() {
        Some(ExecutionEvent::Complete { content, metrics }) => {
            assert_eq!(content, "Hello");
            assert_eq!(metrics.input_tokens, 4);
            assert_eq!(metrics.output_tokens, 2);
            assert!(!metrics.estimated);
        }
        other => panic!("expected complete, got {other:?}"),
    }
}
