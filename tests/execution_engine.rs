mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use lesson_gateway::engine::RunPhase;
use lesson_gateway::{ExecutionEvent, ExecutionRequest, GatewayError, ModelSelection, RunTarget, RunnerConfig};
use serde_json::json;

use common::{engine, engine_with, lesson_request, run_to_end, Step, StubLoader};

fn terminal_count(events: &[ExecutionEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test]
async fn streams_chunks_in_order_then_completes() {
    let loader = StubLoader::default().script(
        "01_hello_agent",
        vec![
            Step::Usage("Hello", 10, 5),
            Step::Usage(", ", 10, 12),
            Step::Usage("world", 10, 20),
        ],
    );
    let events = run_to_end(&engine(loader), lesson_request("01_hello_agent", Some("hi"))).await;

    assert_eq!(events.len(), 4);
    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["Hello", ", ", "world"]);
    match events.last() {
        Some(ExecutionEvent::Complete { content, metrics }) => {
            assert_eq!(content, "Hello, world");
            assert!(!metrics.estimated);
            assert_eq!(metrics.input_tokens, 10);
            assert_eq!(metrics.output_tokens, 20);
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test]
async fn estimates_usage_when_provider_reports_none() {
    let loader = StubLoader::default().script(
        "01_hello_agent",
        vec![Step::Say("one two three "), Step::Say("four five six")],
    );
    let events = run_to_end(&engine(loader), lesson_request("01_hello_agent", Some("count please"))).await;
    match events.last() {
        Some(ExecutionEvent::Complete { metrics, .. }) => {
            assert!(metrics.estimated);
            assert_eq!(metrics.output_tokens, 6);
            assert_eq!(metrics.input_tokens, 2);
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_run_emits_one_error_and_keeps_cwd() {
    let before = std::env::current_dir().unwrap();
    let loader = StubLoader::default().script(
        "01_hello_agent",
        vec![Step::Say("partial"), Step::Fail("model exploded")],
    );
    let events = run_to_end(&engine(loader), lesson_request("01_hello_agent", Some("hi"))).await;

    assert_eq!(std::env::current_dir().unwrap(), before);
    assert_eq!(terminal_count(&events), 1);
    assert!(!events.iter().any(|e| matches!(e, ExecutionEvent::Complete { .. })));
    match events.last() {
        Some(ExecutionEvent::Error { message, traceback }) => {
            assert_eq!(message, "model exploded");
            assert!(traceback.as_deref().unwrap_or_default().contains("RuntimeError"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_entry_point_becomes_error_event() {
    let events = run_to_end(&engine(StubLoader::default()), lesson_request("02_no_entry", Some("hi"))).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        ExecutionEvent::Error { message, .. } => assert!(message.contains("get_agent")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn configuration_errors_carry_the_hint() {
    let loader = StubLoader::default().script("01_hello_agent", vec![Step::Say("never")]);
    let engine = engine_with(loader, RunnerConfig::default(), false);
    let events = run_to_end(&engine, lesson_request("01_hello_agent", Some("hi"))).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        ExecutionEvent::Error { message, .. } => {
            assert!(message.starts_with("API key not found for openai"));
            assert!(message.contains("OPENAI_API_KEY"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_targets_fail_before_streaming() {
    let engine = engine(StubLoader::default());
    let missing = engine.prepare(lesson_request("99_missing", Some("hi")));
    assert!(matches!(missing, Err(GatewayError::NotFound(_))));

    let request = ExecutionRequest {
        target: RunTarget::Catalog {
            agent_id: "nope".into(),
        },
        selection: ModelSelection::default(),
        params: BTreeMap::new(),
        message: None,
    };
    assert!(matches!(engine.prepare(request), Err(GatewayError::NotFound(_))));
}

#[tokio::test]
async fn lesson_runs_require_a_message() {
    let loader = StubLoader::default().script("01_hello_agent", vec![Step::Say("never")]);
    let events = run_to_end(&engine(loader), lesson_request("01_hello_agent", Some("   "))).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], ExecutionEvent::Error { message, .. } if message.contains("message")));
}

#[tokio::test]
async fn catalog_runs_map_params_onto_query_and_kwargs() {
    let loader = StubLoader::default().script("02_research_team", vec![Step::EchoInput]);
    let engine = engine(loader);
    let mut params = BTreeMap::new();
    params.insert("pdf_path".to_string(), json!("paper.pdf"));
    params.insert("unrelated".to_string(), json!("ignored"));
    let request = ExecutionRequest {
        target: RunTarget::Catalog {
            agent_id: "07_real_world__research__02_research_team__main".into(),
        },
        selection: ModelSelection::default(),
        params,
        message: None,
    };
    let run = engine.prepare(request).unwrap();
    assert_eq!(run.query.as_deref(), Some("Rust async runtimes"));
    assert_eq!(run.kwargs.get("pdf_path"), Some(&json!("paper.pdf")));
    assert!(!run.kwargs.contains_key("unrelated"));

    let events: Vec<_> = engine.execute(run).collect().await;
    assert!(matches!(
        &events[0],
        ExecutionEvent::Chunk { content } if content == r#"Rust async runtimes|{"pdf_path":"paper.pdf"}"#
    ));
}

#[tokio::test]
async fn lesson_runs_drop_empty_params() {
    let loader = StubLoader::default().script("01_hello_agent", vec![Step::EchoInput]);
    let engine = engine(loader);
    let mut request = lesson_request("01_hello_agent", Some("hi"));
    request.params.insert("tone".to_string(), json!("dry"));
    request.params.insert("blank".to_string(), json!(""));
    request.params.insert("unset".to_string(), json!(null));
    request.params.insert("limit".to_string(), json!(3));

    let run = engine.prepare(request).unwrap();
    assert_eq!(run.kwargs.keys().collect::<Vec<_>>(), vec!["limit", "tone"]);

    let events: Vec<_> = engine.execute(run).collect().await;
    assert!(matches!(
        &events[0],
        ExecutionEvent::Chunk { content } if content == r#"hi|{"limit":3,"tone":"dry"}"#
    ));
}

#[tokio::test]
async fn catalog_query_defaults_to_greeting() {
    let engine = engine(StubLoader::default());
    let request = ExecutionRequest {
        target: RunTarget::Catalog {
            agent_id: "07_real_world__business__sales__01_lead_qualifier__main".into(),
        },
        selection: ModelSelection::default(),
        params: BTreeMap::new(),
        message: None,
    };
    let run = engine.prepare(request).unwrap();
    assert_eq!(run.query.as_deref(), Some("Hello!"));
    assert_eq!(run.kwargs.get("company"), Some(&json!("Acme Corp")));
    assert!(!run.kwargs.contains_key("contact_email"));
}

#[tokio::test]
async fn concurrent_runs_resolve_their_own_directories() {
    let loader = StubLoader::default()
        .script("01_hello_agent", vec![Step::Sleep(20), Step::ReadFile("data.txt")])
        .script("03_reader", vec![Step::ReadFile("data.txt"), Step::Sleep(20)]);
    let engine = engine(loader);

    let (a, b) = tokio::join!(
        run_to_end(&engine, lesson_request("01_hello_agent", Some("a"))),
        run_to_end(&engine, lesson_request("03_reader", Some("b"))),
    );
    let content = |events: &[ExecutionEvent]| match events.last() {
        Some(ExecutionEvent::Complete { content, .. }) => content.clone(),
        other => panic!("expected complete, got {other:?}"),
    };
    assert_eq!(content(&a), "hello-data");
    assert_eq!(content(&b), "reader-data");
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_run() {
    let loader = StubLoader::default().script("01_hello_agent", vec![Step::Say("first"), Step::Sleep(60_000)]);
    let engine = engine(loader.clone());
    let mut lifecycle = engine.subscribe();

    let run = engine.prepare(lesson_request("01_hello_agent", Some("hi"))).unwrap();
    let mut stream = engine.execute(run);
    assert!(matches!(stream.next().await, Some(ExecutionEvent::Chunk { .. })));
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while loader.dropped_streams() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent stream dropped after disconnect");

    let start = lifecycle.recv().await.unwrap();
    assert_eq!(start.phase, RunPhase::Start);
    assert!(start.topic.ends_with(":start"));
    let end = lifecycle.recv().await.unwrap();
    assert_eq!(end.phase, RunPhase::Error);
}

#[tokio::test]
async fn per_request_timeout_ends_with_error() {
    let loader = StubLoader::default().script("01_hello_agent", vec![Step::Sleep(60_000)]);
    let runner = RunnerConfig {
        timeout_secs: Some(1),
        ..RunnerConfig::default()
    };
    let engine = engine_with(loader, runner, true);
    let events = tokio::time::timeout(
        Duration::from_secs(10),
        run_to_end(&engine, lesson_request("01_hello_agent", Some("hi"))),
    )
    .await
    .unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], ExecutionEvent::Error { message, .. } if message.contains("timed out")));
}

#[tokio::test]
async fn lifecycle_feed_reports_completion() {
    let loader = StubLoader::default().script("01_hello_agent", vec![Step::Say("ok")]);
    let engine = engine(loader);
    let mut lifecycle = engine.subscribe();
    let _ = run_to_end(&engine, lesson_request("01_hello_agent", Some("hi"))).await;

    let start = lifecycle.recv().await.unwrap();
    let end = lifecycle.recv().await.unwrap();
    assert_eq!(start.run_id, end.run_id);
    assert_eq!(start.target, "00_getting_started/01_hello_agent");
    assert_eq!(end.phase, RunPhase::Complete);
    assert_eq!(end.topic, format!("run:{}:complete", end.run_id));
}
