//! End-to-end runtime wiring: bootstrap, tool execution, chains, and
//! failure classification over the development profile.

use std::sync::Arc;

use crucible_rt::backends::RuntimeSelector;
use crucible_rt::catalog::{ToolCatalog, ToolDefinition, ToolLookup, ToolSource};
use crucible_rt::config::{RuntimeConfig, bootstrap};
use crucible_rt::engine::{
    ChainGuards, ChainStep, ErrorCode, ExecutionEngine, StepOutcome, compile_chain,
};
use crucible_rt::primitives::{SecurityProfile, ToolId};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn seeded_catalog() -> Arc<dyn ToolLookup> {
    let catalog = ToolCatalog::new();
    for (id, argv) in [
        ("gen.hello", vec!["sh", "-c", "echo hello"]),
        ("sys.echo", vec!["cat"]),
        ("sys.fail", vec!["sh", "-c", "echo broken >&2; exit 7"]),
    ] {
        catalog
            .register(
                ToolDefinition::new(
                    ToolId::new(id).unwrap(),
                    ToolSource::Program {
                        argv: argv.into_iter().map(String::from).collect(),
                    },
                )
                .unwrap(),
            )
            .unwrap();
    }
    Arc::new(catalog)
}

async fn dev_runtime() -> (Arc<RuntimeSelector>, ExecutionEngine) {
    let config = RuntimeConfig {
        profile: SecurityProfile::Dev,
        ..RuntimeConfig::default()
    };
    bootstrap(&config, seeded_catalog()).await
}

#[tokio::test]
async fn tool_runs_end_to_end() {
    let (selector, engine) = dev_runtime().await;

    let result = engine
        .run_tool(
            &ToolId::new("gen.hello").unwrap(),
            json!({}),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.stdout_utf8().trim(), "hello");

    selector.shutdown().await.unwrap();
    selector.shutdown().await.unwrap();
}

#[tokio::test]
async fn chain_threads_results_and_reports_failures() {
    let (selector, engine) = dev_runtime().await;

    let chain = compile_chain(
        vec![
            ChainStep {
                id: "produce".into(),
                tool: ToolId::new("gen.hello").unwrap(),
                arguments: json!({}),
                use_previous: false,
            },
            ChainStep {
                id: "consume".into(),
                tool: ToolId::new("sys.echo").unwrap(),
                arguments: json!({}),
                use_previous: true,
            },
            ChainStep {
                id: "explode".into(),
                tool: ToolId::new("sys.fail").unwrap(),
                arguments: json!({}),
                use_previous: false,
            },
        ],
        &ChainGuards::default(),
    )
    .unwrap();

    let run = engine.run_chain(chain, CancellationToken::new(), None).await;

    assert_eq!(run.steps.len(), 3);
    assert_eq!(run.steps[1].arguments["input"], json!("hello"));
    assert!(matches!(run.steps[1].outcome, StepOutcome::Completed(_)));

    let error = run.error.expect("chain stopped at the failing step");
    assert_eq!(error.code, ErrorCode::ChainStepFailed);
    assert_eq!(error.step_index, Some(2));
    assert!(!error.retryable);

    selector.shutdown().await.unwrap();
}

#[tokio::test]
async fn classified_errors_reach_the_caller_with_stable_codes() {
    let (selector, engine) = dev_runtime().await;

    let err = engine
        .run_tool(
            &ToolId::new("no.such-tool").unwrap(),
            json!({}),
            None,
            CancellationToken::new(),
        )
        .await
        .expect_err("unknown tool");
    let object = crucible_rt::engine::classify(&err);
    assert_eq!(object.code, ErrorCode::ToolNotFound);
    assert_eq!(object.code.as_str(), "tool_not_found");
    assert!(!object.retryable);

    selector.shutdown().await.unwrap();
}
