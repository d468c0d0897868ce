use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tickwork_core::config::ExecutorsConfig;
use tickwork_core::model::{
    HttpJob, Job, JobPayload, ProcedureJob, RetryPolicy, ScriptJob,
};
use tickwork_core::types::{InstanceName, JobId, RunId};
use tickwork_executors::{
    ExecutorError, ExecutorRegistry, JobContext, Outcome, ProcedureRegistry,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ctx(payload: JobPayload) -> JobContext {
    let now = Utc::now();
    JobContext {
        job: Arc::new(Job {
            id: JobId(1),
            namespace: "default".to_string(),
            name: "job".to_string(),
            description: None,
            kind: payload.kind(),
            payload,
            enabled: true,
            retry: RetryPolicy::none(),
            timeout_ms: 2_000,
            allow_concurrent: true,
            max_reentry: None,
            run_count: 0,
            last_run_at: None,
            last_status: None,
            created_at: now,
            updated_at: now,
        }),
        run_id: RunId::new(),
        attempt: 1,
        fire_at: now,
        manual: false,
        instance_name: InstanceName::from("test"),
        cancel: CancellationToken::new(),
    }
}

fn registry(procedures: Arc<ProcedureRegistry>) -> ExecutorRegistry {
    let config = ExecutorsConfig {
        script_max_operations: 50_000,
        ..ExecutorsConfig::default()
    };
    ExecutorRegistry::with_defaults(&config, procedures)
}

async fn run(registry: &ExecutorRegistry, ctx: &JobContext) -> Outcome {
    registry
        .find(ctx.job.kind)
        .expect("executor for kind")
        .execute(ctx)
        .await
}

fn http(url: String, method: &str) -> JobPayload {
    JobPayload::Http(HttpJob {
        method: method.to_string(),
        url,
        headers: BTreeMap::from([("x-team".to_string(), "ops".to_string())]),
        body: None,
    })
}

#[tokio::test]
async fn http_2xx_is_success_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("x-team", "ops"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(Arc::new(ProcedureRegistry::new()));
    let outcome = run(&registry, &ctx(http(format!("{}/hook", server.uri()), "post"))).await;
    assert_eq!(outcome, Outcome::success(Some("ok".to_string())));
}

#[tokio::test]
async fn http_5xx_is_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let registry = registry(Arc::new(ProcedureRegistry::new()));
    match run(&registry, &ctx(http(server.uri(), "GET"))).await {
        Outcome::Failure { reason } => {
            assert!(reason.contains("503"), "{reason}");
            assert!(reason.contains("down"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn http_slower_than_job_timeout_is_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let registry = registry(Arc::new(ProcedureRegistry::new()));
    let outcome = run(&registry, &ctx(http(server.uri(), "GET"))).await;
    assert_eq!(outcome, Outcome::Timeout);
}

#[tokio::test]
async fn procedure_runs_by_name() {
    let procedures = Arc::new(ProcedureRegistry::new());
    procedures.register_fn("sum", |args| {
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    procedures.register_fn("fail", |_| Err(ExecutorError::ProcedureFailed("nope".into())));

    let registry = registry(Arc::clone(&procedures));
    let ok = ctx(JobPayload::Procedure(ProcedureJob {
        name: "sum".to_string(),
        args: json!({ "a": 2, "b": 3 }),
    }));
    assert_eq!(run(&registry, &ok).await, Outcome::success(Some("5".to_string())));

    let failing = ctx(JobPayload::Procedure(ProcedureJob {
        name: "fail".to_string(),
        args: json!(null),
    }));
    assert_eq!(run(&registry, &failing).await, Outcome::failure("Procedure failed: nope"));

    let missing = ctx(JobPayload::Procedure(ProcedureJob {
        name: "ghost".to_string(),
        args: json!(null),
    }));
    assert_eq!(
        run(&registry, &missing).await,
        Outcome::failure("Procedure not found: ghost")
    );
}

#[tokio::test]
async fn script_output_is_its_final_value() {
    let registry = registry(Arc::new(ProcedureRegistry::new()));
    let c = ctx(JobPayload::Script(ScriptJob {
        source: r#"let total = 0; for x in args.items { total += x; } `total=${total}`"#
            .to_string(),
        args: json!({ "items": [1, 2, 3] }),
    }));
    assert_eq!(run(&registry, &c).await, Outcome::success(Some("total=6".to_string())));
}

#[tokio::test]
async fn runaway_script_hits_operation_budget() {
    let registry = registry(Arc::new(ProcedureRegistry::new()));
    let c = ctx(JobPayload::Script(ScriptJob {
        source: "loop { }".to_string(),
        args: json!(null),
    }));
    assert_eq!(
        run(&registry, &c).await,
        Outcome::failure("script exceeded its operation budget")
    );
}

#[tokio::test]
async fn script_throw_is_failure() {
    let registry = registry(Arc::new(ProcedureRegistry::new()));
    let c = ctx(JobPayload::Script(ScriptJob {
        source: r#"throw "bad input""#.to_string(),
        args: json!(null),
    }));
    match run(&registry, &c).await {
        Outcome::Failure { reason } => assert!(reason.contains("bad input"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
}
