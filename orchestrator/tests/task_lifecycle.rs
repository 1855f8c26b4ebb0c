//! End-to-end lifecycle scenarios driven through the real store, the
//! execution engine and the dispatcher, with scripted external adapters.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orchestrator::config::OrchestratorConfig;
use orchestrator::core::task::{TaskPatch, TaskStatus};
use orchestrator::dispatcher::Dispatcher;
use orchestrator::engine::{Engine, EngineDeps, EngineError};
use orchestrator::io::ci::{CiConclusion, CiObservation};
use orchestrator::io::store::SqliteStore;
use orchestrator::service::TaskService;
use orchestrator::test_support::{
    gen_change, gen_no_change, task_fixture, ScriptedCi, ScriptedGen, ScriptedGenResult,
    ScriptedGenerator, ScriptedVcs,
};

fn test_config(work_dir: &std::path::Path, max_retries: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        max_retries,
        work_dir: work_dir.to_path_buf(),
        poll_interval_secs: 1,
        liveness_threshold_secs: 60,
        ..OrchestratorConfig::default()
    }
}

fn ci_success(run_id: i64) -> CiObservation {
    CiObservation {
        run_id: Some(run_id),
        conclusion: CiConclusion::Success,
    }
}

fn ci_failure(run_id: i64) -> CiObservation {
    CiObservation {
        run_id: Some(run_id),
        conclusion: CiConclusion::Failure,
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    service: TaskService,
    deps: EngineDeps,
    _work: tempfile::TempDir,
}

async fn harness(
    max_retries: u32,
    vcs: ScriptedVcs,
    generator: ScriptedGenerator,
    ci: ScriptedCi,
) -> Harness {
    let work = tempfile::tempdir().expect("workdir");
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    let deps = EngineDeps {
        store: Arc::clone(&store),
        vcs: Arc::new(vcs),
        generator: Arc::new(generator),
        ci: Arc::new(ci),
        config: Arc::new(test_config(work.path(), max_retries)),
    };
    Harness {
        service: TaskService::new(Arc::clone(&store)),
        store,
        deps,
        _work: work,
    }
}

/// Scenario A: generator changes a file, push succeeds, CI is green on the
/// first run.
#[tokio::test]
async fn happy_path_reaches_success() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_change(&["README.md"])]),
        ScriptedCi::new(vec![ci_success(42)]),
    )
    .await;

    let created = h
        .service
        .create_task("https://host/x/y.git", "fix bug")
        .await
        .expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");
    assert_eq!(claimed.id, created.id);

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::Success);

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.attempts, 0);
    assert_eq!(done.ci_run_id, Some(42));
    let expected_branch_url = format!("https://host/x/y/tree/{}", done.branch);
    assert_eq!(done.branch_url.as_deref(), Some(expected_branch_url.as_str()));

    // branch matches ^amp/[a-z0-9]{6}$
    let suffix = done.branch.strip_prefix("amp/").expect("prefix");
    assert_eq!(suffix.len(), 6);
    assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

    let logs = h.service.tail_logs(&created.id, None).await.expect("logs");
    assert!(!logs.is_empty());
}

/// Scenario B: one red CI run produces a feedback prompt, the second run is
/// green.
#[tokio::test]
async fn one_retry_then_green() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_change(&["a.rs"]), gen_change(&["a.rs"])]),
        ScriptedCi::new(vec![ci_failure(7), ci_success(8)]).with_failure_logs(b"FAIL test_login"),
    )
    .await;

    let created = h
        .service
        .create_task("x/y", "fix login")
        .await
        .expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::Success);

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.ci_run_id, Some(8));
    // The feedback prompt replaced the original.
    assert!(done.prompt.starts_with("CI failed:"), "prompt: {}", done.prompt);
    assert!(done.prompt.contains("test_login"));
}

/// Scenario C: the retry budget is exhausted by consecutive red runs.
#[tokio::test]
async fn retry_budget_exhausted_suspends_for_review() {
    let h = harness(
        2,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![
            gen_change(&["a.rs"]),
            gen_change(&["a.rs"]),
            gen_change(&["a.rs"]),
        ]),
        ScriptedCi::new(vec![ci_failure(1), ci_failure(2), ci_failure(3)]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::NeedsReview);

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::NeedsReview);
    assert_eq!(done.attempts, 2);
    assert!(done.summary.contains("max retries"), "summary: {}", done.summary);
}

/// Boundary: attempts = max_retries - 1 and CI fails once more.
#[tokio::test]
async fn last_budgeted_failure_lands_exactly_on_needs_review() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_change(&["a.rs"])]),
        ScriptedCi::new(vec![ci_failure(9)]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    // Simulate a task already two failures deep.
    h.store
        .update_fields(
            &created.id,
            TaskPatch {
                attempts: Some(2),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("patch");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");
    assert_eq!(claimed.attempts, 2);

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::NeedsReview);
    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.attempts, 3);
}

/// Scenario D: abort while the generator is executing. The engine observes
/// the store-level abort, kills in-flight work, and leaves `aborted` behind
/// with the working directory removed.
#[tokio::test]
async fn concurrent_abort_cancels_generator() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![ScriptedGen {
            delay: Duration::from_secs(30),
            result: ScriptedGenResult::Outcome(orchestrator::io::generator::GeneratorOutcome {
                success: true,
                changed_files: vec!["a.rs".to_string()],
                diagnostic: String::new(),
            }),
        }]),
        ScriptedCi::new(vec![]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");

    let deps = h.deps.clone();
    let engine_handle = tokio::spawn(async move {
        Engine::new(deps)
            .with_abort_poll(Duration::from_millis(50))
            .run(claimed, CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.service.abort_task(&created.id).await.expect("abort");

    let result = tokio::time::timeout(Duration::from_secs(5), engine_handle)
        .await
        .expect("engine should return within cancellation latency")
        .expect("join");
    assert!(matches!(result, Err(EngineError::Cancelled)));

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::Aborted);

    // Working directory removed on the cancellation path.
    let mut entries = tokio::fs::read_dir(h.deps.config.work_dir.as_path())
        .await
        .expect("read work dir");
    assert!(entries.next_entry().await.expect("entry").is_none());
}

/// Scenario E: a task left `running` by a crash is re-queued by the startup
/// recovery sweep and then executed to completion, attempts intact.
#[tokio::test]
async fn restart_recovery_requeues_and_finishes_stuck_task() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_change(&["a.rs"])]),
        ScriptedCi::new(vec![ci_success(11)]),
    )
    .await;

    // A crashed run: status running, stale updated_at, one attempt consumed.
    let mut stuck = task_fixture("01STUCK", "x/y");
    stuck.status = TaskStatus::Running;
    stuck.attempts = 1;
    stuck.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.store.create(&stuck).await.expect("create");

    let shutdown = CancellationToken::new();
    let dispatcher_shutdown = shutdown.clone();
    let deps = h.deps.clone();
    let dispatcher_handle =
        tokio::spawn(async move { Dispatcher::new(deps).run(dispatcher_shutdown).await });

    // Wait for the task to be recovered, dispatched and finished.
    let mut finished = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = h.store.get("01STUCK").await.expect("get");
        if task.status == TaskStatus::Success {
            finished = true;
            break;
        }
    }
    shutdown.cancel();
    dispatcher_handle
        .await
        .expect("join")
        .expect("dispatcher run");

    assert!(finished, "stuck task was not recovered and completed");
    let done = h.store.get("01STUCK").await.expect("get");
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.attempts, 1);

    let logs = h.store.logs_since("01STUCK", None).await.expect("logs");
    assert!(logs
        .iter()
        .any(|entry| entry.message.contains("recovery sweep")));
}

/// Invariant: after dispatcher shutdown returns, nothing is `running`.
#[tokio::test]
async fn shutdown_leaves_no_task_running() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![ScriptedGen {
            delay: Duration::from_secs(30),
            result: ScriptedGenResult::Failed("unused".to_string()),
        }]),
        ScriptedCi::new(vec![]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");

    let shutdown = CancellationToken::new();
    let dispatcher_shutdown = shutdown.clone();
    let deps = h.deps.clone();
    let dispatcher_handle =
        tokio::spawn(async move { Dispatcher::new(deps).run(dispatcher_shutdown).await });

    // Let the dispatcher claim the task and enter the generator.
    let mut claimed = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if h.store.get(&created.id).await.expect("get").status == TaskStatus::Running {
            claimed = true;
            break;
        }
    }
    assert!(claimed, "dispatcher never claimed the task");

    shutdown.cancel();
    dispatcher_handle
        .await
        .expect("join")
        .expect("dispatcher run");

    let task = h.store.get(&created.id).await.expect("get");
    assert_ne!(task.status, TaskStatus::Running);
    // Re-queued with budget intact, ready for the next start.
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 0);
}

/// Boundary: the generator claims success but changes nothing.
#[tokio::test]
async fn zero_changed_files_suspends_for_review() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_no_change(true)]),
        ScriptedCi::new(vec![]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::NeedsReview);

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::NeedsReview);
    assert!(done.summary.contains("no files"), "summary: {}", done.summary);
}

/// Boundary: no CI conclusion within the deadline.
#[tokio::test]
async fn ci_timeout_is_a_terminal_error() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_change(&["a.rs"])]),
        ScriptedCi::new(vec![CiObservation {
            run_id: None,
            conclusion: CiConclusion::TimedOut,
        }]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::Error);

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.summary, "ci timeout");
}

/// Clone failure is terminal after bounded transient retries.
#[tokio::test]
async fn clone_failure_is_a_terminal_error() {
    let h = harness(
        3,
        ScriptedVcs {
            fail_clone: Some("remote unreachable".to_string()),
            ..ScriptedVcs::default()
        },
        ScriptedGenerator::new(vec![]),
        ScriptedCi::new(vec![]),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");

    let status = Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");
    assert_eq!(status, TaskStatus::Error);

    let done = h.service.get_task(&created.id).await.expect("get");
    assert!(done.summary.contains("clone failed"), "summary: {}", done.summary);
}

/// Pull-request creation is best-effort: a configured PR URL is recorded,
/// and an unsupported provider does not fail the task.
#[tokio::test]
async fn pull_request_is_best_effort() {
    let h = harness(
        3,
        ScriptedVcs::default(),
        ScriptedGenerator::new(vec![gen_change(&["a.rs"])]),
        ScriptedCi::new(vec![ci_success(5)]).with_pr_url("https://host/x/y/pull/1"),
    )
    .await;

    let created = h.service.create_task("x/y", "p").await.expect("create");
    let claimed = h.store.claim_next().await.expect("claim").expect("task");
    Engine::new(h.deps.clone())
        .run(claimed, CancellationToken::new())
        .await
        .expect("engine");

    let done = h.service.get_task(&created.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.pr_url.as_deref(), Some("https://host/x/y/pull/1"));
}
