//! Integration tests for the whole broker.
//!
//! These wire the real queue, preallocator, scheduler and HTTP facade
//! together over the scripted fake driver, then drive everything through
//! the REST surface the way a requester would.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use makevisor::config::Config;
use makevisor::job::manager::JobManager;
use makevisor::job::queue::JobQueue;
use makevisor::job::worker::WorkerContext;
use makevisor::server::{self, AppState};
use makevisor::storage::Storage;
use makevisor::vm::{PoolSettings, Preallocator};
use makevisor::vmms::fake::FakeDriver;
use makevisor::vmms::RunEnd;

struct Broker {
    _dir: tempfile::TempDir,
    app: Router,
    driver: Arc<FakeDriver>,
    queue: Arc<JobQueue>,
    pool: Arc<Preallocator>,
}

/// Stand up a full broker over the fake driver with one alpine pool of
/// the given target size, scheduler loop running.
async fn broker(target: usize) -> Broker {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.storage_root = dir.path().to_path_buf();
    let config = Arc::new(config);

    let driver = Arc::new(FakeDriver::new(vec!["alpine".to_string()]));
    let storage = Arc::new(Storage::new(dir.path().to_path_buf()));
    let queue = Arc::new(JobQueue::new(256));
    let pool = Preallocator::new(
        driver.clone(),
        PoolSettings {
            hard_cap: 8,
            create_retries: 2,
            create_retry_delay: Duration::from_millis(5),
            safe_destroy_grace: Duration::from_millis(100),
        },
    );
    pool.define_image("alpine", true).await;
    pool.update("alpine", target).await.expect("pool update");

    let ctx = WorkerContext {
        driver: driver.clone(),
        queue: Arc::clone(&queue),
        pool: Arc::clone(&pool),
        storage: Arc::clone(&storage),
        http: reqwest::Client::new(),
        ready_timeout: Duration::from_millis(100),
        retry_budget: 5,
    };
    let manager = JobManager::new(
        Arc::clone(&queue),
        Arc::clone(&pool),
        ctx,
        Duration::from_millis(10),
        5,
    );
    // dropping the handle detaches the loop; it dies with the runtime
    let _scheduler = Arc::clone(&manager).start();

    let state = AppState {
        config,
        queue: Arc::clone(&queue),
        pool: Arc::clone(&pool),
        manager,
        storage,
        driver: driver.clone(),
    };
    Broker {
        _dir: dir,
        app: server::router(state),
        driver,
        queue,
        pool,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

fn spec_json(timeout: u64) -> String {
    format!(
        r#"{{
            "image": "alpine",
            "inputFiles": [ {{ "localFile": "Makefile", "destFile": "Makefile" }} ],
            "outputFile": {{ "destPath": "out.log", "format": "raw" }},
            "maxOutputFileSize": 4096,
            "timeout": {}
        }}"#,
        timeout
    )
}

async fn upload_makefile(app: &Router, contents: &str) {
    let (status, _) = call(app, "POST", "/upload/tester/Makefile", Some(contents)).await;
    assert_eq!(status, StatusCode::OK);
}

/// Poll the REST surface until the job reaches a terminal status.
async fn poll_until_done(app: &Router, dest: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = call(app, "GET", &format!("/poll/tester/{}", dest), None).await;
            assert_eq!(status, StatusCode::OK);
            let state = body["status"].as_str().unwrap_or("");
            if state == "completed" || state == "failed" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never reached a terminal status")
}

async fn settle_pool(pool: &Arc<Preallocator>, free: usize, total: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(snapshot) = pool.get_pool("alpine").await {
                if snapshot.free == free && snapshot.total == total {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pool did not settle");
}

fn trace_contains(body: &serde_json::Value, needle: &str) -> bool {
    body["trace"]
        .as_array()
        .map(|entries| {
            entries.iter().any(|entry| {
                entry["msg"]
                    .as_str()
                    .map(|msg| msg.contains(needle))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Happy path: submit one job against a warm pool of one, watch it run to
/// completion, and check the pool recovered its free VM.
#[tokio::test]
async fn test_happy_path() {
    let broker = broker(1).await;
    broker.driver.script_output(b"hi\n");
    upload_makefile(&broker.app, "all:\n\t@echo hi\n").await;

    let (status, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["output"], "hi\n");
    assert!(trace_contains(&done, "ready"));
    assert!(trace_contains(&done, "input file(s) in"));
    assert!(trace_contains(&done, "run finished"));
    assert!(trace_contains(&done, "output copied out"));

    settle_pool(&broker.pool, 1, 1).await;
}

/// A run that hits its time limit still completes with partial output,
/// but the sandbox is destroyed and replaced rather than pooled.
#[tokio::test]
async fn test_timeout_destroys_the_sandbox() {
    let broker = broker(1).await;
    broker.driver.script_output(b"partial");
    broker.driver.script_run_end(RunEnd::Timeout);
    upload_makefile(&broker.app, "all:\n\tsleep 60\n").await;

    let (_, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(2))).await;
    assert_eq!(body["status"], "queued");

    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["output"], "partial");
    assert!(trace_contains(&done, "run timed out"));

    settle_pool(&broker.pool, 1, 1).await;
    assert!(broker.driver.destroyed_count() >= 1);
    assert_eq!(broker.driver.created_count(), 2);
}

/// Byte-identical submissions while the first is live collapse onto one
/// id and one worker.
#[tokio::test]
async fn test_dedupe_runs_one_worker() {
    let broker = broker(1).await;
    // keep the first job running long enough for the duplicate to land
    broker.driver.script_run_delay(Duration::from_millis(100));
    upload_makefile(&broker.app, "all:\n\t@echo hi\n").await;

    let (_, first) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    let (_, second) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    assert_eq!(first["status"], "queued");
    assert_eq!(second["status"], "duplicate");
    assert_eq!(first["id"], second["id"]);

    poll_until_done(&broker.app, "out.log").await;
    // one pool VM, one run: nothing else was created
    assert_eq!(broker.driver.created_count(), 1);
    assert_eq!(broker.queue.counts().await.dead, 1);
}

/// Two ready-timeouts burn two sandboxes; the third runs the job.
#[tokio::test]
async fn test_retry_on_ready_timeout() {
    let broker = broker(1).await;
    broker.driver.fail_wait(2);
    upload_makefile(&broker.app, "all:\n\t@echo hi\n").await;

    let (_, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    assert_eq!(body["status"], "queued");

    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "completed");
    assert!(broker.driver.destroyed_count() >= 2);
    assert_eq!(broker.driver.created_count(), 3);
    settle_pool(&broker.pool, 1, 1).await;
}

/// A worker that dies mid-run loses its VM but not the job: the job goes
/// back to the head of the queue and completes on the retry.
#[tokio::test]
async fn test_reassign_on_worker_death() {
    let broker = broker(1).await;
    broker.driver.panic_on_run(1);
    upload_makefile(&broker.app, "all:\n\t@echo hi\n").await;

    let (_, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    let id = body["id"].as_u64().expect("id");

    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "completed");
    assert!(trace_contains(&done, "worker died"));

    let job = broker.queue.get(id).await.expect("job");
    assert_eq!(job.retries(), 1);
    assert!(broker.driver.destroyed_count() >= 1);
    settle_pool(&broker.pool, 1, 1).await;
}

/// Submitting against empty pools parks the job in the pending FIFO; a
/// later prealloc lets it run. No polling loop burns a VM meanwhile.
#[tokio::test]
async fn test_job_waits_for_prealloc() {
    let broker = broker(0).await;
    upload_makefile(&broker.app, "all:\n\t@echo hi\n").await;

    let (_, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    assert_eq!(body["status"], "queued");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, pending) = call(&broker.app, "GET", "/poll/tester/out.log", None).await;
    assert_eq!(pending["status"], "pending");

    let (status, _) = call(&broker.app, "POST", "/prealloc/tester/alpine/1", None).await;
    assert_eq!(status, StatusCode::OK);

    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "completed");
}

/// Output past maxOutputFileSize is dropped by the sink and flagged in
/// the trace; the run itself still completes.
#[tokio::test]
async fn test_output_truncation() {
    let broker = broker(1).await;
    broker.driver.script_output(&[b'x'; 10_000]);
    upload_makefile(&broker.app, "all:\n\t@yes x\n").await;

    let (_, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    assert_eq!(body["status"], "queued");

    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "completed");
    assert!(trace_contains(&done, "truncated to 4096 bytes"));
    assert_eq!(done["output"].as_str().expect("output").len(), 4096);
}

/// Cancellation takes effect at the next worker checkpoint and forces the
/// sandbox to be destroyed on release.
#[tokio::test]
async fn test_cancel_before_dispatch() {
    let broker = broker(0).await;
    upload_makefile(&broker.app, "all:\n\t@echo hi\n").await;

    let (_, body) = call(&broker.app, "POST", "/addjob/tester", Some(&spec_json(10))).await;
    let id = body["id"].as_u64().expect("id");
    let (status, _) = call(
        &broker.app,
        "POST",
        &format!("/cancel/tester/{}", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // give it a VM; the worker should fail the job at its first checkpoint
    call(&broker.app, "POST", "/prealloc/tester/alpine/1", None).await;
    let done = poll_until_done(&broker.app, "out.log").await;
    assert_eq!(done["status"], "failed");
    assert!(trace_contains(&done, "cancelled"));
}

/// The info surface reflects the queue and pool counters.
#[tokio::test]
async fn test_info_snapshot() {
    let broker = broker(2).await;
    settle_pool(&broker.pool, 2, 2).await;

    let (status, body) = call(&broker.app, "GET", "/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["driver"], "fake");
    assert_eq!(body["queue"]["live"].as_u64(), Some(0));
    assert_eq!(body["pools"][0]["image"], "alpine");
    assert_eq!(body["pools"][0]["free"].as_u64(), Some(2));
}
