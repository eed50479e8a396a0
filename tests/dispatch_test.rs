//! Delivery policy and initialization tests against in-memory backends.

mod common;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{test_config, timeline, ClientCall, MockClientFactory, MockJobStore};
use tasker_jobs::messaging::{Job, QueueUpdate};
use tasker_jobs::{Handlers, JobError, JobSystem, JobSystemConfig, Queue, QueueConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Email {
    to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Report {
    id: u32,
    #[serde(default)]
    fail: bool,
}

const EMAIL: Queue<Email> = Queue::new("email");
const REPORTS: Queue<Report> = Queue::new("reports");

struct Harness {
    system: JobSystem,
    factory: Arc<MockClientFactory>,
    store: Arc<MockJobStore>,
}

fn harness(config: JobSystemConfig, factory: MockClientFactory, store: MockJobStore) -> Harness {
    let factory = Arc::new(factory);
    let store = Arc::new(store);
    let system = JobSystem::with_backends(config, factory.clone(), store.clone())
        .expect("valid config");
    Harness {
        system,
        factory,
        store,
    }
}

fn failing_email_handlers(attempts: Arc<AtomicUsize>) -> Handlers {
    Handlers::new().register(&EMAIL, move |_email: Email| {
        let attempts = attempts.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("smtp unavailable"))
        }
    })
}

fn report_handlers() -> Handlers {
    Handlers::new().register(&REPORTS, |report: Report| async move {
        if report.fail {
            anyhow::bail!("report {} could not render", report.id);
        }
        Ok(())
    })
}

/// Records every rendered report id before deciding the outcome
fn recording_report_handlers(rendered: Arc<Mutex<Vec<u32>>>) -> Handlers {
    Handlers::new().register(&REPORTS, move |report: Report| {
        let rendered = rendered.clone();
        async move {
            rendered.lock().push(report.id);
            if report.fail {
                anyhow::bail!("report {} could not render", report.id);
            }
            Ok(())
        }
    })
}

fn email_job(id: &str, retry_count: i32, retry_limit: i32) -> Job {
    Job::new(id, "email", json!({"to": "ops@example.com"})).with_retries(retry_count, retry_limit)
}

fn report_job(id: &str, fail: bool, retry_count: i32, retry_limit: i32) -> Job {
    numbered_report_job(id, 1, fail, retry_count, retry_limit)
}

fn numbered_report_job(id: &str, n: u32, fail: bool, retry_count: i32, retry_limit: i32) -> Job {
    Job::new(id, "reports", json!({"id": n, "fail": fail})).with_retries(retry_count, retry_limit)
}

#[tokio::test]
async fn test_single_job_retryable_failure_skips_on_failed() {
    let line = timeline();
    let failed = Arc::new(AtomicUsize::new(0));
    let counter = failed.clone();
    let config = test_config().queue(
        &EMAIL,
        QueueConfig::new().retry_limit(3).on_failed(move |_job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    let attempts = Arc::new(AtomicUsize::new(0));
    h.system.initialize(failing_email_handlers(attempts.clone())).await.unwrap();

    let err = h
        .factory
        .latest()
        .deliver("email", vec![email_job("job-1", 0, 3)])
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Handler { exhausted: false, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 0);
    assert!(h.factory.latest().fail_calls().is_empty());
}

#[tokio::test]
async fn test_single_job_final_attempt_runs_on_failed_then_errors() {
    let line = timeline();
    let seen: Arc<Mutex<Vec<(String, Email, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let config = test_config().queue(
        &EMAIL,
        QueueConfig::new().retry_limit(3).on_failed(move |job| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .push((job.job_id, job.data, job.error.to_string()));
                Ok(())
            }
        }),
    );
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    h.system
        .initialize(failing_email_handlers(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();

    let err = h
        .factory
        .latest()
        .deliver("email", vec![email_job("job-9", 3, 3)])
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Handler { exhausted: true, .. }));
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "job-9");
    assert_eq!(seen[0].1.to, "ops@example.com");
    assert!(seen[0].2.contains("smtp unavailable"));
}

#[tokio::test]
async fn test_single_job_on_failed_error_replaces_handler_error() {
    let line = timeline();
    let config = test_config().queue(
        &EMAIL,
        QueueConfig::new()
            .retry_limit(1)
            .on_failed(|_job| async { Err(anyhow::anyhow!("alerting down")) }),
    );
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    h.system
        .initialize(failing_email_handlers(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();

    let err = h
        .factory
        .latest()
        .deliver("email", vec![email_job("job-2", 1, 1)])
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::FailureCallback { ref job_id, .. } if job_id == "job-2"));
}

#[tokio::test]
async fn test_single_job_success() {
    let line = timeline();
    let config = test_config().queue(&EMAIL, QueueConfig::new());
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    h.system
        .initialize(Handlers::new().register(&EMAIL, move |email: Email| {
            let sink = sink.clone();
            async move {
                sink.lock().push(email.to);
                Ok(())
            }
        }))
        .await
        .unwrap();

    h.factory
        .latest()
        .deliver("email", vec![email_job("job-1", 0, 0)])
        .await
        .unwrap();

    assert_eq!(delivered.lock().as_slice(), ["ops@example.com".to_string()]);
}

#[tokio::test]
async fn test_batch_fails_only_failed_ids_and_calls_on_failed_when_exhausted() {
    let line = timeline();
    let failed_ids = Arc::new(Mutex::new(Vec::new()));
    let sink = failed_ids.clone();
    let config = test_config().queue(
        &REPORTS,
        QueueConfig::new().batch_size(5).on_failed(move |job| {
            let sink = sink.clone();
            async move {
                sink.lock().push(job.job_id);
                Ok(())
            }
        }),
    );
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    let rendered = Arc::new(Mutex::new(Vec::new()));
    h.system
        .initialize(recording_report_handlers(rendered.clone()))
        .await
        .unwrap();

    let client = h.factory.latest();
    client
        .deliver(
            "reports",
            vec![
                numbered_report_job("a", 1, false, 0, 2),
                numbered_report_job("b", 2, true, 2, 2),
                numbered_report_job("c", 3, true, 0, 2),
            ],
        )
        .await
        .unwrap();

    let mut rendered = rendered.lock().clone();
    rendered.sort_unstable();
    assert_eq!(rendered, vec![1, 2, 3]);
    assert_eq!(
        client.fail_calls(),
        vec![("reports".to_string(), vec!["b".to_string(), "c".to_string()])]
    );
    assert_eq!(failed_ids.lock().as_slice(), ["b".to_string()]);
}

#[tokio::test]
async fn test_batch_jobs_settle_independently_of_a_slow_sibling() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new().batch_size(3));
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = finished.clone();
    h.system
        .initialize(Handlers::new().register(&REPORTS, move |report: Report| {
            let sink = sink.clone();
            async move {
                if report.id == 1 {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                sink.lock().push(report.id);
                if report.fail {
                    anyhow::bail!("report {} could not render", report.id);
                }
                Ok(())
            }
        }))
        .await
        .unwrap();

    let client = h.factory.latest();
    client
        .deliver(
            "reports",
            vec![
                numbered_report_job("slow", 1, true, 0, 1),
                numbered_report_job("fast-ok", 2, false, 0, 1),
                numbered_report_job("fast-bad", 3, true, 0, 1),
            ],
        )
        .await
        .unwrap();

    // The slow job finishes last yet neither sibling outcome is lost
    assert_eq!(finished.lock().last(), Some(&1));
    assert_eq!(finished.lock().len(), 3);
    assert_eq!(
        client.fail_calls(),
        vec![(
            "reports".to_string(),
            vec!["slow".to_string(), "fast-bad".to_string()]
        )]
    );
}

#[tokio::test]
async fn test_batch_exhausted_failure_without_on_failed_still_fails_job() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new().batch_size(2));
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    let rendered = Arc::new(Mutex::new(Vec::new()));
    h.system
        .initialize(recording_report_handlers(rendered.clone()))
        .await
        .unwrap();

    let client = h.factory.latest();
    client
        .deliver(
            "reports",
            vec![
                numbered_report_job("done", 1, true, 2, 2),
                numbered_report_job("fine", 2, false, 0, 2),
            ],
        )
        .await
        .unwrap();

    assert_eq!(rendered.lock().len(), 2);
    assert_eq!(
        client.fail_calls(),
        vec![("reports".to_string(), vec!["done".to_string()])]
    );
}

#[tokio::test]
async fn test_batch_all_success_makes_no_fail_call() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new().batch_size(3));
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    h.system.initialize(report_handlers()).await.unwrap();

    let client = h.factory.latest();
    client
        .deliver(
            "reports",
            vec![report_job("a", false, 0, 0), report_job("b", false, 0, 0)],
        )
        .await
        .unwrap();

    assert!(client.fail_calls().is_empty());
}

#[tokio::test]
async fn test_batch_fail_call_error_propagates() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new().batch_size(2));
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    h.system.initialize(report_handlers()).await.unwrap();

    let client = h.factory.latest();
    client.fail_next_fail_call(JobError::client("fail", "connection reset"));
    let err = client
        .deliver("reports", vec![report_job("a", true, 0, 1)])
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Client { .. }));
}

#[tokio::test]
async fn test_batch_size_reaches_work_options() {
    let line = timeline();
    let config = test_config()
        .queue(&REPORTS, QueueConfig::new().batch_size(10).local_concurrency(2))
        .queue(&EMAIL, QueueConfig::new());
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));
    let handlers = report_handlers()
        .register(&EMAIL, |_email: Email| async { Ok(()) });
    h.system.initialize(handlers).await.unwrap();

    let works: Vec<_> = h
        .factory
        .latest()
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ClientCall::Work(q, options) => {
                Some((q, options.batch_size, options.local_concurrency))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        works,
        vec![
            ("reports".to_string(), 10, Some(2)),
            ("email".to_string(), 1, None),
        ]
    );
}

#[tokio::test]
async fn test_provisioning_creates_missing_queues_and_applies_explicit_policy() {
    let line = timeline();
    let config = test_config()
        .queue(&EMAIL, QueueConfig::new())
        .queue(
            &REPORTS,
            QueueConfig::new().retry_limit(2).expire_in_seconds(120),
        );
    let factory = MockClientFactory::new(line.clone()).with_existing_queue("email");
    let h = harness(config, factory, MockJobStore::new(line));
    let handlers = report_handlers().register(&EMAIL, |_email: Email| async { Ok(()) });
    h.system.initialize(handlers).await.unwrap();

    let calls = h.factory.latest().calls();
    let created: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            ClientCall::CreateQueue(q) => Some(q.as_str()),
            _ => None,
        })
        .collect();
    let updated: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            ClientCall::UpdateQueue(q, update) => Some((q.as_str(), update.clone())),
            _ => None,
        })
        .collect();

    assert_eq!(created, vec!["reports"]);
    assert_eq!(
        updated,
        vec![(
            "reports",
            QueueUpdate {
                expire_in_seconds: Some(120),
                retry_limit: Some(2),
                retry_delay: None,
            }
        )]
    );
}

#[tokio::test]
async fn test_missing_handler_fails_before_any_registration() {
    let line = timeline();
    let config = test_config()
        .queue(&EMAIL, QueueConfig::new())
        .queue(&REPORTS, QueueConfig::new());
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));

    let err = h.system.initialize(report_handlers()).await.unwrap_err();

    assert!(matches!(err, JobError::MissingHandler { ref queue } if queue == "email"));
    assert_eq!(h.factory.created(), 0);
    assert!(!h.system.dispatcher().is_initialized().await);

    // Still retryable once every handler is supplied
    let handlers = report_handlers().register(&EMAIL, |_email: Email| async { Ok(()) });
    h.system.initialize(handlers).await.unwrap();
    assert_eq!(
        h.factory
            .latest()
            .count(|c| matches!(c, ClientCall::Work(..))),
        2
    );
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new());
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));

    h.system.initialize(report_handlers()).await.unwrap();
    h.system.initialize(report_handlers()).await.unwrap();

    assert_eq!(h.factory.created(), 1);
    assert_eq!(
        h.factory
            .latest()
            .count(|c| matches!(c, ClientCall::Work(..))),
        1
    );
    assert_eq!(h.store.reclaim_calls.lock().len(), 1);
}

#[tokio::test]
async fn test_concurrent_initialize_registers_once() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new());
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));

    let (a, b) = tokio::join!(
        h.system.initialize(report_handlers()),
        h.system.initialize(report_handlers())
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(
        h.factory
            .latest()
            .count(|c| matches!(c, ClientCall::Work(..))),
        1
    );
}

#[tokio::test]
async fn test_initialization_order() {
    let line = timeline();
    let config = test_config()
        .queue(&REPORTS, QueueConfig::new().retry_limit(1))
        .schedule("reports", "*/5 * * * *");
    let h = harness(
        config,
        MockClientFactory::new(line.clone()),
        MockJobStore::new(line.clone()),
    );
    h.system.initialize(report_handlers()).await.unwrap();

    assert_eq!(
        line.lock().clone(),
        vec![
            "client.start",
            "store.reclaim_orphans",
            "client.get_queue:reports",
            "client.create_queue:reports",
            "client.update_queue:reports",
            "client.work:reports",
            "client.schedule:reports",
        ]
    );
}

#[tokio::test]
async fn test_recovery_uses_ten_second_staleness() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new());
    let mut store = MockJobStore::new(line.clone());
    store.reclaimed = 4;
    let h = harness(config, MockClientFactory::new(line), store);
    h.system.initialize(report_handlers()).await.unwrap();

    assert_eq!(
        h.store.reclaim_calls.lock().as_slice(),
        [std::time::Duration::from_secs(10)]
    );
}

#[tokio::test]
async fn test_clean_orphans_disabled_skips_recovery() {
    let line = timeline();
    let config = test_config()
        .queue(&REPORTS, QueueConfig::new())
        .clean_orphans(false);
    let h = harness(
        config,
        MockClientFactory::new(line.clone()),
        MockJobStore::new(line.clone()),
    );
    h.system.initialize(report_handlers()).await.unwrap();

    assert!(h.store.reclaim_calls.lock().is_empty());
    assert!(!line.lock().iter().any(|e| e.starts_with("store.")));
}

#[tokio::test]
async fn test_recovery_failure_aborts_initialize() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new());
    let mut store = MockJobStore::new(line.clone());
    store.fail_with = Some(JobError::database("reclaim_orphans", "relation does not exist"));
    let h = harness(config, MockClientFactory::new(line), store);

    let err = h.system.initialize(report_handlers()).await.unwrap_err();

    assert!(matches!(err, JobError::Database { .. }));
    assert_eq!(
        h.factory
            .latest()
            .count(|c| matches!(c, ClientCall::Work(..))),
        0
    );
}

#[tokio::test]
async fn test_send_uses_shared_client() {
    let line = timeline();
    let config = test_config().queue(&EMAIL, QueueConfig::new());
    let h = harness(config, MockClientFactory::new(line.clone()), MockJobStore::new(line));

    let id = h
        .system
        .send(&EMAIL, &Email { to: "a@example.com".into() }, None)
        .await
        .unwrap();
    h.system
        .send(&EMAIL, &Email { to: "b@example.com".into() }, None)
        .await
        .unwrap();

    assert!(id.is_some());
    assert_eq!(h.factory.created(), 1);
    assert_eq!(
        h.factory.latest().sent(),
        vec![
            ("email".to_string(), json!({"to": "a@example.com"})),
            ("email".to_string(), json!({"to": "b@example.com"})),
        ]
    );
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_construction() {
    let line = timeline();
    let config = test_config().queue(&REPORTS, QueueConfig::new().batch_size(0));
    let result = JobSystem::with_backends(
        config,
        Arc::new(MockClientFactory::new(line.clone())),
        Arc::new(MockJobStore::new(line)),
    );

    assert!(matches!(result, Err(JobError::Configuration { .. })));
}
