//! End-to-end pool behaviour against in-process workers on a paused clock

use futures::future::join_all;
use pitboss_config::PitbossConfig;
use pitboss_core::{ErrorCategory, ErrorReason, RecoveryStrategy, Severity, StrategyOverride};
use pitboss_pool::testing::InProcessLauncher;
use pitboss_pool::{ExecuteOptions, Pool, PoolError};
use pitboss_resilience::{CircuitState, RecoveryState, POOL_RESOURCES};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config(size: usize) -> PitbossConfig {
    let mut config = PitbossConfig::default();
    config.pool.size = size;
    config.pool.health_check_interval = None;
    config.pool.restart_delay = Duration::from_millis(10);
    config
}

async fn start(config: PitbossConfig, launcher: &InProcessLauncher) -> Pool {
    Pool::start_with_launcher(config, Arc::new(launcher.clone()))
        .await
        .unwrap()
}

/// Let background tasks catch up
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait_for_busy(pool: &Pool, busy: usize) {
    while pool.get_stats().await.busy < busy {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

async fn wait_for_queued(pool: &Pool, queued: usize) {
    while pool.get_stats().await.queued < queued {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn spawn_call(
    pool: &Pool,
    command: &'static str,
    args: serde_json::Value,
) -> tokio::task::JoinHandle<pitboss_pool::CallResult> {
    let pool = pool.clone();
    tokio::spawn(async move { pool.execute(command, args, ExecuteOptions::default()).await })
}

#[tokio::test(start_paused = true)]
async fn test_workers_start_concurrently() {
    let launcher = InProcessLauncher::new().with_startup_delay(Duration::from_millis(500));

    let began = Instant::now();
    let pool = start(config(4), &launcher).await;
    let elapsed = began.elapsed();

    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(1000));

    let stats = pool.get_stats().await;
    assert_eq!(stats.workers, 4);
    assert_eq!(stats.available, 4);
    assert_eq!(stats.busy, 0);
    assert_eq!(
        pool.worker_ids(),
        vec!["worker_0", "worker_1", "worker_2", "worker_3"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ping_round_trip() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    let began = Instant::now();
    let value = pool
        .execute("ping", json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(value["status"], "ok");
    assert!(began.elapsed() < pool.config().pool.health_probe_timeout);

    let stats = pool.get_stats().await;
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.available, 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_workers_started() {
    let launcher = InProcessLauncher::new();
    launcher.fail_worker("worker_0");
    launcher.fail_worker("worker_1");

    let err = Pool::start_with_launcher(config(2), Arc::new(launcher))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::NoWorkersStarted {
            size: 2,
            failed: 2,
            ..
        }
    ));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let err = Pool::start_with_launcher(config(0), Arc::new(InProcessLauncher::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ConfigurationError(_)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_slot_filled_later() {
    let launcher = InProcessLauncher::new();
    launcher.fail_worker("worker_1");

    let pool = start(config(3), &launcher).await;
    assert_eq!(pool.get_stats().await.workers, 2);

    settle().await;
    let stats = pool.get_stats().await;
    assert_eq!(stats.workers, 3);
    assert_eq!(stats.restarts, 1);
    assert_eq!(pool.worker_ids(), vec!["worker_0", "worker_2", "worker_3"]);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_worker_replaced() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    assert!(launcher.kill("worker_0"));
    settle().await;

    let stats = pool.get_stats().await;
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.restarts, 1);
    assert_eq!(pool.worker_ids(), vec!["worker_1", "worker_2"]);
}

#[tokio::test(start_paused = true)]
async fn test_killed_mid_call_recovers_with_backoff() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    let began = Instant::now();
    let call = spawn_call(&pool, "sleep", json!({"ms": 1000}));
    let victim = loop {
        if let Some(stats) = pool.worker_stats().into_iter().find(|w| w.in_flight == 1) {
            break stats.worker_id;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    assert!(launcher.kill(&victim));

    let value = call.await.unwrap().unwrap();
    assert_ne!(value["worker_id"], victim.as_str());
    // First backoff delay, then a full second call
    assert!(began.elapsed() >= Duration::from_secs(2));

    let recoveries = pool.list_recoveries();
    assert_eq!(recoveries.len(), 1);
    let recovery = &recoveries[0];
    assert_eq!(recovery.strategy, RecoveryStrategy::BackoffRetry);
    assert_eq!(recovery.state, RecoveryState::Succeeded);
    assert_eq!(recovery.error.category, ErrorCategory::Connection);
    assert_eq!(recovery.error.severity, Severity::Major);
    assert_eq!(recovery.attempts, 1);

    let metrics = pool.get_metrics();
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.active, 0);
    assert_eq!(pool.get_stats().await.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_after_every_attempt_crashes() {
    let mut config = config(2);
    config.circuit_breakers.failure_threshold = 100;
    config.pool.max_restart_attempts = 20;
    let launcher = InProcessLauncher::new();
    let pool = start(config, &launcher).await;

    let began = Instant::now();
    let err = pool
        .execute("crash", json!({"code": 3}), ExecuteOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.reason, ErrorReason::RetriesExhausted);
    assert_eq!(err.category, ErrorCategory::Connection);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::BackoffRetry);
    assert_eq!(err.attempts, 6);
    assert!(err.message.contains("code 3"));
    assert!(began.elapsed() >= Duration::from_secs(31));

    let metrics = pool.get_metrics();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.success_rate, 0.0);
    assert_eq!(pool.get_stats().await.errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_calls_stay_on_one_worker() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(3), &launcher).await;

    pool.execute_in_session("s1", "put", json!({"key": "k", "value": 42}), ExecuteOptions::default())
        .await
        .unwrap();

    for _ in 0..5 {
        pool.execute("echo", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        let value = pool
            .execute_in_session("s1", "get", json!({"key": "k"}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(value["value"], 42);
    }

    assert_eq!(pool.get_stats().await.sessions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_waits_for_busy_bound_worker() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    let first = pool
        .execute_in_session("s1", "echo", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let bound = first["worker_id"].as_str().unwrap().to_string();

    let long = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute_in_session("s1", "sleep", json!({"ms": 500}), ExecuteOptions::default())
                .await
        })
    };
    wait_for_busy(&pool, 1).await;

    let began = Instant::now();
    let second = pool
        .execute_in_session("s1", "echo", json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(second["worker_id"], bound.as_str());
    assert!(began.elapsed() >= Duration::from_millis(400));
    assert_eq!(long.await.unwrap().unwrap()["worker_id"], bound.as_str());
}

#[tokio::test(start_paused = true)]
async fn test_long_session_call_keeps_its_binding() {
    let launcher = InProcessLauncher::new();
    let mut config = config(2);
    config.session.ttl = Duration::from_secs(1);
    config.session.sweep_interval = Duration::from_millis(100);
    let pool = start(config, &launcher).await;

    pool.execute_in_session("s1", "put", json!({"key": "k", "value": 42}), ExecuteOptions::default())
        .await
        .unwrap();

    // Outlives the ttl and several sweeps
    let slept = pool
        .execute_in_session("s1", "sleep", json!({"ms": 2000}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(slept["worker_id"], "worker_0");

    let value = pool
        .execute_in_session("s1", "get", json!({"key": "k"}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(value["value"], 42);
    assert_eq!(value["worker_id"], "worker_0");

    // Idle for longer than the ttl, the binding goes away
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(pool.get_stats().await.sessions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dead_session_worker_reported() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(3), &launcher).await;

    let first = pool
        .execute_in_session("s1", "echo", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let bound = first["worker_id"].as_str().unwrap().to_string();

    assert!(launcher.kill(&bound));
    settle().await;

    let err = pool
        .execute_in_session("s1", "get", json!({"key": "k"}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_session_worker_unavailable());
    assert_eq!(err.category, ErrorCategory::Session);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::Abandon);
    assert_eq!(err.attempts, 1);
    assert!(!err.is_retryable());
    assert_eq!(pool.get_metrics().initiated, 0);

    // The stale binding is gone; the session starts over elsewhere
    let next = pool
        .execute_in_session("s1", "echo", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_ne!(next["worker_id"], bound.as_str());
}

#[tokio::test(start_paused = true)]
async fn test_resource_failures_open_breaker() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;
    let memory_error = json!({"error_type": "MemoryError", "message": "out of memory"});

    let cooldown = pool.config().circuit_breakers.cooldown;
    for call in 1..=5 {
        let err = pool
            .execute("fail", memory_error.clone(), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, ErrorReason::Failed);
        assert_eq!(err.category, ErrorCategory::Resource);
        assert_eq!(err.severity, Severity::Critical);
        assert_eq!(err.recovery_strategy, RecoveryStrategy::CircuitBreak);
        if call < 5 {
            assert_eq!(err.retry_after, None);
        } else {
            // The failure that trips the breaker tells the caller when to come back
            let retry_after = err.retry_after.unwrap();
            assert!(retry_after > Duration::ZERO && retry_after <= cooldown);
        }
    }

    let resources = pool
        .breaker_states()
        .into_iter()
        .find(|b| b.name == POOL_RESOURCES)
        .unwrap();
    assert_eq!(resources.state, CircuitState::Open);

    let requests_before: u64 = pool.worker_stats().iter().map(|w| w.requests).sum();
    let err = pool
        .execute("ping", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(err.category, ErrorCategory::Resource);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::CircuitBreak);
    assert!(err.retry_after.is_some());
    let requests_after: u64 = pool.worker_stats().iter().map(|w| w.requests).sum();
    assert_eq!(requests_before, requests_after);

    // After the cooldown a single probe call closes the breaker again
    tokio::time::sleep(Duration::from_secs(31)).await;
    pool.execute("ping", json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let resources = pool
        .breaker_states()
        .into_iter()
        .find(|b| b.name == POOL_RESOURCES)
        .unwrap();
    assert_eq!(resources.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_calls_is_bounded_by_queue() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(8), &launcher).await;

    let calls: Vec<_> = (0..100)
        .map(|_| spawn_call(&pool, "sleep", json!({"ms": 50})))
        .collect();
    for result in join_all(calls).await {
        result.unwrap().unwrap();
    }

    let stats = pool.get_stats().await;
    assert_eq!(stats.requests, 100);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.available, 8);
    assert!(stats.max_queued > 0);
    assert!(stats.max_queued <= pool.config().pool.queue_depth);
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_rejects_immediately() {
    let mut config = config(1);
    config.pool.queue_depth = 2;
    let launcher = InProcessLauncher::new();
    let pool = start(config, &launcher).await;

    let holder = spawn_call(&pool, "sleep", json!({"ms": 1000}));
    wait_for_busy(&pool, 1).await;
    let queued: Vec<_> = (0..2).map(|_| spawn_call(&pool, "echo", json!({}))).collect();
    wait_for_queued(&pool, 2).await;

    let began = Instant::now();
    let err = pool
        .execute("ping", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::QueueFull);
    assert_eq!(err.category, ErrorCategory::Resource);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::Abandon);
    assert!(began.elapsed() < Duration::from_millis(10));

    holder.await.unwrap().unwrap();
    for call in queued {
        call.await.unwrap().unwrap();
    }
    // Queue rejections are not worker failures
    assert!(pool
        .breaker_states()
        .iter()
        .all(|b| b.state == CircuitState::Closed && b.failure_count == 0));
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(1), &launcher).await;

    let holder = spawn_call(&pool, "sleep", json!({"ms": 5000}));
    wait_for_busy(&pool, 1).await;

    let err = pool
        .execute(
            "ping",
            json!({}),
            ExecuteOptions::new().with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::QueueTimeout);
    assert_eq!(err.category, ErrorCategory::Timeout);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::Abandon);

    let stats = pool.get_stats().await;
    assert_eq!(stats.queue_timeouts, 1);
    assert_eq!(stats.queued, 0);
    holder.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_call_recycles_silent_worker() {
    let mut config = config(1);
    config.pool.abandoned_call_grace = Duration::from_secs(2);
    config.recovery.strategy_overrides = vec![StrategyOverride {
        category: ErrorCategory::Timeout,
        severity: None,
        strategy: RecoveryStrategy::Abandon,
    }];
    let launcher = InProcessLauncher::new();
    let pool = start(config, &launcher).await;

    let err = pool
        .execute(
            "sleep",
            json!({"ms": 10_000}),
            ExecuteOptions::new().with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::Failed);
    assert_eq!(err.category, ErrorCategory::Timeout);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::Abandon);

    // The worker stays checked out by the abandoned call
    assert_eq!(pool.get_stats().await.busy, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let stats = pool.get_stats().await;
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(pool.worker_ids(), vec!["worker_1"]);
}

#[tokio::test(start_paused = true)]
async fn test_health_probe_replaces_unresponsive_worker() {
    let mut config = config(2);
    config.pool.health_check_interval = Some(Duration::from_secs(1));
    config.pool.health_probe_timeout = Duration::from_millis(200);
    let launcher = InProcessLauncher::new();
    let pool = start(config, &launcher).await;

    launcher.freeze("worker_0");
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let stats = pool.get_stats().await;
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.restarts, 1);
    assert_eq!(pool.worker_ids(), vec!["worker_1", "worker_2"]);
}

#[tokio::test(start_paused = true)]
async fn test_health_sweep_holds_one_worker_at_a_time() {
    let mut config = config(2);
    config.pool.health_check_interval = Some(Duration::from_secs(1));
    config.pool.health_probe_timeout = Duration::from_millis(200);
    let launcher = InProcessLauncher::new();
    let pool = start(config, &launcher).await;

    launcher.freeze("worker_0");
    launcher.freeze("worker_1");
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // First probe is still waiting on its silent worker
    let stats = pool.get_stats().await;
    assert_eq!(stats.busy, 1);
    assert_eq!(stats.available, 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_error_fails_over_once() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    let err = pool
        .execute(
            "fail",
            json!({"error_type": "RuntimeError", "message": "bad input"}),
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.reason, ErrorReason::Failed);
    assert_eq!(err.category, ErrorCategory::Worker);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::Failover);
    assert_eq!(err.attempts, 2);

    // The alternate attempt ran on the other worker
    assert!(pool.worker_stats().iter().all(|w| w.failures == 1));
    assert_eq!(pool.list_recoveries()[0].strategy, RecoveryStrategy::Failover);
    assert_eq!(pool.get_metrics().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_communication_error_retries_immediately() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    let began = Instant::now();
    let err = pool
        .execute(
            "fail",
            json!({"error_type": "JSONDecodeError", "message": "bad frame"}),
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.reason, ErrorReason::RetriesExhausted);
    assert_eq!(err.category, ErrorCategory::Communication);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::ImmediateRetry);
    assert_eq!(err.attempts, 4);
    assert!(began.elapsed() >= Duration::from_millis(300));
    assert!(began.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_recovery() {
    let mut config = config(2);
    config.circuit_breakers.failure_threshold = 100;
    let launcher = InProcessLauncher::new();
    let pool = start(config, &launcher).await;

    let call = spawn_call(&pool, "crash", json!({}));
    while pool.get_metrics().active == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let id = pool.list_recoveries()[0].id;

    assert!(pool.cancel_recovery(id));
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.reason, ErrorReason::RecoveryCancelled);
    assert_eq!(err.category, ErrorCategory::System);

    let status = pool.get_recovery_status(id).unwrap();
    assert_eq!(status.state, RecoveryState::Cancelled);
    assert_eq!(pool.get_metrics().cancelled, 1);
    assert!(!pool.cancel_recovery(id));
}

#[tokio::test(start_paused = true)]
async fn test_stats_stable_when_idle() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(3), &launcher).await;
    pool.execute("echo", json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    let first = pool.get_stats().await;
    let second = pool.get_stats().await;
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_and_rejects() {
    let launcher = InProcessLauncher::new();
    let pool = start(config(2), &launcher).await;

    let in_flight = spawn_call(&pool, "sleep", json!({"ms": 200}));
    wait_for_busy(&pool, 1).await;

    pool.shutdown().await.unwrap();
    assert_eq!(in_flight.await.unwrap().unwrap()["slept_ms"], 200);

    let err = pool
        .execute("ping", json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::ShuttingDown);
    assert_eq!(err.category, ErrorCategory::System);
    assert_eq!(err.recovery_strategy, RecoveryStrategy::Abandon);

    settle().await;
    assert_eq!(pool.get_stats().await.workers, 0);
    pool.shutdown().await.unwrap();
}
