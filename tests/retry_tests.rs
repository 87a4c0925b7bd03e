//! Retry controller timing and classification.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use tiller::error::{ProviderError, ProviderErrorKind, TillerError};
use tiller::util::retry::RetryPolicy;
use tiller::util::timeout::with_timeout;

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        exponential_base: 2.0,
        ..RetryPolicy::default()
    }
}

#[tokio::test(start_paused = true)]
async fn succeeds_after_two_retryable_failures() {
    let calls = AtomicU32::new(0);
    let delays = Mutex::new(Vec::new());

    let result = policy(3)
        .execute_observed(
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(ProviderError::transport("flaky")),
                    _ => Ok("ok"),
                }
            },
            |_, attempt, delay| delays.lock().unwrap().push((attempt, delay)),
        )
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *delays.lock().unwrap(),
        vec![
            (0, Duration::from_millis(100)),
            (1, Duration::from_millis(200)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn exhaustion_wraps_the_last_error() {
    let calls = AtomicU32::new(0);

    let err = policy(2)
        .execute(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderError::rate_limited(format!("busy {n}"), None))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        TillerError::RetryExhausted(exhausted) => {
            assert_eq!(exhausted.attempts, 3);
            assert_eq!(exhausted.cause.message, "busy 2");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limit_hint_extends_the_delay_up_to_the_cap() {
    let calls = AtomicU32::new(0);
    let delays = Mutex::new(Vec::new());

    policy(2)
        .execute_observed(
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(ProviderError::rate_limited("wait", Some(Duration::from_millis(700)))),
                    1 => Err(ProviderError::rate_limited("wait", Some(Duration::from_secs(30)))),
                    _ => Ok(()),
                }
            },
            |_, _, delay| delays.lock().unwrap().push(delay),
        )
        .await
        .unwrap();

    assert_eq!(
        *delays.lock().unwrap(),
        vec![Duration::from_millis(700), Duration::from_secs(1)]
    );
}

#[tokio::test]
async fn non_retryable_kinds_fail_immediately() {
    for err in [
        ProviderError::malformed("garbage"),
        ProviderError::invalid_request("bad"),
        ProviderError::authentication("who"),
    ] {
        let kind = err.kind;
        let calls = AtomicU32::new(0);
        let slot = Mutex::new(Some(err));

        let result = policy(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                let next = slot.lock().unwrap().take();
                async move { Err::<(), _>(next.unwrap()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(TillerError::Provider(e)) if e.kind == kind));
    }
}

#[tokio::test(start_paused = true)]
async fn disabled_policy_makes_one_attempt() {
    let calls = AtomicU32::new(0);

    let err = RetryPolicy::disabled()
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderError::transport("down"))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.attempts(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn timeouts_count_as_retryable_transport_failures() {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result = policy(1)
        .execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            with_timeout(Duration::from_millis(50), async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, ProviderError>(n)
            })
        })
        .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(started.elapsed(), Duration::from_millis(150));
    assert_eq!(
        ProviderError::from(tiller::util::timeout::Elapsed(Duration::from_millis(50))).kind,
        ProviderErrorKind::Transport
    );
}
