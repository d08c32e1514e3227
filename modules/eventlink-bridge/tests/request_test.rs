//! Request bridge: exactly one resolution across event, terminal, timeout
//! and cancellation paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventlink_bridge::{RequestBuilder, RequestError};
use eventlink_subscriptions::SubscriptionRegistry;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Response {
    op: u32,
    result: Result<u32, String>,
}

fn ok(op: u32, value: u32) -> Response {
    Response {
        op,
        result: Ok(value),
    }
}

fn failed(op: u32, reason: &str) -> Response {
    Response {
        op,
        result: Err(reason.to_string()),
    }
}

fn answers(op: u32) -> impl Fn(&Response) -> Option<Result<u32, String>> + Send + Sync + 'static {
    move |response| (response.op == op).then(|| response.result.clone())
}

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

// =========================================================================
// Primary path
// =========================================================================

#[tokio::test]
async fn resolves_on_matching_event_and_ignores_others() {
    let responses = SubscriptionRegistry::new();
    let pending = RequestBuilder::new(&responses, answers(7)).dispatch(|| Ok(()));

    responses.receive(&ok(3, 30));
    assert!(!pending.is_settled());
    responses.receive(&ok(7, 70));

    assert_eq!(pending.await, Ok(70));
    assert!(responses.is_empty());
}

#[tokio::test]
async fn domain_failure_is_reported_and_cleanup_runs() {
    let responses = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let pending = RequestBuilder::new(&responses, answers(1))
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    responses.receive(&failed(1, "busy"));

    assert_eq!(pending.await, Err(RequestError::Failed("busy".to_string())));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn response_delivered_from_inside_send_is_not_missed() {
    let responses = SubscriptionRegistry::new();
    let producer = responses.clone();
    let pending = RequestBuilder::new(&responses, answers(2)).dispatch(move || {
        producer.receive(&ok(2, 20));
        Ok(())
    });

    assert_eq!(pending.await, Ok(20));
}

#[tokio::test]
async fn send_error_settles_immediately_and_disarms_listeners() {
    let responses = SubscriptionRegistry::new();
    let disconnects: SubscriptionRegistry<()> = SubscriptionRegistry::new();
    let pending = RequestBuilder::new(&responses, answers(4))
        .with_terminal(&disconnects, |_| true)
        .dispatch(|| Err("write rejected".to_string()));

    assert!(pending.is_settled());
    assert!(responses.is_empty());
    assert!(disconnects.is_empty());
    assert_eq!(
        pending.await,
        Err(RequestError::Failed("write rejected".to_string()))
    );
}

// =========================================================================
// Terminal path
// =========================================================================

#[tokio::test]
async fn terminal_event_resolves_with_disconnected() {
    let responses = SubscriptionRegistry::new();
    let disconnects: SubscriptionRegistry<&'static str> = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let pending = RequestBuilder::new(&responses, answers(1))
        .with_terminal(&disconnects, |reason| *reason == "gone")
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    disconnects.receive(&"flapping");
    assert!(!pending.is_settled());
    disconnects.receive(&"gone");

    let outcome = pending.await;
    assert!(matches!(&outcome, Err(e) if e.is_terminal()));
    assert!(responses.is_empty());
    assert!(disconnects.is_empty());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn winning_event_disarms_terminal_listener() {
    let responses = SubscriptionRegistry::new();
    let disconnects: SubscriptionRegistry<()> = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let pending = RequestBuilder::new(&responses, answers(1))
        .with_terminal(&disconnects, |_| true)
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    responses.receive(&ok(1, 10));
    assert_eq!(disconnects.receive(&()), 0);

    assert_eq!(pending.await, Ok(10));
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
}

// =========================================================================
// Timeout path
// =========================================================================

#[tokio::test(start_paused = true)]
async fn times_out_once_and_ignores_late_event() {
    let responses = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let timeout = Duration::from_millis(100);
    let start = Instant::now();

    let pending = RequestBuilder::new(&responses, answers(9))
        .with_timeout(timeout)
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    assert_eq!(pending.await, Err(RequestError::TimedOut(timeout)));
    assert!(start.elapsed() >= timeout);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(responses.receive(&ok(9, 90)), 0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn event_before_deadline_disarms_timer() {
    let responses = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let pending = RequestBuilder::new(&responses, answers(5))
        .with_timeout(Duration::from_millis(100))
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    tokio::time::sleep(Duration::from_millis(99)).await;
    responses.receive(&ok(5, 50));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(pending.await, Ok(50));
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn event_at_the_deadline_resolves_once() {
    let responses = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let timeout = Duration::from_millis(100);
    let pending = RequestBuilder::new(&responses, answers(6))
        .with_timeout(timeout)
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    // Let the timer and the event become due together; whichever settles
    // first wins and the other is discarded.
    tokio::time::advance(timeout).await;
    responses.receive(&ok(6, 60));

    let outcome = pending.await;
    match outcome {
        Ok(60) => assert_eq!(cleanups.load(Ordering::SeqCst), 0),
        Err(RequestError::TimedOut(_)) => assert_eq!(cleanups.load(Ordering::SeqCst), 1),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(responses.is_empty());
}

// =========================================================================
// Cancellation path
// =========================================================================

#[tokio::test]
async fn dropping_the_request_cancels_and_cleans_up() {
    let responses = SubscriptionRegistry::new();
    let disconnects: SubscriptionRegistry<()> = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let pending = RequestBuilder::new(&responses, answers(1))
        .with_terminal(&disconnects, |_| true)
        .with_timeout(Duration::from_secs(60))
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    pending.cancel();

    assert!(responses.is_empty());
    assert!(disconnects.is_empty());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_after_completion_does_not_clean_up() {
    let responses = SubscriptionRegistry::new();
    let (cleanups, cleanup) = counter();
    let mut pending = RequestBuilder::new(&responses, answers(1))
        .with_cleanup(cleanup)
        .dispatch(|| Ok(()));

    responses.receive(&ok(1, 1));
    assert_eq!((&mut pending).await, Ok(1));
    drop(pending);

    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ready_request_resolves_without_listeners() {
    let pending = eventlink_bridge::PendingRequest::<u32, String>::ready(Err(
        RequestError::NotFound("ghost".to_string()),
    ));
    assert!(pending.is_settled());
    assert_eq!(pending.await, Err(RequestError::NotFound("ghost".to_string())));
}

// =========================================================================
// Racing producers
// =========================================================================

#[tokio::test]
async fn concurrent_event_and_terminal_resolve_exactly_once() {
    for _ in 0..50 {
        let responses = SubscriptionRegistry::new();
        let disconnects: SubscriptionRegistry<()> = SubscriptionRegistry::new();
        let (cleanups, cleanup) = counter();
        let pending = RequestBuilder::new(&responses, answers(1))
            .with_terminal(&disconnects, |_| true)
            .with_cleanup(cleanup)
            .dispatch(|| Ok(()));

        let r = responses.clone();
        let d = disconnects.clone();
        let event = std::thread::spawn(move || r.receive(&ok(1, 11)));
        let terminal = std::thread::spawn(move || d.receive(&()));
        event.join().unwrap();
        terminal.join().unwrap();

        match pending.await {
            Ok(11) => assert_eq!(cleanups.load(Ordering::SeqCst), 0),
            Err(RequestError::Disconnected) => assert_eq!(cleanups.load(Ordering::SeqCst), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(responses.is_empty());
        assert!(disconnects.is_empty());
    }
}
