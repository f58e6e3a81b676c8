mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{FakePoller, FakeTransport, fast_config, wait_until};
use edu_realtime::{
    ConnectionState, InboundMessage, MemoryStore, RealtimeClient, RealtimeError, RealtimeResult,
    Severity, SubscribeOptions, Topic, TopicHandler, TransitionCause,
};
use parking_lot::Mutex;
use serde_json::json;

#[tokio::test]
async fn test_repeated_failures_switch_to_polling() -> RealtimeResult<()> {
    let transport = FakeTransport::new();
    transport.fail_connects(Some(RealtimeError::connection_failed("unreachable")));
    let poller = FakePoller::new();
    let client = RealtimeClient::builder(transport.clone())
        .config(fast_config().polling_recovery_interval(Duration::from_secs(30)))
        .polling_source(poller.clone())
        .build()?;
    let causes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&causes);
    let _causes = client.on_state_change(move |t| sink.lock().push(t.cause.clone()));

    assert!(client.connect().await.is_err());
    assert!(
        wait_until(Duration::from_secs(2), || client.state() == ConnectionState::Polling).await
    );

    assert_eq!(transport.connects(), 5);
    assert!(causes.lock().contains(&TransitionCause::FallbackEngaged));
    assert!(wait_until(Duration::from_secs(1), || poller.poll_count() >= 2).await);
    Ok(())
}

#[tokio::test]
async fn test_polling_delivers_and_recovery_replays_subscriptions() -> RealtimeResult<()> {
    let transport = FakeTransport::new();
    transport.fail_connects(Some(RealtimeError::connection_failed("unreachable")));
    let poller = FakePoller::new();
    let client = RealtimeClient::builder(transport.clone())
        .config(fast_config())
        .polling_source(poller.clone())
        .build()?;

    let grades = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&grades);
    let id = client
        .subscribe(
            "grades",
            vec![TopicHandler::new("grade.posted", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })],
            SubscribeOptions::persistent(),
        )
        .await?;

    let _ = client.connect().await;
    assert!(
        wait_until(Duration::from_secs(2), || client.state() == ConnectionState::Polling).await
    );

    poller.push_batch(vec![InboundMessage::event(
        "grade.posted",
        Some("grades".into()),
        json!({"score": 97}),
    )]);
    assert!(wait_until(Duration::from_secs(1), || grades.load(Ordering::SeqCst) == 1).await);
    assert!(
        poller
            .seen_topics
            .lock()
            .iter()
            .all(|topics| topics.contains(&Topic::new("grades")))
    );
    assert!(transport.subscribed_topics().is_empty());

    transport.fail_connects(None);
    assert!(
        wait_until(Duration::from_secs(1), || client.state() == ConnectionState::Connected)
            .await
    );
    assert_eq!(transport.subscribed_topics(), vec![Topic::new("grades")]);
    assert!(client.subscription(&id).is_some_and(|s| s.is_wired()));

    let polls = poller.poll_count();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(poller.poll_count(), polls, "polling stopped after recovery");
    Ok(())
}

#[tokio::test]
async fn test_connect_while_polling_recovers_immediately() -> RealtimeResult<()> {
    let transport = FakeTransport::new();
    transport.fail_connects(Some(RealtimeError::connection_failed("unreachable")));
    let config = fast_config().polling_recovery_interval(Duration::from_secs(30));
    let client = RealtimeClient::new(config, transport.clone())?;

    let _ = client.connect().await;
    assert!(
        wait_until(Duration::from_secs(2), || client.state() == ConnectionState::Polling).await
    );

    let failed = client.connect().await;
    assert!(failed.is_err());
    assert_eq!(client.state(), ConnectionState::Polling, "failed recovery stays in polling");

    transport.fail_connects(None);
    client.connect().await?;
    assert_eq!(client.state(), ConnectionState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_fallback_notification_is_optional() -> RealtimeResult<()> {
    for notify in [false, true] {
        let transport = FakeTransport::new();
        transport.fail_connects(Some(RealtimeError::connection_failed("unreachable")));
        let store = Arc::new(MemoryStore::default());
        let client = RealtimeClient::builder(transport.clone())
            .config(fast_config().notify_on_fallback(notify))
            .store(store.clone())
            .build()?;

        let _ = client.connect().await;
        assert!(
            wait_until(Duration::from_secs(2), || store.connection_state()
                == ConnectionState::Polling)
            .await
        );

        let info = store
            .notifications()
            .iter()
            .filter(|n| n.severity == Severity::Info)
            .count();
        assert_eq!(info, usize::from(notify));
        client.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_disconnect_leaves_polling() -> RealtimeResult<()> {
    let transport = FakeTransport::new();
    transport.fail_connects(Some(RealtimeError::connection_failed("unreachable")));
    let poller = FakePoller::new();
    let client = RealtimeClient::builder(transport.clone())
        .config(fast_config())
        .polling_source(poller.clone())
        .build()?;

    let _ = client.connect().await;
    assert!(
        wait_until(Duration::from_secs(2), || client.state() == ConnectionState::Polling).await
    );

    client.disconnect(None).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let polls = poller.poll_count();
    let connects = transport.connects();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(poller.poll_count(), polls);
    assert_eq!(transport.connects(), connects, "recovery attempts stopped");
    Ok(())
}
