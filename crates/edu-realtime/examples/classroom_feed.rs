//! Live classroom feed over the in-process loopback transport.
//!
//! Run with `cargo run --example classroom_feed`. Set `DEBUG_MODE=true` or
//! `RUST_LOG=edu_realtime=debug` to watch the connection layer work.

use std::{sync::Arc, time::Duration};

use edu_realtime::{
    InboundMessage, LoopbackTransport, MemoryStore, RealtimeClient, RealtimeConfig, SendOptions,
    StaticCredentials, SubscribeOptions, TopicHandler, init_tracing,
};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RealtimeConfig::from_env()?
        .reconnect_base_delay(Duration::from_millis(200))
        .reconnect_settle_delay(Duration::from_millis(50));
    init_tracing(&config);

    let transport = Arc::new(LoopbackTransport::requiring_token("student-42"));
    let credentials = Arc::new(StaticCredentials::new(Some("student-42".into())));
    let store = Arc::new(MemoryStore::from_config(&config));

    let client = RealtimeClient::builder(transport.clone())
        .config(config)
        .credentials(credentials.clone())
        .store(store.clone())
        .build()?;

    let _states = client.on_state_change(|t| info!(from = %t.from, to = %t.to, "State changed"));
    let _errors = client.on_error(|e| info!(error = %e, "Connection error"));

    client.connect().await?;

    client
        .subscribe(
            "course.101.announcements",
            vec![TopicHandler::any(|msg| {
                info!(payload = %msg.payload(), "Announcement");
                Ok(())
            })],
            SubscribeOptions::persistent(),
        )
        .await?;
    client
        .subscribe(
            "course.101.quiz",
            vec![
                TopicHandler::new("answer", |msg| {
                    info!(choice = %msg.payload()["choice"], "Answer received");
                    Ok(())
                })
                .with_filter(|msg| msg.payload().get("choice").is_some()),
            ],
            SubscribeOptions::default(),
        )
        .await?;

    let ack = client
        .send(
            "answer",
            json!({"question": 1, "choice": "c"}),
            SendOptions::new()
                .topic("course.101.quiz")
                .await_ack(true),
        )
        .await?;
    info!(acknowledged = ack.is_some(), "Quiz answer submitted");

    transport.inject(InboundMessage::notification(
        "warning",
        "Quiz closes in 5 minutes",
    ));
    transport.inject(
        InboundMessage::event("posted", None, json!({"text": "Slides are online"}))
            .with_topic("course.101.announcements"),
    );

    // Credential rotation is swapped into the live connection.
    credentials.expire();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A server restart: the quiz subscription goes, announcements come back.
    transport.drop_connection("server restart");
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!(
        state = %client.state(),
        topics = ?client.list_active_topics(),
        "After reconnect"
    );

    for notification in store.notifications() {
        info!(
            severity = ?notification.severity,
            message = %notification.message,
            "Notification"
        );
    }
    info!(stats = ?client.stats(), "Session stats");

    client.shutdown().await;
    Ok(())
}
