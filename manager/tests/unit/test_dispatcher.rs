//! Notification dispatcher tests

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use runner_manager::config::schema::{GenericConfig, SlackConfig, WebhooksConfig};
use runner_manager::notify::dispatcher::{self, NotificationDispatcher};
use runner_manager::notify::events::{EventKind, NotificationEvent};

use crate::fakes::ScriptedTransport;

fn generic(events: Vec<EventKind>) -> GenericConfig {
    GenericConfig {
        enabled: true,
        webhook_url: "https://hooks.example.com/runners".to_string(),
        timeout: None,
        events,
        headers: BTreeMap::new(),
    }
}

fn webhooks(generic: GenericConfig) -> WebhooksConfig {
    WebhooksConfig {
        enabled: true,
        timeout: 10,
        retry_count: 3,
        retry_delay: 5,
        generic: Some(generic),
        ..Default::default()
    }
}

fn started() -> NotificationEvent {
    NotificationEvent::new(EventKind::RunnerStarted)
        .with("runner_id", "php83-1")
        .with("runner_name", "my-runner-php83-1")
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_success() {
    let transport = ScriptedTransport::new(vec![
        Err("connection reset".to_string()),
        Ok(500),
    ]);
    let dispatcher = NotificationDispatcher::new(
        &webhooks(generic(vec![EventKind::RunnerStarted])),
        transport.clone(),
    );

    let begin = Instant::now();
    let records = dispatcher.deliver_now(&started(), None).await;

    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].status, Some(200));
    assert_eq!(transport.call_count(), 3);
    // Two waits between three attempts
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_retry_count_plus_one() {
    let transport = ScriptedTransport::new(vec![Ok(502), Ok(502), Ok(502), Ok(502), Ok(502)]);
    let dispatcher = NotificationDispatcher::new(
        &webhooks(generic(vec![EventKind::RunnerStarted])),
        transport.clone(),
    );

    let begin = Instant::now();
    let records = dispatcher.deliver_now(&started(), None).await;

    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].attempts, 4);
    assert_eq!(records[0].error.as_deref(), Some("HTTP 502"));
    assert_eq!(transport.call_count(), 4);
    // No wait after the last attempt
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    assert_eq!(dispatcher.log().snapshot().len(), 1);
}

#[tokio::test]
async fn test_generic_envelope() {
    let transport = ScriptedTransport::new(Vec::new());
    let dispatcher = NotificationDispatcher::new(
        &webhooks(generic(vec![EventKind::RunnerStarted])),
        transport.clone(),
    );

    let event = started();
    dispatcher.deliver_now(&event, Some("generic")).await;

    let calls = transport.calls.lock().unwrap();
    let (url, body) = &calls[0];
    assert_eq!(url, "https://hooks.example.com/runners");
    assert_eq!(body["event"], "runner_started");
    assert_eq!(body["payload"]["runner_name"], "my-runner-php83-1");
    assert_eq!(
        body["timestamp"].as_str().unwrap(),
        event.timestamp.to_rfc3339()
    );
}

#[tokio::test]
async fn test_only_enabled_subscribed_providers_receive() {
    let transport = ScriptedTransport::new(Vec::new());
    let mut config = webhooks(generic(vec![EventKind::BuildFailed]));
    config.slack = Some(SlackConfig {
        enabled: false,
        webhook_url: "https://hooks.slack.com/services/T/B/X".to_string(),
        channel: String::new(),
        username: "GitHub Runner Manager".to_string(),
        timeout: None,
        events: vec![EventKind::RunnerStarted],
        templates: BTreeMap::new(),
    });
    let dispatcher = NotificationDispatcher::new(&config, transport.clone());

    assert!(dispatcher.deliver_now(&started(), None).await.is_empty());
    assert_eq!(transport.call_count(), 0);

    let records = dispatcher
        .deliver_now(&NotificationEvent::sample(EventKind::BuildFailed), None)
        .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].provider, "generic");

    config.enabled = false;
    let muted = NotificationDispatcher::new(&config, transport.clone());
    assert!(muted.active_providers(None).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_background_delivery_never_blocks_producers() {
    let transport = ScriptedTransport::new(vec![Ok(500), Ok(500)]);
    let dispatcher = NotificationDispatcher::new(
        &webhooks(generic(vec![EventKind::RunnerStarted, EventKind::RunnerStopped])),
        transport.clone(),
    );
    let log = dispatcher.log();
    let (notifier, rx) = dispatcher::channel();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(dispatcher.run(
        rx,
        Box::pin(async move {
            let _ = stop_rx.await;
        }),
    ));

    let begin = Instant::now();
    notifier.publish(started());
    notifier.publish(NotificationEvent::new(EventKind::RunnerStopped));
    notifier.publish(NotificationEvent::new(EventKind::UpdateError));
    assert_eq!(begin.elapsed(), Duration::ZERO);

    // Shutdown drains the queue and waits for in-flight deliveries
    stop_tx.send(()).unwrap();
    handle.await.unwrap();

    // update_error has no subscriber
    let records = log.snapshot();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.success));
    assert_eq!(transport.call_count(), 4);
}

#[tokio::test]
async fn test_dispatcher_stops_when_notifiers_are_dropped() {
    let transport = ScriptedTransport::new(Vec::new());
    let dispatcher = NotificationDispatcher::new(
        &webhooks(generic(vec![EventKind::RunnerRemoved])),
        transport.clone(),
    );
    let log = dispatcher.log();
    let (notifier, rx) = dispatcher::channel();

    notifier.publish(NotificationEvent::new(EventKind::RunnerRemoved));
    drop(notifier);

    dispatcher.run(rx, Box::pin(std::future::pending())).await;
    assert_eq!(log.snapshot().len(), 1);
    assert_eq!(transport.call_count(), 1);
}
