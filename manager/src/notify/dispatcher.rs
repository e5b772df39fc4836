//! Asynchronous notification fan-out

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::schema::WebhooksConfig;
use crate::errors::with_timeout;
use crate::notify::events::{EventKind, NotificationEvent};
use crate::notify::providers::{providers_from_config, WebhookProvider};
use crate::notify::transport::WebhookTransport;

const DELIVERY_LOG_CAPACITY: usize = 256;

/// Outcome of delivering one event to one provider
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub event_id: Uuid,
    pub provider: String,
    pub kind: EventKind,
    pub attempts: u32,
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Bounded in-memory log of recent deliveries
#[derive(Debug, Clone)]
pub struct DeliveryLog {
    records: Arc<Mutex<VecDeque<DeliveryRecord>>>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, record: DeliveryRecord) {
        if let Ok(mut records) = self.records.lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<DeliveryRecord> {
        self.records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new(DELIVERY_LOG_CAPACITY)
    }
}

/// Producer handle. Publishing never blocks and never fails.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl Notifier {
    /// Notifier that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, event: NotificationEvent) {
        debug!("Publishing {} ({})", event.kind, event.id);
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("Dispatcher stopped, event dropped");
            }
        }
    }
}

/// Create a connected notifier and event queue
pub fn channel() -> (Notifier, mpsc::UnboundedReceiver<NotificationEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Notifier { tx: Some(tx) }, rx)
}

/// Global delivery settings
#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub enabled: bool,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl From<&WebhooksConfig> for DeliverySettings {
    fn from(config: &WebhooksConfig) -> Self {
        Self {
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout),
            retry_count: config.retry_count,
            retry_delay: Duration::from_secs(config.retry_delay),
        }
    }
}

/// Fans events out to every enabled, subscribed provider
#[derive(Clone)]
pub struct NotificationDispatcher {
    settings: DeliverySettings,
    providers: Arc<Vec<WebhookProvider>>,
    transport: Arc<dyn WebhookTransport>,
    log: DeliveryLog,
}

impl NotificationDispatcher {
    pub fn new(config: &WebhooksConfig, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            settings: DeliverySettings::from(config),
            providers: Arc::new(providers_from_config(config)),
            transport,
            log: DeliveryLog::default(),
        }
    }

    pub fn log(&self) -> DeliveryLog {
        self.log.clone()
    }

    pub fn settings(&self) -> DeliverySettings {
        self.settings
    }

    /// Enabled providers, optionally restricted to one name
    pub fn active_providers(&self, only: Option<&str>) -> Vec<&WebhookProvider> {
        if !self.settings.enabled {
            return Vec::new();
        }
        self.providers
            .iter()
            .filter(|p| p.enabled())
            .filter(|p| only.map_or(true, |name| p.name() == name))
            .collect()
    }

    fn targets(&self, kind: EventKind, only: Option<&str>) -> Vec<WebhookProvider> {
        self.active_providers(only)
            .into_iter()
            .filter(|p| p.subscribes(kind))
            .cloned()
            .collect()
    }

    /// Consume the queue until every notifier is dropped or shutdown is signalled,
    /// then drain what is queued and wait for in-flight deliveries.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<NotificationEvent>,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => self.fan_out(&mut in_flight, event),
                        None => break,
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = &mut shutdown_signal => {
                    info!("Notification dispatcher shutting down");
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        self.fan_out(&mut in_flight, event);
                    }
                    break;
                }
            }
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!("Delivery task failed: {}", e);
            }
        }
        debug!("Notification dispatcher stopped");
    }

    fn fan_out(&self, in_flight: &mut JoinSet<()>, event: NotificationEvent) {
        let targets = self.targets(event.kind, None);
        if targets.is_empty() {
            debug!("No provider subscribed to {}", event.kind);
            return;
        }

        let event = Arc::new(event);
        for provider in targets {
            let event = event.clone();
            let settings = self.settings;
            let transport = self.transport.clone();
            let log = self.log.clone();
            in_flight.spawn(async move {
                let record = deliver(&settings, &provider, transport.as_ref(), &event).await;
                log.push(record);
            });
        }
    }

    /// Deliver `event` inline and return one record per targeted provider
    pub async fn deliver_now(
        &self,
        event: &NotificationEvent,
        provider: Option<&str>,
    ) -> Vec<DeliveryRecord> {
        let mut records = Vec::new();
        for target in self.targets(event.kind, provider) {
            let record = deliver(&self.settings, &target, self.transport.as_ref(), event).await;
            self.log.push(record.clone());
            records.push(record);
        }
        records
    }
}

/// Up to `retry_count + 1` attempts with `retry_delay` between them
async fn deliver(
    settings: &DeliverySettings,
    provider: &WebhookProvider,
    transport: &dyn WebhookTransport,
    event: &NotificationEvent,
) -> DeliveryRecord {
    let body = provider.format(event);
    let headers = provider.headers();
    let timeout = provider
        .timeout()
        .map(Duration::from_secs)
        .unwrap_or(settings.timeout);
    let max_attempts = settings.retry_count + 1;

    let mut status = None;
    let mut last_error = None;
    let mut attempts = 0;

    while attempts < max_attempts {
        attempts += 1;

        let result = with_timeout(
            "webhook delivery",
            timeout,
            transport.post(provider.webhook_url(), &headers, &body, timeout),
        )
        .await;

        match result {
            Ok(code) if (200..300).contains(&code) => {
                info!("Notification {} sent via {}", event.kind, provider);
                return DeliveryRecord {
                    event_id: event.id,
                    provider: provider.name().to_string(),
                    kind: event.kind,
                    attempts,
                    success: true,
                    status: Some(code),
                    error: None,
                    finished_at: Utc::now(),
                };
            }
            Ok(code) => {
                status = Some(code);
                last_error = Some(format!("HTTP {}", code));
            }
            Err(e) => last_error = Some(e.to_string()),
        }

        warn!(
            "Attempt {}/{} to {} for {} failed: {}",
            attempts,
            max_attempts,
            provider,
            event.kind,
            last_error.as_deref().unwrap_or("unknown")
        );

        if attempts < max_attempts {
            tokio::time::sleep(settings.retry_delay).await;
        }
    }

    error!("Giving up on {} via {} after {} attempts", event.kind, provider, attempts);
    DeliveryRecord {
        event_id: event.id,
        provider: provider.name().to_string(),
        kind: event.kind,
        attempts,
        success: false,
        status,
        error: last_error,
        finished_at: Utc::now(),
    }
}
