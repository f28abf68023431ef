use std::sync::Arc;

use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{BasicPublishArguments, ExchangeDeclareArguments},
    connection::{Connection, OpenConnectionArguments},
    BasicProperties,
};
use chrono::NaiveDateTime;
use log::{error, info, warn};
use serde::Serialize;

use crate::config::Config;
use crate::models::{GameMaster, GameTable, Recipient, RegistrationState};
use crate::registration::{CancellationOutcome, Participant, RegistrationOutcome};
use crate::settings::SettingsReader;

type SinkError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RegistrationReceived,
    RegistrationCancelled,
    PromotedFromWaitingList,
}

impl NotificationKind {
    pub fn routing_key(&self) -> &'static str {
        match self {
            NotificationKind::RegistrationReceived => "registration.received",
            NotificationKind::RegistrationCancelled => "registration.cancelled",
            NotificationKind::PromotedFromWaitingList => "registration.promoted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Registrant,
    GameMaster,
}

/// Message published for the mailer; one per recipient.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub audience: Audience,
    pub recipient: Recipient,
    pub registration_id: i32,
    pub registration_state: RegistrationState,
    pub table_id: i32,
    pub table_title: String,
    pub starts_at: NaiveDateTime,
    /// Lets the mailer build the guest's cancellation link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_token: Option<String>,
}

impl Notification {
    fn to_registrant(kind: NotificationKind, table: &GameTable, participant: &Participant) -> Option<Notification> {
        let recipient = participant.recipient.clone()?;
        let registration = &participant.registration;
        Some(Notification {
            kind,
            audience: Audience::Registrant,
            recipient,
            registration_id: registration.id,
            registration_state: registration.state,
            table_id: table.id,
            table_title: table.title.clone(),
            starts_at: table.starts_at,
            cancellation_token: match kind {
                NotificationKind::RegistrationCancelled => None,
                _ => registration.cancellation_token.clone(),
            },
        })
    }

    fn to_game_master(
        kind: NotificationKind,
        table: &GameTable,
        game_master: &GameMaster,
        participant: &Participant,
    ) -> Option<Notification> {
        let email = game_master.email.clone()?;
        Some(Notification {
            kind,
            audience: Audience::GameMaster,
            recipient: Recipient {
                name: game_master.name.clone(),
                email,
            },
            registration_id: participant.registration.id,
            registration_state: participant.registration.state,
            table_id: table.id,
            table_title: table.title.clone(),
            starts_at: table.starts_at,
            cancellation_token: None,
        })
    }
}

pub fn for_registration(outcome: &RegistrationOutcome, settings: &SettingsReader) -> Vec<Notification> {
    if !settings.is_notify_on_registration_enabled() {
        return Vec::new();
    }

    let kind = NotificationKind::RegistrationReceived;
    let mut notifications: Vec<Notification> =
        Notification::to_registrant(kind, &outcome.table, &outcome.registrant).into_iter().collect();

    if let Some(gm) = outcome.game_master.as_ref().filter(|gm| gm.notify_on_registration) {
        notifications.extend(Notification::to_game_master(kind, &outcome.table, gm, &outcome.registrant));
    }
    notifications
}

pub fn for_cancellation(outcome: &CancellationOutcome, settings: &SettingsReader) -> Vec<Notification> {
    let mut notifications = Vec::new();

    if settings.is_notify_on_cancellation_enabled() {
        let kind = NotificationKind::RegistrationCancelled;
        notifications.extend(Notification::to_registrant(kind, &outcome.table, &outcome.cancelled));
        if let Some(gm) = outcome.game_master.as_ref().filter(|gm| gm.notify_on_cancellation) {
            notifications.extend(Notification::to_game_master(kind, &outcome.table, gm, &outcome.cancelled));
        }
    }

    if settings.is_notify_waiting_list_promotion_enabled() {
        notifications.extend(outcome.promoted.iter().filter_map(|promoted| {
            Notification::to_registrant(NotificationKind::PromotedFromWaitingList, &outcome.table, promoted)
        }));
    }

    notifications
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Publishes notifications to a durable direct exchange, routed by kind.
pub struct AmqpSink {
    connection: Connection,
    exchange: String,
}

impl AmqpSink {
    pub async fn connect(config: &Config, host: &str) -> Result<AmqpSink, SinkError> {
        info!("Connecting to RabbitMQ at {}:{}", host, config.amqp_port);

        let connection = Connection::open(&OpenConnectionArguments::new(
            host,
            config.amqp_port,
            &config.amqp_username,
            &config.amqp_password,
        ))
        .await?;
        connection.register_callback(DefaultConnectionCallback).await?;

        let setup_channel = connection.open_channel(None).await?;
        setup_channel.register_callback(DefaultChannelCallback).await?;
        setup_channel
            .exchange_declare(
                ExchangeDeclareArguments::new(&config.notification_exchange, "direct")
                    .durable(true)
                    .finish(),
            )
            .await?;
        let _ = setup_channel.close().await;

        info!("Declared notification exchange '{}'", config.notification_exchange);

        Ok(AmqpSink {
            connection,
            exchange: config.notification_exchange.clone(),
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for AmqpSink {
    async fn publish(&self, notification: &Notification) -> Result<(), SinkError> {
        let channel = self.connection.open_channel(None).await?;
        channel.register_callback(DefaultChannelCallback).await?;

        let content = serde_json::to_vec(notification)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json")
            .with_delivery_mode(2) // persistent
            .finish();

        channel
            .basic_publish(
                properties,
                content,
                BasicPublishArguments::new(&self.exchange, notification.kind.routing_key()),
            )
            .await?;
        let _ = channel.close().await;

        Ok(())
    }
}

/// Used when no broker is configured.
pub struct LogSink;

#[async_trait::async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, notification: &Notification) -> Result<(), SinkError> {
        info!(
            "notification {} for {} ({:?}) on table {}",
            notification.kind.routing_key(),
            notification.recipient.email,
            notification.audience,
            notification.table_id
        );
        Ok(())
    }
}

/// Delivers notifications off the request path with bounded retry.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    max_attempts: u32,
    base_delay_ms: u64,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            max_attempts: 3,
            base_delay_ms: 25,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Returns how many notifications were published. Failures are logged, never returned.
    pub async fn deliver(&self, notifications: Vec<Notification>) -> usize {
        let mut delivered = 0;
        for notification in &notifications {
            if self.deliver_one(notification).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver_one(&self, notification: &Notification) -> bool {
        let mut delay_ms = self.base_delay_ms;

        for attempt in 1..=self.max_attempts {
            match self.sink.publish(notification).await {
                Ok(()) => return true,
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "Publishing {} failed (attempt {}/{}), retrying: {:?}",
                        notification.kind.routing_key(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                Err(e) => {
                    error!(
                        "Publishing {} for registration {} failed after {} attempts, giving up: {:?}",
                        notification.kind.routing_key(),
                        notification.registration_id,
                        self.max_attempts,
                        e
                    );
                }
            }
        }
        false
    }

    pub fn spawn(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.deliver(notifications).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::config::NotificationDefaults;
    use crate::registration::testing::{guest, now, table, MemoryStore};
    use crate::registration::{cancel_by_token, register_guest};
    use crate::settings::{ModuleSettings, Toggle};

    fn disabled(toggle: Toggle) -> SettingsReader {
        SettingsReader::new(
            std::iter::once((toggle.override_key(), "false".to_string())).collect::<ModuleSettings>(),
            NotificationDefaults::default(),
        )
    }

    fn full_table_with_queue() -> (MemoryStore, String) {
        let mut store = MemoryStore::with_table(table(1, 1));
        let first = register_guest(&mut store, 1, guest("Ana"), now()).unwrap();
        register_guest(&mut store, 1, guest("Bea"), now()).unwrap();
        let token = first.registrant.registration.cancellation_token.unwrap();
        (store, token)
    }

    #[test]
    fn registration_notifies_registrant_and_game_master() {
        let mut store = MemoryStore::with_table(table(1, 2));
        let outcome = register_guest(&mut store, 1, guest("Ana"), now()).unwrap();

        let notifications = for_registration(&outcome, &SettingsReader::default());

        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].audience, Audience::Registrant);
        assert_eq!(notifications[0].recipient.email, "ana@example.com");
        assert!(notifications[0].cancellation_token.is_some());
        assert_eq!(notifications[1].audience, Audience::GameMaster);
        assert_eq!(notifications[1].cancellation_token, None);
    }

    #[test]
    fn registration_toggle_silences_everyone() {
        let mut store = MemoryStore::with_table(table(1, 2));
        let outcome = register_guest(&mut store, 1, guest("Ana"), now()).unwrap();

        assert!(for_registration(&outcome, &disabled(Toggle::Registration)).is_empty());
    }

    #[test]
    fn cancellation_notifies_cancelled_and_promoted() {
        let (mut store, token) = full_table_with_queue();
        let outcome = cancel_by_token(&mut store, &token, now()).unwrap();

        let notifications = for_cancellation(&outcome, &SettingsReader::default());
        let kinds: Vec<_> = notifications.iter().map(|n| (n.kind, n.recipient.email.as_str())).collect();

        // The test game master opted out of cancellation mails.
        assert_eq!(
            kinds,
            vec![
                (NotificationKind::RegistrationCancelled, "ana@example.com"),
                (NotificationKind::PromotedFromWaitingList, "bea@example.com"),
            ]
        );
        assert_eq!(notifications[1].registration_state, RegistrationState::Confirmed);
    }

    #[test]
    fn promotion_toggle_is_independent() {
        let (mut store, token) = full_table_with_queue();
        let outcome = cancel_by_token(&mut store, &token, now()).unwrap();

        let without_promotion = for_cancellation(&outcome, &disabled(Toggle::WaitingListPromotion));
        assert_eq!(without_promotion.len(), 1);
        assert_eq!(without_promotion[0].kind, NotificationKind::RegistrationCancelled);

        let without_cancellation = for_cancellation(&outcome, &disabled(Toggle::Cancellation));
        assert_eq!(without_cancellation.len(), 1);
        assert_eq!(without_cancellation[0].kind, NotificationKind::PromotedFromWaitingList);
    }

    #[test]
    fn serializes_for_the_mailer() {
        let mut store = MemoryStore::with_table(table(1, 2));
        let outcome = register_guest(&mut store, 1, guest("Ana"), now()).unwrap();
        let notification = &for_registration(&outcome, &SettingsReader::default())[0];

        let json = serde_json::to_value(notification).unwrap();
        assert_eq!(json["kind"], "registration_received");
        assert_eq!(json["audience"], "registrant");
        assert_eq!(json["registration_state"], "confirmed");
        assert_eq!(json["table_id"], 1);
    }

    struct FlakySink {
        failures_left: AtomicUsize,
        published: Mutex<Vec<i32>>,
    }

    #[async_trait::async_trait]
    impl NotificationSink for FlakySink {
        async fn publish(&self, notification: &Notification) -> Result<(), SinkError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err("broker unavailable".into());
            }
            self.published.lock().unwrap().push(notification.registration_id);
            Ok(())
        }
    }

    fn sample() -> Vec<Notification> {
        let mut store = MemoryStore::with_table(table(1, 2));
        let outcome = register_guest(&mut store, 1, guest("Ana"), now()).unwrap();
        for_registration(&outcome, &SettingsReader::default())
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(1),
            published: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::new(sink.clone()).with_retry(3, 1);

        let delivered = notifier.deliver(sample()).await;

        assert_eq!(delivered, 2);
        assert_eq!(sink.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(10),
            published: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::new(sink.clone()).with_retry(2, 1);

        let delivered = notifier.deliver(sample()).await;

        assert_eq!(delivered, 0);
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 6);
    }
}
