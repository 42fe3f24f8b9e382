//! Outbound notifications (OTP codes, impersonation notices).
//!
//! Callers only ever `enqueue`; delivery happens on a background worker that
//! retries transient SMTP failures with exponential backoff. Messages the
//! server or the builder rejects outright are dropped on the first attempt.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::GatewayError;
use crate::config::SmtpConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Fire-and-forget delivery handle.
pub trait Notifier: Send + Sync {
    fn enqueue(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Bad address, unbuildable message or a permanent SMTP reply.
    #[error("message rejected: {0}")]
    Rejected(anyhow::Error),

    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

#[derive(Clone)]
pub struct SmtpEmailProvider {
    mailer: SmtpTransport,
    from_address: String,
}

impl SmtpEmailProvider {
    pub fn new(config: &SmtpConfig) -> Result<Self, anyhow::Error> {
        let mailer = if config.username.is_empty() {
            // Unauthenticated relay, e.g. a local mail catcher.
            SmtpTransport::builder_dangerous(&config.host)
                .port(config.port)
                .timeout(Some(Duration::from_secs(10)))
                .build()
        } else {
            SmtpTransport::starttls_relay(&config.host)?
                .credentials(Credentials::new(
                    config.username.clone(),
                    config.password.clone(),
                ))
                .port(config.port)
                .timeout(Some(Duration::from_secs(10)))
                .build()
        };

        tracing::info!(host = %config.host, port = config.port, "SMTP provider initialized");

        Ok(Self {
            mailer,
            from_address: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl EmailProvider for SmtpEmailProvider {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let reject = |e: &dyn std::fmt::Display| DeliveryError::Rejected(anyhow::anyhow!("{}", e));
        let email = Message::builder()
            .from(self.from_address.parse::<Mailbox>().map_err(|e| reject(&e))?)
            .to(notification.to.parse::<Mailbox>().map_err(|e| reject(&e))?)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| reject(&e))?;

        // SmtpTransport blocks; keep it off the async workers.
        let mailer = self.mailer.clone();
        match tokio::task::spawn_blocking(move || mailer.send(&email)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.is_permanent() => Err(DeliveryError::Rejected(e.into())),
            Ok(Err(e)) => Err(DeliveryError::Transport(e.into())),
            Err(e) => Err(DeliveryError::Transport(e.into())),
        }
    }
}

/// Channel-backed [`Notifier`] drained by [`NotificationQueue::spawn_worker`].
#[derive(Clone)]
pub struct NotificationQueue {
    sender: mpsc::Sender<Notification>,
}

pub struct NotificationReceiver(mpsc::Receiver<Notification>);

impl NotificationQueue {
    pub fn new(capacity: usize) -> (Self, NotificationReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, NotificationReceiver(receiver))
    }

    /// Deliver queued notifications until `shutdown` fires. Each message is
    /// retried for up to `max_retry` before it is dropped.
    pub fn spawn_worker(
        receiver: NotificationReceiver,
        provider: Arc<dyn EmailProvider>,
        max_retry: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let NotificationReceiver(mut receiver) = receiver;
        tokio::spawn(async move {
            tracing::info!("Notification worker started");
            loop {
                let notification = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(n) => n,
                        None => break,
                    },
                };
                deliver(provider.as_ref(), &notification, max_retry).await;
            }
            tracing::info!("Notification worker stopped");
        })
    }
}

async fn deliver(provider: &dyn EmailProvider, notification: &Notification, max_retry: Duration) {
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_elapsed_time: Some(max_retry),
        ..Default::default()
    };

    let result = retry(policy, || async move {
        provider.send(notification).await.map_err(|e| match e {
            DeliveryError::Rejected(_) => backoff::Error::permanent(e),
            DeliveryError::Transport(_) => {
                tracing::warn!(to = %notification.to, error = %e, "Notification delivery failed, retrying");
                backoff::Error::transient(e)
            }
        })
    })
    .await;

    match result {
        Ok(()) => tracing::info!(
            to = %notification.to,
            subject = %notification.subject,
            "Notification delivered"
        ),
        Err(e) => tracing::error!(
            to = %notification.to,
            error = %e,
            "Giving up on notification"
        ),
    }
}

impl Notifier for NotificationQueue {
    fn enqueue(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError> {
        self.sender
            .try_send(Notification {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            })
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("Notification queue: {}", e)))
    }
}

/// Keeps every enqueued notification in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_to(&self, to: &str) -> Option<Notification> {
        self.sent().into_iter().rev().find(|n| n.to == to)
    }
}

impl Notifier for RecordingNotifier {
    fn enqueue(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| GatewayError::Internal(anyhow::anyhow!("notifier lock poisoned")))?;
        sent.push(Notification {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
