use crate::core::{
    alert::{AlertSender, DeliveryOutcome},
    drop::TokenDrop,
    error::TrapError,
    hit::Hit,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;

fn hit_time(hit: &Hit) -> String {
    DateTime::<Utc>::from(hit.time)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}

/// Plain-text alert body shared by email and SMS.
fn render_body(drop: &TokenDrop, hit: &Hit) -> String {
    let mut body = format!(
        "Honeytoken triggered!\n\n\
        Token: {}\n\
        Memo: {}\n\
        Channel: {}\n\
        Source IP: {}\n\
        Time: {}\n",
        drop.token,
        drop.memo,
        hit.input_channel,
        hit.src_ip,
        hit_time(hit),
    );
    for (key, value) in &hit.additional_info {
        body.push_str(&format!("{}: {}\n", key, value));
    }
    body
}

/// Transient failures are logged through the shared error taxonomy but
/// never propagate: the caller only ever sees an outcome.
fn log_failure(channel: &str, token: &str, message: String) {
    let failure = TrapError::DeliveryFailure {
        channel: channel.to_string(),
        message,
    };
    error!("alert for {} not delivered: {}", token, failure);
}

fn outcome_from_status(channel: &str, token: &str, status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        info!("{} alert delivered for {}", channel, token);
        DeliveryOutcome::Sent
    } else if status.is_client_error() {
        warn!("{} rejected alert for {}: {}", channel, token, status);
        DeliveryOutcome::Ignored
    } else {
        log_failure(channel, token, status.to_string());
        DeliveryOutcome::Error
    }
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl EmailSender {
    pub fn new(relay: &str, from: &str) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay)
            .timeout(Some(Duration::from_secs(10)))
            .build();
        Self {
            transport,
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl AlertSender for EmailSender {
    async fn send_alert(&self, drop: &TokenDrop, hit: &Hit) -> DeliveryOutcome {
        let recipient = match drop.alert_email_recipient.as_deref() {
            Some(r) => r,
            None => return DeliveryOutcome::Ignored,
        };
        let to: Mailbox = match recipient.parse() {
            Ok(mbox) => mbox,
            Err(e) => {
                warn!("invalid alert address {:?} for {}: {}", recipient, drop.token, e);
                return DeliveryOutcome::Ignored;
            }
        };
        let from: Mailbox = match self.from.parse() {
            Ok(mbox) => mbox,
            Err(e) => {
                error!("configured sender address is invalid: {}", e);
                return DeliveryOutcome::Error;
            }
        };

        let message = match Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Honeytoken alert: {}", drop.memo))
            .body(render_body(drop, hit))
        {
            Ok(message) => message,
            Err(e) => {
                warn!("could not build alert mail for {}: {}", drop.token, e);
                return DeliveryOutcome::Ignored;
            }
        };

        match self.transport.send(message).await {
            Ok(_) => {
                info!("email alert delivered for {}", drop.token);
                DeliveryOutcome::Sent
            }
            Err(e) if e.is_permanent() => {
                warn!("smtp permanently rejected alert for {}: {}", drop.token, e);
                DeliveryOutcome::Ignored
            }
            Err(e) => {
                log_failure("email", drop.token.as_str(), e.to_string());
                DeliveryOutcome::Error
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

pub struct WebhookSender {
    http_client: Client,
}

impl WebhookSender {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self { http_client }
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSender for WebhookSender {
    async fn send_alert(&self, drop: &TokenDrop, hit: &Hit) -> DeliveryOutcome {
        let url = match drop.alert_webhook_url.as_deref() {
            Some(url) => url,
            None => return DeliveryOutcome::Ignored,
        };

        let response = self
            .http_client
            .post(url)
            .json(&json!({
                "token": drop.token.as_str(),
                "memo": drop.memo,
                "channel": hit.input_channel,
                "src_ip": hit.src_ip.to_string(),
                "time": hit_time(hit),
                "additional_info": hit.additional_info,
            }))
            .send()
            .await;

        match response {
            Ok(response) => {
                outcome_from_status("webhook", drop.token.as_str(), response.status())
            }
            Err(e) if e.is_builder() => {
                warn!("unusable webhook URL for {}: {}", drop.token, e);
                DeliveryOutcome::Ignored
            }
            Err(e) => {
                log_failure("webhook", drop.token.as_str(), e.to_string());
                DeliveryOutcome::Error
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SMS (HTTP gateway)
// ---------------------------------------------------------------------------

pub struct SmsSender {
    http_client: Client,
    gateway_url: String,
}

impl SmsSender {
    pub fn new(gateway_url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http_client,
            gateway_url: gateway_url.to_string(),
        }
    }
}

#[async_trait]
impl AlertSender for SmsSender {
    async fn send_alert(&self, drop: &TokenDrop, hit: &Hit) -> DeliveryOutcome {
        let number = match drop.alert_sms_number.as_deref() {
            Some(number) => number,
            None => return DeliveryOutcome::Ignored,
        };

        let message = format!(
            "Honeytoken {} triggered via {} from {} at {}",
            drop.token,
            hit.input_channel,
            hit.src_ip,
            hit_time(hit),
        );

        let response = self
            .http_client
            .post(&self.gateway_url)
            .json(&json!({
                "to": number,
                "message": message,
            }))
            .send()
            .await;

        match response {
            Ok(response) => outcome_from_status("sms", drop.token.as_str(), response.status()),
            Err(e) => {
                log_failure("sms", drop.token.as_str(), e.to_string());
                DeliveryOutcome::Error
            }
        }
    }
}
