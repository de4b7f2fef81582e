use crate::core::{
    alert::{AlertSender, DeliveryOutcome},
    drop::{AlertChannelKind, DropRepository, TokenDrop},
    error::{TrapError, TrapResult},
    hit::Hit,
};
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Hits closer together than this only alert once.
const BURST_WINDOW: Duration = Duration::from_secs(1);

/// The central dispatcher: validates the reporting listener, records the
/// hit, consults the alert gate, then fans out to every enabled output
/// channel with per-channel failure isolation.
pub struct Switchboard {
    repo: Arc<dyn DropRepository>,
    email: Arc<dyn AlertSender>,
    webhook: Arc<dyn AlertSender>,
    sms: Arc<dyn AlertSender>,
    input_channels: HashSet<String>,
    failure_threshold: u32,
    send_timeout: Duration,
}

impl Switchboard {
    pub fn new(
        repo: Arc<dyn DropRepository>,
        email: Arc<dyn AlertSender>,
        webhook: Arc<dyn AlertSender>,
        sms: Arc<dyn AlertSender>,
        failure_threshold: u32,
        send_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            email,
            webhook,
            sms,
            input_channels: HashSet::new(),
            failure_threshold,
            send_timeout,
        }
    }

    /// Listeners register their channel name at construction; a hit from an
    /// unregistered name is a programming error and surfaces hard.
    pub fn register_input_channel(&mut self, name: &str) {
        self.input_channels.insert(name.to_string());
    }

    pub fn repository(&self) -> Arc<dyn DropRepository> {
        Arc::clone(&self.repo)
    }

    /// Records the hit unconditionally, then notifies if the gate allows.
    /// Returns the per-channel outcomes of any delivery attempts made.
    pub async fn dispatch(
        &self,
        hit: Hit,
    ) -> TrapResult<Vec<(AlertChannelKind, DeliveryOutcome)>> {
        if !self.input_channels.contains(&hit.input_channel) {
            error!(
                "hit for {} arrived on unregistered channel {:?}",
                hit.token, hit.input_channel
            );
            return Err(TrapError::InvalidChannel(hit.input_channel));
        }

        let drop = self
            .repo
            .get(&hit.token)
            .await?
            .ok_or_else(|| TrapError::UnknownDrop(hit.token.to_string()))?;

        // Recording happens independent of alertability.
        let hit = self.repo.record_hit(hit).await?;

        if !self.alertable(&drop).await? {
            info!("alert quota reached for {}, hit recorded silently", drop.token);
            return Ok(Vec::new());
        }
        if !self.can_notify_again(&drop).await? {
            info!("burst-suppressed repeat hit for {}", drop.token);
            return Ok(Vec::new());
        }

        self.repo
            .increment_accounting(&drop.token, drop.alert_expiry())
            .await?;

        let channels = drop.enabled_channels();
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        // Fan out concurrently; a slow or failing channel never touches the
        // others.
        let mut tasks = Vec::with_capacity(channels.len());
        for channel in channels {
            let sender = self.sender_for(channel);
            let drop = drop.clone();
            let hit = hit.clone();
            let timeout = self.send_timeout;
            tasks.push(tokio::spawn(async move {
                let outcome = match tokio::time::timeout(timeout, sender.send_alert(&drop, &hit))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("{} delivery for {} timed out", channel, drop.token);
                        DeliveryOutcome::Error
                    }
                };
                (channel, outcome)
            }));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok((channel, outcome)) => {
                    self.settle(&drop, channel, outcome).await;
                    outcomes.push((channel, outcome));
                }
                Err(e) => error!("delivery task for {} panicked: {}", drop.token, e),
            }
        }
        Ok(outcomes)
    }

    /// Quota gate: false once the rolling counter has reached the drop's
    /// limit. Advisory only; never blocks hit recording.
    async fn alertable(&self, drop: &TokenDrop) -> TrapResult<bool> {
        let count = self
            .repo
            .accounting_count(&drop.token, drop.alert_expiry())
            .await?;
        Ok(count < drop.alert_limit)
    }

    /// Burst suppression: the two most recent hits within one second mean a
    /// scanner is hammering the token; only the first notifies.
    async fn can_notify_again(&self, drop: &TokenDrop) -> TrapResult<bool> {
        let hits = self.repo.hits(&drop.token).await?;
        if hits.len() < 2 {
            return Ok(true);
        }
        let newest = hits[hits.len() - 1].time;
        let previous = hits[hits.len() - 2].time;
        match newest.duration_since(previous) {
            Ok(gap) => Ok(gap >= BURST_WINDOW),
            // Clock went backwards between hits; treat as a burst.
            Err(_) => Ok(false),
        }
    }

    fn sender_for(&self, channel: AlertChannelKind) -> Arc<dyn AlertSender> {
        match channel {
            AlertChannelKind::Email => Arc::clone(&self.email),
            AlertChannelKind::Webhook => Arc::clone(&self.webhook),
            AlertChannelKind::Sms => Arc::clone(&self.sms),
        }
    }

    /// Feeds one delivery outcome back into the channel's circuit-breaker
    /// state. Failures here are logged, never propagated.
    async fn settle(&self, drop: &TokenDrop, channel: AlertChannelKind, outcome: DeliveryOutcome) {
        let result = match outcome {
            DeliveryOutcome::Sent => {
                info!("{} alert sent for {}", channel, drop.token);
                self.repo.clear_delivery_failures(&drop.token, channel).await
            }
            DeliveryOutcome::Ignored => {
                warn!(
                    "{} rejected the recipient for {}, disabling channel",
                    channel, drop.token
                );
                self.repo.disable_channel(&drop.token, channel).await
            }
            DeliveryOutcome::Error => match self
                .repo
                .record_delivery_failure(&drop.token, channel)
                .await
            {
                Ok(failures) if failures >= self.failure_threshold => {
                    warn!(
                        "{} failed {} times in a row for {}, disabling channel",
                        channel, failures, drop.token
                    );
                    self.repo.disable_channel(&drop.token, channel).await
                }
                Ok(failures) => {
                    warn!(
                        "{} delivery failed for {} ({}/{})",
                        channel, drop.token, failures, self.failure_threshold
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            error!("failed to update {} channel state for {}: {}", channel, drop.token, e);
        }
    }
}
