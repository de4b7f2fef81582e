use crate::core::drop::TokenDrop;
use crate::core::hit::Hit;

/// What happened to one delivery attempt.
///
/// `Ignored` means the provider rejected the recipient itself (bad address,
/// dead URL shape) and retrying is pointless; the channel is disabled on the
/// drop immediately. `Error` is a transient failure and only disables the
/// channel after the consecutive-failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Ignored,
    Error,
}

/// One notification transport. Implementations must map every internal
/// failure into an outcome; nothing propagates out of a delivery attempt.
#[async_trait::async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_alert(&self, drop: &TokenDrop, hit: &Hit) -> DeliveryOutcome;
}
