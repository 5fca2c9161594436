//! message-fanout: deliver an addressed notification to live connections.

use super::{HandlerContext, HandlerError, HandlerOutcome};
use crate::event::ClientNotification;
use tracing::trace;

const NAME: &str = "message-fanout";

/// Hand `raw` to every live connection of the addressed user.
///
/// `raw` is the payload exactly as stored, so clients receive the bytes the
/// producer wrote. Notifications without a `user` are dropped.
pub async fn handle(
    ctx: &HandlerContext,
    notification: &ClientNotification,
    raw: &[u8],
) -> Result<HandlerOutcome, HandlerError> {
    let Some(user) = notification.user.as_deref() else {
        trace!(cmd = %notification.cmd, "Unaddressed notification dropped");
        return Ok(HandlerOutcome::success(NAME, "unaddressed, dropped"));
    };

    let delivered = ctx.multiplexer.publish(user, raw).await;
    Ok(HandlerOutcome::success(
        NAME,
        format!("delivered to {} connections of {}", delivered, user),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::fixture;
    use crate::multiplexer::Multiplexer;

    #[tokio::test]
    async fn test_unaddressed_never_reaches_multiplexer() {
        let f = fixture();
        let (tx, mut rx) = Multiplexer::channel();
        f.ctx.multiplexer.register("u", tx).await;

        let notification = ClientNotification::new("ping");
        let raw = serde_json::to_vec(&notification).unwrap();
        handle(&f.ctx, &notification, &raw).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_addressed_reaches_only_that_user() {
        let f = fixture();
        let (tx_a, mut rx_a) = Multiplexer::channel();
        let (tx_b, mut rx_b) = Multiplexer::channel();
        let (tx_other, mut rx_other) = Multiplexer::channel();
        f.ctx.multiplexer.register("u", tx_a).await;
        f.ctx.multiplexer.register("u", tx_b).await;
        f.ctx.multiplexer.register("other", tx_other).await;

        let notification = ClientNotification::new("ping").for_user("u");
        let raw = br#"{"cmd":"ping","user":"u"}"#;
        handle(&f.ctx, &notification, raw).await.unwrap();

        let mut expected = raw.to_vec();
        expected.push(0);
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert_eq!(rx_b.try_recv().unwrap(), expected);
        assert!(rx_other.try_recv().is_err());
    }
}
