//! services/api/src/web/keepalive_task.rs
//!
//! The per-session ping worker. It is scoped to one session: it stops when the
//! session's read loop cancels its token, and it closes the session when a ping
//! can no longer be queued.

use crate::web::{protocol::Outbound, registry::SessionHandle};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub async fn keepalive_process(
    session: SessionHandle,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!(identity = %session.identity(), "Keep-alive stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = session.send(Outbound::Ping) {
                    warn!(identity = %session.identity(), "Keep-alive failed, closing session: {}", e);
                    session.close();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couple_chat_core::Identity;
    use uuid::Uuid;

    const EVERY: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn pings_on_every_interval() {
        let (session, mut rx) = SessionHandle::new(Identity::new(Uuid::new_v4()));
        let token = CancellationToken::new();
        let worker = tokio::spawn(keepalive_process(session, EVERY, token.clone()));

        tokio::time::sleep(EVERY / 2).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(EVERY * 2).await;
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        assert_eq!(rx.recv().await, Some(Outbound::Ping));

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_token_is_cancelled() {
        let (session, mut rx) = SessionHandle::new(Identity::new(Uuid::new_v4()));
        let token = CancellationToken::new();
        let worker = tokio::spawn(keepalive_process(session.clone(), EVERY, token.clone()));

        token.cancel();
        worker.await.unwrap();

        tokio::time::sleep(EVERY * 3).await;
        assert!(rx.try_recv().is_err());
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn closes_session_when_writer_is_gone() {
        let (session, rx) = SessionHandle::new(Identity::new(Uuid::new_v4()));
        drop(rx);
        let worker = tokio::spawn(keepalive_process(
            session.clone(),
            EVERY,
            CancellationToken::new(),
        ));

        tokio::time::sleep(EVERY + Duration::from_secs(1)).await;
        worker.await.unwrap();
        assert!(session.token().is_cancelled());
    }
}
