//! Periodic liveness probing of online sessions

use log::debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::session::SessionRegistry;

/// Probe every `every` until the task is aborted. The first probe happens
/// one full period after start.
pub fn spawn(sessions: Arc<SessionRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let departed = sessions.probe().await;
            if !departed.is_empty() {
                debug!("heartbeat: {} session(s) went offline", departed.len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::shared_writer;
    use crate::session::tests::{drain, peer, BrokenWriter};

    #[tokio::test]
    async fn test_heartbeat_pings_and_demotes() {
        let sessions = Arc::new(SessionRegistry::new());
        let (_alice, mut alice_rx) = peer(&sessions, "alice").await;
        let ghost = sessions
            .create("ghost", "/tmp", None, shared_writer(BrokenWriter))
            .await;

        let handle = spawn(Arc::clone(&sessions), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        assert!(!sessions.get(&ghost.id).await.unwrap().online);
        let seen = drain(&mut alice_rx).await;
        assert!(seen.contains("PING\n"));
        assert_eq!(seen.matches("User ghost is now offline").count(), 1);
    }

    #[tokio::test]
    async fn test_no_probe_before_first_period() {
        let sessions = Arc::new(SessionRegistry::new());
        let (_alice, mut alice_rx) = peer(&sessions, "alice").await;
        let handle = spawn(Arc::clone(&sessions), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        assert_eq!(drain(&mut alice_rx).await, "");
    }
}
