//! Active user observer
//!
//! Follows a session's latest frame and keeps the last reported active user
//! count. Frames for other actions are skipped.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::session::ClientSession;
use crate::server::{Action, Frame, ServerStats};

/// Tracks the most recent `server_stats` value seen by a session
pub struct ActiveUsersTracker {
    rx: watch::Receiver<Option<usize>>,
    task: JoinHandle<()>,
}

impl ActiveUsersTracker {
    /// Start observing a session
    pub fn spawn(session: &ClientSession) -> Self {
        let frames = session.subscribe();
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(track(frames, tx));
        Self { rx, task }
    }

    /// Last reported count, if any has arrived
    pub fn active_users(&self) -> Option<usize> {
        *self.rx.borrow()
    }

    /// Receiver notified whenever the count changes
    pub fn subscribe(&self) -> watch::Receiver<Option<usize>> {
        self.rx.clone()
    }
}

impl Drop for ActiveUsersTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn track(mut frames: watch::Receiver<Option<Frame>>, tx: watch::Sender<Option<usize>>) {
    loop {
        let frame = frames.borrow_and_update().clone();
        if let Some(frame) = frame {
            apply(&frame, &tx);
        }
        if frames.changed().await.is_err() {
            debug!("Session mailbox dropped, stopping tracker");
            break;
        }
    }
}

fn apply(frame: &Frame, tx: &watch::Sender<Option<usize>>) {
    if !frame.is(Action::ServerStats) {
        return;
    }
    match ServerStats::from_frame(frame) {
        Ok(stats) => {
            tx.send_if_modified(|current| {
                let changed = *current != Some(stats.active_users);
                *current = Some(stats.active_users);
                changed
            });
        }
        Err(e) => warn!("Ignoring bad {} payload: {}", Action::ServerStats, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_updates_on_change_only() {
        let (tx, mut rx) = watch::channel(None);

        apply(&Frame::server_stats(ServerStats::new(3)), &tx);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(3));

        apply(&Frame::server_stats(ServerStats::new(3)), &tx);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_apply_skips_other_actions() {
        let (tx, rx) = watch::channel(None);
        let frame = Frame {
            action: "chat".to_string(),
            data: json!({ "active_users": 9 }),
        };
        apply(&frame, &tx);
        assert_eq!(*rx.borrow(), None);
    }

    #[test]
    fn test_apply_skips_bad_payload() {
        let (tx, rx) = watch::channel(Some(1));
        let frame = Frame {
            action: "server_stats".to_string(),
            data: json!({ "users": 9 }),
        };
        apply(&frame, &tx);
        assert_eq!(*rx.borrow(), Some(1));
    }
}
