//! Latest-frame mailbox
//!
//! A single-slot cell holding the most recent inbound frame. Publishing always
//! overwrites the slot; a subscriber that has not looked at the previous frame
//! simply never sees it. There is no queue and no backpressure.

use tokio::sync::watch;

use crate::server::Frame;

/// Single-slot overwrite cell with change notification
#[derive(Debug)]
pub struct LatestFrame {
    tx: watch::Sender<Option<Frame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Store a frame, returning the one it replaced
    pub fn publish(&self, frame: Frame) -> Option<Frame> {
        self.tx.send_replace(Some(frame))
    }

    /// Copy of the current frame
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every publish
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.tx.subscribe()
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerStats;

    fn stats(n: usize) -> Frame {
        Frame::server_stats(ServerStats::new(n))
    }

    #[test]
    fn test_empty_until_published() {
        let mailbox = LatestFrame::new();
        assert!(mailbox.latest().is_none());
    }

    #[test]
    fn test_publish_overwrites() {
        let mailbox = LatestFrame::new();
        assert!(mailbox.publish(stats(1)).is_none());
        assert_eq!(mailbox.publish(stats(2)), Some(stats(1)));
        assert_eq!(mailbox.latest(), Some(stats(2)));
    }

    #[tokio::test]
    async fn test_unobserved_frame_is_overwritten() {
        let mailbox = LatestFrame::new();
        let mut rx = mailbox.subscribe();

        mailbox.publish(stats(1));
        mailbox.publish(stats(2));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(stats(2)));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_subscriber_notified() {
        let mailbox = LatestFrame::new();
        let mut rx = mailbox.subscribe();

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            rx.borrow_and_update().clone()
        });
        mailbox.publish(stats(5));

        assert_eq!(waiter.await.unwrap(), Some(stats(5)));
    }
}
