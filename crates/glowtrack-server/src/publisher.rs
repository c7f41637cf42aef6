//! Frame output: the [`FramePublisher`] seam and an in-process broadcast
//! implementation.
//!
//! [`BroadcastPublisher`] uses a [`tokio::sync::broadcast`] channel so every
//! subscriber (network encoder, recorder, debug UI) receives every frame
//! without a slow subscriber blocking the tracking loop.

use glowtrack_types::{ControllerFrame, TrackingError};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (frames buffered before slow subscribers start
/// lagging).
pub const DEFAULT_CAPACITY: usize = 256;

/// Destination for per-controller frames.
pub trait FramePublisher: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TrackingError::Publish`] when the frame cannot be handed on.
    fn publish(&self, frame: ControllerFrame) -> Result<(), TrackingError>;
}

/// Publisher backed by a broadcast channel.  Clone it cheaply; all clones
/// share the channel.
#[derive(Clone, Debug)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ControllerFrame>,
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerFrame> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl FramePublisher for BroadcastPublisher {
    /// Publishing with nobody listening is not an error; the frame is simply
    /// dropped.
    fn publish(&self, frame: ControllerFrame) -> Result<(), TrackingError> {
        let controller_id = frame.controller_id;
        match self.sender.send(frame) {
            Ok(receivers) => trace!(controller_id, receivers, "Frame published"),
            Err(broadcast::error::SendError(_)) => {
                trace!(controller_id, "Frame dropped; no subscribers")
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use glowtrack_types::{ControllerKind, Physics, Pose};

    fn frame(controller_id: usize) -> ControllerFrame {
        ControllerFrame {
            controller_id,
            kind: ControllerKind::Move,
            sequence_num: 1,
            timestamp: Utc::now(),
            pose: Pose::identity(),
            physics: Physics::default(),
            is_orientation_valid: false,
            is_position_valid: false,
            is_tracking_enabled: false,
            is_currently_tracking: false,
            tracking_color: None,
            led_override_active: false,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_frame() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        publisher.publish(frame(3)).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.controller_id, 3);
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_frame() {
        let publisher = BroadcastPublisher::default();
        let mut a = publisher.subscribe();
        let mut b = publisher.clone().subscribe();
        assert_eq!(publisher.subscriber_count(), 2);
        publisher.publish(frame(0)).unwrap();
        publisher.publish(frame(1)).unwrap();
        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().controller_id, 0);
            assert_eq!(rx.recv().await.unwrap().controller_id, 1);
        }
    }

    #[test]
    fn publishing_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::new(1);
        assert!(publisher.publish(frame(0)).is_ok());
    }
}
