use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{ReservationSnapshot, RoomId, Span, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// What subscribers of a room channel receive. Reservation creations carry
/// the full denormalized snapshot; cancellations carry enough to identify
/// the freed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ReservationCreated(ReservationSnapshot),
    ReservationCancelled {
        id: Ulid,
        room_id: RoomId,
        span: Span,
    },
    WaitlistAssigned {
        entry_id: Ulid,
        reservation_id: Ulid,
        user_id: UserId,
    },
}

/// Broadcast hub, one channel per room.
pub struct NotifyHub {
    channels: DashMap<RoomId, broadcast::Sender<Notice>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, room_id: RoomId, notice: &Notice) {
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Remove a channel (e.g. when a room is deleted).
    pub fn remove(&self, room_id: &RoomId) {
        self.channels.remove(room_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(7);

        let notice = Notice::ReservationCancelled {
            id: Ulid::new(),
            room_id: 7,
            span: Span::new(1000, 2000),
        };
        hub.send(7, &notice);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, notice);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(
            3,
            &Notice::WaitlistAssigned {
                entry_id: Ulid::new(),
                reservation_id: Ulid::new(),
                user_id: 1,
            },
        );
    }

    #[tokio::test]
    async fn channels_are_per_room() {
        let hub = NotifyHub::new();
        let mut rx_a = hub.subscribe(1);
        let _rx_b = hub.subscribe(2);

        let notice = Notice::ReservationCancelled {
            id: Ulid::new(),
            room_id: 1,
            span: Span::new(0, 100),
        };
        hub.send(1, &notice);

        assert_eq!(rx_a.recv().await.unwrap(), notice);
        // Room 2's channel saw nothing; try_recv on a fresh subscription
        let mut rx_b2 = hub.subscribe(2);
        assert!(rx_b2.try_recv().is_err());
    }
}
