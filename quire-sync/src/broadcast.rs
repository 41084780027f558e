//! Per-document rooms with fan-out to every subscribed connection.
//!
//! One tokio broadcast channel per room: a send is O(1) regardless of the
//! number of subscribers, and each receiver buffers up to `capacity` events.
//! Receivers that fall further behind observe `Lagged` and must resync with
//! `RequestDiff`.

use quire_core::{DocumentId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// A pre-encoded frame plus the connection it came from.
///
/// Forwarders skip events whose origin is their own connection, so a sender
/// never receives its own delta back.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub connection_id: Uuid,
    pub user_id: UserId,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomEvent>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<RoomEvent> {
        let mut peers = self.peers.write().await;
        peers.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode once and send to every subscriber, the origin included.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(RoomEvent { origin, frame }))
    }

    /// Send an already encoded event. Returns the number of receivers.
    pub fn broadcast_raw(&self, event: RoomEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Maps document ids to their rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get(&self, document_id: &DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Join a room, creating it if needed.
    ///
    /// Runs under the map's write lock so it cannot interleave with
    /// [`unsubscribe`](Self::unsubscribe) dropping the same room.
    pub async fn subscribe(
        &self,
        document_id: &DocumentId,
        info: PeerInfo,
    ) -> broadcast::Receiver<RoomEvent> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)));
        room.add_peer(info).await
    }

    /// Leave a room and drop it if it became empty. Returns whether the
    /// room was removed.
    pub async fn unsubscribe(&self, document_id: &DocumentId, connection_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(document_id) else {
            return false;
        };
        room.remove_peer(connection_id).await;
        if room.peer_count().await == 0 {
            rooms.remove(document_id);
            return true;
        }
        false
    }

    /// Broadcast an applied delta to the document's room, if anyone is in it.
    pub async fn relay_update(
        &self,
        origin: Uuid,
        document_id: &DocumentId,
        seq: u64,
        delta: Vec<u8>,
    ) -> Result<usize, ProtocolError> {
        match self.get(document_id).await {
            Some(room) => room.broadcast(origin, &SyncMessage::update(document_id, seq, delta)),
            None => Ok(0),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo {
            connection_id: Uuid::new_v4(),
            user_id: UserId::new(name),
        }
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");
        let id = alice.connection_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);

        assert_eq!(group.remove_peer(&id).await.unwrap().user_id, UserId::new("alice"));
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_tags_origin() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");
        let bob = peer("bob");
        let mut rx_alice = group.add_peer(alice.clone()).await;
        let mut rx_bob = group.add_peer(bob).await;

        let doc = DocumentId::new("ep-1");
        let msg = SyncMessage::update(&doc, 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(alice.connection_id, &msg).unwrap(), 2);

        // Both receive it; filtering out the origin is the forwarder's job.
        let seen_by_alice = rx_alice.recv().await.unwrap();
        let seen_by_bob = rx_bob.recv().await.unwrap();
        assert_eq!(seen_by_alice.origin, alice.connection_id);
        assert_eq!(SyncMessage::decode(&seen_by_bob.frame).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_lagging_receiver_observes_lag() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(peer("slow")).await;
        for _ in 0..5 {
            group.broadcast_raw(RoomEvent {
                origin: Uuid::nil(),
                frame: Arc::new(vec![0]),
            });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_room_manager_isolates_documents() {
        let manager = RoomManager::new(16);
        let ep1 = DocumentId::new("ep-1");
        let ep2 = DocumentId::new("ep-2");

        let _rx_a = manager.subscribe(&ep1, peer("alice")).await;
        let _rx_b = manager.subscribe(&ep1, peer("bob")).await;
        let _rx_c = manager.subscribe(&ep2, peer("carol")).await;
        assert_eq!(manager.room_count().await, 2);
        let room1 = manager.get(&ep1).await.unwrap();
        let room2 = manager.get(&ep2).await.unwrap();
        assert!(!Arc::ptr_eq(&room1, &room2));
        assert_eq!(room1.peer_count().await, 2);
        assert_eq!(room2.peer_count().await, 1);
        assert!(manager.get(&DocumentId::new("ep-3")).await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_manage_room_lifetime() {
        let manager = RoomManager::new(16);
        let doc = DocumentId::new("ep-1");
        let alice = peer("alice");
        let bob = peer("bob");

        let _rx_a = manager.subscribe(&doc, alice.clone()).await;
        let mut rx_b = manager.subscribe(&doc, bob.clone()).await;
        assert_eq!(manager.get(&doc).await.unwrap().peer_count().await, 2);

        let sent = manager
            .relay_update(alice.connection_id, &doc, 3, vec![9])
            .await
            .unwrap();
        assert_eq!(sent, 2);
        let event = rx_b.recv().await.unwrap();
        let msg = SyncMessage::decode(&event.frame).unwrap();
        assert_eq!((msg.msg_type, msg.seq), (crate::protocol::MessageType::Update, 3));

        assert!(!manager.unsubscribe(&doc, &alice.connection_id).await);
        assert!(manager.unsubscribe(&doc, &bob.connection_id).await);
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(manager.relay_update(Uuid::nil(), &doc, 4, vec![]).await.unwrap(), 0);
    }
}
