//! Signaling hub: registry of connected WebSocket clients, their bounded
//! outbound queues, the room -> clients index used for fan-out, and the
//! pub/sub bridge that carries room broadcasts across instances.

use std::sync::{Arc, RwLock as StdRwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::id_types::{ClientId, PeerId, RoomId, UserId};
use crate::messages::Envelope;
use crate::metrics::SFU_MESSAGES_SENT_TOTAL;
use crate::rate_limit::TokenBucket;
use crate::store::StateStore;

/// Frames queued towards one client's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFrame {
    Text(String),
    Close,
}

/// Per-connection state shared between the socket loops and the hub.
pub struct ClientHandle {
    pub id: ClientId,
    pub user_id: UserId,
    pub display_name: String,
    /// Set when the client joins a room.
    pub room_id: StdRwLock<Option<RoomId>>,
    /// The live peer this socket drives, once joined.
    pub peer_id: StdRwLock<Option<PeerId>>,
    pub session_id: StdRwLock<Option<String>>,
    pub bucket: TokenBucket,
    outbound: mpsc::Sender<HubFrame>,
    /// Signalled when the hub force-disconnects this client.
    pub closed: Notify,
}

impl ClientHandle {
    pub fn new(
        user_id: UserId,
        display_name: String,
        rate_per_sec: u32,
        burst: u32,
    ) -> (Arc<Self>, mpsc::Receiver<HubFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = Arc::new(ClientHandle {
            id: ClientId::generate(),
            user_id,
            display_name,
            room_id: StdRwLock::new(None),
            peer_id: StdRwLock::new(None),
            session_id: StdRwLock::new(None),
            bucket: TokenBucket::new(rate_per_sec, burst),
            outbound: tx,
            closed: Notify::new(),
        });
        (handle, rx)
    }

    pub fn current_room(&self) -> Option<RoomId> {
        self.room_id.read().unwrap().clone()
    }

    pub fn current_peer(&self) -> Option<PeerId> {
        self.peer_id.read().unwrap().clone()
    }

    pub fn current_session(&self) -> Option<String> {
        self.session_id.read().unwrap().clone()
    }
}

/// Payload bridged over the state store between instances.
#[derive(Debug, Serialize, Deserialize)]
struct BridgedBroadcast {
    instance_id: String,
    room_id: String,
    exclude_user_id: Option<String>,
    frame: String,
}

pub struct SignalingHub {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    by_user: DashMap<UserId, Vec<ClientId>>,
    by_room: DashMap<RoomId, Vec<ClientId>>,
    store: Arc<dyn StateStore>,
    pub instance_id: String,
}

impl SignalingHub {
    pub fn new(store: Arc<dyn StateStore>, instance_id: String) -> Arc<Self> {
        Arc::new(SignalingHub {
            clients: DashMap::new(),
            by_user: DashMap::new(),
            by_room: DashMap::new(),
            store,
            instance_id,
        })
    }

    pub fn register(&self, client: Arc<ClientHandle>) {
        self.by_user
            .entry(client.user_id.clone())
            .or_default()
            .push(client.id.clone());
        self.clients.insert(client.id.clone(), client);
    }

    pub fn unregister(&self, client_id: &ClientId) {
        let Some((_, client)) = self.clients.remove(client_id) else {
            return;
        };
        if let Some(mut ids) = self.by_user.get_mut(&client.user_id) {
            ids.retain(|id| id != client_id);
        }
        self.by_user.retain(|_, ids| !ids.is_empty());
        if let Some(room_id) = client.current_room() {
            if let Some(mut ids) = self.by_room.get_mut(&room_id) {
                ids.retain(|id| id != client_id);
            }
            self.by_room.retain(|_, ids| !ids.is_empty());
        }
        let _ = client.outbound.try_send(HubFrame::Close);
        client.closed.notify_waiters();
        debug!(client = %client_id, "Client unregistered");
    }

    /// Indexes a client under its room at join time.
    pub fn assign_room(&self, client_id: &ClientId, room_id: &RoomId) {
        if let Some(client) = self.clients.get(client_id) {
            *client.room_id.write().unwrap() = Some(room_id.clone());
            self.by_room
                .entry(room_id.clone())
                .or_default()
                .push(client_id.clone());
        }
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.get(client_id).map(|e| e.value().clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn all_client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Finds the connected client currently driving a peer.
    pub fn client_for_peer(&self, peer_id: &PeerId) -> Option<Arc<ClientHandle>> {
        self.clients
            .iter()
            .find(|e| e.value().current_peer().as_ref() == Some(peer_id))
            .map(|e| e.value().clone())
    }

    /// Non-blocking send. A client that cannot drain its queue is
    /// disconnected rather than allowed to stall the sender.
    pub fn send_to_client(&self, client_id: &ClientId, envelope: &Envelope) -> bool {
        let Some(client) = self.clients.get(client_id).map(|e| e.value().clone()) else {
            return false;
        };
        match client.outbound.try_send(HubFrame::Text(envelope.to_text())) {
            Ok(()) => {
                SFU_MESSAGES_SENT_TOTAL.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client = %client_id, "Write queue full, disconnecting client");
                self.unregister(client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(client_id);
                false
            }
        }
    }

    /// O(R) local fan-out to every client in the room.
    pub fn broadcast_room(
        &self,
        room_id: &RoomId,
        envelope: &Envelope,
        exclude: Option<&ClientId>,
    ) {
        let targets: Vec<ClientId> = self
            .by_room
            .get(room_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for client_id in targets {
            if Some(&client_id) == exclude {
                continue;
            }
            self.send_to_client(&client_id, envelope);
        }
    }

    /// Room broadcast including peers homed on other instances: local
    /// fan-out plus a publish on the room's pub/sub channel.
    pub async fn broadcast_room_all(
        &self,
        room_id: &RoomId,
        envelope: &Envelope,
        exclude: Option<&ClientId>,
    ) {
        self.broadcast_room(room_id, envelope, exclude);

        let bridged = BridgedBroadcast {
            instance_id: self.instance_id.clone(),
            room_id: room_id.to_string(),
            exclude_user_id: exclude
                .and_then(|id| self.get(id))
                .map(|c| c.user_id.to_string()),
            frame: envelope.to_text(),
        };
        if let Ok(payload) = serde_json::to_string(&bridged) {
            if let Err(e) = self
                .store
                .publish(&format!("room:{}", room_id), &payload)
                .await
            {
                debug!(room = %room_id, error = %e, "Cross-instance publish failed");
            }
        }
    }

    /// Disconnects every socket of `user_id` except `keep`. Used at join
    /// time to clear stale sockets from page-refresh races.
    pub fn evict_by_user_id(&self, user_id: &UserId, keep: &ClientId) {
        let stale: Vec<ClientId> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().filter(|id| *id != keep).cloned().collect())
            .unwrap_or_default();
        for client_id in stale {
            info!(user = %user_id, client = %client_id, "Evicting stale client");
            self.unregister(&client_id);
        }
    }

    /// Runs the inbound side of the cross-instance bridge: messages
    /// published by other instances are delivered to local room members.
    pub fn start_bridge(self: &Arc<Self>) {
        let hub = Arc::downgrade(self);
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut rx = match store.subscribe("room:*").await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "Cross-instance bridge unavailable");
                    return;
                }
            };
            while let Some((_channel, payload)) = rx.recv().await {
                let Some(hub) = hub.upgrade() else { break };
                let Ok(bridged) = serde_json::from_str::<BridgedBroadcast>(&payload) else {
                    continue;
                };
                if bridged.instance_id == hub.instance_id {
                    continue; // our own echo
                }
                let Ok(envelope) = Envelope::parse(&bridged.frame) else {
                    continue;
                };
                let room_id = RoomId::from(bridged.room_id.as_str());
                let targets: Vec<ClientId> = hub
                    .by_room
                    .get(&room_id)
                    .map(|ids| ids.clone())
                    .unwrap_or_default();
                for client_id in targets {
                    if let Some(client) = hub.get(&client_id) {
                        if Some(client.user_id.to_string()) == bridged.exclude_user_id {
                            continue;
                        }
                    }
                    hub.send_to_client(&client_id, &envelope);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn make_hub() -> Arc<SignalingHub> {
        SignalingHub::new(Arc::new(MemoryStore::new()), "instance-a".to_string())
    }

    fn make_client(user: &str) -> (Arc<ClientHandle>, mpsc::Receiver<HubFrame>) {
        ClientHandle::new(UserId::from(user), user.to_string(), 20, 40)
    }

    #[tokio::test]
    async fn test_register_send_unregister() {
        let hub = make_hub();
        let (client, mut rx) = make_client("u1");
        let client_id = client.id.clone();
        hub.register(client);
        assert_eq!(hub.client_count(), 1);

        assert!(hub.send_to_client(&client_id, &Envelope::bare("ping")));
        match rx.recv().await.unwrap() {
            HubFrame::Text(text) => assert!(text.contains("ping")),
            HubFrame::Close => panic!("expected text frame"),
        }

        hub.unregister(&client_id);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.send_to_client(&client_id, &Envelope::bare("ping")));
        assert_eq!(rx.recv().await, Some(HubFrame::Close));
    }

    #[tokio::test]
    async fn test_room_broadcast_excludes_sender() {
        let hub = make_hub();
        let room = RoomId::from("demo");
        let (alice, mut alice_rx) = make_client("u1");
        let (bob, mut bob_rx) = make_client("u2");
        let alice_id = alice.id.clone();
        let bob_id = bob.id.clone();
        hub.register(alice);
        hub.register(bob);
        hub.assign_room(&alice_id, &room);
        hub.assign_room(&bob_id, &room);

        hub.broadcast_room(&room, &Envelope::bare("peer-joined"), Some(&alice_id));

        assert!(matches!(bob_rx.recv().await, Some(HubFrame::Text(_))));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backpressure_disconnects_client() {
        let hub = make_hub();
        let (client, _rx) = make_client("u1");
        let client_id = client.id.clone();
        hub.register(client);

        // Nobody drains the queue; it holds 64 frames, then the client goes.
        for _ in 0..64 {
            assert!(hub.send_to_client(&client_id, &Envelope::bare("ping")));
        }
        assert!(!hub.send_to_client(&client_id, &Envelope::bare("ping")));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_evict_by_user_keeps_newest() {
        let hub = make_hub();
        let (old, mut old_rx) = make_client("u1");
        let (new, new_rx) = make_client("u1");
        let old_id = old.id.clone();
        let new_id = new.id.clone();
        hub.register(old);
        hub.register(new);

        hub.evict_by_user_id(&UserId::from("u1"), &new_id);
        assert!(hub.get(&old_id).is_none());
        assert!(hub.get(&new_id).is_some());
        assert_eq!(old_rx.recv().await, Some(HubFrame::Close));
        drop(new_rx);
    }

    #[tokio::test]
    async fn test_bridge_ignores_own_echo_and_delivers_remote() {
        let store = Arc::new(MemoryStore::new());
        let hub = SignalingHub::new(store.clone() as Arc<dyn StateStore>, "instance-a".into());
        hub.start_bridge();
        tokio::task::yield_now().await;

        let room = RoomId::from("demo");
        let (client, mut rx) = make_client("u1");
        let client_id = client.id.clone();
        hub.register(client);
        hub.assign_room(&client_id, &room);

        // Our own broadcast publishes but must not be re-delivered.
        hub.broadcast_room_all(&room, &Envelope::bare("dominant-speaker"), None)
            .await;
        let first = rx.recv().await.unwrap(); // the direct local send
        assert!(matches!(first, HubFrame::Text(_)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        // A frame from another instance is delivered locally.
        let remote = BridgedBroadcast {
            instance_id: "instance-b".into(),
            room_id: "demo".into(),
            exclude_user_id: None,
            frame: Envelope::bare("peer-joined").to_text(),
        };
        store
            .publish("room:demo", &serde_json::to_string(&remote).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        match rx.try_recv().unwrap() {
            HubFrame::Text(text) => assert!(text.contains("peer-joined")),
            HubFrame::Close => panic!("unexpected close"),
        }
    }
}
