//! Durable session identity. A session outlives its transport: on socket
//! loss it is suspended with a TTL, and a client holding the session id and
//! token can resume it on a fresh connection without losing room membership.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::errors::{SfuError, SfuResult};
use crate::id_types::{RoomId, SessionId, UserId};
use crate::messages::MediaState;
use crate::metrics::{
    SFU_ACTIVE_SESSIONS, SFU_SESSION_RECOVERY_TOTAL, SFU_SUSPENDED_SESSIONS,
};
use crate::store::StateStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// Never persisted; empty on records loaded from the store, which makes
    /// them unresumable by construction.
    #[serde(skip)]
    pub token: String,
    pub user_id: String,
    pub room_id: String,
    pub display_name: String,
    pub current_peer_id: Option<String>,
    pub media_state: MediaState,
    pub subscriptions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub suspended: bool,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn session_key(id: &str) -> String {
    format!("session:{}", id)
}

fn room_member_key(room_id: &str, session_id: &str) -> String {
    format!("roomSessions:{}:{}", room_id, session_id)
}

fn room_members_prefix(room_id: &str) -> String {
    format!("roomSessions:{}:", room_id)
}

pub struct SessionManager {
    sessions: DashMap<SessionId, Session>,
    /// (userId, roomId) -> sessionId, enforcing one session per pairing.
    by_user_room: DashMap<(UserId, RoomId), SessionId>,
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        SessionManager {
            sessions: DashMap::new(),
            by_user_room: DashMap::new(),
            store,
            ttl,
        }
    }

    /// Persists a session record. Store failures are logged, never surfaced:
    /// the local index stays the hot path during store outages.
    async fn persist(&self, session: &Session) {
        let ttl = session.suspended.then_some(self.ttl);
        match serde_json::to_string(session) {
            Ok(json) => {
                if let Err(e) = self.store.set(&session_key(&session.id), &json, ttl).await {
                    warn!(session = %session.id, error = %e, "Failed to persist session");
                }
                if let Err(e) = self
                    .store
                    .set(&room_member_key(&session.room_id, &session.id), "1", ttl)
                    .await
                {
                    warn!(session = %session.id, error = %e, "Failed to persist room membership");
                }
            }
            Err(e) => warn!(session = %session.id, error = %e, "Failed to encode session"),
        }
    }

    /// Returns the existing session for `(user, room)` or allocates a fresh
    /// identity. A suspended session found here is reactivated in place.
    pub async fn create(&self, user_id: &UserId, room_id: &RoomId, name: &str) -> Session {
        let pair_key = (user_id.clone(), room_id.clone());
        if let Some(existing_id) = self.by_user_room.get(&pair_key).map(|e| e.value().clone()) {
            if let Some(mut entry) = self.sessions.get_mut(&existing_id) {
                let session = entry.value_mut();
                if !session.suspended {
                    return session.clone();
                }
                session.suspended = false;
                session.last_seen_at = Utc::now();
                session.display_name = name.to_string();
                SFU_SUSPENDED_SESSIONS.dec();
                SFU_ACTIVE_SESSIONS.inc();
                let snapshot = session.clone();
                drop(entry);
                info!(session = %snapshot.id, user = %user_id, "Reactivated suspended session");
                self.persist(&snapshot).await;
                return snapshot;
            }
        }

        let now = Utc::now();
        let session = Session {
            id: random_hex(16),
            token: random_hex(32),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            display_name: name.to_string(),
            current_peer_id: None,
            media_state: MediaState::default(),
            subscriptions: BTreeSet::new(),
            created_at: now,
            last_seen_at: now,
            suspended: false,
        };
        self.sessions
            .insert(SessionId::from(session.id.clone()), session.clone());
        self.by_user_room
            .insert(pair_key, SessionId::from(session.id.clone()));
        SFU_ACTIVE_SESSIONS.inc();
        info!(session = %session.id, user = %user_id, room = %room_id, "Session created");
        self.persist(&session).await;
        session
    }

    /// Resumes a suspended or live session. The token compare is constant
    /// time; a successful resume rotates the token, so the old one is dead.
    pub async fn resume(&self, session_id: &str, token: &str) -> SfuResult<Session> {
        let key = SessionId::from(session_id);
        let mut entry = self
            .sessions
            .get_mut(&key)
            .ok_or_else(|| SfuError::Validation("invalid session credentials".into()))?;
        let session = entry.value_mut();

        // Recovered records carry no token and can never be resumed.
        if session.token.is_empty() {
            return Err(SfuError::Validation("invalid session credentials".into()));
        }
        let matches: bool = session
            .token
            .as_bytes()
            .ct_eq(token.as_bytes())
            .into();
        if !matches {
            return Err(SfuError::Validation("invalid session credentials".into()));
        }

        if session.suspended {
            session.suspended = false;
            SFU_SUSPENDED_SESSIONS.dec();
            SFU_ACTIVE_SESSIONS.inc();
        }
        session.token = random_hex(32);
        session.last_seen_at = Utc::now();
        let snapshot = session.clone();
        drop(entry);
        info!(session = %session_id, "Session resumed, token rotated");
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Marks a session suspended; it stays resumable for the configured TTL.
    pub async fn suspend(&self, session_id: &str) {
        let key = SessionId::from(session_id);
        let snapshot = match self.sessions.get_mut(&key) {
            Some(mut entry) => {
                let session = entry.value_mut();
                if session.suspended {
                    return;
                }
                session.suspended = true;
                session.last_seen_at = Utc::now();
                SFU_ACTIVE_SESSIONS.dec();
                SFU_SUSPENDED_SESSIONS.inc();
                session.clone()
            }
            None => return,
        };
        info!(session = %session_id, "Session suspended");
        self.persist(&snapshot).await;
    }

    pub async fn delete(&self, session_id: &str) {
        let key = SessionId::from(session_id);
        if let Some((_, session)) = self.sessions.remove(&key) {
            self.by_user_room.remove(&(
                UserId::from(session.user_id.clone()),
                RoomId::from(session.room_id.clone()),
            ));
            if session.suspended {
                SFU_SUSPENDED_SESSIONS.dec();
            } else {
                SFU_ACTIVE_SESSIONS.dec();
            }
            if let Err(e) = self.store.delete(&session_key(session_id)).await {
                warn!(session = %session_id, error = %e, "Failed to delete persisted session");
            }
            let _ = self
                .store
                .delete(&room_member_key(&session.room_id, session_id))
                .await;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .get(&SessionId::from(session_id))
            .map(|e| e.value().clone())
    }

    /// Session ids attached to a room, from the store's per-room index, so
    /// suspended sessions persisted by other instances are included. Falls
    /// back to the local index when the store is unreachable.
    pub async fn sessions_in_room(&self, room_id: &str) -> Vec<String> {
        match self.store.list_by_prefix(&room_members_prefix(room_id)).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(key, _)| key.rsplit(':').next().map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(room = %room_id, error = %e, "Room session scan failed, using local index");
                self.sessions
                    .iter()
                    .filter(|e| e.value().room_id == room_id)
                    .map(|e| e.value().id.clone())
                    .collect()
            }
        }
    }

    /// Cache-first read with a store fallback on miss. A record pulled from
    /// the store carries no token, so it lands in the cache suspended.
    pub async fn lookup(&self, session_id: &str) -> Option<Session> {
        if let Some(session) = self.get(session_id) {
            return Some(session);
        }
        let raw = match self.store.get(&session_key(session_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Store fallback read failed");
                return None;
            }
        };
        let mut session: Session = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Unreadable session record in store");
                return None;
            }
        };
        session.suspended = true;
        self.by_user_room.insert(
            (
                UserId::from(session.user_id.clone()),
                RoomId::from(session.room_id.clone()),
            ),
            SessionId::from(session.id.clone()),
        );
        self.sessions
            .insert(SessionId::from(session.id.clone()), session.clone());
        SFU_SUSPENDED_SESSIONS.inc();
        Some(session)
    }

    pub async fn update_peer_id(&self, session_id: &str, peer_id: &str) {
        self.mutate(session_id, |s| {
            s.current_peer_id = Some(peer_id.to_string());
        })
        .await;
    }

    pub async fn update_media_state(&self, session_id: &str, media_state: MediaState) {
        self.mutate(session_id, |s| {
            s.media_state = media_state;
        })
        .await;
    }

    pub async fn update_subscriptions(&self, session_id: &str, subscriptions: BTreeSet<String>) {
        self.mutate(session_id, |s| {
            s.subscriptions = subscriptions;
        })
        .await;
    }

    async fn mutate<F: FnOnce(&mut Session)>(&self, session_id: &str, f: F) {
        let key = SessionId::from(session_id);
        let snapshot = match self.sessions.get_mut(&key) {
            Some(mut entry) => {
                let session = entry.value_mut();
                f(session);
                session.last_seen_at = Utc::now();
                session.clone()
            }
            None => return,
        };
        self.persist(&snapshot).await;
    }

    /// Drops suspended sessions idle past `ttl`. Returns the removed
    /// sessions so the caller can announce the departures.
    pub async fn gc_expired(&self, ttl: Duration) -> Vec<Session> {
        let now = Utc::now();
        let expired: Vec<Session> = self
            .sessions
            .iter()
            .filter(|e| {
                let s = e.value();
                s.suspended
                    && (now - s.last_seen_at).to_std().unwrap_or_default() > ttl
            })
            .map(|e| e.value().clone())
            .collect();

        for session in &expired {
            info!(session = %session.id, "Expiring suspended session");
            self.delete(&session.id).await;
        }
        expired
    }

    /// Loads persisted session records into the local index at startup.
    /// Tokens are not persisted, so recovered sessions are suspended and can
    /// only be rejoined as new sessions.
    pub async fn recover(&self) -> Vec<Session> {
        let records = match self.store.list_by_prefix("session:").await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Session recovery scan failed");
                SFU_SESSION_RECOVERY_TOTAL.with_label_values(&["error"]).inc();
                return Vec::new();
            }
        };

        let mut recovered = Vec::new();
        for (key, value) in records {
            match serde_json::from_str::<Session>(&value) {
                Ok(mut session) => {
                    if !session.suspended {
                        session.suspended = true;
                        session.last_seen_at = Utc::now();
                    }
                    self.by_user_room.insert(
                        (
                            UserId::from(session.user_id.clone()),
                            RoomId::from(session.room_id.clone()),
                        ),
                        SessionId::from(session.id.clone()),
                    );
                    self.sessions
                        .insert(SessionId::from(session.id.clone()), session.clone());
                    SFU_SUSPENDED_SESSIONS.inc();
                    SFU_SESSION_RECOVERY_TOTAL.with_label_values(&["ok"]).inc();
                    recovered.push(session);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable session record");
                    SFU_SESSION_RECOVERY_TOTAL.with_label_values(&["error"]).inc();
                }
            }
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered persisted sessions");
        }
        recovered
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|e| !e.value().suspended).count()
    }

    pub fn suspended_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().suspended).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryStore::new()), Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_user_room() {
        let mgr = manager();
        let user = UserId::from("u1");
        let room = RoomId::from("demo");

        let first = mgr.create(&user, &room, "Alice").await;
        let second = mgr.create(&user, &room, "Alice").await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.token, second.token);
    }

    #[tokio::test]
    async fn test_resume_rotates_token_and_rejects_replay() {
        let mgr = manager();
        let session = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "Alice")
            .await;

        let resumed = mgr.resume(&session.id, &session.token).await.unwrap();
        assert_eq!(resumed.id, session.id);
        assert_ne!(resumed.token, session.token);

        // Replaying the original token must fail.
        let replay = mgr.resume(&session.id, &session.token).await;
        assert!(matches!(replay, Err(SfuError::Validation(_))));
    }

    #[tokio::test]
    async fn test_suspend_resume_round_trip() {
        let mgr = manager();
        let session = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "Alice")
            .await;

        mgr.suspend(&session.id).await;
        assert!(mgr.get(&session.id).unwrap().suspended);
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.suspended_count(), 1);

        let resumed = mgr.resume(&session.id, &session.token).await.unwrap();
        assert_eq!(mgr.active_count(), 1);
        assert_eq!(mgr.suspended_count(), 0);
        assert!(!resumed.suspended);
        assert_eq!(resumed.user_id, session.user_id);
        assert_eq!(resumed.room_id, session.room_id);
        assert_eq!(resumed.display_name, session.display_name);
    }

    #[tokio::test]
    async fn test_create_reactivates_suspended_session() {
        let mgr = manager();
        let user = UserId::from("u1");
        let room = RoomId::from("demo");
        let session = mgr.create(&user, &room, "Alice").await;

        mgr.suspend(&session.id).await;
        let again = mgr.create(&user, &room, "Alice B.").await;
        assert_eq!(again.id, session.id);
        assert!(!again.suspended);
        assert_eq!(again.display_name, "Alice B.");
    }

    #[tokio::test]
    async fn test_resume_unknown_session_fails() {
        let mgr = manager();
        let res = mgr.resume("deadbeef", "tok").await;
        assert!(matches!(res, Err(SfuError::Validation(_))));
    }

    #[tokio::test]
    async fn test_gc_drops_only_expired_suspended() {
        let mgr = manager();
        let a = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "A")
            .await;
        let b = mgr
            .create(&UserId::from("u2"), &RoomId::from("demo"), "B")
            .await;
        mgr.suspend(&a.id).await;

        // Active session and a freshly suspended one both survive.
        assert!(mgr.gc_expired(Duration::from_secs(120)).await.is_empty());

        // Zero TTL expires the suspended session immediately.
        let expired = mgr.gc_expired(Duration::from_secs(0)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, a.id);
        assert!(mgr.get(&a.id).is_none());
        assert!(mgr.get(&b.id).is_some());
    }

    #[tokio::test]
    async fn test_recover_marks_sessions_suspended_and_unresumable() {
        let store = Arc::new(MemoryStore::new());
        let mgr = SessionManager::new(store.clone(), Duration::from_secs(120));
        let session = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "Alice")
            .await;

        // Fresh manager over the same store simulates a process restart.
        let restarted = SessionManager::new(store, Duration::from_secs(120));
        let recovered = restarted.recover().await;
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].suspended);

        // The token was never persisted; the old one cannot resume.
        let res = restarted.resume(&session.id, &session.token).await;
        assert!(matches!(res, Err(SfuError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sessions_in_room_enumerates_per_room() {
        let mgr = manager();
        let a = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "A")
            .await;
        let b = mgr
            .create(&UserId::from("u2"), &RoomId::from("demo"), "B")
            .await;
        let other = mgr
            .create(&UserId::from("u3"), &RoomId::from("standup"), "C")
            .await;

        let mut demo = mgr.sessions_in_room("demo").await;
        demo.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(demo, expected);
        assert_eq!(mgr.sessions_in_room("standup").await, vec![other.id.clone()]);

        // Deleting a session also drops it from the room index.
        mgr.delete(&a.id).await;
        assert_eq!(mgr.sessions_in_room("demo").await, vec![b.id]);
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_store_on_cache_miss() {
        let store = Arc::new(MemoryStore::new());
        let mgr = SessionManager::new(store.clone(), Duration::from_secs(120));
        let session = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "Alice")
            .await;

        // A manager with a cold cache over the same store.
        let cold = SessionManager::new(store, Duration::from_secs(120));
        assert!(cold.get(&session.id).is_none());

        let fetched = cold.lookup(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert!(fetched.suspended, "store-loaded records are suspended");
        assert!(fetched.token.is_empty(), "tokens are never persisted");

        // Second lookup is served from the cache.
        assert!(cold.get(&session.id).is_some());
    }

    #[tokio::test]
    async fn test_updates_persist_fields() {
        let mgr = manager();
        let session = mgr
            .create(&UserId::from("u1"), &RoomId::from("demo"), "Alice")
            .await;

        mgr.update_peer_id(&session.id, "peer-9").await;
        mgr.update_media_state(
            &session.id,
            MediaState {
                mic: true,
                camera: true,
                screen: false,
            },
        )
        .await;
        let mut subs = BTreeSet::new();
        subs.insert("track-1".to_string());
        mgr.update_subscriptions(&session.id, subs).await;

        let got = mgr.get(&session.id).unwrap();
        assert_eq!(got.current_peer_id.as_deref(), Some("peer-9"));
        assert!(got.media_state.mic);
        assert!(got.subscriptions.contains("track-1"));
    }
}
