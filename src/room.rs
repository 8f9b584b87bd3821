//! A room is the fan-out scope: membership, the published-track registry,
//! per-subscriber senders, dominant-speaker detection and the quality loop.
//!
//! The room never talks to sockets. It emits typed `RoomEvent`s into a sink
//! owned by the orchestrator, which turns them into signaling messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::errors::{SfuError, SfuResult};
use crate::forwarder::{RtpSource, TrackForwarder, TrackKind};
use crate::id_types::{PeerId, RoomId, TrackId, UserId};
use crate::messages::{IceCandidate, PeerInfo};
use crate::peer::Peer;
use crate::quality::{self, QualityLevel};
use crate::speaker::DominantSpeakerDetector;
use crate::subscriptions::SubscriptionPolicy;

/// Typed events the room (and its peers) emit towards the orchestrator.
#[derive(Debug)]
pub enum RoomEvent {
    PeerJoined {
        room_id: RoomId,
        peer: PeerInfo,
    },
    PeerLeft {
        room_id: RoomId,
        peer_id: PeerId,
        user_id: UserId,
    },
    /// Server added senders; the client should send a fresh offer.
    RenegotiationNeeded {
        room_id: RoomId,
        peer_id: PeerId,
        reason: String,
        track_count: usize,
    },
    /// Server-side ICE candidate for one client.
    IceCandidate {
        room_id: RoomId,
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    LayerAvailable {
        room_id: RoomId,
        track_id: TrackId,
        layers: Vec<String>,
    },
    DominantSpeakerChanged {
        room_id: RoomId,
        peer_id: Option<PeerId>,
    },
    QualityStats {
        room_id: RoomId,
        peer_id: PeerId,
        level: QualityLevel,
        packet_loss: f64,
    },
    /// The peer's transport failed; its session should be suspended.
    TransportFailed {
        room_id: RoomId,
        peer_id: PeerId,
    },
}

struct Members {
    peers: HashMap<PeerId, Arc<Peer>>,
    /// userId -> peerId for O(1) reconnect eviction.
    user_index: HashMap<UserId, PeerId>,
}

/// Summary served by the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub id: String,
    pub peer_count: usize,
    pub track_count: usize,
    pub dominant_speaker: Option<String>,
    /// Outbound RTP packets across all member connections.
    pub packets_sent: u64,
    pub created_at: DateTime<Utc>,
}

pub struct Room {
    pub id: RoomId,
    config: Arc<Config>,
    policy: SubscriptionPolicy,
    members: RwLock<Members>,
    /// trackId -> forwarder; the track publication registry.
    published_tracks: DashMap<TrackId, Arc<TrackForwarder>>,
    detector: StdMutex<DominantSpeakerDetector>,
    events: mpsc::Sender<RoomEvent>,
    created_at: DateTime<Utc>,
    /// Set while the room has no peers; drives idle cleanup.
    empty_since: StdMutex<Option<Instant>>,
    max_peers: usize,
}

impl Room {
    pub fn new(
        id: RoomId,
        config: Arc<Config>,
        policy: SubscriptionPolicy,
        events: mpsc::Sender<RoomEvent>,
        max_peers: usize,
    ) -> Arc<Self> {
        info!(room = %id, "Room created");
        Arc::new(Room {
            id,
            config,
            policy,
            members: RwLock::new(Members {
                peers: HashMap::new(),
                user_index: HashMap::new(),
            }),
            published_tracks: DashMap::new(),
            detector: StdMutex::new(DominantSpeakerDetector::new()),
            events,
            created_at: Utc::now(),
            empty_since: StdMutex::new(Some(Instant::now())),
            max_peers,
        })
    }

    async fn emit(&self, event: RoomEvent) {
        if self.events.send(event).await.is_err() {
            debug!(room = %self.id, "Event sink closed");
        }
    }

    /// Adds a peer, evicting any existing peer with the same userId first.
    /// The eviction and insert are atomic under the membership write lock;
    /// the evicted peer is fully torn down here (tracks unpublished,
    /// transport closed) and returned for the caller's bookkeeping.
    ///
    /// `announce` suppresses the `peer-joined` broadcast (and the evicted
    /// peer's `peer-left`) for session resumes, where the membership is
    /// logically unchanged.
    pub async fn add_peer(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        announce: bool,
    ) -> SfuResult<Option<Arc<Peer>>> {
        let evicted = {
            let mut members = self.members.write().await;
            let evicted = members
                .user_index
                .remove(&peer.user_id)
                .and_then(|old_id| members.peers.remove(&old_id));

            if evicted.is_none() && members.peers.len() >= self.max_peers {
                return Err(SfuError::Capacity(format!(
                    "room {} is full ({} peers)",
                    self.id, self.max_peers
                )));
            }

            members.peers.insert(peer.id.clone(), peer.clone());
            members
                .user_index
                .insert(peer.user_id.clone(), peer.id.clone());
            evicted
        };
        *self.empty_since.lock().unwrap() = None;
        crate::metrics::SFU_ACTIVE_PEERS.inc();

        if let Some(old) = &evicted {
            info!(room = %self.id, user = %peer.user_id, old_peer = %old.id, new_peer = %peer.id,
                "Evicted stale peer for reconnecting user");
            self.cleanup_departed(old, announce).await;
            old.close().await;
        }

        if announce {
            self.emit(RoomEvent::PeerJoined {
                room_id: self.id.clone(),
                peer: peer_info(&peer),
            })
            .await;
        }
        Ok(evicted)
    }

    /// Removes a peer from membership and tears down all fan-out state that
    /// references it.
    pub async fn remove_peer(self: &Arc<Self>, peer_id: &PeerId, announce: bool) -> Option<Arc<Peer>> {
        let removed = {
            let mut members = self.members.write().await;
            let removed = members.peers.remove(peer_id)?;
            // The user may already be re-indexed to a newer peer.
            if members.user_index.get(&removed.user_id) == Some(peer_id) {
                members.user_index.remove(&removed.user_id);
            }
            if members.peers.is_empty() {
                *self.empty_since.lock().unwrap() = Some(Instant::now());
            }
            removed
        };
        self.cleanup_departed(&removed, announce).await;
        Some(removed)
    }

    /// Tears down fan-out state for a peer no longer in the membership map:
    /// unpublishes its tracks (closing the senders carrying them on every
    /// other peer) and detaches its writers from remaining tracks. Also used
    /// for peers evicted by `add_peer`.
    async fn cleanup_departed(self: &Arc<Self>, peer: &Arc<Peer>, announce: bool) {
        let owned: Vec<Arc<TrackForwarder>> = self
            .published_tracks
            .iter()
            .filter(|e| e.value().source_peer_id == peer.id)
            .map(|e| e.value().clone())
            .collect();
        for forwarder in owned {
            self.unpublish_track(&forwarder.track_id).await;
        }

        let remaining: Vec<Arc<TrackForwarder>> = self
            .published_tracks
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for forwarder in remaining {
            forwarder.remove_writer(&peer.id).await;
        }
        crate::metrics::SFU_ACTIVE_PEERS.dec();

        if announce {
            self.emit(RoomEvent::PeerLeft {
                room_id: self.id.clone(),
                peer_id: peer.id.clone(),
                user_id: peer.user_id.clone(),
            })
            .await;
        }
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.members.read().await.peers.get(peer_id).cloned()
    }

    pub async fn peer_by_user(&self, user_id: &UserId) -> Option<Arc<Peer>> {
        let members = self.members.read().await;
        let peer_id = members.user_index.get(user_id)?;
        members.peers.get(peer_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.members.read().await.peers.len()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.members.read().await.peers.values().cloned().collect()
    }

    /// Current members for the `room-state` message, excluding one peer.
    pub async fn peer_infos_excluding(&self, exclude: &PeerId) -> Vec<PeerInfo> {
        self.members
            .read()
            .await
            .peers
            .values()
            .filter(|p| p.id != *exclude)
            .map(|p| peer_info(p))
            .collect()
    }

    /// Idle for at least `threshold` with no members.
    pub fn is_expired(&self, threshold: std::time::Duration) -> bool {
        self.empty_since
            .lock()
            .unwrap()
            .map(|since| since.elapsed() >= threshold)
            .unwrap_or(false)
    }

    /// Ingest entry point: a publisher's track (or one simulcast layer of
    /// it) arrived. Registers the forwarder, starts the ingest loop and
    /// fans the track out to every eligible subscriber.
    pub async fn publish_track(
        self: &Arc<Self>,
        publisher: &Arc<Peer>,
        source: Arc<dyn RtpSource>,
        audio_level_ext: Option<u8>,
    ) {
        let track_id = TrackId::from(source.id());
        let kind = TrackKind::from_str(&source.kind());

        // Layers of one simulcast track can land concurrently; the entry
        // guard makes forwarder creation atomic per track id.
        let mut is_new_track = false;
        let forwarder = self
            .published_tracks
            .entry(track_id.clone())
            .or_insert_with(|| {
                is_new_track = true;
                Arc::new(TrackForwarder::new(
                    track_id.clone(),
                    publisher.id.clone(),
                    kind,
                    source.codec_capability(),
                    publisher.pc.clone(),
                ))
            })
            .clone();

        let meter = (kind == TrackKind::Audio)
            .then(|| audio_level_ext.map(|ext| (ext, publisher.audio_meter.clone())))
            .flatten();
        let grew = forwarder.add_layer(source, meter, self.config.max_rtp_errors);

        info!(room = %self.id, track = %track_id, peer = %publisher.id, kind = %kind.as_str(),
            new = is_new_track, "Track published");

        if is_new_track {
            // Attach a sender on every other eligible peer.
            let subscribers = self.peers().await;
            for subscriber in subscribers {
                if subscriber.id == publisher.id {
                    continue;
                }
                if !self.allowed(&subscriber, track_id.as_ref()) {
                    continue;
                }
                self.add_sender(&subscriber, &forwarder).await;
                self.schedule_renegotiate(&subscriber, "track-added").await;
            }
        }

        if grew && self.config.simulcast_enabled && kind == TrackKind::Video {
            let layers = forwarder.layers();
            if !layers.is_empty() {
                self.emit(RoomEvent::LayerAvailable {
                    room_id: self.id.clone(),
                    track_id: track_id.clone(),
                    layers,
                })
                .await;
            }
        }
    }

    /// Closes a publication everywhere: the forwarder, and the matching
    /// sender on every subscriber.
    pub async fn unpublish_track(self: &Arc<Self>, track_id: &TrackId) {
        let Some((_, forwarder)) = self.published_tracks.remove(track_id) else {
            return;
        };
        forwarder.close().await;

        let peers = self.peers().await;
        for peer in peers {
            if peer.id == forwarder.source_peer_id {
                continue;
            }
            if peer.remove_forwarded_sender(track_id).await {
                self.schedule_renegotiate(&peer, "track-removed").await;
            }
        }
        info!(room = %self.id, track = %track_id, "Track unpublished");
    }

    fn allowed(&self, subscriber: &Arc<Peer>, track_id: &str) -> bool {
        let subs = subscriber.subscriptions.read().unwrap();
        self.policy.should_receive(&subs, track_id)
    }

    /// Adds senders for every existing publication this subscriber should
    /// receive. Called when the subscriber's initial offer arrives.
    pub async fn attach_existing_tracks(self: &Arc<Self>, subscriber: &Arc<Peer>) -> usize {
        let forwarders: Vec<Arc<TrackForwarder>> = self
            .published_tracks
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut attached = 0;
        for forwarder in forwarders {
            if forwarder.source_peer_id == subscriber.id {
                continue;
            }
            if !self.allowed(subscriber, forwarder.track_id.as_ref()) {
                continue;
            }
            if subscriber.has_forwarded_sender(&forwarder.track_id).await {
                continue;
            }
            self.add_sender(subscriber, &forwarder).await;
            attached += 1;
        }
        attached
    }

    /// Creates the outbound leg of one track on one subscriber: a local
    /// track whose stream id is the publisher's peer id (how clients
    /// attribute incoming media), an RTP sender, and a PLI monitor.
    async fn add_sender(&self, subscriber: &Arc<Peer>, forwarder: &Arc<TrackForwarder>) {
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            forwarder.capability.clone(),
            forwarder.track_id.to_string(),
            forwarder.source_peer_id.to_string(),
        ));

        let sender = match subscriber
            .pc
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                warn!(room = %self.id, peer = %subscriber.id, track = %forwarder.track_id,
                    error = %e, "Failed to add outbound track");
                return;
            }
        };

        // Relay PLI from the subscriber back to the publisher.
        let sender_for_rtcp = sender.clone();
        let forwarder_for_rtcp = forwarder.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((packets, _)) = sender_for_rtcp.read(&mut rtcp_buf).await {
                for packet in packets {
                    if packet.as_any().is::<PictureLossIndication>() {
                        forwarder_for_rtcp.request_keyframe().await;
                    }
                }
            }
        });

        subscriber
            .insert_forwarded_sender(forwarder.track_id.clone(), sender)
            .await;
        forwarder
            .add_writer(subscriber.id.clone(), local_track)
            .await;
        forwarder.clone().schedule_pli_retry();

        debug!(room = %self.id, peer = %subscriber.id, track = %forwarder.track_id,
            source = %forwarder.source_peer_id, "Forwarding track to subscriber");
    }

    /// Debounced renegotiation request. The first track add flips the peer
    /// into PendingRenegotiate; adds landing within the debounce window ride
    /// along with the same `renegotiate` message.
    pub async fn schedule_renegotiate(self: &Arc<Self>, peer: &Arc<Peer>, reason: &str) {
        if !peer.mark_pending_renegotiate() {
            return;
        }
        let room = self.clone();
        let peer = peer.clone();
        let reason = reason.to_string();
        let delay = self.config.renegotiation_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let track_count = peer.forwarded_sender_count().await;
            room.emit(RoomEvent::RenegotiationNeeded {
                room_id: room.id.clone(),
                peer_id: peer.id.clone(),
                reason,
                track_count,
            })
            .await;
        });
    }

    /// Subscriber asks for a specific simulcast layer of a track.
    pub async fn switch_layer(
        &self,
        subscriber_id: &PeerId,
        track_id: &TrackId,
        rid: &str,
    ) -> SfuResult<()> {
        let forwarder = self
            .published_tracks
            .get(track_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SfuError::NotFound(format!("unknown track {}", track_id)))?;

        if forwarder.switch_layer(subscriber_id, rid).await {
            Ok(())
        } else {
            Err(SfuError::NotFound(format!(
                "layer {} not available on track {}",
                rid, track_id
            )))
        }
    }

    pub fn track_count(&self) -> usize {
        self.published_tracks.len()
    }

    pub async fn stats(&self) -> RoomStats {
        let peers = self.peers().await;
        let mut packets_sent = 0;
        for peer in &peers {
            packets_sent += quality::outbound_packets_sent(&peer.pc).await;
        }
        RoomStats {
            id: self.id.to_string(),
            peer_count: peers.len(),
            track_count: self.published_tracks.len(),
            dominant_speaker: self
                .detector
                .lock()
                .unwrap()
                .current()
                .map(|p| p.to_string()),
            packets_sent,
            created_at: self.created_at,
        }
    }

    /// Spawns the dominant-speaker and stats tickers for this room. Both
    /// stop on shutdown or when the room is dropped from the registry.
    pub fn start_background_tasks(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let speaker_room = Arc::downgrade(self);
        let speaker_interval = self.config.speaker_detection_interval;
        let mut speaker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + speaker_interval,
                speaker_interval,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(room) = speaker_room.upgrade() else { break };
                        room.speaker_tick().await;
                    }
                    _ = speaker_shutdown.changed() => break,
                }
            }
        });

        let stats_room = Arc::downgrade(self);
        let stats_interval = self.config.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + stats_interval,
                stats_interval,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(room) = stats_room.upgrade() else { break };
                        room.stats_tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn speaker_tick(self: &Arc<Self>) {
        let peers = self.peers().await;
        if peers.is_empty() {
            return;
        }
        let levels: Vec<(PeerId, u8)> = peers
            .iter()
            .map(|p| (p.id.clone(), p.audio_meter.energy()))
            .collect();

        let transition = self.detector.lock().unwrap().tick(&levels);
        if let Some(new_dominant) = transition {
            self.emit(RoomEvent::DominantSpeakerChanged {
                room_id: self.id.clone(),
                peer_id: new_dominant,
            })
            .await;
        }
    }

    async fn stats_tick(self: &Arc<Self>) {
        let peers = self.peers().await;
        let forwarders: Vec<Arc<TrackForwarder>> = self
            .published_tracks
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for peer in peers {
            // Aggregate uplink loss across everything this peer publishes.
            let (mut received, mut lost) = (0u64, 0u64);
            for forwarder in &forwarders {
                if forwarder.source_peer_id == peer.id {
                    let (r, l) = forwarder.loss_stats();
                    received += r;
                    lost += l;
                }
            }
            let packet_loss = quality::loss_percent(received, lost);
            let level = QualityLevel::classify(packet_loss);

            self.emit(RoomEvent::QualityStats {
                room_id: self.id.clone(),
                peer_id: peer.id.clone(),
                level,
                packet_loss,
            })
            .await;

            // Sustained poor quality drops this subscriber to a lower layer
            // until it re-selects explicitly.
            if self.config.simulcast_enabled && level.needs_downgrade() {
                let target = level.downgrade_rid();
                for forwarder in &forwarders {
                    if forwarder.kind != TrackKind::Video
                        || forwarder.source_peer_id == peer.id
                        || !forwarder.has_writer(&peer.id).await
                    {
                        continue;
                    }
                    let current = forwarder.selected_layer(&peer.id).await.unwrap_or_default();
                    if current != target && forwarder.switch_layer(&peer.id, target).await {
                        debug!(room = %self.id, peer = %peer.id, track = %forwarder.track_id,
                            rid = %target, "Auto-downgraded simulcast layer");
                    }
                }
            }
        }
    }

    /// Tears the room down: every peer is closed, which closes every
    /// transport; forwarders are detached.
    pub async fn close(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut members = self.members.write().await;
            members.user_index.clear();
            members.peers.drain().map(|(_, p)| p).collect()
        };
        crate::metrics::SFU_ACTIVE_PEERS.sub(peers.len() as i64);
        let forwarders: Vec<Arc<TrackForwarder>> = self
            .published_tracks
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.published_tracks.clear();
        for forwarder in forwarders {
            forwarder.close().await;
        }
        for peer in peers {
            peer.close().await;
        }
        info!(room = %self.id, "Room closed");
    }
}

pub fn peer_info(peer: &Arc<Peer>) -> PeerInfo {
    PeerInfo {
        peer_id: peer.id.to_string(),
        user_id: peer.user_id.to_string(),
        display_name: peer.display_name.clone(),
        media_state: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;
    use webrtc::interceptor::Attributes;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp::packet::Packet;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct StaticSource {
        id: String,
        rid: String,
        kind: String,
        ssrc: u32,
    }

    #[async_trait::async_trait]
    impl RtpSource for StaticSource {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn rid(&self) -> String {
            self.rid.clone()
        }
        fn kind(&self) -> String {
            self.kind.clone()
        }
        fn ssrc(&self) -> u32 {
            self.ssrc
        }
        fn codec_capability(&self) -> RTCRtpCodecCapability {
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                ..Default::default()
            }
        }
        async fn read_rtp(&self) -> anyhow::Result<(Packet, Attributes)> {
            // Keeps the ingest loop parked without producing packets.
            futures_util::future::pending::<()>().await;
            unreachable!()
        }
    }

    async fn make_peer(user: &str) -> Arc<Peer> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        Arc::new(Peer::new(
            pc,
            format!("sess-{}", user),
            UserId::from(user),
            RoomId::from("demo"),
            user.to_string(),
        ))
    }

    fn make_room(max_peers: usize) -> (Arc<Room>, mpsc::Receiver<RoomEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let room = Room::new(
            RoomId::from("demo"),
            Arc::new(Config::default()),
            SubscriptionPolicy::new(true),
            tx,
            max_peers,
        );
        (room, rx)
    }

    #[tokio::test]
    async fn test_add_peer_capacity_bound() {
        let (room, _rx) = make_room(2);
        room.add_peer(make_peer("u1").await, true).await.unwrap();
        room.add_peer(make_peer("u2").await, true).await.unwrap();

        let result = room.add_peer(make_peer("u3").await, true).await;
        assert!(matches!(result, Err(SfuError::Capacity(_))));
        assert_eq!(room.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_same_user_evicts_previous_peer() {
        let (room, _rx) = make_room(8);
        let first = make_peer("u1").await;
        let first_id = first.id.clone();
        room.add_peer(first, true).await.unwrap();

        let second = make_peer("u1").await;
        let second_id = second.id.clone();
        let evicted = room.add_peer(second, true).await.unwrap();

        assert_eq!(evicted.unwrap().id, first_id);
        assert_eq!(room.peer_count().await, 1);
        let current = room.peer_by_user(&UserId::from("u1")).await.unwrap();
        assert_eq!(current.id, second_id);
    }

    #[tokio::test]
    async fn test_eviction_tears_down_published_tracks() {
        let (room, _rx) = make_room(8);
        let first = make_peer("u1").await;
        let watcher = make_peer("u2").await;
        room.add_peer(first.clone(), true).await.unwrap();
        room.add_peer(watcher.clone(), true).await.unwrap();

        let source = Arc::new(StaticSource {
            id: "track-1".into(),
            rid: "".into(),
            kind: "video".into(),
            ssrc: 42,
        });
        room.publish_track(&first, source, None).await;
        assert_eq!(room.track_count(), 1);
        assert!(watcher.has_forwarded_sender(&TrackId::from("track-1")).await);

        // Same user rejoins; the evicted peer's publications must go with it.
        let evicted = room.add_peer(make_peer("u1").await, true).await.unwrap();
        assert_eq!(evicted.unwrap().id, first.id);
        assert_eq!(room.track_count(), 0);
        assert!(!watcher.has_forwarded_sender(&TrackId::from("track-1")).await);
    }

    #[tokio::test]
    async fn test_eviction_does_not_count_against_capacity() {
        let (room, _rx) = make_room(1);
        room.add_peer(make_peer("u1").await, true).await.unwrap();
        // Same user reconnecting into a full room must succeed.
        let evicted = room.add_peer(make_peer("u1").await, true).await.unwrap();
        assert!(evicted.is_some());
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let (room, _rx) = make_room(8);
        let publisher = make_peer("u1").await;
        let subscriber = make_peer("u2").await;
        room.add_peer(publisher.clone(), true).await.unwrap();
        room.add_peer(subscriber.clone(), true).await.unwrap();

        let source = Arc::new(StaticSource {
            id: "track-1".into(),
            rid: "".into(),
            kind: "video".into(),
            ssrc: 42,
        });
        room.publish_track(&publisher, source, None).await;

        let track_id = TrackId::from("track-1");
        assert_eq!(room.track_count(), 1);
        assert!(subscriber.has_forwarded_sender(&track_id).await);
        assert!(!publisher.has_forwarded_sender(&track_id).await);

        let forwarder = room.published_tracks.get(&track_id).unwrap().value().clone();
        assert!(forwarder.has_writer(&subscriber.id).await);
        assert_eq!(forwarder.source_peer_id, publisher.id);
    }

    #[tokio::test]
    async fn test_remove_peer_cleans_up_both_directions() {
        let (room, _rx) = make_room(8);
        let publisher = make_peer("u1").await;
        let subscriber = make_peer("u2").await;
        room.add_peer(publisher.clone(), true).await.unwrap();
        room.add_peer(subscriber.clone(), true).await.unwrap();

        let source = Arc::new(StaticSource {
            id: "track-1".into(),
            rid: "".into(),
            kind: "video".into(),
            ssrc: 42,
        });
        room.publish_track(&publisher, source, None).await;
        assert_eq!(room.track_count(), 1);

        room.remove_peer(&publisher.id, true).await.unwrap();

        // No sender anywhere carries the departed publisher's track.
        assert_eq!(room.track_count(), 0);
        assert!(!subscriber.has_forwarded_sender(&TrackId::from("track-1")).await);
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_attach_existing_tracks_on_late_joiner() {
        let (room, _rx) = make_room(8);
        let publisher = make_peer("u1").await;
        room.add_peer(publisher.clone(), true).await.unwrap();
        let source = Arc::new(StaticSource {
            id: "track-1".into(),
            rid: "".into(),
            kind: "video".into(),
            ssrc: 42,
        });
        room.publish_track(&publisher, source, None).await;

        let late = make_peer("u2").await;
        room.add_peer(late.clone(), true).await.unwrap();
        assert!(!late.has_forwarded_sender(&TrackId::from("track-1")).await);

        let attached = room.attach_existing_tracks(&late).await;
        assert_eq!(attached, 1);
        assert!(late.has_forwarded_sender(&TrackId::from("track-1")).await);

        // Idempotent: a second pass attaches nothing.
        assert_eq!(room.attach_existing_tracks(&late).await, 0);
    }

    #[tokio::test]
    async fn test_explicit_subscription_policy_filters_fanout() {
        let (tx, _rx) = mpsc::channel(64);
        let room = Room::new(
            RoomId::from("demo"),
            Arc::new(Config::default()),
            SubscriptionPolicy::new(false),
            tx,
            8,
        );
        let publisher = make_peer("u1").await;
        let wants_it = make_peer("u2").await;
        let does_not = make_peer("u3").await;
        wants_it
            .subscriptions
            .write()
            .unwrap()
            .insert("track-1".to_string());

        room.add_peer(publisher.clone(), true).await.unwrap();
        room.add_peer(wants_it.clone(), true).await.unwrap();
        room.add_peer(does_not.clone(), true).await.unwrap();

        let source = Arc::new(StaticSource {
            id: "track-1".into(),
            rid: "".into(),
            kind: "video".into(),
            ssrc: 42,
        });
        room.publish_track(&publisher, source, None).await;

        assert!(wants_it.has_forwarded_sender(&TrackId::from("track-1")).await);
        assert!(!does_not.has_forwarded_sender(&TrackId::from("track-1")).await);
    }

    #[tokio::test]
    async fn test_peer_events_emitted() {
        let (room, mut rx) = make_room(8);
        let peer = make_peer("u1").await;
        let peer_id = peer.id.clone();
        room.add_peer(peer, true).await.unwrap();
        room.remove_peer(&peer_id, true).await;

        match rx.recv().await.unwrap() {
            RoomEvent::PeerJoined { peer, .. } => assert_eq!(peer.user_id, "u1"),
            other => panic!("expected PeerJoined, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            RoomEvent::PeerLeft { peer_id: left, .. } => assert_eq!(left, peer_id),
            other => panic!("expected PeerLeft, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_room_idle_expiry() {
        let (room, _rx) = make_room(8);
        assert!(room.is_expired(std::time::Duration::from_millis(0)));

        let peer = make_peer("u1").await;
        let peer_id = peer.id.clone();
        room.add_peer(peer, true).await.unwrap();
        assert!(!room.is_expired(std::time::Duration::from_millis(0)));

        room.remove_peer(&peer_id, true).await;
        assert!(room.is_expired(std::time::Duration::from_millis(0)));
    }
}
