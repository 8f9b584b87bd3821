//! The orchestrator binds the layers together: it dispatches parsed
//! signaling frames to session/room/peer operations, pumps room events back
//! out as signaling messages, and owns instance-wide lifecycle (cleanup
//! tickers, shutdown).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::config::Config;
use crate::errors::{SfuError, SfuResult};
use crate::forwarder::RtpSource;
use crate::hub::{ClientHandle, SignalingHub};
use crate::id_types::{ClientId, PeerId, RoomId, TrackId, UserId};
use crate::media::{MediaSetup, AUDIO_LEVEL_URI};
use crate::messages::{
    self, AllowRenegotiation, DominantSpeaker, Envelope, ErrorMessage, IceCandidate, JoinRequest,
    JoinResponse, LayerSwitch, QualityStats, Renegotiate, RoomState, Sdp, SetBandwidthLimit,
};
use crate::metrics::{
    SFU_ERRORS_TOTAL, SFU_ICE_RESTART_TOTAL, SFU_MESSAGES_RECEIVED_TOTAL,
};
use crate::peer::{NegotiationState, OfferDisposition, Peer};
use crate::registry::RoomRegistry;
use crate::room::{Room, RoomEvent, RoomStats};
use crate::session::SessionManager;
use crate::store::StateStore;
use crate::subscriptions::SubscriptionPolicy;

/// Identifier charset: `[A-Za-z0-9_.-]+`, bounded length.
pub fn validate_id(value: &str, max_len: usize, field: &str) -> SfuResult<()> {
    if value.is_empty() {
        return Err(SfuError::Validation(format!("{} must not be empty", field)));
    }
    if value.len() > max_len {
        return Err(SfuError::Validation(format!(
            "{} exceeds {} characters",
            field, max_len
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(SfuError::Validation(format!(
            "{} contains invalid characters",
            field
        )));
    }
    Ok(())
}

const ROOM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_TICK: Duration = Duration::from_secs(30);
const MAX_DISPLAY_NAME: usize = 128;

pub struct Sfu {
    pub config: Arc<Config>,
    api: Arc<webrtc::api::API>,
    pub hub: Arc<SignalingHub>,
    pub sessions: Arc<SessionManager>,
    pub rooms: Arc<RoomRegistry>,
    pub store: Arc<dyn StateStore>,
    pub store_configured: bool,
    policy: SubscriptionPolicy,
    events_tx: mpsc::Sender<RoomEvent>,
    /// peerId -> the client currently driving it.
    peer_clients: DashMap<PeerId, ClientId>,
    shutdown_tx: watch::Sender<bool>,
    pub instance_id: String,
}

impl Sfu {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn StateStore>,
        store_configured: bool,
    ) -> anyhow::Result<Arc<Self>> {
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let api = Arc::new(MediaSetup::create_webrtc_api(&config)?);
        let hub = SignalingHub::new(store.clone(), instance_id.clone());
        let sessions = Arc::new(SessionManager::new(store.clone(), config.session_ttl));
        let rooms = Arc::new(RoomRegistry::new(config.max_rooms));
        let policy = SubscriptionPolicy::new(config.auto_subscribe);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        let sfu = Arc::new(Sfu {
            config,
            api,
            hub,
            sessions,
            rooms,
            store,
            store_configured,
            policy,
            events_tx,
            peer_clients: DashMap::new(),
            shutdown_tx,
            instance_id,
        });
        sfu.spawn_event_pump(events_rx);
        sfu.spawn_cleanup_tasks();
        sfu.hub.start_bridge();
        Ok(sfu)
    }

    /// Startup hook: loads persisted sessions into the local index.
    pub async fn recover_sessions(&self) {
        let recovered = self.sessions.recover().await;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Sessions recovered from store");
        }
    }

    /// Dispatches one inbound frame. Returns false when the connection must
    /// be closed afterwards.
    pub async fn dispatch(self: &Arc<Self>, client: &Arc<ClientHandle>, raw: &str) -> bool {
        SFU_MESSAGES_RECEIVED_TOTAL.inc();

        if !client.bucket.try_acquire() {
            return self.reject(client, SfuError::RateLimited);
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => return self.reject(client, err),
        };

        let result = match envelope.kind.as_str() {
            "join" => self.handle_join(client, &envelope).await,
            "leave" => self.handle_leave(client).await,
            "offer" => self.handle_offer(client, &envelope).await,
            "answer" => self.handle_answer(client, &envelope).await,
            "ice-candidate" => self.handle_ice_candidate(client, &envelope).await,
            "ice-restart-request" => self.handle_ice_restart(client).await,
            "isAllowRenegotiation" => self.handle_allow_renegotiation(client).await,
            "setBandwidthLimit" => self.handle_bandwidth_limit(client, &envelope).await,
            "layer-switch" => self.handle_layer_switch(client, &envelope).await,
            "ping" => {
                self.hub.send_to_client(&client.id, &Envelope::bare("pong"));
                Ok(())
            }
            "pong" => Ok(()),
            other => Err(SfuError::Validation(format!(
                "unknown message type: {}",
                other
            ))),
        };

        match result {
            Ok(()) => true,
            Err(err) => self.reject(client, err),
        }
    }

    fn reject(&self, client: &Arc<ClientHandle>, err: SfuError) -> bool {
        SFU_ERRORS_TOTAL.inc();
        debug!(client = %client.id, code = err.code(), error = %err, "Rejecting message");
        self.hub
            .send_to_client(&client.id, &ErrorMessage::from_error(&err));
        err.keeps_connection()
    }

    async fn handle_join(self: &Arc<Self>, client: &Arc<ClientHandle>, env: &Envelope) -> SfuResult<()> {
        let req: JoinRequest = env.payload()?;
        validate_id(&req.room_id, self.config.max_room_id_length, "roomId")?;
        validate_id(&req.user_id, self.config.max_user_id_length, "userId")?;
        if client.user_id.as_ref() != req.user_id {
            return Err(SfuError::Validation(
                "userId does not match this connection".into(),
            ));
        }
        if client.current_peer().is_some() {
            return Err(SfuError::Validation("already joined".into()));
        }

        let room_id = RoomId::from(req.room_id.as_str());
        let user_id = UserId::from(req.user_id.as_str());
        let mut display_name = if req.name.is_empty() {
            client.display_name.clone()
        } else {
            req.name.clone()
        };
        display_name.truncate(MAX_DISPLAY_NAME);

        // Resume if credentials check out for this exact pairing, else a
        // fresh (or reactivated) session.
        let mut resumed = false;
        let session = match (&req.session_id, &req.token) {
            (Some(id), Some(token)) => match self.sessions.resume(id, token).await {
                Ok(s) if s.room_id == req.room_id && s.user_id == req.user_id => {
                    resumed = true;
                    s
                }
                Ok(_) => {
                    debug!(client = %client.id, "Resumed session is for another pairing, creating fresh");
                    self.sessions.create(&user_id, &room_id, &display_name).await
                }
                Err(_) => self.sessions.create(&user_id, &room_id, &display_name).await,
            },
            _ => self.sessions.create(&user_id, &room_id, &display_name).await,
        };

        // Page-refresh races: stale sockets of this user go first.
        self.hub.evict_by_user_id(&user_id, &client.id);

        let room = self.rooms.get_or_create(&room_id, || {
            let room = Room::new(
                room_id.clone(),
                self.config.clone(),
                self.policy,
                self.events_tx.clone(),
                self.config.max_peers_per_room,
            );
            room.start_background_tasks(self.shutdown_tx.subscribe());
            room
        })?;

        let pc = self
            .api
            .new_peer_connection(MediaSetup::rtc_config(&self.config))
            .await
            .map_err(|e| SfuError::Transport(e.to_string()))?;
        let peer = Arc::new(Peer::new(
            Arc::new(pc),
            session.id.clone(),
            user_id.clone(),
            room_id.clone(),
            display_name,
        ));
        *peer.subscriptions.write().unwrap() = session.subscriptions.clone();
        // Default receive budget; an explicit setBandwidthLimit overrides it.
        let default_cap = self
            .config
            .max_video_bitrate
            .saturating_add(self.config.max_audio_bitrate);
        peer.set_bandwidth_cap(default_cap).await;
        self.wire_peer_handlers(&room, &peer);

        // add_peer atomically evicts and tears down this user's previous
        // peer (the reconnect race of §5); only the client map is ours.
        let evicted = match room.add_peer(peer.clone(), !resumed).await {
            Ok(evicted) => evicted,
            Err(err) => {
                peer.close().await;
                return Err(err);
            }
        };
        if let Some(old) = evicted {
            self.peer_clients.remove(&old.id);
        }

        *client.peer_id.write().unwrap() = Some(peer.id.clone());
        *client.session_id.write().unwrap() = Some(session.id.clone());
        self.hub.assign_room(&client.id, &room_id);
        self.peer_clients.insert(peer.id.clone(), client.id.clone());
        self.sessions
            .update_peer_id(&session.id, peer.id.as_ref())
            .await;

        info!(room = %room_id, user = %user_id, peer = %peer.id, resumed = resumed, "Peer joined");

        self.hub.send_to_client(
            &client.id,
            &Envelope::new(
                "join",
                &JoinResponse {
                    success: true,
                    peer_id: peer.id.to_string(),
                    session_id: session.id.clone(),
                    token: session.token.clone(),
                    resumed,
                },
            ),
        );
        let peers = room.peer_infos_excluding(&peer.id).await;
        self.hub.send_to_client(
            &client.id,
            &Envelope::new(
                "room-state",
                &RoomState {
                    room_id: room_id.to_string(),
                    peers,
                },
            ),
        );
        Ok(())
    }

    /// Attaches transport callbacks: ICE candidates and transport failures
    /// flow into the event sink; inbound tracks into the room's registry.
    fn wire_peer_handlers(self: &Arc<Self>, room: &Arc<Room>, peer: &Arc<Peer>) {
        let events = self.events_tx.clone();
        let room_id = room.id.clone();
        let peer_id = peer.id.clone();
        peer.pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            let room_id = room_id.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else {
                    warn!(peer = %peer_id, "Failed to serialize ICE candidate");
                    return;
                };
                let _ = events
                    .send(RoomEvent::IceCandidate {
                        room_id,
                        peer_id,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    })
                    .await;
            })
        }));

        let events = self.events_tx.clone();
        let room_id = room.id.clone();
        let peer_id = peer.id.clone();
        peer.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let room_id = room_id.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!(peer = %peer_id, state = %state, "Peer connection state changed");
                    if state == RTCPeerConnectionState::Failed {
                        let _ = events
                            .send(RoomEvent::TransportFailed { room_id, peer_id })
                            .await;
                    }
                })
            }));

        let room_for_track = Arc::downgrade(room);
        let peer_for_track = peer.clone();
        peer.pc.on_track(Box::new(move |track, receiver, _transceiver| {
            let room = room_for_track.clone();
            let publisher = peer_for_track.clone();
            Box::pin(async move {
                let Some(room) = room.upgrade() else { return };
                let audio_level_ext = receiver
                    .get_parameters()
                    .await
                    .header_extensions
                    .iter()
                    .find(|ext| ext.uri == AUDIO_LEVEL_URI)
                    .map(|ext| ext.id as u8);
                let source: Arc<dyn RtpSource> = track;
                room.publish_track(&publisher, source, audio_level_ext).await;
            })
        }));
    }

    async fn client_room_peer(
        &self,
        client: &Arc<ClientHandle>,
    ) -> SfuResult<(Arc<Room>, Arc<Peer>, PeerId)> {
        let room_id = client
            .current_room()
            .ok_or_else(|| SfuError::NotFound("not in a room".into()))?;
        let peer_id = client
            .current_peer()
            .ok_or_else(|| SfuError::NotFound("no active peer".into()))?;
        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| SfuError::NotFound(format!("room {} not found", room_id)))?;
        let peer = room
            .get_peer(&peer_id)
            .await
            .ok_or_else(|| SfuError::NotFound("peer not found in room".into()))?;
        Ok((room, peer, peer_id))
    }

    async fn handle_offer(self: &Arc<Self>, client: &Arc<ClientHandle>, env: &Envelope) -> SfuResult<()> {
        let sdp: Sdp = env.payload()?;
        let (room, peer, _) = self.client_room_peer(client).await?;

        let disposition = peer
            .apply_remote_offer(sdp.sdp)
            .await
            .map_err(|e| SfuError::Validation(e.to_string()))?;

        match disposition {
            OfferDisposition::Accepted { initial } => {
                if initial {
                    let attached = room.attach_existing_tracks(&peer).await;
                    if attached > 0 {
                        debug!(peer = %peer.id, count = attached, "Attached existing tracks before answer");
                    }
                }
                self.answer_and_flush(client, &peer).await?;
            }
            OfferDisposition::Queued => {}
        }
        Ok(())
    }

    /// Sends the answer for the current transaction, then replays any offer
    /// queued while it was in flight.
    async fn answer_and_flush(&self, client: &Arc<ClientHandle>, peer: &Arc<Peer>) -> SfuResult<()> {
        let answer = peer
            .create_answer()
            .await
            .map_err(|e| SfuError::Validation(e.to_string()))?;
        self.hub
            .send_to_client(&client.id, &Envelope::new("answer", &Sdp { sdp: answer }));

        while let Some(queued) = peer.take_queued_offer() {
            let disposition = peer
                .apply_remote_offer(queued)
                .await
                .map_err(|e| SfuError::Validation(e.to_string()))?;
            if let OfferDisposition::Accepted { .. } = disposition {
                let answer = peer
                    .create_answer()
                    .await
                    .map_err(|e| SfuError::Validation(e.to_string()))?;
                self.hub
                    .send_to_client(&client.id, &Envelope::new("answer", &Sdp { sdp: answer }));
            }
        }
        Ok(())
    }

    async fn handle_answer(&self, client: &Arc<ClientHandle>, env: &Envelope) -> SfuResult<()> {
        let sdp: Sdp = env.payload()?;
        let (_, peer, _) = self.client_room_peer(client).await?;
        peer.apply_remote_answer(sdp.sdp)
            .await
            .map_err(|e| SfuError::Validation(e.to_string()))
    }

    async fn handle_ice_candidate(&self, client: &Arc<ClientHandle>, env: &Envelope) -> SfuResult<()> {
        let candidate: IceCandidate = env.payload()?;
        let (_, peer, _) = self.client_room_peer(client).await?;
        peer.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await;
        Ok(())
    }

    async fn handle_ice_restart(&self, client: &Arc<ClientHandle>) -> SfuResult<()> {
        let (_, peer, _) = self.client_room_peer(client).await?;
        let sdp = peer
            .create_ice_restart_offer()
            .await
            .map_err(|e| SfuError::Validation(e.to_string()))?;
        SFU_ICE_RESTART_TOTAL.inc();
        self.hub.send_to_client(
            &client.id,
            &Envelope::new("ice-restart-offer", &Sdp { sdp }),
        );
        Ok(())
    }

    async fn handle_allow_renegotiation(&self, client: &Arc<ClientHandle>) -> SfuResult<()> {
        let allowed = match self.client_room_peer(client).await {
            Ok((_, peer, _)) => matches!(
                peer.negotiation_state(),
                NegotiationState::Idle | NegotiationState::PendingRenegotiate
            ),
            Err(_) => false,
        };
        self.hub.send_to_client(
            &client.id,
            &Envelope::new("isAllowRenegotiation", &AllowRenegotiation { allowed }),
        );
        Ok(())
    }

    async fn handle_bandwidth_limit(&self, client: &Arc<ClientHandle>, env: &Envelope) -> SfuResult<()> {
        let limit: SetBandwidthLimit = env.payload()?;
        let (_, peer, _) = self.client_room_peer(client).await?;
        peer.set_bandwidth_cap(limit.bps).await;
        Ok(())
    }

    async fn handle_layer_switch(&self, client: &Arc<ClientHandle>, env: &Envelope) -> SfuResult<()> {
        let switch: LayerSwitch = env.payload()?;
        let (room, _, peer_id) = self.client_room_peer(client).await?;
        room.switch_layer(&peer_id, &TrackId::from(switch.track_id.as_str()), &switch.rid)
            .await
    }

    async fn handle_leave(&self, client: &Arc<ClientHandle>) -> SfuResult<()> {
        let (room, peer, peer_id) = self.client_room_peer(client).await?;
        room.remove_peer(&peer_id, true).await;
        peer.close().await;
        self.peer_clients.remove(&peer_id);
        *client.peer_id.write().unwrap() = None;
        Ok(())
    }

    /// Socket-gone path: tears down the peer and suspends the session so the
    /// user can resume within the TTL. The departure is not announced; to
    /// the rest of the room a resumable session never left. The room learns
    /// of the user for good only when the session expires or a new peer
    /// takes over.
    pub async fn client_disconnected(&self, client: &Arc<ClientHandle>) {
        if let (Some(room_id), Some(peer_id)) = (client.current_room(), client.current_peer()) {
            if let Some(room) = self.rooms.get(&room_id) {
                if let Some(peer) = room.remove_peer(&peer_id, false).await {
                    peer.close().await;
                }
            }
            self.peer_clients.remove(&peer_id);

            if let Some(session_id) = client.current_session() {
                // Only suspend if this peer is still the session's current
                // one; a newer connection may have taken the session over.
                if let Some(session) = self.sessions.lookup(&session_id).await {
                    if session.current_peer_id.as_deref() == Some(peer_id.as_ref()) {
                        self.sessions.suspend(&session_id).await;
                    }
                }
            }
        }
        self.hub.unregister(&client.id);
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events_rx: mpsc::Receiver<RoomEvent>) {
        let sfu = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(sfu) = sfu.upgrade() else { break };
                sfu.handle_room_event(event).await;
            }
        });
    }

    fn send_to_peer(&self, peer_id: &PeerId, envelope: &Envelope) {
        if let Some(client_id) = self.peer_clients.get(peer_id).map(|e| e.value().clone()) {
            self.hub.send_to_client(&client_id, envelope);
        }
    }

    async fn handle_room_event(self: &Arc<Self>, event: RoomEvent) {
        match event {
            RoomEvent::PeerJoined { room_id, peer } => {
                let exclude = self
                    .peer_clients
                    .get(&PeerId::from(peer.peer_id.as_str()))
                    .map(|e| e.value().clone());
                self.hub
                    .broadcast_room_all(&room_id, &Envelope::new("peer-joined", &peer), exclude.as_ref())
                    .await;
            }
            RoomEvent::PeerLeft {
                room_id,
                peer_id,
                user_id,
            } => {
                self.peer_clients.remove(&peer_id);
                self.hub
                    .broadcast_room_all(
                        &room_id,
                        &Envelope::new(
                            "peer-left",
                            &messages::PeerLeft {
                                peer_id: peer_id.to_string(),
                                user_id: user_id.to_string(),
                            },
                        ),
                        None,
                    )
                    .await;
            }
            RoomEvent::RenegotiationNeeded {
                peer_id,
                reason,
                track_count,
                ..
            } => {
                self.send_to_peer(
                    &peer_id,
                    &Envelope::new(
                        "renegotiate",
                        &Renegotiate {
                            reason,
                            track_count,
                        },
                    ),
                );
            }
            RoomEvent::IceCandidate {
                peer_id, candidate, ..
            } => {
                self.send_to_peer(&peer_id, &Envelope::new("ice-candidate", &candidate));
            }
            RoomEvent::LayerAvailable {
                room_id,
                track_id,
                layers,
            } => {
                self.hub
                    .broadcast_room_all(
                        &room_id,
                        &Envelope::new(
                            "layer-available",
                            &messages::LayerAvailable {
                                track_id: track_id.to_string(),
                                layers,
                            },
                        ),
                        None,
                    )
                    .await;
            }
            RoomEvent::DominantSpeakerChanged { room_id, peer_id } => {
                self.hub
                    .broadcast_room_all(
                        &room_id,
                        &Envelope::new(
                            "dominant-speaker",
                            &DominantSpeaker {
                                new_peer_id: peer_id.map(|p| p.to_string()),
                            },
                        ),
                        None,
                    )
                    .await;
            }
            RoomEvent::QualityStats {
                peer_id,
                level,
                packet_loss,
                ..
            } => {
                self.send_to_peer(
                    &peer_id,
                    &Envelope::new(
                        "quality-stats",
                        &QualityStats {
                            peer_id: peer_id.to_string(),
                            level: level.as_str().to_string(),
                            packet_loss,
                        },
                    ),
                );
            }
            RoomEvent::TransportFailed { room_id, peer_id } => {
                self.handle_transport_failed(room_id, peer_id).await;
            }
        }
    }

    async fn handle_transport_failed(&self, room_id: RoomId, peer_id: PeerId) {
        warn!(room = %room_id, peer = %peer_id, "Transport failed, closing peer");
        let Some(room) = self.rooms.get(&room_id) else {
            return;
        };
        // Not announced: the session stays resumable within its TTL.
        let Some(peer) = room.remove_peer(&peer_id, false).await else {
            return; // already evicted by a reconnect
        };
        let session_id = peer.session_id.clone();
        peer.close().await;
        self.peer_clients.remove(&peer_id);

        if let Some(session) = self.sessions.lookup(&session_id).await {
            if session.current_peer_id.as_deref() == Some(peer_id.as_ref()) {
                self.sessions.suspend(&session_id).await;
            }
        }
    }

    fn spawn_cleanup_tasks(self: &Arc<Self>) {
        let sfu = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(sfu) = sfu.upgrade() else { break };
                        sfu.cleanup_tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn cleanup_tick(&self) {
        for room in self.rooms.all() {
            if room.peer_count().await == 0 && room.is_expired(ROOM_IDLE_TIMEOUT) {
                info!(room = %room.id, "Removing idle room");
                if let Some(room) = self.rooms.remove(&room.id) {
                    room.close().await;
                }
            }
        }
        // Sessions that expired without resuming are now announced as gone;
        // their suspension was invisible to the room.
        let expired = self.sessions.gc_expired(self.config.session_ttl).await;
        for session in &expired {
            let Some(peer_id) = &session.current_peer_id else {
                continue;
            };
            self.hub
                .broadcast_room_all(
                    &RoomId::from(session.room_id.as_str()),
                    &Envelope::new(
                        "peer-left",
                        &messages::PeerLeft {
                            peer_id: peer_id.clone(),
                            user_id: session.user_id.clone(),
                        },
                    ),
                    None,
                )
                .await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired suspended sessions");
        }
    }

    pub async fn total_peer_count(&self) -> usize {
        let mut total = 0;
        for room in self.rooms.all() {
            total += room.peer_count().await;
        }
        total
    }

    pub async fn room_stats_list(&self) -> Vec<RoomStats> {
        let mut out = Vec::new();
        for room in self.rooms.all() {
            out.push(room.stats().await);
        }
        out
    }

    /// Admin surface: pre-create a room with an optional peer cap.
    pub async fn create_room(&self, name: &str, max_peers: Option<usize>) -> SfuResult<RoomStats> {
        validate_id(name, self.config.max_room_id_length, "roomId")?;
        let room_id = RoomId::from(name);
        let room = self.rooms.get_or_create(&room_id, || {
            let room = Room::new(
                room_id.clone(),
                self.config.clone(),
                self.policy,
                self.events_tx.clone(),
                max_peers.unwrap_or(self.config.max_peers_per_room),
            );
            room.start_background_tasks(self.shutdown_tx.subscribe());
            room
        })?;
        Ok(room.stats().await)
    }

    pub async fn close_room(&self, room_id: &RoomId) -> bool {
        match self.rooms.remove(room_id) {
            Some(room) => {
                room.close().await;
                // A closed room must not stay resumable: drop every session
                // attached to it, suspended ones included.
                for session_id in self.sessions.sessions_in_room(room_id.as_ref()).await {
                    self.sessions.delete(&session_id).await;
                }
                true
            }
            None => false,
        }
    }

    pub async fn store_healthy(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.store.ping())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Stops everything: rooms (closing peers and transports), then client
    /// queues, which flush before their sockets close.
    pub async fn shutdown(&self) {
        info!("Shutting down SFU");
        let _ = self.shutdown_tx.send(true);
        for room in self.rooms.all() {
            if let Some(room) = self.rooms.remove(&room.id) {
                room.close().await;
            }
        }
        // Unregister queues a Close frame behind whatever is pending, so
        // each write loop flushes its queue and then closes the socket.
        for client_id in self.hub.all_client_ids() {
            self.hub.unregister(&client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_validate_id_accepts_charset() {
        assert!(validate_id("room-1.test_A", 64, "roomId").is_ok());
        assert!(validate_id("demo", 64, "roomId").is_ok());
    }

    #[test]
    fn test_validate_id_rejects_bad_input() {
        assert!(matches!(
            validate_id("", 64, "roomId"),
            Err(SfuError::Validation(_))
        ));
        assert!(matches!(
            validate_id("room with spaces", 64, "roomId"),
            Err(SfuError::Validation(_))
        ));
        assert!(matches!(
            validate_id("room/slash", 64, "roomId"),
            Err(SfuError::Validation(_))
        ));
        // One past the bound.
        let long = "a".repeat(65);
        assert!(matches!(
            validate_id(&long, 64, "roomId"),
            Err(SfuError::Validation(_))
        ));
        assert!(validate_id(&"a".repeat(64), 64, "roomId").is_ok());
    }

    fn test_sfu() -> Arc<Sfu> {
        let config = Arc::new(Config::default());
        Sfu::new(config, Arc::new(MemoryStore::new()), false).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_validation_error() {
        let sfu = test_sfu();
        let (client, mut rx) = ClientHandle::new(UserId::from("u1"), "U".into(), 20, 40);
        sfu.hub.register(client.clone());

        let keep = sfu
            .dispatch(&client, r#"{"type":"warp-drive","data":{}}"#)
            .await;
        assert!(keep);
        match rx.recv().await.unwrap() {
            crate::hub::HubFrame::Text(text) => {
                assert!(text.contains("\"error\""));
                assert!(text.contains("400"));
            }
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_429() {
        let sfu = test_sfu();
        // Tiny bucket: 1 token, no practical refill.
        let (client, mut rx) = ClientHandle::new(UserId::from("u1"), "U".into(), 1, 1);
        sfu.hub.register(client.clone());

        assert!(sfu.dispatch(&client, r#"{"type":"ping"}"#).await);
        let _pong = rx.recv().await.unwrap();

        assert!(sfu.dispatch(&client, r#"{"type":"ping"}"#).await);
        match rx.recv().await.unwrap() {
            crate::hub::HubFrame::Text(text) => {
                assert!(text.contains("429"));
                assert!(text.contains("Rate limit exceeded"));
            }
            other => panic!("expected 429 frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_without_join_is_not_found() {
        let sfu = test_sfu();
        let (client, mut rx) = ClientHandle::new(UserId::from("u1"), "U".into(), 20, 40);
        sfu.hub.register(client.clone());

        assert!(
            sfu.dispatch(&client, r#"{"type":"offer","data":{"sdp":"v=0"}}"#)
                .await
        );
        match rx.recv().await.unwrap() {
            crate::hub::HubFrame::Text(text) => assert!(text.contains("404")),
            other => panic!("expected 404 frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_rejects_mismatched_user() {
        let sfu = test_sfu();
        let (client, mut rx) = ClientHandle::new(UserId::from("u1"), "U".into(), 20, 40);
        sfu.hub.register(client.clone());

        let frame = r#"{"type":"join","data":{"roomId":"demo","userId":"someone-else"}}"#;
        assert!(sfu.dispatch(&client, frame).await);
        match rx.recv().await.unwrap() {
            crate::hub::HubFrame::Text(text) => assert!(text.contains("400")),
            other => panic!("expected 400 frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admin_room_create_and_close() {
        let sfu = test_sfu();
        let stats = sfu.create_room("ops-room", Some(4)).await.unwrap();
        assert_eq!(stats.id, "ops-room");
        assert_eq!(stats.peer_count, 0);
        assert_eq!(sfu.rooms.len(), 1);

        assert!(sfu.close_room(&RoomId::from("ops-room")).await);
        assert!(!sfu.close_room(&RoomId::from("ops-room")).await);
        assert_eq!(sfu.rooms.len(), 0);
    }

    #[tokio::test]
    async fn test_store_health_reflects_ping() {
        let sfu = test_sfu();
        assert!(sfu.store_healthy().await);
    }

    #[tokio::test]
    async fn test_close_room_drops_its_sessions() {
        let sfu = test_sfu();
        let (client, mut rx) = ClientHandle::new(UserId::from("u1"), "U".into(), 20, 40);
        sfu.hub.register(client.clone());
        assert!(
            sfu.dispatch(&client, r#"{"type":"join","data":{"roomId":"demo","userId":"u1"}}"#)
                .await
        );

        let session_id = match rx.recv().await.unwrap() {
            crate::hub::HubFrame::Text(text) => {
                let join: serde_json::Value = serde_json::from_str(&text).unwrap();
                join["data"]["sessionId"].as_str().unwrap().to_string()
            }
            other => panic!("expected join frame, got {:?}", other),
        };
        assert!(sfu.sessions.get(&session_id).is_some());

        assert!(sfu.close_room(&RoomId::from("demo")).await);
        assert!(
            sfu.sessions.get(&session_id).is_none(),
            "sessions of a deleted room must not survive"
        );
        assert!(sfu.sessions.lookup(&session_id).await.is_none());
    }
}
