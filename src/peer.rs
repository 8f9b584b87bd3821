//! One connected peer: a live media transport plus the negotiation gate,
//! ICE candidate buffer and forwarded-sender bookkeeping that keep SDP
//! exchanges with it well ordered.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::id_types::{PeerId, RoomId, TrackId, UserId};
use crate::speaker::AudioLevelMeter;

/// Explicit negotiation gate. At most one offer/answer transaction is in
/// flight per peer; a client offer arriving mid-transaction is queued and
/// replayed once the current answer is out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Server-initiated offer (ICE restart) awaiting the client's answer.
    OfferInFlight,
    /// A client offer was applied; the answer is being produced.
    AnswerPending,
    /// Server added tracks and asked the client to send a fresh offer.
    PendingRenegotiate,
}

struct NegotiationGate {
    state: NegotiationState,
    queued_offer: Option<String>,
    /// Set once the initial offer/answer exchange completed.
    ready: bool,
}

/// Outcome of handing a client offer to the gate.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Proceed; `initial` is true when the peer had no remote description yet.
    Accepted { initial: bool },
    /// Another transaction is in flight; the offer was queued.
    Queued,
}

pub struct Peer {
    pub id: PeerId,
    pub session_id: String,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub display_name: String,
    pub pc: Arc<RTCPeerConnection>,
    negotiation: StdMutex<NegotiationGate>,
    /// Remote candidates received before the remote description; drained in
    /// arrival order once a description is applied.
    candidate_buffer: StdMutex<Vec<RTCIceCandidateInit>>,
    /// source trackId -> outbound sender carrying it on this connection.
    forwarded_senders: RwLock<HashMap<TrackId, Arc<RTCRtpSender>>>,
    /// Track ids this peer wants under the explicit subscription policy.
    pub subscriptions: StdRwLock<BTreeSet<String>>,
    /// Receive cap in bits/s; 0 means uncapped.
    bandwidth_cap: AtomicU32,
    pub audio_meter: Arc<AudioLevelMeter>,
}

impl Peer {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        session_id: String,
        user_id: UserId,
        room_id: RoomId,
        display_name: String,
    ) -> Self {
        Peer {
            id: PeerId::generate(),
            session_id,
            user_id,
            room_id,
            display_name,
            pc,
            negotiation: StdMutex::new(NegotiationGate {
                state: NegotiationState::Idle,
                queued_offer: None,
                ready: false,
            }),
            candidate_buffer: StdMutex::new(Vec::new()),
            forwarded_senders: RwLock::new(HashMap::new()),
            subscriptions: StdRwLock::new(BTreeSet::new()),
            bandwidth_cap: AtomicU32::new(0),
            audio_meter: Arc::new(AudioLevelMeter::new()),
        }
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.lock().unwrap().state
    }

    pub fn is_ready(&self) -> bool {
        self.negotiation.lock().unwrap().ready
    }

    /// Applies a client offer as the remote description, or queues it when a
    /// transaction is already in flight.
    pub async fn apply_remote_offer(&self, sdp: String) -> Result<OfferDisposition> {
        {
            let mut gate = self.negotiation.lock().unwrap();
            match gate.state {
                NegotiationState::Idle | NegotiationState::PendingRenegotiate => {
                    gate.state = NegotiationState::AnswerPending;
                }
                NegotiationState::OfferInFlight | NegotiationState::AnswerPending => {
                    debug!(peer = %self.id, "Offer while negotiating, queued");
                    gate.queued_offer = Some(sdp);
                    return Ok(OfferDisposition::Queued);
                }
            }
        }

        let initial = self.pc.remote_description().await.is_none();
        let offer = match RTCSessionDescription::offer(sdp) {
            Ok(offer) => offer,
            Err(e) => {
                self.abort_transaction();
                return Err(anyhow::anyhow!("invalid SDP offer: {}", e));
            }
        };
        if let Err(e) = self.pc.set_remote_description(offer).await {
            self.abort_transaction();
            return Err(anyhow::anyhow!("failed to set remote offer: {}", e));
        }
        self.drain_candidates().await;
        Ok(OfferDisposition::Accepted { initial })
    }

    /// Produces and installs the answer for a previously applied offer.
    pub async fn create_answer(&self) -> Result<String> {
        let answer = match self.pc.create_answer(None).await {
            Ok(a) => a,
            Err(e) => {
                self.abort_transaction();
                return Err(anyhow::anyhow!("failed to create answer: {}", e));
            }
        };
        if let Err(e) = self.pc.set_local_description(answer).await {
            self.abort_transaction();
            return Err(anyhow::anyhow!("failed to set local answer: {}", e));
        }

        let local = self
            .pc
            .local_description()
            .await
            .context("no local description after answer")?;
        let mut sdp = local.sdp;
        // Stay DTLS-passive even when the browser offers actpass.
        if sdp.contains("a=setup:active") {
            sdp = sdp.replace("a=setup:active", "a=setup:passive");
            debug!(peer = %self.id, "Rewrote answer to setup:passive");
        }

        let mut gate = self.negotiation.lock().unwrap();
        gate.state = NegotiationState::Idle;
        gate.ready = true;
        Ok(sdp)
    }

    /// Takes the offer queued during the last transaction, if any.
    pub fn take_queued_offer(&self) -> Option<String> {
        self.negotiation.lock().unwrap().queued_offer.take()
    }

    fn abort_transaction(&self) {
        let mut gate = self.negotiation.lock().unwrap();
        gate.state = NegotiationState::Idle;
    }

    /// Applies the client's answer to a server-initiated offer.
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp).context("invalid SDP answer")?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| anyhow::anyhow!("failed to set remote answer: {}", e))?;
        self.drain_candidates().await;

        let mut gate = self.negotiation.lock().unwrap();
        if gate.state == NegotiationState::OfferInFlight {
            gate.state = NegotiationState::Idle;
        }
        Ok(())
    }

    /// Marks this peer as needing a client-driven renegotiation. Returns true
    /// only on the transition out of Idle, so concurrent track adds coalesce
    /// into a single `renegotiate` message.
    pub fn mark_pending_renegotiate(&self) -> bool {
        let mut gate = self.negotiation.lock().unwrap();
        if !gate.ready || gate.state != NegotiationState::Idle {
            return false;
        }
        gate.state = NegotiationState::PendingRenegotiate;
        true
    }

    /// Creates a server-side offer with the ICE-restart flag set.
    pub async fn create_ice_restart_offer(&self) -> Result<String> {
        {
            let mut gate = self.negotiation.lock().unwrap();
            if gate.state != NegotiationState::Idle {
                anyhow::bail!("negotiation already in progress");
            }
            gate.state = NegotiationState::OfferInFlight;
        }

        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = match self.pc.create_offer(Some(options)).await {
            Ok(o) => o,
            Err(e) => {
                self.abort_transaction();
                return Err(anyhow::anyhow!("failed to create restart offer: {}", e));
            }
        };
        if let Err(e) = self.pc.set_local_description(offer).await {
            self.abort_transaction();
            return Err(anyhow::anyhow!("failed to set restart offer: {}", e));
        }
        let local = self
            .pc
            .local_description()
            .await
            .context("no local description after restart offer")?;
        info!(peer = %self.id, "Created ICE restart offer");
        Ok(local.sdp)
    }

    /// Applies a candidate now, or buffers it until the remote description
    /// lands. Candidates never reach the transport before a description.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) {
        if self.pc.remote_description().await.is_some() {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(peer = %self.id, error = %e, "Failed to add ICE candidate");
            }
        } else {
            self.candidate_buffer.lock().unwrap().push(candidate);
        }
    }

    async fn drain_candidates(&self) {
        let buffered: Vec<RTCIceCandidateInit> =
            self.candidate_buffer.lock().unwrap().drain(..).collect();
        for candidate in buffered {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(peer = %self.id, error = %e, "Failed to add buffered ICE candidate");
            }
        }
    }

    pub fn buffered_candidate_count(&self) -> usize {
        self.candidate_buffer.lock().unwrap().len()
    }

    pub async fn insert_forwarded_sender(&self, track_id: TrackId, sender: Arc<RTCRtpSender>) {
        self.forwarded_senders.write().await.insert(track_id, sender);
    }

    pub async fn has_forwarded_sender(&self, track_id: &TrackId) -> bool {
        self.forwarded_senders.read().await.contains_key(track_id)
    }

    /// Closes and removes the sender carrying `track_id`, if present.
    pub async fn remove_forwarded_sender(&self, track_id: &TrackId) -> bool {
        let sender = self.forwarded_senders.write().await.remove(track_id);
        match sender {
            Some(sender) => {
                if let Err(e) = self.pc.remove_track(&sender).await {
                    debug!(peer = %self.id, track = %track_id, error = %e, "remove_track failed");
                }
                true
            }
            None => false,
        }
    }

    /// Count of outbound senders with a live track; the `trackCount` hint in
    /// `renegotiate` messages.
    pub async fn forwarded_sender_count(&self) -> usize {
        self.forwarded_senders.read().await.len()
    }

    pub fn bandwidth_cap(&self) -> u32 {
        self.bandwidth_cap.load(Ordering::Relaxed)
    }

    /// Caps this peer's receive bitrate via REMB on the connection; the cap
    /// is summed across the peer, not split per track. Before the transport
    /// is up the cap is only recorded.
    pub async fn set_bandwidth_cap(&self, bps: u32) {
        self.bandwidth_cap.store(bps, Ordering::Relaxed);
        if bps == 0 || self.pc.connection_state() != RTCPeerConnectionState::Connected {
            return;
        }
        let remb = ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate: bps as f32,
            ssrcs: vec![],
        };
        if let Err(e) = self.pc.write_rtcp(&[Box::new(remb)]).await {
            debug!(peer = %self.id, error = %e, "Failed to send REMB");
        } else {
            info!(peer = %self.id, bps = %bps, "Applied bandwidth cap");
        }
    }

    pub async fn close(&self) {
        self.forwarded_senders.write().await.clear();
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.id, error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    async fn test_peer() -> Peer {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        Peer::new(
            pc,
            "sess-1".to_string(),
            UserId::from("u1"),
            RoomId::from("demo"),
            "Alice".to_string(),
        )
    }

    /// Builds a valid offer SDP from a scratch client-side connection.
    async fn client_offer() -> String {
        let api = APIBuilder::new().build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        offer.sdp
    }

    #[tokio::test]
    async fn test_initial_offer_answer_cycle() {
        let peer = test_peer().await;
        assert_eq!(peer.negotiation_state(), NegotiationState::Idle);
        assert!(!peer.is_ready());

        let disposition = peer.apply_remote_offer(client_offer().await).await.unwrap();
        assert_eq!(disposition, OfferDisposition::Accepted { initial: true });
        assert_eq!(peer.negotiation_state(), NegotiationState::AnswerPending);

        let answer = peer.create_answer().await.unwrap();
        assert!(answer.contains("v=0"));
        assert!(!answer.contains("a=setup:active"));
        assert_eq!(peer.negotiation_state(), NegotiationState::Idle);
        assert!(peer.is_ready());
    }

    #[tokio::test]
    async fn test_offer_during_transaction_is_queued() {
        let peer = test_peer().await;
        let offer = client_offer().await;
        peer.apply_remote_offer(offer.clone()).await.unwrap();

        // Second offer arrives before the answer went out.
        let disposition = peer.apply_remote_offer(offer.clone()).await.unwrap();
        assert_eq!(disposition, OfferDisposition::Queued);

        peer.create_answer().await.unwrap();
        assert_eq!(peer.take_queued_offer(), Some(offer));
        assert_eq!(peer.take_queued_offer(), None);
    }

    #[tokio::test]
    async fn test_pending_renegotiate_coalesces() {
        let peer = test_peer().await;
        // Not ready yet: no renegotiation requests before the initial cycle.
        assert!(!peer.mark_pending_renegotiate());

        peer.apply_remote_offer(client_offer().await).await.unwrap();
        peer.create_answer().await.unwrap();

        assert!(peer.mark_pending_renegotiate());
        // Coalesced while one is outstanding.
        assert!(!peer.mark_pending_renegotiate());
        assert_eq!(peer.negotiation_state(), NegotiationState::PendingRenegotiate);

        // The client's follow-up offer resolves the pending state.
        let disposition = peer.apply_remote_offer(client_offer().await).await.unwrap();
        assert_eq!(disposition, OfferDisposition::Accepted { initial: false });
        peer.create_answer().await.unwrap();
        assert_eq!(peer.negotiation_state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_ice_candidates_buffered_until_description() {
        let peer = test_peer().await;
        let candidate = RTCIceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 127.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        peer.add_ice_candidate(candidate).await;
        assert_eq!(peer.buffered_candidate_count(), 1);

        peer.apply_remote_offer(client_offer().await).await.unwrap();
        assert_eq!(peer.buffered_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_ice_restart_blocks_concurrent_transactions() {
        let peer = test_peer().await;
        peer.apply_remote_offer(client_offer().await).await.unwrap();
        peer.create_answer().await.unwrap();

        let restart_sdp = peer.create_ice_restart_offer().await.unwrap();
        assert!(restart_sdp.contains("v=0"));
        assert_eq!(peer.negotiation_state(), NegotiationState::OfferInFlight);

        // No second server offer while one is in flight.
        assert!(peer.create_ice_restart_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_bandwidth_cap_stored() {
        let peer = test_peer().await;
        assert_eq!(peer.bandwidth_cap(), 0);
        peer.set_bandwidth_cap(750_000).await;
        assert_eq!(peer.bandwidth_cap(), 750_000);
    }

    #[tokio::test]
    async fn test_invalid_offer_resets_gate() {
        let peer = test_peer().await;
        assert!(peer.apply_remote_offer("not sdp".to_string()).await.is_err());
        assert_eq!(peer.negotiation_state(), NegotiationState::Idle);
    }
}
