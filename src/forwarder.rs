//! Per-track RTP fan-out. One `TrackForwarder` exists per published track;
//! it ingests the publisher's RTP (one loop per simulcast layer) and relays
//! packets to one outbound writer per subscriber, without decoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::interceptor::Attributes;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::id_types::{PeerId, TrackId};
use crate::speaker::AudioLevelMeter;

/// Checks whether an RTP payload starts a video keyframe.
/// VP8: RFC 7741 §4.2 (P bit). H.264: RFC 6184 §5.3 (NAL type 5 / FU-A).
fn detect_keyframe(payload: &[u8], mime_type: &str) -> bool {
    if payload.is_empty() {
        return false;
    }
    if mime_type.contains("vp8") {
        (payload[0] & 0x01) == 0
    } else if mime_type.contains("h264") {
        let nal_type = payload[0] & 0x1F;
        if nal_type == 5 {
            true
        } else if nal_type == 28 && payload.len() > 1 {
            let s_bit = (payload[1] & 0x80) != 0;
            let inner_type = payload[1] & 0x1F;
            s_bit && inner_type == 5
        } else {
            false
        }
    } else {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn from_str(kind: &str) -> Self {
        if kind.starts_with("audio") {
            TrackKind::Audio
        } else {
            TrackKind::Video
        }
    }
}

/// Remote RTP source, abstracted for tests.
#[async_trait]
pub trait RtpSource: Send + Sync {
    fn id(&self) -> String;
    fn rid(&self) -> String;
    fn kind(&self) -> String;
    fn ssrc(&self) -> u32;
    fn codec_capability(&self) -> RTCRtpCodecCapability;
    async fn read_rtp(&self) -> Result<(Packet, Attributes)>;
}

#[async_trait]
impl RtpSource for TrackRemote {
    fn id(&self) -> String {
        self.id()
    }
    fn rid(&self) -> String {
        self.rid().to_string()
    }
    fn kind(&self) -> String {
        self.kind().to_string()
    }
    fn ssrc(&self) -> u32 {
        self.ssrc()
    }
    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.codec().capability.clone()
    }
    async fn read_rtp(&self) -> Result<(Packet, Attributes)> {
        self.read_rtp().await.map_err(|e| e.into())
    }
}

/// One subscriber's outbound leg for this track.
pub struct SubscriberWriter {
    pub track: Arc<TrackLocalStaticRTP>,
    /// Which simulcast layer this subscriber currently receives. Empty for
    /// audio and non-simulcast video.
    pub selected_rid: Arc<StdRwLock<String>>,
}

pub struct TrackForwarder {
    pub track_id: TrackId,
    pub source_peer_id: PeerId,
    pub kind: TrackKind,
    pub capability: RTCRtpCodecCapability,
    source_pc: Arc<RTCPeerConnection>,
    /// rid -> ssrc of the ingest layer. Single entry with rid "" when the
    /// publisher does not simulcast.
    layers: StdRwLock<Vec<(String, u32)>>,
    writers: RwLock<HashMap<PeerId, SubscriberWriter>>,
    packets_received: AtomicU64,
    packets_lost: AtomicU64,
    keyframe_seen: AtomicU32,
}

impl TrackForwarder {
    pub fn new(
        track_id: TrackId,
        source_peer_id: PeerId,
        kind: TrackKind,
        capability: RTCRtpCodecCapability,
        source_pc: Arc<RTCPeerConnection>,
    ) -> Self {
        TrackForwarder {
            track_id,
            source_peer_id,
            kind,
            capability,
            source_pc,
            layers: StdRwLock::new(Vec::new()),
            writers: RwLock::new(HashMap::new()),
            packets_received: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            keyframe_seen: AtomicU32::new(0),
        }
    }

    /// Observed simulcast layers, in quality order `l`, `m`, `h`.
    pub fn layers(&self) -> Vec<String> {
        let mut rids: Vec<String> = self
            .layers
            .read()
            .unwrap()
            .iter()
            .map(|(rid, _)| rid.clone())
            .filter(|rid| !rid.is_empty())
            .collect();
        rids.sort_by_key(|rid| match rid.as_str() {
            "l" => 0,
            "m" => 1,
            "h" => 2,
            _ => 3,
        });
        rids
    }

    fn best_rid(&self) -> String {
        self.layers().into_iter().last().unwrap_or_default()
    }

    /// Registers a layer and starts its ingest loop. Returns true if the rid
    /// was not seen before (the layer set grew).
    pub fn add_layer(
        self: &Arc<Self>,
        source: Arc<dyn RtpSource>,
        audio_level: Option<(u8, Arc<AudioLevelMeter>)>,
        max_rtp_errors: u32,
    ) -> bool {
        let rid = source.rid();
        let grew = {
            let mut layers = self.layers.write().unwrap();
            if layers.iter().any(|(r, _)| *r == rid) {
                false
            } else {
                layers.push((rid.clone(), source.ssrc()));
                true
            }
        };

        let forwarder = Arc::clone(self);
        tokio::spawn(async move {
            forwarder.ingest_loop(source, rid, audio_level, max_rtp_errors).await;
        });
        grew
    }

    async fn ingest_loop(
        self: Arc<Self>,
        source: Arc<dyn RtpSource>,
        rid: String,
        audio_level: Option<(u8, Arc<AudioLevelMeter>)>,
        max_rtp_errors: u32,
    ) {
        let track = source.id();
        let mime_type = source.codec_capability().mime_type.to_lowercase();
        info!(track = %track, rid = %rid, "Starting RTP ingest loop");

        let mut last_seq: Option<u16> = None;
        let mut consecutive_errors: u32 = 0;
        loop {
            match source.read_rtp().await {
                Ok((packet, _)) => {
                    consecutive_errors = 0;
                    self.account(&packet, &mut last_seq);
                    if detect_keyframe(&packet.payload, &mime_type) {
                        self.mark_keyframe_seen();
                    }
                    if let Some((ext_id, meter)) = &audio_level {
                        if let Some(ext) = packet.header.get_extension(*ext_id) {
                            if let Some(&byte) = ext.first() {
                                // Level is negative dBov: 0 loud, 127 silent.
                                meter.observe(127u8.saturating_sub(byte & 0x7F));
                            }
                        }
                    }
                    self.relay(&packet, &rid).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > max_rtp_errors {
                        warn!(track = %track, rid = %rid, error = %e, "RTP error budget exhausted, stopping ingest");
                        break;
                    }
                }
            }
        }
        debug!(track = %track, rid = %rid, "RTP ingest loop finished");
    }

    fn account(&self, packet: &Packet, last_seq: &mut Option<u16>) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        if let Some(prev) = *last_seq {
            let expected = prev.wrapping_add(1);
            if packet.header.sequence_number != expected {
                let gap = packet.header.sequence_number.wrapping_sub(expected);
                // Treat large backwards jumps as reordering, not loss.
                if gap < 0x8000 {
                    self.packets_lost.fetch_add(u64::from(gap), Ordering::Relaxed);
                }
            }
        }
        *last_seq = Some(packet.header.sequence_number);
    }

    /// Relays one ingested packet to every writer tuned to this layer.
    pub async fn relay(&self, packet: &Packet, rid: &str) {
        let mut dead: Vec<PeerId> = Vec::new();
        {
            let writers = self.writers.read().await;
            for (peer_id, writer) in writers.iter() {
                if self.kind == TrackKind::Video {
                    let selected = writer.selected_rid.read().unwrap().clone();
                    if selected != rid {
                        continue;
                    }
                }
                if let Err(e) = writer.track.write_rtp(packet).await {
                    debug!(peer = %peer_id, error = %e, "Writer failed, scheduling removal");
                    dead.push(peer_id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut writers = self.writers.write().await;
            for peer_id in dead {
                writers.remove(&peer_id);
            }
        }
    }

    /// Attaches a subscriber. Video writers start on the best observed layer.
    pub async fn add_writer(&self, peer_id: PeerId, track: Arc<TrackLocalStaticRTP>) {
        let selected = if self.kind == TrackKind::Video {
            self.best_rid()
        } else {
            String::new()
        };
        let mut writers = self.writers.write().await;
        writers.insert(
            peer_id.clone(),
            SubscriberWriter {
                track,
                selected_rid: Arc::new(StdRwLock::new(selected)),
            },
        );
        drop(writers);
        info!(track = %self.track_id, peer = %peer_id, "Added writer for track");
        self.request_keyframe().await;
    }

    pub async fn remove_writer(&self, peer_id: &PeerId) -> bool {
        self.writers.write().await.remove(peer_id).is_some()
    }

    pub async fn writer_count(&self) -> usize {
        self.writers.read().await.len()
    }

    pub async fn has_writer(&self, peer_id: &PeerId) -> bool {
        self.writers.read().await.contains_key(peer_id)
    }

    /// Points a subscriber's writer at another simulcast layer. Returns false
    /// if the rid has not been observed on this track.
    pub async fn switch_layer(&self, peer_id: &PeerId, rid: &str) -> bool {
        if !self.layers.read().unwrap().iter().any(|(r, _)| r == rid) {
            return false;
        }
        let writers = self.writers.read().await;
        match writers.get(peer_id) {
            Some(writer) => {
                *writer.selected_rid.write().unwrap() = rid.to_string();
                info!(track = %self.track_id, peer = %peer_id, rid = %rid, "Switched simulcast layer");
                // The new layer needs a fresh keyframe before it decodes.
                drop(writers);
                self.request_keyframe().await;
                true
            }
            None => false,
        }
    }

    pub async fn selected_layer(&self, peer_id: &PeerId) -> Option<String> {
        let writers = self.writers.read().await;
        writers
            .get(peer_id)
            .map(|w| w.selected_rid.read().unwrap().clone())
    }

    /// Cumulative publisher-side loss accounting from sequence-number gaps.
    pub fn loss_stats(&self) -> (u64, u64) {
        (
            self.packets_received.load(Ordering::Relaxed),
            self.packets_lost.load(Ordering::Relaxed),
        )
    }

    pub fn mark_keyframe_seen(&self) {
        self.keyframe_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keyframes_seen(&self) -> u32 {
        self.keyframe_seen.load(Ordering::Relaxed)
    }

    /// Asks the publisher for a keyframe via PLI on every known layer.
    pub async fn request_keyframe(&self) {
        if self.kind != TrackKind::Video {
            return;
        }
        let ssrcs: Vec<u32> = self
            .layers
            .read()
            .unwrap()
            .iter()
            .map(|(_, ssrc)| *ssrc)
            .collect();
        for ssrc in ssrcs {
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: ssrc,
            };
            if let Err(e) = self.source_pc.write_rtcp(&[Box::new(pli)]).await {
                debug!(track = %self.track_id, ssrc = %ssrc, error = %e, "Failed to send PLI");
            }
        }
    }

    /// Burst of delayed keyframe requests to catch receivers that finish
    /// DTLS after the first PLI.
    pub fn schedule_pli_retry(self: Arc<Self>) {
        tokio::spawn(async move {
            for delay_secs in [1u64, 2, 5] {
                tokio::time::sleep(tokio::time::Duration::from_secs(delay_secs)).await;
                self.request_keyframe().await;
            }
        });
    }

    /// Detaches every subscriber; their senders are closed by the peer layer.
    pub async fn close(&self) {
        self.writers.write().await.clear();
    }
}
