//! Packet-loss classification for the per-peer quality loop.

use std::sync::Arc;

use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLevel {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl QualityLevel {
    /// loss% < 0.5 excellent, < 2 good, < 5 poor, else critical.
    pub fn classify(packet_loss_percent: f64) -> Self {
        if packet_loss_percent < 0.5 {
            QualityLevel::Excellent
        } else if packet_loss_percent < 2.0 {
            QualityLevel::Good
        } else if packet_loss_percent < 5.0 {
            QualityLevel::Poor
        } else {
            QualityLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Poor => "poor",
            QualityLevel::Critical => "critical",
        }
    }

    pub fn needs_downgrade(&self) -> bool {
        matches!(self, QualityLevel::Poor | QualityLevel::Critical)
    }

    /// Simulcast layer a struggling subscriber is dropped to.
    pub fn downgrade_rid(&self) -> &'static str {
        match self {
            QualityLevel::Critical => "l",
            _ => "m",
        }
    }
}

pub fn loss_percent(packets_received: u64, packets_lost: u64) -> f64 {
    (packets_lost as f64 / packets_received.max(1) as f64) * 100.0
}

/// Total outbound RTP packets across a connection, from the library's stats
/// reports. Used by the admin surface, not the quality loop.
pub async fn outbound_packets_sent(pc: &Arc<RTCPeerConnection>) -> u64 {
    let stats = pc.get_stats().await;
    let mut total = 0;
    for (_key, stat) in stats.reports.iter() {
        if let StatsReportType::OutboundRTP(rtp) = stat {
            total += rtp.packets_sent;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(QualityLevel::classify(0.0), QualityLevel::Excellent);
        assert_eq!(QualityLevel::classify(0.49), QualityLevel::Excellent);
        assert_eq!(QualityLevel::classify(0.5), QualityLevel::Good);
        assert_eq!(QualityLevel::classify(1.99), QualityLevel::Good);
        assert_eq!(QualityLevel::classify(2.0), QualityLevel::Poor);
        assert_eq!(QualityLevel::classify(4.99), QualityLevel::Poor);
        assert_eq!(QualityLevel::classify(5.0), QualityLevel::Critical);
        assert_eq!(QualityLevel::classify(60.0), QualityLevel::Critical);
    }

    #[test]
    fn test_loss_percent_guard_against_zero() {
        assert_eq!(loss_percent(0, 0), 0.0);
        assert_eq!(loss_percent(0, 3), 300.0);
        assert!((loss_percent(200, 1) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_downgrade_targets() {
        assert!(!QualityLevel::Good.needs_downgrade());
        assert!(QualityLevel::Poor.needs_downgrade());
        assert_eq!(QualityLevel::Poor.downgrade_rid(), "m");
        assert_eq!(QualityLevel::Critical.downgrade_rid(), "l");
    }
}
