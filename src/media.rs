use anyhow::{Context, Result};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

use crate::config::Config;

/// RTP header extension URI carrying the speaker audio level.
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

pub struct MediaSetup;

impl MediaSetup {
    /// Builds the WebRTC API with the codec set and header extensions this
    /// SFU negotiates, plus the transport settings from config.
    pub fn create_webrtc_api(config: &Config) -> Result<webrtc::api::API> {
        let mut media_engine = MediaEngine::default();

        // Opus with FEC and low latency settings
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "audio/opus".to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        ..Default::default()
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .context("Failed to register Opus codec")?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/VP8".to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_owned(),
                        ..Default::default()
                    },
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .context("Failed to register VP8 codec")?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/H264".to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line:
                            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                                .to_owned(),
                        ..Default::default()
                    },
                    payload_type: 102,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .context("Failed to register H264 codec")?;

        // mid + rid extensions let browsers tag simulcast layers; audio-level
        // feeds the dominant speaker detector.
        let extensions = vec![
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            AUDIO_LEVEL_URI,
            "urn:ietf:params:rtp-hdrext:toffset",
            "urn:3gpp:video-orientation",
        ];

        for extension in extensions {
            let _ = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Video,
                None,
            );
            let _ = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Audio,
                None,
            );
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        if config.udp_port_max > 0 {
            let udp = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .context("Invalid UDP port range")?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp));
        }
        if let Some(public_ip) = &config.public_ip {
            setting_engine
                .set_nat_1to1_ips(vec![public_ip.clone()], RTCIceCandidateType::Host);
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    pub fn rtc_config(config: &Config) -> RTCConfiguration {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|entry| RTCIceServer {
                urls: vec![entry.url.clone()],
                username: entry.username.clone().unwrap_or_default(),
                credential: entry.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_creates_peer_connection() {
        let config = Config::default();
        let api = MediaSetup::create_webrtc_api(&config).unwrap();
        let pc = api.new_peer_connection(MediaSetup::rtc_config(&config)).await;
        assert!(pc.is_ok(), "API should be able to create a PeerConnection");
    }

    #[test]
    fn test_rtc_config_carries_turn_credentials() {
        let mut config = Config::default();
        config.ice_servers = vec![crate::config::IceServerConfig {
            url: "turn:turn.example.org:3478".into(),
            username: Some("alice".into()),
            credential: Some("s3cret".into()),
        }];
        let rtc = MediaSetup::rtc_config(&config);
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].username, "alice");
    }
}
