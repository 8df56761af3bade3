use std::sync::Arc;

use anyhow::Context;
use relay_protocol::IceConfig;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

/// Process-global handle to the media engine. Built exactly once at
/// startup and handed by value (as an `Arc`) to both endpoints — every
/// peer connection in the process is built from this one `API` so that
/// track references created on one peer connection can be forwarded into
/// another.
pub struct MediaFactory {
    api: API,
    ice_config: IceConfig,
}

impl MediaFactory {
    pub fn new(ice_config: IceConfig) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line:
                            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                                .to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 102,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .context("Failed to register H.264 codec")?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .context("Failed to register Opus codec")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_config })
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: vec![format!(
                "turn:{}:{}?transport=tcp",
                self.ice_config.turn_host, self.ice_config.turn_port
            )],
            username: self.ice_config.turn_username.clone().unwrap_or_default(),
            credential: self.ice_config.turn_password.clone().unwrap_or_default(),
            ..Default::default()
        }]
    }

    /// Create a new peer connection bound to this factory's media engine and
    /// configured TURN server.
    pub async fn new_peer_connection(&self) -> anyhow::Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.rtc_ice_servers(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .context("Failed to create peer connection")?;
        Ok(Arc::new(pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_builds_peer_connections_from_one_engine() {
        let factory = MediaFactory::new(IceConfig::default()).expect("factory should build");
        let a = factory.new_peer_connection().await.unwrap();
        let b = factory.new_peer_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
