use std::sync::Arc;

use anyhow::Context;
use relay_protocol::{
    EnvelopeKind, IceCandidateInit as CandidateWire, SdpKind, SessionDescription, SignalingEnvelope,
};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaFactory;

/// One `RTCPeerConnection` bound 1:1 to one signaling socket, driving the
/// impolite side of "perfect negotiation". Every caller holds this behind an
/// `Arc`; callbacks registered on the underlying peer connection capture only
/// a `Weak` reference, so a callback that fires after the adapter has been
/// dropped becomes a silent no-op instead of touching freed state.
pub struct PeerAdapter {
    pub label: String,
    pub peer_connection: Arc<RTCPeerConnection>,
    pub current_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    outbound_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    state: Mutex<NegotiationState>,
}

#[derive(Default)]
struct NegotiationState {
    making_offer: bool,
    ignore_offer: bool,
}

impl PeerAdapter {
    /// Build a peer connection from the shared factory and wire its
    /// callbacks. `on_track` fires (once per incoming track) with the
    /// remote track; sink adapters pass a no-op, the source adapter hands
    /// the track to the `FanOut` controller.
    pub async fn new(
        label: impl Into<String>,
        factory: &MediaFactory,
        outbound_tx: tokio::sync::mpsc::UnboundedSender<Message>,
        on_track: impl Fn(Arc<TrackRemote>) + Send + Sync + 'static,
    ) -> anyhow::Result<Arc<Self>> {
        let peer_connection = factory
            .new_peer_connection()
            .await
            .context("Failed to create peer connection for adapter")?;

        let adapter = Arc::new(Self {
            label: label.into(),
            peer_connection,
            current_sender: Mutex::new(None),
            outbound_tx,
            state: Mutex::new(NegotiationState::default()),
        });
        adapter.wire_callbacks(on_track);
        Ok(adapter)
    }

    fn wire_callbacks(self: &Arc<Self>, on_track: impl Fn(Arc<TrackRemote>) + Send + Sync + 'static) {
        let weak = Arc::downgrade(self);
        self.peer_connection
            .on_negotiation_needed(Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(adapter) = weak.upgrade() {
                        adapter.start_negotiation().await;
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(adapter), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => adapter.send_envelope(SignalingEnvelope::candidate(CandidateWire {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(label = %adapter.label, "failed to serialize ICE candidate: {e}"),
                }
            })
        }));

        let label = self.label.clone();
        self.peer_connection
            .on_signaling_state_change(Box::new(move |state| {
                debug!(label = %label, ?state, "signaling state changed");
                Box::pin(async {})
            }));

        let label = self.label.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state| {
                debug!(label = %label, ?state, "ice connection state changed");
                Box::pin(async {})
            }));

        let label = self.label.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                // Never close on a bad connection state here — a fresh offer
                // from the peer can restart ICE and recover the connection.
                info!(label = %label, ?state, "peer connection state changed");
                Box::pin(async {})
            }));

        let on_track = Arc::new(on_track);
        self.peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let on_track = Arc::clone(&on_track);
            Box::pin(async move {
                on_track(track);
            })
        }));

        let label = self.label.clone();
        self.peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!(label = %label, channel = %dc.label(), "data channel opened (ignored)");
            Box::pin(async {})
        }));
    }

    fn send_envelope(&self, envelope: SignalingEnvelope) {
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                let _ = self.outbound_tx.send(Message::Text(text.into()));
            }
            Err(e) => warn!(label = %self.label, "failed to serialize outgoing envelope: {e}"),
        }
    }

    /// Drive the "negotiation needed" side of perfect negotiation: produce a
    /// local offer and send it down the signaling socket. The whole sequence
    /// runs under `state`'s lock so a concurrently-arriving remote offer sees
    /// an up-to-date `making_offer` flag.
    async fn start_negotiation(&self) {
        let mut state = self.state.lock().await;
        state.making_offer = true;
        let result = self.create_and_set_local_offer().await;
        state.making_offer = false;
        drop(state);

        match result {
            Ok(offer) => self.send_envelope(SignalingEnvelope::description(SessionDescription {
                kind: sdp_kind_from_rtc(offer.sdp_type),
                sdp: offer.sdp,
            })),
            Err(e) => warn!(label = %self.label, "failed to negotiate local offer: {e:#}"),
        }
    }

    async fn create_and_set_local_offer(&self) -> anyhow::Result<RTCSessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("create_offer failed")?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .context("set_local_description failed")?;
        Ok(offer)
    }

    /// Entry point for every inbound signaling text frame.
    pub async fn handle_envelope(&self, envelope: &SignalingEnvelope) {
        match envelope.kind() {
            Ok(EnvelopeKind::Description(desc)) => self.handle_remote_description(desc).await,
            Ok(EnvelopeKind::Candidate(candidate)) => self.handle_remote_candidate(candidate).await,
            Err(e) => warn!(label = %self.label, "dropping malformed signaling envelope: {e}"),
        }
    }

    async fn handle_remote_description(&self, desc: &SessionDescription) {
        let mut state = self.state.lock().await;

        let incoming_is_offer = desc.kind == SdpKind::Offer;
        let collision = incoming_is_offer
            && (state.making_offer
                || self.peer_connection.signaling_state() != RTCSignalingState::Stable);
        // Impolite: always ignore a colliding offer, never roll back.
        state.ignore_offer = collision;
        if collision {
            debug!(label = %self.label, "dropping colliding remote offer (impolite)");
            return;
        }

        let rtc_desc = match to_rtc_description(desc) {
            Ok(d) => d,
            Err(e) => {
                warn!(label = %self.label, "invalid remote description: {e:#}");
                return;
            }
        };

        if let Err(e) = self.peer_connection.set_remote_description(rtc_desc).await {
            warn!(label = %self.label, "failed to set remote description: {e:#}");
            return;
        }

        if !incoming_is_offer {
            return;
        }

        let answer = match self.peer_connection.create_answer(None).await {
            Ok(a) => a,
            Err(e) => {
                warn!(label = %self.label, "failed to create answer: {e:#}");
                return;
            }
        };
        if let Err(e) = self
            .peer_connection
            .set_local_description(answer.clone())
            .await
        {
            warn!(label = %self.label, "failed to set local answer description: {e:#}");
            return;
        }

        self.send_envelope(SignalingEnvelope::description(SessionDescription {
            kind: sdp_kind_from_rtc(answer.sdp_type),
            sdp: answer.sdp,
        }));
    }

    async fn handle_remote_candidate(&self, candidate: &CandidateWire) {
        let ignore_offer = self.state.lock().await.ignore_offer;

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
            if ignore_offer {
                debug!(label = %self.label, "swallowing ICE candidate error after ignored offer: {e:#}");
            } else {
                warn!(label = %self.label, "failed to add ICE candidate: {e:#}");
            }
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!(label = %self.label, "error closing peer connection: {e:#}");
        }
    }
}

fn sdp_kind_from_rtc(kind: RTCSdpType) -> SdpKind {
    match kind {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => SdpKind::Offer,
    }
}

fn to_rtc_description(desc: &SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let value = serde_json::json!({ "type": desc.kind, "sdp": desc.sdp });
    serde_json::from_value(value).context("failed to parse session description")
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::IceConfig;

    #[test]
    fn sdp_kind_roundtrips_through_rtc_type() {
        for kind in [SdpKind::Offer, SdpKind::Answer, SdpKind::Pranswer, SdpKind::Rollback] {
            let desc = SessionDescription {
                kind,
                sdp: "v=0\r\n".to_string(),
            };
            let rtc = to_rtc_description(&desc).unwrap();
            assert_eq!(sdp_kind_from_rtc(rtc.sdp_type), kind);
        }
    }

    #[tokio::test]
    async fn colliding_offer_is_ignored_by_impolite_adapter() {
        let factory = MediaFactory::new(IceConfig::default()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = PeerAdapter::new("test", &factory, tx, |_track| {}).await.unwrap();

        // Simulate this adapter being mid-way through producing its own
        // offer when a remote offer arrives.
        {
            let mut state = adapter.state.lock().await;
            state.making_offer = true;
        }

        let remote_offer = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
        };
        adapter.handle_remote_description(&remote_offer).await;

        assert_eq!(
            adapter.peer_connection.signaling_state(),
            RTCSignalingState::Stable,
            "remote description must not be applied on collision"
        );
        assert!(adapter.state.lock().await.ignore_offer);
    }
}
