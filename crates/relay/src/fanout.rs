use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::PeerAdapter;

const BROADCAST_CAPACITY: usize = 1024;

/// Republishes the source's single active track into every connected sink.
/// There is exactly one of these per process, shared by the source and sink
/// endpoints.
///
/// `active` and `sinks` live behind one `tokio::sync::Mutex` and every public
/// operation holds that same lock for its entire duration, including the
/// awaited `add_track`/`remove_track` calls it makes against sink peer
/// connections. This is the "single serialized queue" the design calls for:
/// `attach`, `detach`, `set_active`, and `clear_active` are mutually
/// exclusive, so a sink can never be observed as registered-but-unpublished
/// (or vice versa) by a concurrent caller.
pub struct FanOut {
    inner: Mutex<Inner>,
}

struct Inner {
    active: Option<ActiveSource>,
    sinks: HashMap<Uuid, Arc<PeerAdapter>>,
}

struct ActiveSource {
    kind: RTPCodecType,
    tx: broadcast::Sender<rtp::packet::Packet>,
    reader: JoinHandle<()>,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl FanOut {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: None,
                sinks: HashMap::new(),
            }),
        }
    }

    /// Pin the source's incoming track as the process's one active track,
    /// spawn the RTP reader that broadcasts its packets, and publish it into
    /// every sink already connected.
    pub async fn set_active(&self, track: Arc<TrackRemote>) {
        let kind = track.kind();
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let broadcast_tx = tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _attributes)) => {
                        // No subscribers yet, or all lagging, is not an error.
                        let _ = broadcast_tx.send(packet);
                    }
                    Err(e) => {
                        info!("source track ended: {e}");
                        break;
                    }
                }
            }
        });

        self.install_active(kind, tx, reader).await;
    }

    /// Shared body of `set_active`, split out so tests can install a
    /// synthetic active source without needing a genuine inbound RTP track.
    async fn install_active(&self, kind: RTPCodecType, tx: broadcast::Sender<rtp::packet::Packet>, reader: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        Self::clear_active_locked(&mut inner).await;
        inner.active = Some(ActiveSource { kind, tx, reader });

        let sinks: Vec<Arc<PeerAdapter>> = inner.sinks.values().cloned().collect();
        for sink in sinks {
            Self::publish_to_locked(&inner, &sink).await;
        }
    }

    /// The source disconnected or its track ended. Stop the reader and
    /// detach the stale track from every sink's peer connection.
    pub async fn clear_active(&self) {
        let mut inner = self.inner.lock().await;
        Self::clear_active_locked(&mut inner).await;
    }

    async fn clear_active_locked(inner: &mut Inner) {
        let Some(previous) = inner.active.take() else { return };
        previous.reader.abort();

        let sinks: Vec<Arc<PeerAdapter>> = inner.sinks.values().cloned().collect();
        for sink in sinks {
            Self::remove_sender(&sink).await;
        }
    }

    /// Register a newly-connected sink. If a track is already active,
    /// immediately publish it. Holding `inner` for the whole call means a
    /// concurrent `set_active` either completes fully before this insert (and
    /// so is picked up by this call's own publish) or starts fully after it
    /// (and so publishes to this sink itself) — never both or neither.
    pub async fn attach(&self, id: Uuid, adapter: Arc<PeerAdapter>) {
        let mut inner = self.inner.lock().await;
        inner.sinks.insert(id, Arc::clone(&adapter));
        if inner.active.is_some() {
            Self::publish_to_locked(&inner, &adapter).await;
        }
    }

    /// A sink disconnected; stop forwarding to it.
    pub async fn detach(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(adapter) = inner.sinks.remove(&id) {
            Self::remove_sender(&adapter).await;
        }
    }

    /// Add a local republishing track to `adapter`'s peer connection and
    /// spawn the task that copies broadcast packets into it. Caller must
    /// already hold `inner`'s lock.
    async fn publish_to_locked(inner: &Inner, adapter: &Arc<PeerAdapter>) {
        let Some(active) = inner.active.as_ref() else { return };
        let capability = codec_capability_for(active.kind);
        let tx = active.tx.clone();

        Self::remove_sender(adapter).await;

        let output_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            "video".to_string(),
            "relay".to_string(),
        ));

        let sender = match adapter
            .peer_connection
            .add_track(Arc::clone(&output_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                warn!(label = %adapter.label, "failed to publish track to sink: {e}");
                return;
            }
        };

        *adapter.current_sender.lock().await = Some(Arc::clone(&sender));

        // Drain RTCP so interceptors (NACK, etc.) keep working.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let mut rx = tx.subscribe();
        let label = adapter.label.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(packet) => {
                        if let Err(e) = output_track.write_rtp(&packet).await {
                            debug!(label = %label, "sink write_rtp failed, stopping forward: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(label = %label, skipped, "sink fell behind, dropping packets");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn remove_sender(adapter: &Arc<PeerAdapter>) {
        let previous = adapter.current_sender.lock().await.take();
        if let Some(sender) = previous {
            if let Err(e) = adapter.peer_connection.remove_track(&sender).await {
                warn!(label = %adapter.label, "failed to remove stale track: {e}");
            }
        }
    }
}

/// `TrackRemote::codec()` needs a live track; sinks are published to before
/// we necessarily still hold one, so fan-out only keeps the codec kind and
/// rebuilds a capability generic enough for either media type. Must match
/// the codecs `MediaFactory` registers.
fn codec_capability_for(kind: RTPCodecType) -> webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
    use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    match kind {
        RTPCodecType::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        _ => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
            rtcp_feedback: vec![],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaFactory;
    use relay_protocol::IceConfig;

    async fn test_sink(label: &str, factory: &MediaFactory) -> Arc<PeerAdapter> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        PeerAdapter::new(label, factory, tx, |_track| {})
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn detach_of_unknown_sink_is_a_no_op() {
        let fanout = FanOut::new();
        fanout.detach(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn clear_active_without_a_source_is_a_no_op() {
        let fanout = FanOut::new();
        fanout.clear_active().await;
        assert!(fanout.inner.lock().await.active.is_none());
    }

    #[tokio::test]
    async fn attach_then_set_active_publishes_to_the_sink() {
        let factory = MediaFactory::new(IceConfig::default()).unwrap();
        let fanout = FanOut::new();
        let sink = test_sink("sink", &factory).await;
        let sink_id = Uuid::new_v4();

        fanout.attach(sink_id, Arc::clone(&sink)).await;
        assert!(sink.current_sender.lock().await.is_none());

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let reader = tokio::spawn(async {});
        fanout.install_active(RTPCodecType::Video, tx, reader).await;

        assert!(sink.current_sender.lock().await.is_some());
    }

    /// Regression test for a prior check-then-act race: `attach` and
    /// `set_active` used to mutate `sinks` and `active` through two
    /// independent mutexes, so a sink could be inserted after `set_active`
    /// had already snapshotted the sink registry and never get published to
    /// until the *next* source reconnect. Both operations now share one
    /// lock, so racing them in either interleaving must still leave the
    /// sink with a sender.
    #[tokio::test]
    async fn attach_racing_set_active_still_publishes_to_the_new_sink() {
        let factory = MediaFactory::new(IceConfig::default()).unwrap();
        let fanout = Arc::new(FanOut::new());
        let sink = test_sink("sink", &factory).await;
        let sink_id = Uuid::new_v4();

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let reader = tokio::spawn(async {});

        let install_fut = fanout.install_active(RTPCodecType::Video, tx, reader);
        let attach_fut = fanout.attach(sink_id, Arc::clone(&sink));
        tokio::join!(install_fut, attach_fut);

        assert!(
            sink.current_sender.lock().await.is_some(),
            "sink must end up with a sender regardless of attach/set_active interleaving"
        );
    }
}
