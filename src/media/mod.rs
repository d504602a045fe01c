#[cfg(feature = "native-audio")]
pub mod native;

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;
use crate::models::{CallMedia, TrackKind};

/// One encoded media frame as produced by a capture device.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Keeps a capture device open for as long as it lives.
pub struct DeviceHandle {
    pub name: String,
    frames: Option<mpsc::Receiver<EncodedFrame>>,
    _inner: Option<Box<dyn Any + Send + Sync>>,
}

impl DeviceHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frames: None,
            _inner: None,
        }
    }

    /// Attach backend state (a capture thread handle, a stream) that must be
    /// dropped when the device is released.
    pub fn with_inner(name: impl Into<String>, inner: impl Any + Send + Sync) -> Self {
        Self {
            name: name.into(),
            frames: None,
            _inner: Some(Box::new(inner)),
        }
    }

    /// Frames the device produces. The track built on this device pumps them
    /// into its RTP track while enabled.
    pub fn with_frames(mut self, frames: mpsc::Receiver<EncodedFrame>) -> Self {
        self.frames = Some(frames);
        self
    }
}

/// Opens physical (or virtual) capture devices.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError>;
}

/// Backend with no physical devices: tracks exist and can be negotiated,
/// but nothing is captured. Used for headless endpoints.
pub struct HeadlessBackend;

#[async_trait]
impl CaptureBackend for HeadlessBackend {
    async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError> {
        Ok(DeviceHandle::new(format!("headless-{}", kind)))
    }
}

/// A local track plus its device and enable flag. Samples written while
/// disabled are dropped, which is how mute and camera-off are realised.
pub struct LocalTrack {
    pub kind: TrackKind,
    gate: Arc<SampleGate>,
    device: DeviceHandle,
}

/// The RTP track behind its enable flag.
struct SampleGate {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    sent: AtomicU64,
}

impl SampleGate {
    async fn write(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::Write(e.to_string()))
    }
}

async fn pump_frames(gate: Arc<SampleGate>, mut frames: mpsc::Receiver<EncodedFrame>) {
    while let Some(frame) = frames.recv().await {
        let sample = Sample {
            data: frame.data,
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = gate.write(&sample).await {
            debug!("Dropped captured frame: {}", e);
        }
    }
    debug!("Capture frame pump finished");
}

impl LocalTrack {
    fn new(kind: TrackKind, mut device: DeviceHandle) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 1,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            format!("{}-track", kind),
            "chatr-call".to_string(),
        ));
        let gate = Arc::new(SampleGate {
            track,
            enabled: AtomicBool::new(true),
            sent: AtomicU64::new(0),
        });
        // The pump ends once the device stops producing, at the latest when
        // the device handle is dropped.
        if let Some(frames) = device.frames.take() {
            tokio::spawn(pump_frames(gate.clone(), frames));
        }
        Self { kind, gate, device }
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.gate.track.clone()
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn is_enabled(&self) -> bool {
        self.gate.enabled.load(Ordering::Relaxed)
    }

    /// Samples that passed the enable flag so far.
    pub fn samples_sent(&self) -> u64 {
        self.gate.sent.load(Ordering::Relaxed)
    }
}

/// Tracks held by one session. Holding this value holds the exclusive
/// device lease; dropping it releases both.
pub struct LocalTracks {
    pub audio: LocalTrack,
    pub video: Option<LocalTrack>,
    _lease: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTracks")
            .field("audio", &self.audio.device_name())
            .field("video", &self.video.as_ref().map(|v| v.device_name()))
            .finish()
    }
}

impl LocalTracks {
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => Some(&self.audio),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        std::iter::once(&self.audio).chain(self.video.as_ref())
    }
}

/// Local capture capability. Device handles are owned by at most one
/// session at a time; a second acquisition queues until the first releases.
#[derive(Clone)]
pub struct MediaCapture {
    backend: Arc<dyn CaptureBackend>,
    devices: Arc<Mutex<()>>,
}

impl MediaCapture {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            devices: Arc::new(Mutex::new(())),
        }
    }

    pub fn headless() -> Self {
        Self::new(Arc::new(HeadlessBackend))
    }

    pub async fn acquire(&self, media: CallMedia) -> Result<LocalTracks, MediaError> {
        let lease = self.devices.clone().lock_owned().await;
        let audio = LocalTrack::new(TrackKind::Audio, self.backend.open(TrackKind::Audio).await?);
        let video = if media.has_video() {
            Some(LocalTrack::new(
                TrackKind::Video,
                self.backend.open(TrackKind::Video).await?,
            ))
        } else {
            None
        };
        info!(
            "Acquired local media: {}",
            std::iter::once(audio.device_name())
                .chain(video.as_ref().map(|v| v.device_name()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(LocalTracks {
            audio,
            video,
            _lease: lease,
        })
    }

    /// Like [`acquire`](Self::acquire), but abandons the attempt (dropping any
    /// half-open device) as soon as `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        media: CallMedia,
        cancel: &CancellationToken,
    ) -> Result<LocalTracks, MediaError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MediaError::Cancelled),
            result = self.acquire(media) => result,
        }
    }

    pub fn release(&self, tracks: LocalTracks) {
        debug!(
            "Releasing local media ({} tracks)",
            tracks.iter().count()
        );
        drop(tracks);
    }

    pub fn set_track_enabled(
        &self,
        tracks: &LocalTracks,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), MediaError> {
        let track = tracks.track(kind).ok_or(MediaError::NoSuchTrack(kind))?;
        track.gate.enabled.store(enabled, Ordering::Relaxed);
        debug!("Local {} track enabled={}", kind, enabled);
        Ok(())
    }

    /// True when no session holds the capture devices.
    pub fn is_idle(&self) -> bool {
        self.devices.try_lock().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct DeniedBackend;

    #[async_trait]
    impl CaptureBackend for DeniedBackend {
        async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError> {
            match kind {
                TrackKind::Audio => Ok(DeviceHandle::new("mic")),
                TrackKind::Video => Err(MediaError::PermissionDenied("camera".into())),
            }
        }
    }

    /// Microphone whose frames the test feeds by hand.
    struct FedBackend(std::sync::Mutex<Option<mpsc::Receiver<EncodedFrame>>>);

    #[async_trait]
    impl CaptureBackend for FedBackend {
        async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError> {
            let frames = self.0.lock().unwrap().take();
            let device = DeviceHandle::new(format!("fed-{}", kind));
            Ok(match frames {
                Some(frames) if kind == TrackKind::Audio => device.with_frames(frames),
                _ => device,
            })
        }
    }

    fn frame() -> EncodedFrame {
        EncodedFrame {
            data: Bytes::from_static(&[0xf8, 0xff, 0xfe]),
            duration: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn captured_frames_stop_while_muted() {
        let (tx, rx) = mpsc::channel(8);
        let capture = MediaCapture::new(Arc::new(FedBackend(std::sync::Mutex::new(Some(rx)))));
        let tracks = capture.acquire(CallMedia::AudioOnly).await.unwrap();

        tx.send(frame()).await.unwrap();
        tx.send(frame()).await.unwrap();
        while tracks.audio.samples_sent() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        capture.set_track_enabled(&tracks, TrackKind::Audio, false).unwrap();
        tx.send(frame()).await.unwrap();
        // Full capacity again means the pump has taken the muted frame.
        while tx.capacity() < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracks.audio.samples_sent(), 2);

        capture.set_track_enabled(&tracks, TrackKind::Audio, true).unwrap();
        tx.send(frame()).await.unwrap();
        while tracks.audio.samples_sent() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn audio_only_has_no_video_track() {
        let capture = MediaCapture::headless();
        let tracks = capture.acquire(CallMedia::AudioOnly).await.unwrap();
        assert!(tracks.video.is_none());
        assert_eq!(tracks.iter().count(), 1);
        assert_eq!(
            capture.set_track_enabled(&tracks, TrackKind::Video, false),
            Err(MediaError::NoSuchTrack(TrackKind::Video))
        );
    }

    #[tokio::test]
    async fn toggling_enable_flag() {
        let capture = MediaCapture::headless();
        let tracks = capture.acquire(CallMedia::AudioVideo).await.unwrap();
        capture.set_track_enabled(&tracks, TrackKind::Audio, false).unwrap();
        assert!(!tracks.audio.is_enabled());
        assert!(tracks.video.as_ref().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn partial_failure_releases_lease() {
        let capture = MediaCapture::new(Arc::new(DeniedBackend));
        let err = capture.acquire(CallMedia::AudioVideo).await.unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied(_)));
        assert!(capture.is_idle());
    }

    #[tokio::test]
    async fn second_acquisition_waits_for_release() {
        let capture = MediaCapture::headless();
        let first = capture.acquire(CallMedia::AudioOnly).await.unwrap();
        assert!(!capture.is_idle());

        let queued = {
            let capture = capture.clone();
            tokio::spawn(async move { capture.acquire(CallMedia::AudioOnly).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        capture.release(first);
        let second = queued.await.unwrap().unwrap();
        assert_eq!(second.audio.device_name(), "headless-audio");
    }

    #[tokio::test]
    async fn cancelled_acquisition_does_not_take_the_lease() {
        let capture = MediaCapture::headless();
        let held = capture.acquire(CallMedia::AudioOnly).await.unwrap();

        let cancel = CancellationToken::new();
        let waiting = {
            let capture = capture.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                capture.acquire_cancellable(CallMedia::AudioOnly, &cancel).await
            })
        };
        cancel.cancel();
        assert_eq!(waiting.await.unwrap().err(), Some(MediaError::Cancelled));

        capture.release(held);
        assert!(capture.is_idle());
    }
}
