//! Microphone capture through cpal, encoded to Opus for the audio track.
//!
//! The cpal stream is `!Send`, so it is built and kept on a dedicated thread.
//! The callback cuts 20ms PCM frames; an encoder task turns them into Opus
//! packets for [`DeviceHandle::with_frames`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{CaptureBackend, DeviceHandle, EncodedFrame};
use crate::error::MediaError;
use crate::models::TrackKind;

const SAMPLE_RATE: u32 = 48_000;
/// 20ms at 48kHz mono.
const FRAME_SAMPLES: usize = 960;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_OPUS_PACKET: usize = 4000;

/// Default input device for audio. Video gets a virtual camera: the track is
/// negotiated, but no frames are produced.
#[derive(Default)]
pub struct NativeAudioBackend;

impl NativeAudioBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureBackend for NativeAudioBackend {
    async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError> {
        match kind {
            TrackKind::Audio => {
                let (capture, pcm) = tokio::task::spawn_blocking(start_capture)
                    .await
                    .map_err(|e| MediaError::DeviceUnavailable(format!("capture thread: {}", e)))??;
                let encoder = OpusEncoder::new()?;
                let (frames_tx, frames_rx) = mpsc::channel(64);
                tokio::spawn(encode_frames(encoder, pcm, frames_tx));
                let name = capture.device_name.clone();
                Ok(DeviceHandle::with_inner(name, capture).with_frames(frames_rx))
            }
            TrackKind::Video => {
                warn!("No camera capture available, using a virtual camera track");
                Ok(DeviceHandle::new("virtual-camera"))
            }
        }
    }
}

/// Keeps the capture thread (and with it the cpal stream) alive.
struct CaptureHandle {
    device_name: String,
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        debug!("Stopping capture on {}", self.device_name);
    }
}

/// Blocks until the stream is playing or has failed to start.
fn start_capture() -> Result<(CaptureHandle, mpsc::Receiver<Vec<f32>>), MediaError> {
    let (tx, rx) = mpsc::channel::<Vec<f32>>(64);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String, MediaError>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready_tx.send(Err(MediaError::DeviceUnavailable("no default input device".into())));
            return;
        };
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let mut buffer = Vec::with_capacity(FRAME_SAMPLES);

        let stream = match device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    return;
                }
                for &sample in data {
                    buffer.push(sample);
                    if buffer.len() == FRAME_SAMPLES {
                        let frame = std::mem::replace(&mut buffer, Vec::with_capacity(FRAME_SAMPLES));
                        let _ = tx.try_send(frame);
                    }
                }
            },
            move |err| error!("Audio capture error: {}", err),
            None,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(map_build_error(&device_name, e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(map_play_error(&device_name, e)));
            return;
        }
        info!("Audio capture started on {} (48kHz mono, 20ms frames)", device_name);
        let _ = ready_tx.send(Ok(device_name));

        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(50));
        }
        drop(stream);
        debug!("Audio capture thread exiting");
    });

    let device_name = match ready_rx.recv() {
        Ok(result) => result?,
        Err(_) => return Err(MediaError::DeviceUnavailable("audio capture thread panicked".into())),
    };
    Ok((
        CaptureHandle {
            device_name,
            running,
            _thread: thread,
        },
        rx,
    ))
}

async fn encode_frames(
    mut encoder: OpusEncoder,
    mut pcm: mpsc::Receiver<Vec<f32>>,
    frames: mpsc::Sender<EncodedFrame>,
) {
    while let Some(samples) = pcm.recv().await {
        let data = match encoder.encode(&samples) {
            Ok(data) => data,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };
        let frame = EncodedFrame {
            data: Bytes::from(data),
            duration: FRAME_DURATION,
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
}

struct OpusEncoder {
    encoder: opus::Encoder,
}

impl OpusEncoder {
    fn new() -> Result<Self, MediaError> {
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| MediaError::Codec(format!("failed to create Opus encoder: {}", e)))?;
        Ok(Self { encoder })
    }

    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, MediaError> {
        let mut output = vec![0u8; MAX_OPUS_PACKET];
        let len = self
            .encoder
            .encode_float(pcm, &mut output)
            .map_err(|e| MediaError::Codec(format!("Opus encode error: {}", e)))?;
        output.truncate(len);
        Ok(output)
    }
}

fn map_build_error(device: &str, e: cpal::BuildStreamError) -> MediaError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable(device.to_string()),
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_error(device, &err.description),
        other => MediaError::DeviceUnavailable(format!("{}: {}", device, other)),
    }
}

fn map_play_error(device: &str, e: cpal::PlayStreamError) -> MediaError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable(device.to_string()),
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_error(device, &err.description),
    }
}

/// Host backends only report a refused microphone as free text.
fn classify_backend_error(device: &str, description: &str) -> MediaError {
    let lowered = description.to_lowercase();
    let refused = ["permission", "denied", "not authorized", "not permitted"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if refused {
        MediaError::PermissionDenied(format!("{}: {}", device, description))
    } else {
        MediaError::DeviceUnavailable(format!("{}: {}", device, description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_map_to_permission_denied() {
        assert!(matches!(
            classify_backend_error("mic", "Permission denied (os error 13)"),
            MediaError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_error("mic", "Device or resource busy"),
            MediaError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn missing_device_is_unavailable() {
        assert_eq!(
            map_build_error("mic", cpal::BuildStreamError::DeviceNotAvailable),
            MediaError::DeviceUnavailable("mic".into())
        );
    }

    #[test]
    fn encodes_a_frame_of_silence() {
        let mut encoder = OpusEncoder::new().unwrap();
        let packet = encoder.encode(&[0.0; FRAME_SAMPLES]).unwrap();
        assert!(!packet.is_empty() && packet.len() < MAX_OPUS_PACKET);
    }
}
