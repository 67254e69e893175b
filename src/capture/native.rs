//! Native camera + microphone capture using nokhwa and cpal
//!
//! Frames are decoded to RGBA on the capture thread and pushed into the sink
//! with timestamps on one shared monotonic clock, so video and audio line up.

use super::orientation::Rotation;
use super::traits::{
    AudioSample, CameraFacing, CaptureError, CaptureResult, CaptureSource, FrameSink, VideoFrame,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Check whether any camera is present
pub fn has_camera() -> bool {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => !cameras.is_empty(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            false
        }
    }
}

/// Camera + default microphone capture source
pub struct NativeCameraSource {
    id: String,
    device_id: Option<String>,
    facing: CameraFacing,
    running: Arc<AtomicBool>,
    video_thread: Option<std::thread::JoinHandle<()>>,
    audio_thread: Option<std::thread::JoinHandle<()>>,
}

impl NativeCameraSource {
    /// `device_id` is a camera index or name; `None` selects the first camera
    pub fn new(device_id: Option<String>, facing: CameraFacing) -> Self {
        Self {
            id: "native-camera".to_string(),
            device_id,
            facing,
            running: Arc::new(AtomicBool::new(false)),
            video_thread: None,
            audio_thread: None,
        }
    }

    fn camera_index(&self) -> CameraIndex {
        match &self.device_id {
            Some(id) => match id.parse::<u32>() {
                Ok(idx) => CameraIndex::Index(idx),
                Err(_) => CameraIndex::String(id.clone()),
            },
            None => CameraIndex::Index(0),
        }
    }
}

fn run_camera(
    index: CameraIndex,
    facing: CameraFacing,
    sink: FrameSink,
    running: Arc<AtomicBool>,
    epoch: Instant,
) {
    let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = match Camera::new(index.clone(), format) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to open camera {:?}: {:?}", index, e);
            return;
        }
    };

    if let Err(e) = camera.open_stream() {
        tracing::error!("Failed to open camera stream: {:?}", e);
        return;
    }

    let camera_format = camera.camera_format();
    tracing::info!(
        "Camera opened: {}x{} @ {}fps, format={:?}",
        camera_format.resolution().width(),
        camera_format.resolution().height(),
        camera_format.frame_rate(),
        camera_format.format()
    );
    sink.set_ready(true);

    let mut delivered: u64 = 0;
    let mut decode_failures: u64 = 0;
    while running.load(Ordering::SeqCst) {
        // Blocks until the camera delivers the next frame
        let buffer = match camera.frame() {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::debug!("Failed to capture frame: {:?}", e);
                continue;
            }
        };
        let pts = epoch.elapsed();

        match buffer.decode_image::<RgbAFormat>() {
            Ok(image) => {
                let (width, height) = (image.width(), image.height());
                let frame = VideoFrame::new(image.into_raw(), width, height, pts, facing);
                if sink.push_video(frame) {
                    delivered += 1;
                }
            }
            Err(e) => {
                decode_failures += 1;
                if decode_failures == 1 {
                    tracing::warn!("Failed to decode camera frame: {:?}", e);
                }
            }
        }
    }

    sink.set_ready(false);
    if let Err(e) = camera.stop_stream() {
        tracing::warn!("Error stopping camera stream: {:?}", e);
    }
    tracing::info!(
        "Camera capture stopped: {} frames delivered, {} discarded, {} decode failures",
        delivered,
        sink.discarded(),
        decode_failures
    );
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn run_microphone(sink: FrameSink, running: Arc<AtomicBool>, epoch: Instant) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        tracing::warn!("No default input device; recording without microphone audio");
        return;
    };

    let config = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to get microphone config: {}", e);
            return;
        }
    };

    let sample_rate = config.sample_rate().0;
    let channels = config.channels();
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    let deliver = {
        let sink = sink.clone();
        move |samples: Vec<i16>| {
            let sample = AudioSample::new(samples, Duration::ZERO, sample_rate, channels);
            // Timestamp the start of the chunk on the shared clock
            let pts = epoch.elapsed().saturating_sub(sample.duration);
            sink.push_audio(AudioSample { pts, ..sample });
        }
    };

    let err_fn = |err: cpal::StreamError| tracing::error!("Microphone stream error: {}", err);
    let stream = match sample_format {
        SampleFormat::F32 => {
            let deliver = deliver.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    deliver(data.iter().map(|&s| to_i16(s)).collect());
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let deliver = deliver.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    deliver(data.to_vec());
                },
                err_fn,
                None,
            )
        }
        other => {
            tracing::error!("Unsupported microphone sample format: {:?}", other);
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to build microphone stream: {}", e);
            return;
        }
    };

    if let Err(e) = stream.play() {
        tracing::error!("Failed to start microphone stream: {}", e);
        return;
    }

    tracing::info!("Microphone capture started: {}Hz, {}ch", sample_rate, channels);

    // The stream lives on this thread until recording stops
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    tracing::info!("Microphone capture stopped");
}

#[async_trait]
impl CaptureSource for NativeCameraSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn facing(&self) -> CameraFacing {
        self.facing
    }

    async fn open(&mut self, sink: FrameSink, rotation: Rotation) -> CaptureResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyOpen);
        }
        if !has_camera() {
            return Err(CaptureError::DeviceNotFound("No cameras found".to_string()));
        }

        self.running.store(true, Ordering::SeqCst);
        let epoch = Instant::now();

        let index = self.camera_index();
        let facing = self.facing;
        let video_sink = sink.clone();
        let video_running = self.running.clone();
        self.video_thread = Some(std::thread::spawn(move || {
            run_camera(index, facing, video_sink, video_running, epoch)
        }));

        let audio_running = self.running.clone();
        self.audio_thread = Some(std::thread::spawn(move || {
            run_microphone(sink, audio_running, epoch)
        }));

        tracing::info!(
            "Native capture starting (rotation hint {}° applied downstream)",
            rotation.degrees()
        );
        Ok(())
    }

    async fn close(&mut self) -> CaptureResult<()> {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self
            .video_thread
            .take()
            .into_iter()
            .chain(self.audio_thread.take())
            .collect();

        tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await
        .map_err(|e| CaptureError::Capture(format!("capture thread join failed: {}", e)))?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
