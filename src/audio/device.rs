//! cpal-backed microphone input and speaker output
//!
//! Both directions run the device at its default configuration and convert
//! on the fly: capture down to 16kHz mono PCM16 frames, playback up from
//! 24kHz mono to the device's rate and channel count.
//!
//! cpal streams are not `Send` everywhere, so the input stream lives on its
//! own thread for the lifetime of the capture graph, and the output stream
//! is created on the player thread (see `streaming::playback`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use super::capture::{AudioError, CaptureGraph, FrameCallback, InputDevice};
use super::resample::{resample_linear, sample_to_i16, to_mono, Downsampler};
use crate::streaming::playback::{AudioOutput, PlaybackBuffer};
use crate::streaming::protocol::CAPTURE_SAMPLE_RATE;

/// How often `CpalOutput::play` checks whether its buffer has drained
const DRAIN_POLL: Duration = Duration::from_millis(10);

fn map_build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::NoInputDevice,
        cpal::BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
        cpal::BuildStreamError::BackendSpecific { err }
            if err.description.to_lowercase().contains("denied") =>
        {
            AudioError::PermissionDenied(err.description)
        }
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}

// ============================================================================
// Input
// ============================================================================

/// Default system microphone
#[derive(Debug, Default)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }
}

impl InputDevice for CpalInput {
    fn open(
        &self,
        frame_samples: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn CaptureGraph>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(frame_samples, on_frame) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Hold the stream until released (or the graph is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("CpalInput: stream dropped");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalCaptureGraph {
                stop_tx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamCreationFailed(
                    "Capture thread exited during setup".to_string(),
                ))
            }
        }
    }
}

/// Handle to the capture thread holding the input stream
struct CpalCaptureGraph {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureGraph for CpalCaptureGraph {
    fn release(mut self: Box<Self>) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("CpalInput: capture thread panicked");
            }
        }
    }
}

fn build_input_stream(frame_samples: usize, on_frame: FrameCallback) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, frame_samples, on_frame),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, frame_samples, on_frame),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, frame_samples, on_frame),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    frame_samples: usize,
    mut on_frame: FrameCallback,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let mut resampler = Downsampler::new(config.sample_rate.0, CAPTURE_SAMPLE_RATE);
    let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                let mono = to_mono(&converted, channels);
                pending.extend(resampler.process(&mono));

                while pending.len() >= frame_samples {
                    let frame: Vec<i16> = pending.drain(..frame_samples).collect();
                    on_frame(frame);
                }
            },
            |err| log::error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

// ============================================================================
// Output
// ============================================================================

/// Default system speaker
pub struct CpalOutput {
    _stream: Stream,
    pending: Arc<Mutex<VecDeque<f32>>>,
    device_rate: u32,
}

impl CpalOutput {
    /// Open the default output device and start a silent stream
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        log::info!("Using audio output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();
        let pending = Arc::new(Mutex::new(VecDeque::new()));

        let stream = match sample_format {
            SampleFormat::I16 => build_output_typed::<i16>(&device, &config, pending.clone()),
            SampleFormat::U16 => build_output_typed::<u16>(&device, &config, pending.clone()),
            SampleFormat::F32 => build_output_typed::<f32>(&device, &config, pending.clone()),
            _ => Err(AudioError::NoSupportedConfig),
        }?;

        stream.play().map_err(|e| {
            AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        Ok(Self {
            _stream: stream,
            pending,
            device_rate: config.sample_rate.0,
        })
    }

    fn remaining(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl AudioOutput for CpalOutput {
    fn play(&mut self, buffer: &PlaybackBuffer, cancel: &AtomicBool) -> Result<(), AudioError> {
        let samples = resample_linear(&buffer.samples, buffer.sample_rate, self.device_rate);
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| AudioError::StreamCreationFailed("Output poisoned".to_string()))?;
            pending.extend(samples);
        }

        while self.remaining() > 0 {
            if cancel.load(Ordering::SeqCst) {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.clear();
                }
                break;
            }
            std::thread::sleep(DRAIN_POLL);
        }
        Ok(())
    }
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    pending: Arc<Mutex<VecDeque<f32>>>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Never block the audio thread; emit silence if the lock is busy
                let mut guard = pending.try_lock().ok();
                for frame in data.chunks_mut(channels) {
                    let value = guard
                        .as_mut()
                        .and_then(|p| p.pop_front())
                        .unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = T::from_sample(value);
                    }
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| match map_build_error(e) {
            AudioError::NoInputDevice => AudioError::NoOutputDevice,
            other => other,
        })
}
