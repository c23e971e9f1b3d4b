//! Microphone capture lifecycle
//!
//! The capture graph is built lazily on the first `start()` and then kept
//! alive across stop/start toggles so the device is only acquired once per
//! session. Frames produced while not recording are dropped at the source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::metrics::SessionMetrics;

/// Errors that can occur while acquiring or driving an audio device.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    PermissionDenied(String),
    StreamCreationFailed(String),
    /// The capture graph was torn down by `close()`
    DeviceReleased,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::PermissionDenied(e) => write!(f, "Microphone access denied: {}", e),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::DeviceReleased => write!(f, "Audio device already released"),
        }
    }
}

impl std::error::Error for AudioError {}

/// Callback invoked by the device for every complete 16kHz PCM16 frame
pub type FrameCallback = Box<dyn FnMut(Vec<i16>) + Send + 'static>;

/// Source of microphone frames.
///
/// `open` acquires the device and starts delivering frames of exactly
/// `frame_samples` samples to `on_frame` until the returned graph is released.
pub trait InputDevice: Send + Sync + 'static {
    fn open(
        &self,
        frame_samples: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn CaptureGraph>, AudioError>;
}

/// A running capture pipeline holding the device.
pub trait CaptureGraph: Send {
    /// Stop delivering frames and release the device
    fn release(self: Box<Self>);
}

enum CaptureState {
    Uninitialized,
    Idle(Box<dyn CaptureGraph>),
    Recording(Box<dyn CaptureGraph>),
    Released,
}

impl std::fmt::Debug for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureState::Uninitialized => "Uninitialized",
            CaptureState::Idle(_) => "Idle",
            CaptureState::Recording(_) => "Recording",
            CaptureState::Released => "Released",
        };
        f.write_str(name)
    }
}

/// Capture state machine: `Uninitialized → Idle ⇄ Recording → Released`
pub struct Capture {
    device: Arc<dyn InputDevice>,
    state: CaptureState,
    recording: Arc<AtomicBool>,
    frame_samples: usize,
    frames_tx: mpsc::Sender<Vec<i16>>,
    metrics: Arc<SessionMetrics>,
}

impl Capture {
    pub fn new(
        device: Arc<dyn InputDevice>,
        frame_samples: usize,
        frames_tx: mpsc::Sender<Vec<i16>>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            device,
            state: CaptureState::Uninitialized,
            recording: Arc::new(AtomicBool::new(false)),
            frame_samples,
            frames_tx,
            metrics,
        }
    }

    /// Start recording, building the capture graph on first use.
    ///
    /// Returns `true` if this call acquired the device.
    pub fn start(&mut self) -> Result<bool, AudioError> {
        match std::mem::replace(&mut self.state, CaptureState::Uninitialized) {
            CaptureState::Uninitialized => {
                let graph = self.device.open(self.frame_samples, self.frame_callback())?;
                self.recording.store(true, Ordering::SeqCst);
                self.state = CaptureState::Recording(graph);
                log::info!("Capture: device acquired, recording");
                Ok(true)
            }
            CaptureState::Idle(graph) | CaptureState::Recording(graph) => {
                self.recording.store(true, Ordering::SeqCst);
                self.state = CaptureState::Recording(graph);
                log::debug!("Capture: recording resumed");
                Ok(false)
            }
            CaptureState::Released => {
                self.state = CaptureState::Released;
                Err(AudioError::DeviceReleased)
            }
        }
    }

    /// Stop sending frames; the graph and device stay acquired.
    pub fn stop(&mut self) {
        self.recording.store(false, Ordering::SeqCst);
        self.state = match std::mem::replace(&mut self.state, CaptureState::Uninitialized) {
            CaptureState::Recording(graph) => {
                log::debug!("Capture: recording paused");
                CaptureState::Idle(graph)
            }
            other => other,
        };
    }

    /// Tear down the graph and release the device.
    ///
    /// Returns `true` if a graph was actually released.
    pub fn release(&mut self) -> bool {
        self.recording.store(false, Ordering::SeqCst);
        match std::mem::replace(&mut self.state, CaptureState::Released) {
            CaptureState::Idle(graph) | CaptureState::Recording(graph) => {
                graph.release();
                log::info!("Capture: device released");
                true
            }
            _ => false,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, CaptureState::Recording(_))
    }

    pub fn is_acquired(&self) -> bool {
        matches!(
            self.state,
            CaptureState::Idle(_) | CaptureState::Recording(_)
        )
    }

    fn frame_callback(&self) -> FrameCallback {
        let recording = self.recording.clone();
        let frames_tx = self.frames_tx.clone();
        let metrics = self.metrics.clone();

        Box::new(move |frame: Vec<i16>| {
            if !recording.load(Ordering::SeqCst) {
                return;
            }
            if frames_tx.try_send(frame).is_err() {
                metrics.record_frame_dropped();
            }
        })
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("state", &self.state)
            .field("frame_samples", &self.frame_samples)
            .finish()
    }
}
