//! Audio devices for the voice session
//!
//! Microphone capture produces 16kHz mono PCM16 frames; speaker output
//! accepts 24kHz mono float buffers. Uses CPAL for both directions.

pub mod capture;
mod device;
mod resample;

pub use capture::{AudioError, Capture, CaptureGraph, FrameCallback, InputDevice};
pub use device::{CpalInput, CpalOutput};
pub use resample::{f32_to_i16, i16_to_f32, resample_linear, sample_to_i16, to_mono, Downsampler};
