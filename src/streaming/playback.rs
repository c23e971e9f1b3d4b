//! Sequential playback of inbound bot speech
//!
//! Audio chunks arrive as discrete WebSocket messages. They are appended to
//! a FIFO queue and played strictly one after another by a dedicated
//! player thread, so segments never overlap and are heard in receipt order.
//!
//! # Architecture
//!
//! ```text
//! Dispatch task (async)            Player thread (sync)
//! ┌──────────────────┐             ┌─────────────────────────┐
//! │ enqueue(samples) │──Condvar──▶ │ pop_next() → play() ... │
//! └──────────────────┘             └─────────────────────────┘
//! ```
//!
//! The output device is created on the player thread because cpal streams
//! are not `Send` on every platform.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::audio::AudioError;

/// One decoded chunk of speech awaiting output
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    /// Mono samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Receipt order, monotonically increasing
    pub sequence: u64,
}

impl PlaybackBuffer {
    /// Duration of this buffer in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// FIFO of pending buffers plus the "playback in flight" flag
///
/// Thread-safety: This struct is NOT internally synchronized.
/// [`Player`] wraps it in a `Mutex`.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    buffers: VecDeque<PlaybackBuffer>,
    playing: bool,
    next_sequence: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer at the tail.
    ///
    /// Returns `true` if playback was idle and this push starts it; `false`
    /// if a buffer is already in flight and this one simply waits its turn.
    pub fn push(&mut self, samples: Vec<f32>, sample_rate: u32) -> bool {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.buffers.push_back(PlaybackBuffer {
            samples,
            sample_rate,
            sequence,
        });

        let starts = !self.playing;
        self.playing = true;
        starts
    }

    /// Take the head buffer for output, or mark playback idle if empty
    pub fn pop_next(&mut self) -> Option<PlaybackBuffer> {
        let next = self.buffers.pop_front();
        self.playing = next.is_some();
        next
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Number of buffers waiting (not counting one in flight)
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop everything still waiting
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.playing = false;
    }
}

/// Audio output that plays one buffer to completion
pub trait AudioOutput {
    /// Block until `buffer` has been fully played, or `cancel` is set
    fn play(&mut self, buffer: &PlaybackBuffer, cancel: &AtomicBool) -> Result<(), AudioError>;
}

/// Builds the output on the player thread
pub type OutputFactory =
    Box<dyn FnOnce() -> Result<Box<dyn AudioOutput>, AudioError> + Send + 'static>;

struct Shared {
    queue: PlaybackQueue,
    shutdown: bool,
}

/// Sole consumer of the playback queue
pub struct Player {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Player {
    /// Spawn the player thread and open the output device on it
    pub fn spawn(factory: OutputFactory) -> Result<Self, AudioError> {
        let shared = Arc::new((
            Mutex::new(Shared {
                queue: PlaybackQueue::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let cancel = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);

        let thread_shared = shared.clone();
        let thread_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let output = match factory() {
                    Ok(output) => {
                        let _ = ready_tx.send(Ok(()));
                        output
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_player(output, thread_shared, thread_cancel);
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamCreationFailed(
                    "Playback thread exited during setup".to_string(),
                ));
            }
        }

        log::info!("Player: output ready");
        Ok(Self {
            shared,
            cancel,
            thread: Some(thread),
        })
    }

    /// Queue a buffer; starts playback if nothing is in flight.
    ///
    /// Returns `true` if this call started playback.
    pub fn enqueue(&self, samples: Vec<f32>, sample_rate: u32) -> bool {
        let (lock, cvar) = &*self.shared;
        let Ok(mut shared) = lock.lock() else {
            return false;
        };
        if shared.shutdown {
            return false;
        }
        let started = shared.queue.push(samples, sample_rate);
        if started {
            cvar.notify_one();
        }
        started
    }

    pub fn is_playing(&self) -> bool {
        let (lock, _) = &*self.shared;
        lock.lock().map(|s| s.queue.is_playing()).unwrap_or(false)
    }

    pub fn queued(&self) -> usize {
        let (lock, _) = &*self.shared;
        lock.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Abandon queued audio, cut the in-flight buffer, and release the device
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        {
            let (lock, cvar) = &*self.shared;
            if let Ok(mut shared) = lock.lock() {
                shared.shutdown = true;
                shared.queue.clear();
            }
            cvar.notify_all();
        }
        self.cancel.store(true, Ordering::SeqCst);

        if thread.join().is_err() {
            log::warn!("Player: playback thread panicked");
        }
        log::info!("Player: stopped");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_player(
    mut output: Box<dyn AudioOutput>,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    cancel: Arc<AtomicBool>,
) {
    let (lock, cvar) = &*shared;

    loop {
        let buffer = {
            let Ok(mut guard) = lock.lock() else {
                return;
            };
            loop {
                if guard.shutdown {
                    return;
                }
                if let Some(buffer) = guard.queue.pop_next() {
                    break buffer;
                }
                guard = match cvar.wait(guard) {
                    Ok(g) => g,
                    Err(_) => return,
                };
            }
        };

        log::debug!(
            "Player: playing chunk {} ({}ms)",
            buffer.sequence,
            buffer.duration_ms()
        );
        if let Err(e) = output.play(&buffer, &cancel) {
            log::warn!("Player: failed to play chunk {}: {}", buffer.sequence, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct Recorder {
        played: Arc<Mutex<Vec<u64>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    struct FakeOutput {
        rec: Recorder,
        delay: Duration,
    }

    impl AudioOutput for FakeOutput {
        fn play(&mut self, buffer: &PlaybackBuffer, _cancel: &AtomicBool) -> Result<(), AudioError> {
            let now = self.rec.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.rec.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.rec.played.lock().unwrap().push(buffer.sequence);
            self.rec.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Drop for FakeOutput {
        fn drop(&mut self) {
            self.rec.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn player_with(rec: &Recorder, delay: Duration) -> Player {
        let rec = rec.clone();
        Player::spawn(Box::new(
            move || -> Result<Box<dyn AudioOutput>, AudioError> {
                Ok(Box::new(FakeOutput { rec, delay }))
            },
        ))
        .unwrap()
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_queue_push_reports_start_only_when_idle() {
        let mut queue = PlaybackQueue::new();
        assert!(queue.push(vec![0.0; 10], 24000));
        assert!(!queue.push(vec![0.0; 10], 24000));
        assert!(queue.is_playing());

        assert_eq!(queue.pop_next().unwrap().sequence, 0);
        assert_eq!(queue.pop_next().unwrap().sequence, 1);
        assert!(queue.pop_next().is_none());
        assert!(!queue.is_playing());

        // Idle again, so the next push restarts playback
        assert!(queue.push(vec![0.0; 10], 24000));
    }

    #[test]
    fn test_queue_clear() {
        let mut queue = PlaybackQueue::new();
        queue.push(vec![0.0; 10], 24000);
        queue.push(vec![0.0; 10], 24000);
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_playing());
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = PlaybackBuffer {
            samples: vec![0.0; 2400],
            sample_rate: 24000,
            sequence: 0,
        };
        assert_eq!(buffer.duration_ms(), 100);
    }

    #[test]
    fn test_player_preserves_order_without_overlap() {
        let rec = Recorder::default();
        let player = player_with(&rec, Duration::from_millis(5));

        let mut starts = 0;
        for _ in 0..10 {
            if player.enqueue(vec![0.0; 240], 24000) {
                starts += 1;
            }
        }

        wait_for(|| rec.played.lock().unwrap().len() == 10);
        assert_eq!(*rec.played.lock().unwrap(), (0..10).collect::<Vec<u64>>());
        assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 1);
        // Everything after the first push queued behind the in-flight buffer
        assert_eq!(starts, 1);

        wait_for(|| !player.is_playing());
    }

    #[test]
    fn test_player_stop_abandons_queue_and_releases_output() {
        let rec = Recorder::default();
        let mut player = player_with(&rec, Duration::from_millis(50));

        for _ in 0..5 {
            player.enqueue(vec![0.0; 240], 24000);
        }
        player.stop();
        player.stop();

        assert!(rec.played.lock().unwrap().len() < 5);
        assert_eq!(rec.dropped.load(Ordering::SeqCst), 1);
        assert!(!player.enqueue(vec![0.0; 240], 24000));
    }

    #[test]
    fn test_player_factory_error_is_reported() {
        let result = Player::spawn(Box::new(|| -> Result<Box<dyn AudioOutput>, AudioError> {
            Err(AudioError::NoOutputDevice)
        }));
        assert!(matches!(result, Err(AudioError::NoOutputDevice)));
    }
}
