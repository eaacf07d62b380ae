//! # Playback Scheduler
//!
//! Receives inbound audio frames and schedules them on a monotonically
//! advancing virtual audio clock so consecutive frames play back-to-back
//! with no gap and no overlap.
//!
//! ## How gapless works:
//! The scheduler keeps one cursor, `next_play_time`: the clock timestamp at
//! which the next frame must begin. Each drained frame is scheduled at
//! `max(clock_now, next_play_time)` and the cursor advances by the frame's
//! duration. Bursts that arrive late still play back-to-back because
//! scheduling is driven by the cumulative cursor, not by wall-clock arrival
//! time; when the queue underruns, the cursor simply falls behind the clock
//! and the next frame schedules at "now".
//!
//! ## The output abstraction:
//! The host audio subsystem is a collaborator, reached through the
//! [`AudioOutput`] trait: a current-time clock plus "schedule this buffer at
//! time T". The application only ever schedules *future* buffers; it never
//! renders samples itself. `resume()` is an explicit, idempotent operation
//! invoked at the start of every drain, so a suspended clock can never
//! silently swallow the first frame.

use crate::audio::codec::AudioFrame;
use crate::error::ClientResult;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Clock-and-sink interface of the host audio subsystem.
///
/// Implementations must be cheap to call from the drain task: `schedule`
/// hands samples over, it does not block until they play.
pub trait AudioOutput: Send + Sync {
    /// Current time on the audio clock, in seconds. Monotone.
    fn now(&self) -> f64;

    /// Resume the clock if the host suspended it. Idempotent.
    fn resume(&self) -> ClientResult<()>;

    /// Schedule normalized samples to begin playing at `start_time` on this
    /// clock.
    fn schedule(&self, samples: Vec<f32>, sample_rate: u32, start_time: f64) -> ClientResult<()>;

    /// Forcibly stop anything scheduled and not yet (or currently) playing.
    fn cancel_all(&self);
}

/// An output that keeps wall-clock time but renders nothing. Used by
/// headless runs (no speaker) and as the default for recording-only
/// sessions: frames are still drained, timed and recorded, just not heard.
pub struct NullOutput {
    started: Instant,
}

impl NullOutput {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for NullOutput {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn resume(&self) -> ClientResult<()> {
        Ok(())
    }

    fn schedule(&self, _samples: Vec<f32>, _sample_rate: u32, _start_time: f64) -> ClientResult<()> {
        Ok(())
    }

    fn cancel_all(&self) {}
}

/// Mutable scheduler state, guarded by one mutex. Every mutation, in
/// particular `stop()`'s clear-queue-and-rebase, happens in a single locked
/// section with no await inside, so callbacks can never observe a half-torn
/// queue.
struct PlaybackInner {
    /// Pending frames, FIFO, unbounded
    queue: VecDeque<AudioFrame>,
    /// Clock timestamp at which the next scheduled frame must begin
    next_play_time: f64,
    /// A drain task is currently running
    draining: bool,
    /// Bumped by `stop()`; a drain task that observes a newer generation
    /// exits without touching the queue, so a stop can never race a stale
    /// drainer back to life
    generation: u64,
}

/// The playback scheduler. Cheap to clone; clones share the queue, cursor
/// and output.
#[derive(Clone)]
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    inner: Arc<Mutex<PlaybackInner>>,
}

/// Sleep chunk for the completion wait: short enough that a stop() is
/// noticed promptly, long enough not to spin.
const COMPLETION_POLL: Duration = Duration::from_millis(10);

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            inner: Arc::new(Mutex::new(PlaybackInner {
                queue: VecDeque::new(),
                next_play_time: 0.0,
                draining: false,
                generation: 0,
            })),
        }
    }

    /// Append a frame to the queue and start the drain loop if it is idle.
    /// Empty frames are dropped; there is nothing to schedule.
    pub fn enqueue(&self, frame: AudioFrame) {
        if frame.is_empty() {
            debug!("Dropping empty inbound frame");
            return;
        }

        let start_drain = {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.push_back(frame);
            if inner.draining {
                None
            } else {
                inner.draining = true;
                Some(inner.generation)
            }
        };

        if let Some(generation) = start_drain {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.drain_loop(generation).await;
            });
        }
    }

    /// Empty the queue, cancel in-flight scheduled audio, and rebase the
    /// cursor to the clock's current time. Safe from any state; used when
    /// the user interrupts playback or the session ends.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.queue.len();
        inner.queue.clear();
        inner.generation += 1;
        inner.draining = false;
        self.output.cancel_all();
        inner.next_play_time = self.output.now();
        info!(dropped_frames = dropped, "Playback stopped, queue cleared");
    }

    /// Number of frames waiting to be scheduled.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// The cursor value: where the next frame will begin if it arrives
    /// before the clock catches up.
    pub fn next_play_time(&self) -> f64 {
        self.inner.lock().unwrap().next_play_time
    }

    /// Drain the queue one frame at a time until it is empty, then go idle.
    async fn drain_loop(self, generation: u64) {
        // A suspended clock would schedule everything into a void
        if let Err(err) = self.output.resume() {
            warn!("Audio clock resume failed: {}", err);
        }

        loop {
            let frame = {
                let mut inner = self.inner.lock().unwrap();
                if inner.generation != generation {
                    return; // superseded by stop()
                }
                match inner.queue.pop_front() {
                    Some(frame) => frame,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };

            let duration = frame.duration_seconds();
            let end_time = {
                let mut inner = self.inner.lock().unwrap();
                if inner.generation != generation {
                    return;
                }
                // Always read a fresh "now": after a cold start or a clock
                // recreation the cursor may be far in the past, and a stale
                // reference would schedule the frame there.
                let now = self.output.now();
                let start_time = now.max(inner.next_play_time);

                match self
                    .output
                    .schedule(frame.to_f32(), frame.sample_rate, start_time)
                {
                    Ok(()) => {
                        inner.next_play_time = start_time + duration;
                        inner.next_play_time
                    }
                    Err(err) => {
                        // One bad frame must not silence the rest
                        warn!("Skipping unplayable frame: {}", err);
                        continue;
                    }
                }
            };

            // Completion wait: this frame has finished rendering once the
            // clock passes its end. Chunked so a stop() is noticed quickly.
            loop {
                if self.inner.lock().unwrap().generation != generation {
                    return;
                }
                let now = self.output.now();
                if now >= end_time {
                    break;
                }
                let remaining = Duration::from_secs_f64(end_time - now);
                tokio::time::sleep(remaining.min(COMPLETION_POLL)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Output with a manually driven clock that records every schedule call.
    struct MockOutput {
        clock: Mutex<f64>,
        scheduled: Mutex<Vec<(f64, usize, u32)>>,
        resumes: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl MockOutput {
        fn new(start: f64) -> Arc<Self> {
            Arc::new(Self {
                clock: Mutex::new(start),
                scheduled: Mutex::new(Vec::new()),
                resumes: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
            })
        }

        fn advance_to(&self, t: f64) {
            *self.clock.lock().unwrap() = t;
        }

        fn starts(&self) -> Vec<f64> {
            self.scheduled.lock().unwrap().iter().map(|s| s.0).collect()
        }
    }

    impl AudioOutput for MockOutput {
        fn now(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn resume(&self) -> ClientResult<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn schedule(&self, samples: Vec<f32>, sample_rate: u32, start_time: f64) -> ClientResult<()> {
            self.scheduled
                .lock()
                .unwrap()
                .push((start_time, samples.len(), sample_rate));
            Ok(())
        }

        fn cancel_all(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 0.25 s of 24 kHz audio; the duration is exact in f64, which keeps the
    /// cursor arithmetic in these tests exact as well.
    fn quarter_second_frame() -> AudioFrame {
        AudioFrame::new(vec![100; 6000], 24_000)
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// After draining N frames the cursor equals the first start plus the
    /// sum of all durations (no gaps, no overlap) even when frames are
    /// enqueued with arbitrary delays.
    #[tokio::test]
    async fn test_gapless_cursor_arithmetic() {
        let output = MockOutput::new(5.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(quarter_second_frame());
        scheduler.enqueue(quarter_second_frame());
        wait_until("first frame scheduled", || output.starts().len() == 1).await;

        // First frame starts at "now" (cursor was at 0, clock at 5)
        assert_eq!(output.starts()[0], 5.0);

        // Let the first frame finish; the second must butt up exactly
        output.advance_to(5.25);
        wait_until("second frame scheduled", || output.starts().len() == 2).await;
        assert_eq!(output.starts()[1], 5.25);

        // A late third frame, enqueued mid-playback, still lands on the cursor
        scheduler.enqueue(quarter_second_frame());
        output.advance_to(5.5);
        wait_until("third frame scheduled", || output.starts().len() == 3).await;
        assert_eq!(output.starts()[2], 5.5);

        assert_eq!(scheduler.next_play_time(), 5.75);

        // Drain goes idle once the queue empties
        output.advance_to(5.75);
        wait_until("queue drained", || scheduler.queue_len() == 0).await;
    }

    /// Stopping playback rebases the cursor to "now"; a frame enqueued right
    /// after must never schedule at the stale pre-stop cursor.
    #[tokio::test]
    async fn test_stop_rebases_cursor_to_now() {
        let output = MockOutput::new(1.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(quarter_second_frame());
        wait_until("first frame scheduled", || output.starts().len() == 1).await;
        // Cursor is now 1.25, ahead of the clock (still 1.0)
        assert_eq!(scheduler.next_play_time(), 1.25);

        scheduler.stop();
        assert_eq!(scheduler.next_play_time(), 1.0);
        assert_eq!(output.cancels.load(Ordering::SeqCst), 1);

        scheduler.enqueue(quarter_second_frame());
        wait_until("post-stop frame scheduled", || output.starts().len() == 2).await;
        // Scheduled at "now", not at the stale 1.25
        assert_eq!(output.starts()[1], 1.0);
    }

    /// When the queue underruns, the cursor falls behind the clock and the
    /// next frame schedules immediately at "now".
    #[tokio::test]
    async fn test_underrun_resumes_at_now() {
        let output = MockOutput::new(2.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(quarter_second_frame());
        wait_until("first frame scheduled", || output.starts().len() == 1).await;
        output.advance_to(2.25);
        wait_until("drain idle", || scheduler.queue_len() == 0).await;

        // Silence for a while, then a new burst arrives
        output.advance_to(4.0);
        scheduler.enqueue(quarter_second_frame());
        wait_until("resumed frame scheduled", || output.starts().len() == 2).await;
        assert_eq!(output.starts()[1], 4.0);
        assert_eq!(scheduler.next_play_time(), 4.25);
    }

    /// The clock resume is explicit and happens on every drain start.
    #[tokio::test]
    async fn test_resume_invoked_per_drain() {
        let output = MockOutput::new(0.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(quarter_second_frame());
        output.advance_to(0.25);
        wait_until("drain idle", || scheduler.queue_len() == 0).await;
        wait_until("resume seen", || output.resumes.load(Ordering::SeqCst) == 1).await;

        scheduler.enqueue(quarter_second_frame());
        output.advance_to(0.75);
        wait_until("second resume seen", || {
            output.resumes.load(Ordering::SeqCst) == 2
        })
        .await;
    }

    /// Empty frames are dropped without disturbing the cursor.
    #[tokio::test]
    async fn test_empty_frame_dropped() {
        let output = MockOutput::new(0.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.enqueue(AudioFrame::new(Vec::new(), 24_000));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(output.starts().is_empty());
        assert_eq!(scheduler.queue_len(), 0);
    }
}
