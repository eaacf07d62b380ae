//! # Audio Device Binding
//!
//! cpal-backed implementations of the two host-audio collaborator
//! interfaces: [`AudioSource`] (microphone capture) and [`AudioOutput`]
//! (speaker clock + sink). Only this module touches real hardware; the rest
//! of the pipeline is written against the traits, which is also why the
//! whole module sits behind the `device` cargo feature.
//!
//! ## Thread model:
//! cpal streams are not `Send`, so each stream lives on a dedicated worker
//! thread for its whole lifetime. The real-time callbacks exchange samples
//! with the async side through channels and shared queues; startup errors
//! travel back over a ready-channel so acquisition failures surface at the
//! call site, typed.

use crate::audio::playback::AudioOutput;
use crate::capture::AudioSource;
use crate::error::{ClientError, ClientResult};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How long device acquisition may take before it is reported as
/// unavailable.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a cpal startup failure onto the acquisition error taxonomy. Linux
/// backends report permission problems as backend-specific errors, so the
/// message is inspected rather than the variant.
fn acquisition_error(context: &str, message: String) -> ClientError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        ClientError::PermissionDenied(format!("{}: {}", context, message))
    } else {
        ClientError::DeviceUnavailable(format!("{}: {}", context, message))
    }
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|| "unknown device".to_string())
}

/// The default system microphone, delivering fixed-size f32 blocks.
pub struct MicrophoneSource {
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Prepare a source for the given capture rate. No hardware is touched
    /// until `start`; acquisition is the permission-gated step.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl AudioSource for MicrophoneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, block_size: usize) -> ClientResult<mpsc::UnboundedReceiver<Vec<f32>>> {
        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<ClientResult<()>>();

        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();
        let sample_rate = self.sample_rate;

        let worker = std::thread::spawn(move || {
            let build = move || -> ClientResult<cpal::Stream> {
                let host = cpal::default_host();
                let device = host.default_input_device().ok_or_else(|| {
                    ClientError::DeviceUnavailable("no default input device".to_string())
                })?;
                info!(device = %device_name(&device), "Microphone acquired");

                let config = cpal::StreamConfig {
                    channels: 1,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                // The callback accumulates hardware-sized chunks into the
                // fixed block size the capture session expects
                let mut pending: Vec<f32> = Vec::with_capacity(block_size);
                let stream = device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                            for &sample in data {
                                pending.push(sample);
                                if pending.len() == block_size {
                                    let block = std::mem::replace(
                                        &mut pending,
                                        Vec::with_capacity(block_size),
                                    );
                                    let _ = block_tx.send(block);
                                }
                            }
                        },
                        |err| error!("Microphone stream error: {}", err),
                        None,
                    )
                    .map_err(|e| acquisition_error("input stream", e.to_string()))?;

                stream
                    .play()
                    .map_err(|e| acquisition_error("input stream start", e.to_string()))?;
                Ok(stream)
            };

            match build() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // The stream must stay alive on this thread; park until
                    // told to release it
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    drop(stream);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            }
        });

        match ready_rx.recv_timeout(ACQUIRE_TIMEOUT) {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                Ok(block_rx)
            }
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => Err(ClientError::DeviceUnavailable(
                "timed out acquiring microphone".to_string(),
            )),
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// One buffer handed to the speaker, due at `start_time` on the output
/// clock.
struct ScheduledBuffer {
    start_time: f64,
    samples: Vec<f32>,
    pos: usize,
}

/// State shared between the scheduler side and the real-time callback.
struct SpeakerShared {
    queue: Mutex<VecDeque<ScheduledBuffer>>,
    /// Samples emitted since the stream started; this counter *is* the
    /// audio clock
    emitted: AtomicU64,
}

/// Produce the sample due at clock time `t`: the front buffer once it is
/// due, silence while nothing is, skipping exhausted buffers.
fn next_output_sample(queue: &mut VecDeque<ScheduledBuffer>, t: f64) -> f32 {
    loop {
        let Some(front) = queue.front_mut() else {
            return 0.0; // underrun: render silence
        };
        if front.pos >= front.samples.len() {
            queue.pop_front();
            continue;
        }
        if front.start_time > t {
            return 0.0; // not due yet
        }
        let sample = front.samples[front.pos];
        front.pos += 1;
        return sample;
    }
}

/// The default system speaker as an [`AudioOutput`]: a sample-counter clock
/// plus schedule-at-time playback.
pub struct SpeakerOutput {
    sample_rate: u32,
    shared: Arc<SpeakerShared>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SpeakerOutput {
    /// Prepare an output for the given playback rate. The stream itself is
    /// opened by the first `resume()`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            shared: Arc::new(SpeakerShared {
                queue: Mutex::new(VecDeque::new()),
                emitted: AtomicU64::new(0),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl AudioOutput for SpeakerOutput {
    fn now(&self) -> f64 {
        self.shared.emitted.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    /// Open the output stream if it is not already running. Idempotent: a
    /// second call with a live stream returns immediately.
    fn resume(&self) -> ClientResult<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<ClientResult<()>>();
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let sample_rate = self.sample_rate;

        let handle = std::thread::spawn(move || {
            let build = {
                let shared = shared.clone();
                move || -> ClientResult<cpal::Stream> {
                    let host = cpal::default_host();
                    let device = host.default_output_device().ok_or_else(|| {
                        ClientError::DeviceUnavailable("no default output device".to_string())
                    })?;
                    info!(device = %device_name(&device), "Speaker acquired");

                    let config = cpal::StreamConfig {
                        channels: 1,
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };

                    let stream = device
                        .build_output_stream(
                            &config,
                            move |out: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                                let mut queue = shared.queue.lock().unwrap();
                                let mut position = shared.emitted.load(Ordering::SeqCst);
                                for slot in out.iter_mut() {
                                    let t = position as f64 / sample_rate as f64;
                                    *slot = next_output_sample(&mut queue, t);
                                    position += 1;
                                }
                                shared.emitted.store(position, Ordering::SeqCst);
                            },
                            |err| error!("Speaker stream error: {}", err),
                            None,
                        )
                        .map_err(|e| acquisition_error("output stream", e.to_string()))?;

                    stream
                        .play()
                        .map_err(|e| acquisition_error("output stream start", e.to_string()))?;
                    Ok(stream)
                }
            };

            match build() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    drop(stream);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            }
        });

        match ready_rx.recv_timeout(ACQUIRE_TIMEOUT) {
            Ok(Ok(())) => {
                *worker = Some(handle);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => Err(ClientError::DeviceUnavailable(
                "timed out acquiring speaker".to_string(),
            )),
        }
    }

    fn schedule(&self, samples: Vec<f32>, sample_rate: u32, start_time: f64) -> ClientResult<()> {
        if sample_rate != self.sample_rate {
            // The wire guarantees one inbound rate; a mismatch means a
            // misconfigured session, not a per-frame condition
            warn!(
                frame_rate = sample_rate,
                output_rate = self.sample_rate,
                "Frame sample rate differs from output rate"
            );
        }
        self.shared.queue.lock().unwrap().push_back(ScheduledBuffer {
            start_time,
            samples,
            pos: 0,
        });
        Ok(())
    }

    fn cancel_all(&self) {
        self.shared.queue.lock().unwrap().clear();
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}
