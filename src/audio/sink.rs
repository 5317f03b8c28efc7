//! Remote audio sink
//!
//! Plays decoded assistant audio on the default output device. Unmuted and
//! at full volume by default. The sink also exposes a "far end active" flag
//! that the capture conditioner uses for echo control.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::audio::capture::SAMPLE_RATE;
use crate::{Error, Result};

/// Shared sink state touched from the output callback and the decode task
#[derive(Debug)]
struct SinkShared {
    queue: Mutex<VecDeque<f32>>,
    /// Volume as f32 bits; 1.0 by default
    volume: AtomicU32,
    muted: AtomicBool,
    far_end_active: Arc<AtomicBool>,
}

/// Cheap, cloneable handle for pushing samples and adjusting playback
#[derive(Debug, Clone)]
pub struct SinkHandle {
    shared: Arc<SinkShared>,
}

impl SinkHandle {
    /// Queue decoded samples (mono f32 at the session sample rate)
    pub fn push(&self, samples: &[f32]) {
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.extend(samples.iter().copied());
        self.shared.far_end_active.store(true, Ordering::Relaxed);
    }

    /// Set playback volume (clamped to `0.0..=1.0`)
    pub fn set_volume(&self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Current playback volume
    #[must_use]
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }

    /// Mute or unmute playback
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    /// Whether playback is muted
    #[must_use]
    pub fn muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    /// Whether queued far-end audio is still playing
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.far_end_active.load(Ordering::Relaxed)
    }
}

/// Remote audio sink owning the playback stream thread
pub struct RemoteAudioSink {
    shared: Arc<SinkShared>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RemoteAudioSink {
    /// Open the default output device and start the playback stream.
    ///
    /// `far_end_active` is raised while queued audio is playing and lowered
    /// when the queue drains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] when no output device or config
    /// is usable.
    pub fn open(far_end_active: Arc<AtomicBool>) -> Result<Self> {
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(VecDeque::new()),
            volume: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            far_end_active,
        });

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("remote-audio".to_string())
            .spawn(move || match build_stream(&thread_shared) {
                Ok(stream) => {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("remote audio sink stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(sample_rate = SAMPLE_RATE, "remote audio sink started");
                Ok(Self {
                    shared,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("playback thread exited early".to_string())),
        }
    }

    /// Handle for the decode task and playback controls
    #[must_use]
    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop playback and release the device
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared.far_end_active.store(false, Ordering::Relaxed);
    }
}

impl Drop for RemoteAudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the output stream on the playback thread
fn build_stream(shared: &Arc<SinkShared>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config();
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "remote audio sink initialized"
    );

    let shared = Arc::clone(shared);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
                let muted = shared.muted.load(Ordering::Relaxed);
                let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);

                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    let out = if muted { 0.0 } else { sample * volume };
                    for slot in frame.iter_mut() {
                        *slot = out;
                    }
                }

                if queue.is_empty() {
                    shared.far_end_active.store(false, Ordering::Relaxed);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SinkHandle {
        SinkHandle {
            shared: Arc::new(SinkShared {
                queue: Mutex::new(VecDeque::new()),
                volume: AtomicU32::new(1.0f32.to_bits()),
                muted: AtomicBool::new(false),
                far_end_active: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    #[test]
    fn defaults_are_unmuted_full_volume() {
        let sink = handle();
        assert!(!sink.muted());
        assert!((sink.volume() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn pushing_samples_raises_far_end_flag() {
        let sink = handle();
        assert!(!sink.is_active());
        sink.push(&[0.1, 0.2]);
        assert!(sink.is_active());
    }

    #[test]
    fn volume_is_clamped() {
        let sink = handle();
        sink.set_volume(2.5);
        assert!((sink.volume() - 1.0).abs() < f32::EPSILON);
        sink.set_volume(-1.0);
        assert!(sink.volume().abs() < f32::EPSILON);
    }
}
