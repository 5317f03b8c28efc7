//! Microphone capture
//!
//! Opens the default input device at the preferred rate and conditions the
//! signal according to [`CaptureSettings`]: a noise gate, peak-tracking gain
//! control, and far-end attenuation while the remote sink is playing (the
//! echo-control stand-in for platform echo cancellation).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};
use tokio::sync::mpsc;

use crate::config::CaptureSettings;
use crate::{Error, Result};

/// Preferred capture sample rate (matches the realtime service input)
pub const SAMPLE_RATE: u32 = 24000;

/// Samples per 20 ms opus frame at the preferred rate
pub const FRAME_SAMPLES: usize = 480;

/// RMS floor below which frames are gated as noise
const NOISE_FLOOR: f32 = 0.01;

/// Peak level the gain control normalizes toward
const AGC_TARGET_PEAK: f32 = 0.7;

/// Attenuation applied while the far end is audible. The microphone stays
/// live so the remote VAD can still hear the user barge in.
const FAR_END_ATTENUATION: f32 = 0.5;

/// Live microphone capture.
///
/// The cpal stream lives on its own thread; this handle carries the frame
/// channel and the stop signal. Dropping the handle stops the capture.
pub struct AudioCapture {
    frames: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapture {
    /// Acquire the default input device and start capturing.
    ///
    /// The stream is started immediately; cpal backends that create streams
    /// in a paused state are resumed by the initial `play()` before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] when no usable input device or
    /// config exists and [`Error::PermissionDenied`] when the platform
    /// refuses device access.
    pub fn open(settings: &CaptureSettings, far_end_active: Arc<AtomicBool>) -> Result<Self> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let settings = settings.clone();
        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                match build_stream(&settings, frame_tx, &far_end_active) {
                    Ok(stream) => {
                        // Streams may start paused; play() resumes them.
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));
                        // Park until the handle signals stop (or is dropped)
                        let _ = stop_rx.recv();
                        drop(stream);
                        tracing::debug!("audio capture stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(sample_rate = SAMPLE_RATE, "audio capture started");
                Ok(Self {
                    frames: Some(frame_rx),
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("capture thread exited early".to_string())),
        }
    }

    /// Take the frame receiver (conditioned mono f32 at [`SAMPLE_RATE`]).
    ///
    /// Yields `None` after the first call.
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<f32>>> {
        self.frames.take()
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find the input device and a config at the preferred rate (mono first,
/// any channel count as fallback).
fn select_input(device: &Device) -> Result<StreamConfig> {
    let configs = || {
        device
            .supported_input_configs()
            .map_err(|e| Error::PermissionDenied(e.to_string()))
    };

    let supported = configs()?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .map_or_else(
            || {
                configs().ok().and_then(|mut iter| {
                    iter.find(|c| {
                        c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                            && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
                    })
                })
            },
            Some,
        )
        .ok_or_else(|| Error::DeviceUnavailable("no suitable input config found".to_string()))?;

    Ok(supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
}

/// Build the input stream on the capture thread
fn build_stream(
    settings: &CaptureSettings,
    frame_tx: mpsc::UnboundedSender<Vec<f32>>,
    far_end_active: &Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let config = select_input(&device)?;
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let mut conditioner = Conditioner::new(settings.clone());
    let far_end = Arc::clone(far_end_active);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut frame = downmix(data, channels);
                conditioner.condition(&mut frame, far_end.load(Ordering::Relaxed));
                let _ = frame_tx.send(frame);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                Error::DeviceUnavailable("input device disappeared".to_string())
            }
            other => Error::PermissionDenied(other.to_string()),
        })?;

    Ok(stream)
}

/// Interleaved multi-channel to mono by averaging
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Software signal conditioning applied in the capture callback
struct Conditioner {
    settings: CaptureSettings,
    peak: f32,
}

impl Conditioner {
    const fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            peak: 0.0,
        }
    }

    fn condition(&mut self, frame: &mut [f32], far_end_active: bool) {
        if frame.is_empty() {
            return;
        }

        if self.settings.echo_cancellation && far_end_active {
            for s in frame.iter_mut() {
                *s *= FAR_END_ATTENUATION;
            }
        }

        if self.settings.noise_suppression && rms_energy(frame) < NOISE_FLOOR {
            frame.fill(0.0);
            return;
        }

        if self.settings.auto_gain_control {
            let frame_peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            self.peak = self.peak.mul_add(0.995, 0.0).max(frame_peak);
            if self.peak > 0.01 {
                let gain = (AGC_TARGET_PEAK / self.peak).clamp(0.5, 4.0);
                for s in frame.iter_mut() {
                    *s = (*s * gain).clamp(-1.0, 1.0);
                }
            }
        }
    }
}

/// RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_of_silence_is_zero() {
        assert!(rms_energy(&vec![0.0; 480]) < 0.001);
        assert!((rms_energy(&[]) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn energy_of_tone_is_positive() {
        let loud = vec![0.5f32; 480];
        assert!(rms_energy(&loud) > 0.4);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [0.2, 0.4, -0.2, -0.4];
        let mono = downmix(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn noise_gate_zeroes_quiet_frames() {
        let mut conditioner = Conditioner::new(CaptureSettings::default());
        let mut frame = vec![0.001f32; 480];
        conditioner.condition(&mut frame, false);
        assert!(frame.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn gate_passes_speech_level_frames() {
        let settings = CaptureSettings {
            auto_gain_control: false,
            ..CaptureSettings::default()
        };
        let mut conditioner = Conditioner::new(settings);
        let mut frame = vec![0.2f32; 480];
        conditioner.condition(&mut frame, false);
        assert!(frame.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn far_end_attenuates_when_echo_cancellation_enabled() {
        let settings = CaptureSettings {
            noise_suppression: false,
            auto_gain_control: false,
            ..CaptureSettings::default()
        };
        let mut conditioner = Conditioner::new(settings);
        let mut frame = vec![0.4f32; 16];
        conditioner.condition(&mut frame, true);
        assert!(frame.iter().all(|s| (*s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn agc_boosts_quiet_speech() {
        let settings = CaptureSettings {
            noise_suppression: false,
            echo_cancellation: false,
            ..CaptureSettings::default()
        };
        let mut conditioner = Conditioner::new(settings);
        let mut frame = vec![0.1f32; 480];
        conditioner.condition(&mut frame, false);
        // 0.1 peak against a 0.7 target clamps at the 4x gain ceiling
        assert!(frame.iter().all(|s| (*s - 0.4).abs() < 1e-3));
    }
}
