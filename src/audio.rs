use crate::state::CaptureStats;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Wire sample rate expected by the agent.
pub const TARGET_SAMPLE_RATE: u32 = 16000;
/// Samples per outbound frame (~256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;

/// Convert normalized float samples to 16-bit signed little-endian PCM.
/// Values are clamped to [-1, 1]; negatives scale by 32768, the rest by 32767.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            let v = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
            (v as i16).to_le_bytes()
        })
        .collect()
}

/// Cuts a continuous sample stream into fixed-size encoded frames.
pub struct FrameAssembler {
    pending: Vec<f32>,
    frame_samples: usize,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            pending: Vec::with_capacity(frame_samples * 2),
            frame_samples,
        }
    }

    /// Feed samples; returns every frame that is now complete, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            frames.push(float_to_pcm16(&frame));
        }
        frames
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Best-effort outbound path for frames: a frame is handed to the channel only if
/// its queue accepts it right now, otherwise it is dropped.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<CaptureStats>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Vec<u8>>, stats: Arc<CaptureStats>) -> Self {
        Self { tx, stats }
    }

    /// Returns true if the frame was accepted.
    pub fn offer(&self, frame: Vec<u8>) -> bool {
        let len = frame.len() as u64;
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Microphone seam used by the session controller.
pub trait AudioInput: Send {
    /// Acquire the device and start streaming frames into `sink`.
    fn start(&mut self, sink: FrameSink) -> Result<(), String>;
    /// Release the device. Returns only after capture has fully stopped.
    fn stop(&mut self);
    fn is_capturing(&self) -> bool;
}

/// Input from a cpal device, chosen by name or the system default.
pub struct CpalInput {
    device_name: Option<String>,
    capture: Option<AudioCapture>,
}

impl CpalInput {
    pub fn new(device_name: Option<&str>) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
            capture: None,
        }
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self, sink: FrameSink) -> Result<(), String> {
        if self.capture.is_some() {
            return Err("capture already running".into());
        }
        self.capture = Some(AudioCapture::start(self.device_name.as_deref(), sink)?);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping joins the device thread.
        self.capture = None;
    }

    fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

/// A running capture. The cpal stream lives on its own thread for its whole
/// lifetime; dropping this handle stops the stream and joins both threads.
pub struct AudioCapture {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    owner: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub fn start(device_name: Option<&str>, sink: FrameSink) -> Result<Self, String> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = device_name.map(str::to_string);

        let owner = std::thread::Builder::new()
            .name("voxlink-capture".into())
            .spawn(move || {
                let (stream, processor) = match open_stream(device_name.as_deref(), sink) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Block until stop is requested or the handle is gone.
                let _ = stop_rx.recv();
                drop(stream);
                let _ = processor.join();
                log::info!("[audio] device released");
            })
            .map_err(|e| format!("Failed to spawn capture thread: {}", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                owner: Some(owner),
            }),
            Ok(Err(e)) => {
                let _ = owner.join();
                Err(e)
            }
            Err(_) => {
                let _ = owner.join();
                Err("capture thread exited before the device opened".into())
            }
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }
}

fn open_stream(
    device_name: Option<&str>,
    sink: FrameSink,
) -> Result<(cpal::Stream, JoinHandle<()>), String> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| format!("Failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?
    } else {
        host.default_input_device()
            .ok_or("No default input device")?
    };

    let name = device.name().unwrap_or_else(|_| "unknown".into());
    log::info!("[audio] using device: {}", name);

    let config = match try_config(&device, TARGET_SAMPLE_RATE) {
        Some(cfg) => cfg,
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| format!("No input config: {}", e))?;
            log::info!(
                "[audio] {}Hz unavailable, using default {}Hz {}ch",
                TARGET_SAMPLE_RATE,
                default.sample_rate().0,
                default.channels()
            );
            StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        }
    };
    let input_rate = config.sample_rate.0;
    log::info!(
        "[audio] stream config: {}Hz, {}ch, resample to {}Hz",
        input_rate,
        config.channels,
        TARGET_SAMPLE_RATE
    );

    // Callback → processing thread. Full queue means the processor is behind;
    // the chunk is dropped rather than blocking the device callback.
    let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(128);
    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                forward_mono(data, channels, &raw_tx);
            },
            |err| {
                log::error!("[audio] stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("Failed to build stream: {}", e))?;

    stream
        .play()
        .map_err(|e| format!("Failed to start stream: {}", e))?;

    let processor = std::thread::Builder::new()
        .name("voxlink-frames".into())
        .spawn(move || process_audio(raw_rx, sink, input_rate))
        .map_err(|e| format!("Failed to spawn frame thread: {}", e))?;

    Ok((stream, processor))
}

fn forward_mono(data: &[f32], channels: usize, raw_tx: &SyncSender<Vec<f32>>) {
    let mono: Vec<f32> = if channels > 1 {
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    };
    let _ = raw_tx.try_send(mono);
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    // Prefer mono; otherwise take any channel count and downmix.
    let range = supported
        .iter()
        .filter(|r| r.sample_format() == cpal::SampleFormat::F32)
        .filter(|r| r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate)
        .min_by_key(|r| r.channels())?;
    Some(StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn process_audio(raw_rx: Receiver<Vec<f32>>, sink: FrameSink, input_rate: u32) {
    let mut resampler = ResamplerState::default();
    let mut assembler = FrameAssembler::new(FRAME_SAMPLES);
    let mut frames: u64 = 0;
    let mut dropped: u64 = 0;

    while let Ok(samples) = raw_rx.recv() {
        let samples = if input_rate == TARGET_SAMPLE_RATE {
            samples
        } else {
            resample_linear(&samples, input_rate, TARGET_SAMPLE_RATE, &mut resampler)
        };
        for frame in assembler.push(&samples) {
            if sink.offer(frame) {
                frames += 1;
            } else {
                dropped += 1;
            }
            if (frames + dropped) % 100 == 0 {
                log::debug!("[audio] frames sent={} dropped={}", frames, dropped);
            }
        }
    }

    log::info!(
        "[audio] processing thread stopped: frames sent={} dropped={} (partial frame of {} samples discarded)",
        frames,
        dropped,
        assembler.pending_samples()
    );
}

/// Carry-over between callback chunks so the output does not depend on how the
/// device splits its stream.
#[derive(Default)]
struct ResamplerState {
    /// Next output position, in input samples, relative to `last_sample`.
    pos: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut out = Vec::with_capacity((buf.len() as f64 / step) as usize + 2);
    let mut pos = state.pos;
    loop {
        let i = pos.floor() as usize;
        if i + 1 >= buf.len() {
            break;
        }
        let frac = (pos - i as f64) as f32;
        out.push(buf[i] + (buf[i + 1] - buf[i]) * frac);
        pos += step;
    }

    // Re-anchor on the last sample, which leads the next chunk.
    let last = buf.len() - 1;
    state.pos = pos - last as f64;
    state.last_sample = buf[last];
    state.has_last = true;
    out
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_i16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn pcm16_scales_asymmetrically_and_clamps() {
        let bytes = float_to_pcm16(&[1.0, -1.0, 0.0, 0.5, -0.5, 2.0, -3.0]);
        assert_eq!(bytes.len(), 14);
        assert_eq!(
            as_i16(&bytes),
            vec![32767, -32768, 0, 16383, -16384, 32767, -32768]
        );
    }

    #[test]
    fn pcm16_is_little_endian() {
        assert_eq!(float_to_pcm16(&[1.0]), vec![0xFF, 0x7F]);
        assert_eq!(float_to_pcm16(&[-1.0]), vec![0x00, 0x80]);
    }

    #[test]
    fn assembler_emits_fixed_frames_and_keeps_remainder() {
        let mut a = FrameAssembler::new(4);
        assert!(a.push(&[0.0; 3]).is_empty());
        let frames = a.push(&[0.0; 6]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 8));
        assert_eq!(a.pending_samples(), 1);
    }

    #[test]
    fn full_size_frame_is_8192_bytes() {
        let mut a = FrameAssembler::new(FRAME_SAMPLES);
        let frames = a.push(&vec![0.1; FRAME_SAMPLES]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_SAMPLES * 2);
    }

    #[test]
    fn frame_sink_drops_when_queue_full_or_closed() {
        let stats = Arc::new(CaptureStats::default());
        let (tx, mut rx) = mpsc::channel(1);
        let sink = FrameSink::new(tx, stats.clone());
        assert!(sink.offer(vec![1, 2]));
        assert!(!sink.offer(vec![3, 4]));
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2]);
        drop(rx);
        assert!(!sink.offer(vec![5, 6]));
        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_dropped, 2);
        assert_eq!(snap.bytes_sent, 2);
    }

    #[test]
    fn resampler_downsamples_48k_to_16k() {
        let mut state = ResamplerState::default();
        let input: Vec<f32> = (0..4800).map(|i| (i % 10) as f32 / 10.0).collect();
        let out = resample_linear(&input, 48000, 16000, &mut state);
        assert!((1598..=1601).contains(&out.len()), "got {}", out.len());
    }

    fn sine(rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * std::f32::consts::PI * 440.0 * n as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn resampler_output_does_not_depend_on_chunking() {
        for (rate, chunk) in [(44100, 100), (44100, 512), (48000, 100), (22050, 37)] {
            let input = sine(rate, 8820);
            let whole = resample_linear(&input, rate, 16000, &mut ResamplerState::default());

            let mut state = ResamplerState::default();
            let pieces: Vec<f32> = input
                .chunks(chunk)
                .flat_map(|c| resample_linear(c, rate, 16000, &mut state))
                .collect();

            assert_eq!(pieces.len(), whole.len(), "rate={} chunk={}", rate, chunk);
            for (i, (a, b)) in pieces.iter().zip(&whole).enumerate() {
                assert!(
                    (a - b).abs() < 1e-4,
                    "rate={} chunk={} sample {}: {} vs {}",
                    rate,
                    chunk,
                    i,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn resampler_upsamples_without_gaps() {
        let mut state = ResamplerState::default();
        let input = sine(8000, 800);
        let mut out = resample_linear(&input[..333], 8000, 16000, &mut state);
        out.extend(resample_linear(&input[333..], 8000, 16000, &mut state));
        assert!((1598..=1600).contains(&out.len()), "got {}", out.len());
        // Even outputs land on input samples.
        assert!((out[666] - input[333]).abs() < 1e-6);
    }

    #[test]
    fn resampler_passes_through_equal_rates() {
        let mut state = ResamplerState::default();
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 16000, 16000, &mut state), input);
    }
}
