use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;

/// Microphone capture producing 16-bit little-endian mono PCM chunks at the
/// requested rate. The cpal stream is not `Send`, so it is owned by a
/// dedicated thread; dropping the handle stops it and closes the audio
/// channel.
pub struct MicCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl MicCapture {
    pub fn start(
        device_name: Option<&str>,
        audio_tx: mpsc::Sender<Vec<u8>>,
        target_rate: u32,
    ) -> Result<Self, String> {
        let device_name = device_name.map(str::to_string);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), audio_tx, target_rate) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("[audio] capture stopped");
            })
            .map_err(|e| format!("Failed to spawn capture thread: {}", e))?;

        ready_rx
            .recv()
            .map_err(|_| "Capture thread exited before starting".to_string())??;
        Ok(Self {
            stop_tx: Some(stop_tx),
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(
    device_name: Option<&str>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    target_rate: u32,
) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| format!("Failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?,
        None => host
            .default_input_device()
            .ok_or("No default input device")?,
    };
    log::info!(
        "[audio] using device: {}",
        device.name().unwrap_or_else(|_| "unknown".into())
    );

    let config = match try_config(&device, target_rate) {
        Some(cfg) => cfg,
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| format!("No input config: {}", e))?;
            StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        }
    };
    log::info!(
        "[audio] stream config: {}Hz, {}ch, target={}Hz",
        config.sample_rate.0,
        config.channels,
        target_rate
    );

    // Callback -> processing thread; the callback must never block.
    let (raw_tx, raw_rx) = std_mpsc::sync_channel::<Vec<f32>>(128);
    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = raw_tx.try_send(downmix(data, channels));
            },
            |err| log::error!("[audio] stream error: {}", err),
            None,
        )
        .map_err(|e| format!("Failed to build stream: {}", e))?;
    stream
        .play()
        .map_err(|e| format!("Failed to start stream: {}", e))?;

    let input_rate = config.sample_rate.0;
    std::thread::Builder::new()
        .name("mic-process".into())
        .spawn(move || process_audio(raw_rx, audio_tx, input_rate, target_rate))
        .map_err(|e| format!("Failed to spawn audio processor: {}", e))?;

    Ok(stream)
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    let fits = |r: &cpal::SupportedStreamConfigRange| {
        r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate
    };
    // Prefer mono; anything else is downmixed.
    let range = supported
        .iter()
        .find(|r| r.channels() == 1 && fits(r))
        .or_else(|| supported.iter().find(|r| fits(r)))?;
    Some(StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

/// Ends when the stream is dropped (raw channel closes) or the consumer
/// goes away; either way `audio_tx` is dropped, which signals end of audio.
fn process_audio(
    raw_rx: std_mpsc::Receiver<Vec<f32>>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    input_rate: u32,
    target_rate: u32,
) {
    let mut resampler = ResamplerState::default();
    while let Ok(samples) = raw_rx.recv() {
        let resampled = resample_linear(&samples, input_rate, target_rate, &mut resampler);
        let pcm = to_pcm16(&resampled);
        if pcm.is_empty() {
            continue;
        }
        if audio_tx.blocking_send(pcm).is_err() {
            break;
        }
    }
}

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    }
}

fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            clamped.to_le_bytes()
        })
        .collect()
}

#[derive(Default)]
struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate || target_rate == 0 {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    loop {
        // A position carried over from the previous chunk may sit past `buf[1]`.
        while t >= 1.0 && i + 1 < buf.len() {
            t -= 1.0;
            i += 1;
        }
        if i + 1 >= buf.len() {
            break;
        }
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}
