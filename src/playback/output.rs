use super::fetch::PlaybackError;
use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// PCM ready to hand to the output.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Arc<Vec<i16>>,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as u64 / self.channels.max(1) as u64;
        Duration::from_millis(frames * 1000 / self.sample_rate.max(1) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Stopped,
    Failed(String),
}

/// The single audio sink shared by both playback paths.
pub trait AudioOutput: Send + Sync {
    fn is_suspended(&self) -> bool;
    fn resume(&self) -> Result<(), PlaybackError>;
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError>;
    /// Starts a one-shot playback without blocking. The receiver resolves
    /// when it ends, including failures found after the request was accepted.
    fn start(&self, audio: DecodedAudio)
        -> Result<oneshot::Receiver<PlaybackOutcome>, PlaybackError>;
    fn stop(&self);
}

pub fn decode_audio(bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
    let decoder = Decoder::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<i16> = decoder.collect();
    if samples.is_empty() {
        return Err(PlaybackError::Decode("no samples decoded".into()));
    }
    Ok(DecodedAudio {
        channels,
        sample_rate,
        samples: Arc::new(samples),
    })
}

enum Command {
    Start {
        audio: DecodedAudio,
        done: oneshot::Sender<PlaybackOutcome>,
    },
    Stop,
    Resume {
        reply: std_mpsc::Sender<Result<(), PlaybackError>>,
    },
}

/// rodio output. The output stream is not `Send`, so it lives on its own
/// thread and is driven through a command channel.
pub struct RodioOutput {
    commands: std_mpsc::Sender<Command>,
    suspended: Arc<AtomicBool>,
}

impl RodioOutput {
    pub fn spawn() -> Result<Self, String> {
        let (commands, rx) = std_mpsc::channel();
        let suspended = Arc::new(AtomicBool::new(true));
        let flag = suspended.clone();
        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || output_thread(rx, flag))
            .map_err(|e| format!("Failed to spawn audio output thread: {}", e))?;
        Ok(Self {
            commands,
            suspended,
        })
    }

    fn send(&self, command: Command) -> Result<(), PlaybackError> {
        self.commands
            .send(command)
            .map_err(|_| PlaybackError::Other("audio output thread stopped".into()))
    }
}

impl AudioOutput for RodioOutput {
    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Blocks until the output thread has tried to open a device.
    fn resume(&self) -> Result<(), PlaybackError> {
        let (reply, result) = std_mpsc::channel();
        self.send(Command::Resume { reply })?;
        result
            .recv()
            .map_err(|_| PlaybackError::Other("audio output thread stopped".into()))?
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
        decode_audio(bytes)
    }

    fn start(
        &self,
        audio: DecodedAudio,
    ) -> Result<oneshot::Receiver<PlaybackOutcome>, PlaybackError> {
        if self.is_suspended() {
            return Err(PlaybackError::Suspended);
        }
        let (done, done_rx) = oneshot::channel();
        self.send(Command::Start { audio, done })?;
        Ok(done_rx)
    }

    fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

fn open_device() -> Option<(OutputStream, OutputStreamHandle)> {
    match OutputStream::try_default() {
        Ok(device) => Some(device),
        Err(e) => {
            log::warn!("[output] no output device: {}", e);
            None
        }
    }
}

fn finish(active: &mut Option<(Sink, oneshot::Sender<PlaybackOutcome>)>, outcome: PlaybackOutcome) {
    if let Some((sink, done)) = active.take() {
        sink.stop();
        let _ = done.send(outcome);
    }
}

fn output_thread(rx: std_mpsc::Receiver<Command>, suspended: Arc<AtomicBool>) {
    let mut device = open_device();
    suspended.store(device.is_none(), Ordering::SeqCst);
    let mut active: Option<(Sink, oneshot::Sender<PlaybackOutcome>)> = None;

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Command::Start { audio, done }) => {
                finish(&mut active, PlaybackOutcome::Stopped);
                let Some((_, handle)) = device.as_ref() else {
                    let _ = done.send(PlaybackOutcome::Failed("no audio output device".into()));
                    continue;
                };
                match Sink::try_new(handle) {
                    Ok(sink) => {
                        log::info!(
                            "[output] playing {}ms ({}Hz, {}ch)",
                            audio.duration().as_millis(),
                            audio.sample_rate,
                            audio.channels
                        );
                        sink.append(SamplesBuffer::new(
                            audio.channels,
                            audio.sample_rate,
                            audio.samples.as_ref().clone(),
                        ));
                        active = Some((sink, done));
                    }
                    Err(e) => {
                        let _ = done.send(PlaybackOutcome::Failed(format!(
                            "failed to open audio sink: {}",
                            e
                        )));
                    }
                }
            }
            Ok(Command::Stop) => finish(&mut active, PlaybackOutcome::Stopped),
            Ok(Command::Resume { reply }) => {
                if device.is_none() {
                    device = open_device();
                }
                suspended.store(device.is_none(), Ordering::SeqCst);
                let result = if device.is_some() {
                    Ok(())
                } else {
                    Err(PlaybackError::Other("no audio output device available".into()))
                };
                let _ = reply.send(result);
            }
            Err(RecvTimeoutError::Timeout) => {
                let drained = matches!(&active, Some((sink, _)) if sink.empty());
                if drained {
                    finish(&mut active, PlaybackOutcome::Finished);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    finish(&mut active, PlaybackOutcome::Stopped);
    log::info!("[output] thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_does_not_decode() {
        let err = decode_audio(b"definitely not audio").unwrap_err();
        assert!(matches!(err, PlaybackError::Decode(_)));
        assert_eq!(err.to_string(), "invalid audio data; please try again");
    }

    fn detached(suspended: bool) -> (RodioOutput, std_mpsc::Receiver<Command>) {
        let (commands, rx) = std_mpsc::channel();
        let output = RodioOutput {
            commands,
            suspended: Arc::new(AtomicBool::new(suspended)),
        };
        (output, rx)
    }

    fn tone() -> DecodedAudio {
        DecodedAudio {
            channels: 1,
            sample_rate: 8000,
            samples: Arc::new(vec![0; 80]),
        }
    }

    #[test]
    fn start_hands_off_without_waiting_for_the_thread() {
        let (output, rx) = detached(false);
        let mut done = output.start(tone()).unwrap();

        let Ok(Command::Start { done: tx, .. }) = rx.try_recv() else {
            panic!("start command not queued");
        };
        tx.send(PlaybackOutcome::Failed("failed to open audio sink".into()))
            .unwrap();
        assert_eq!(
            done.try_recv().unwrap(),
            PlaybackOutcome::Failed("failed to open audio sink".into())
        );
    }

    #[test]
    fn suspended_output_refuses_to_start() {
        let (output, rx) = detached(true);
        assert_eq!(output.start(tone()).unwrap_err(), PlaybackError::Suspended);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duration_accounts_for_channels() {
        let audio = DecodedAudio {
            channels: 2,
            sample_rate: 1000,
            samples: Arc::new(vec![0; 4000]),
        };
        assert_eq!(audio.duration(), Duration::from_secs(2));
    }
}
