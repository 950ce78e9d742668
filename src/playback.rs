use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

const COMPLETION_POLL_MS: u64 = 40;

/// Where assembled reply clips are played.
///
/// `play` replaces whatever is currently playing. Implementations report natural
/// completion of a clip out of band (see [`RodioOutput::new`]) using the id passed
/// to `play`; a clip that was stopped or replaced is never reported.
pub trait AudioOutput: Send {
    fn play(&mut self, clip_id: u64, clip: Vec<u8>) -> Result<(), String>;
    fn stop(&mut self);
}

/// Collects the audio fragments of one agent reply and plays them as a single clip.
pub struct PlaybackQueue {
    buffer: Vec<Vec<u8>>,
    output: Box<dyn AudioOutput>,
    /// Clip currently playing, if any. Cleared on completion or interruption.
    current: Option<u64>,
    next_clip: u64,
}

impl PlaybackQueue {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            buffer: Vec::new(),
            output,
            current: None,
            next_clip: 0,
        }
    }

    pub fn push(&mut self, fragment: Vec<u8>) {
        self.buffer.push(fragment);
    }

    pub fn buffered_fragments(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_speaking(&self) -> bool {
        self.current.is_some()
    }

    /// Assemble the buffered fragments in arrival order and start playing them.
    /// Returns the new clip id, or `None` when nothing was buffered.
    pub fn finalize(&mut self) -> Result<Option<u64>, String> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let clip = std::mem::take(&mut self.buffer).concat();
        self.next_clip += 1;
        let clip_id = self.next_clip;
        log::info!("[playback] clip {} assembled: {} bytes", clip_id, clip.len());
        match self.output.play(clip_id, clip) {
            Ok(()) => {
                self.current = Some(clip_id);
                Ok(Some(clip_id))
            }
            Err(e) => {
                self.current = None;
                Err(e)
            }
        }
    }

    /// Natural end of `clip_id`. Returns true if that clip was the one playing.
    pub fn finished(&mut self, clip_id: u64) -> bool {
        if self.current == Some(clip_id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Halt playback and discard everything buffered. Returns true if a clip was
    /// playing. Safe to call at any time, any number of times.
    pub fn interrupt(&mut self) -> bool {
        self.buffer.clear();
        match self.current.take() {
            Some(clip_id) => {
                self.output.stop();
                log::info!("[playback] clip {} interrupted", clip_id);
                true
            }
            None => false,
        }
    }

    /// Drop fragments of a reply that will never be finished.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }
}

enum OutputCommand {
    Play { clip_id: u64, clip: Vec<u8> },
    Stop,
}

/// Default-device output backed by rodio. The output stream lives on its own
/// thread and is opened on the first clip.
pub struct RodioOutput {
    cmd_tx: Option<Sender<OutputCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl RodioOutput {
    /// `on_finished` is called from the output thread when a clip plays to the end.
    pub fn new<F>(pcm_sample_rate: u32, on_finished: F) -> Self
    where
        F: Fn(u64) + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            run_output(cmd_rx, pcm_sample_rate.max(1), on_finished);
        });
        Self {
            cmd_tx: Some(cmd_tx),
            worker: Some(worker),
        }
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, clip_id: u64, clip: Vec<u8>) -> Result<(), String> {
        self.cmd_tx
            .as_ref()
            .ok_or("audio output closed")?
            .send(OutputCommand::Play { clip_id, clip })
            .map_err(|_| "audio output thread stopped".to_string())
    }

    fn stop(&mut self) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(OutputCommand::Stop);
        }
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.cmd_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_output<F>(cmd_rx: Receiver<OutputCommand>, pcm_sample_rate: u32, on_finished: F)
where
    F: Fn(u64),
{
    let mut stream: Option<rodio::OutputStream> = None;
    let mut playing: Option<(u64, rodio::Sink)> = None;

    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(COMPLETION_POLL_MS)) {
            Ok(OutputCommand::Play { clip_id, clip }) => {
                if let Some((_, sink)) = playing.take() {
                    sink.stop();
                }
                if stream.is_none() {
                    stream = match open_default_stream() {
                        Ok(s) => Some(s),
                        Err(e) => {
                            log::error!("[playback] {}", e);
                            None
                        }
                    };
                }
                let Some(out) = stream.as_ref() else {
                    // Nothing can be heard; report the clip as done so the
                    // speaking flag does not stick.
                    on_finished(clip_id);
                    continue;
                };
                let sink = rodio::Sink::connect_new(out.mixer());
                append_clip(&sink, clip, pcm_sample_rate);
                playing = Some((clip_id, sink));
            }
            Ok(OutputCommand::Stop) => {
                if let Some((_, sink)) = playing.take() {
                    sink.stop();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if playing.as_ref().map(|(_, sink)| sink.empty()).unwrap_or(false) {
            if let Some((clip_id, _)) = playing.take() {
                log::info!("[playback] clip {} finished", clip_id);
                on_finished(clip_id);
            }
        }
    }

    if let Some((_, sink)) = playing.take() {
        sink.stop();
    }
    log::debug!("[playback] output thread stopped");
}

fn open_default_stream() -> Result<rodio::OutputStream, String> {
    rodio::OutputStreamBuilder::from_default_device()
        .map_err(|e| format!("Failed to get audio output: {}", e))?
        .open_stream()
        .map_err(|e| format!("Failed to open audio stream: {}", e))
}

/// Containers (WAV, MP3, ...) are decoded; anything else is treated as
/// headerless 16-bit little-endian mono PCM.
fn append_clip(sink: &rodio::Sink, clip: Vec<u8>, pcm_sample_rate: u32) {
    match rodio::Decoder::new(Cursor::new(clip.clone())) {
        Ok(source) => sink.append(source),
        Err(e) => {
            log::debug!("[playback] not a container ({}), playing as raw PCM", e);
            let samples = pcm16_to_f32(&clip);
            sink.append(rodio::buffer::SamplesBuffer::new(1, pcm_sample_rate, samples));
        }
    }
}

fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let s = i16::from_le_bytes([pair[0], pair[1]]);
            if s < 0 {
                s as f32 / 32768.0
            } else {
                s as f32 / 32767.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        played: Vec<(u64, Vec<u8>)>,
        stops: usize,
    }

    struct FakeOutput(Arc<Mutex<Log>>);

    impl AudioOutput for FakeOutput {
        fn play(&mut self, clip_id: u64, clip: Vec<u8>) -> Result<(), String> {
            self.0.lock().unwrap().played.push((clip_id, clip));
            Ok(())
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().stops += 1;
        }
    }

    fn queue() -> (PlaybackQueue, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        (PlaybackQueue::new(Box::new(FakeOutput(log.clone()))), log)
    }

    #[test]
    fn fragments_play_as_one_clip_in_order() {
        let (mut q, log) = queue();
        q.push(vec![1, 2]);
        q.push(vec![3]);
        let clip = q.finalize().unwrap();
        assert_eq!(clip, Some(1));
        assert!(q.is_speaking());
        assert_eq!(q.buffered_fragments(), 0);
        assert_eq!(log.lock().unwrap().played, vec![(1, vec![1, 2, 3])]);
    }

    #[test]
    fn finalize_with_empty_buffer_does_nothing() {
        let (mut q, log) = queue();
        assert_eq!(q.finalize().unwrap(), None);
        assert!(!q.is_speaking());
        assert!(log.lock().unwrap().played.is_empty());
    }

    #[test]
    fn completion_clears_speaking() {
        let (mut q, _) = queue();
        q.push(vec![0]);
        let id = q.finalize().unwrap().unwrap();
        assert!(q.finished(id));
        assert!(!q.is_speaking());
        assert!(!q.finished(id));
    }

    #[test]
    fn interrupt_is_idempotent_and_discards_buffer() {
        let (mut q, log) = queue();
        q.push(vec![0]);
        q.finalize().unwrap();
        q.push(vec![9]);
        assert!(q.interrupt());
        assert!(!q.interrupt());
        assert!(!q.is_speaking());
        assert_eq!(q.buffered_fragments(), 0);
        assert_eq!(log.lock().unwrap().stops, 1);
    }

    #[test]
    fn interrupt_when_idle_is_a_no_op() {
        let (mut q, log) = queue();
        assert!(!q.interrupt());
        assert_eq!(log.lock().unwrap().stops, 0);
    }

    #[test]
    fn late_completion_after_interrupt_is_ignored() {
        let (mut q, _) = queue();
        q.push(vec![0]);
        let first = q.finalize().unwrap().unwrap();
        q.interrupt();
        q.push(vec![1]);
        let second = q.finalize().unwrap().unwrap();
        assert!(!q.finished(first));
        assert!(q.is_speaking());
        assert!(q.finished(second));
    }

    #[test]
    fn pcm16_conversion_is_symmetric_at_extremes() {
        let bytes = [i16::MIN.to_le_bytes(), i16::MAX.to_le_bytes(), 0i16.to_le_bytes()].concat();
        assert_eq!(pcm16_to_f32(&bytes), vec![-1.0, 1.0, 0.0]);
    }
}
