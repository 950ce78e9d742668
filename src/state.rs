use crate::channel::Channel;
use crate::transcript::TranscriptEntry;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything the session controller reacts to, in arrival order.
pub enum SessionEvent {
    /// UI asked to begin capturing (and barge in on the agent if it is talking).
    Start,
    /// UI asked to end the session.
    Stop,
    /// Start when idle, otherwise stop (also cancels a connect in flight).
    Toggle,
    /// Leave the event loop.
    Shutdown,
    ChannelOpened {
        generation: u64,
        result: Result<Channel, String>,
    },
    /// One inbound text frame, untouched.
    Inbound { generation: u64, text: String },
    ChannelClosed {
        generation: u64,
        reason: Option<String>,
    },
    PlaybackFinished { clip_id: u64 },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Start => write!(f, "Start"),
            SessionEvent::Stop => write!(f, "Stop"),
            SessionEvent::Toggle => write!(f, "Toggle"),
            SessionEvent::Shutdown => write!(f, "Shutdown"),
            SessionEvent::ChannelOpened { generation, result } => write!(
                f,
                "ChannelOpened(gen={}, ok={})",
                generation,
                result.is_ok()
            ),
            SessionEvent::Inbound { generation, text } => {
                write!(f, "Inbound(gen={}, {} bytes)", generation, text.len())
            }
            SessionEvent::ChannelClosed { generation, reason } => {
                write!(f, "ChannelClosed(gen={}, {:?})", generation, reason)
            }
            SessionEvent::PlaybackFinished { clip_id } => {
                write!(f, "PlaybackFinished({})", clip_id)
            }
        }
    }
}

/// Events sent from the controller to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Full transcript after any change.
    TranscriptUpdated(Vec<TranscriptEntry>),
    TurnEnded,
    PlaybackStarted,
    PlaybackEnded,
    StatusChanged(String),
    /// Capture switched on or off (drives the record button).
    RecordingChanged(bool),
}

/// Outbound audio counters for the current session. Written from the frame
/// thread, read by the controller when the session ends.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CaptureTotals {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
}

impl CaptureTotals {
    /// Seconds of 16 kHz PCM16 audio delivered to the channel.
    pub fn seconds_sent(&self) -> f64 {
        self.bytes_sent as f64 / 2.0 / crate::audio::TARGET_SAMPLE_RATE as f64
    }
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureTotals {
        CaptureTotals {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Return the current totals and start counting from zero.
    pub fn take(&self) -> CaptureTotals {
        CaptureTotals {
            frames_sent: self.frames_sent.swap(0, Ordering::Relaxed),
            frames_dropped: self.frames_dropped.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_counters() {
        let stats = CaptureStats::default();
        stats.frames_sent.fetch_add(2, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(32000, Ordering::Relaxed);
        let totals = stats.take();
        assert_eq!(totals.frames_sent, 2);
        assert!((totals.seconds_sent() - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.snapshot(), CaptureTotals::default());
    }
}
