use crate::audio::{AudioInput, FrameSink};
use crate::channel::{Channel, Connector};
use crate::credentials::Credentials;
use crate::error::StartError;
use crate::playback::{AudioOutput, PlaybackQueue};
use crate::protocol::{self, InboundMessage, KeyParamStyle};
use crate::settings::Settings;
use crate::state::{CaptureStats, ClientEvent, SessionEvent};
use crate::transcript::{HistoryTurn, Transcript};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const STATUS_READY: &str = "Ready";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_LISTENING: &str = "Listening...";
pub const STATUS_THINKING: &str = "Considering your request...";
pub const STATUS_SPEAKING: &str = "Agent is speaking...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Channel open in flight.
    Connecting,
    /// Channel open and microphone streaming.
    Active,
    /// Tearing down; never observed between events.
    Closing,
}

/// Where and how to open the channel.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub secure: bool,
    pub key_params: KeyParamStyle,
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            host: settings.host.clone(),
            secure: settings.secure,
            key_params: settings.key_params,
        }
    }
}

struct Session {
    id: String,
    generation: u64,
    channel: Option<Channel>,
}

/// Owns one voice session at a time and everything it touches: the channel,
/// the microphone, the reply playback and the transcript.
///
/// All state changes happen in [`SessionController::handle`], one event at a
/// time. Background work (channel I/O, capture, audio output) only posts
/// [`SessionEvent`]s back to the controller's queue.
pub struct SessionController {
    config: SessionConfig,
    credentials: Credentials,
    session_id: Option<String>,
    connector: Arc<dyn Connector>,
    input: Box<dyn AudioInput>,
    playback: PlaybackQueue,
    transcript: Transcript,
    state: SessionState,
    session: Option<Session>,
    generation: u64,
    stats: Arc<CaptureStats>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    client_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl SessionController {
    /// `events_tx` must feed the receiver later passed to [`SessionController::run`]
    /// (or drained into [`SessionController::handle`]).
    pub fn new(
        config: SessionConfig,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        client_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            config,
            credentials,
            session_id: None,
            connector,
            input,
            playback: PlaybackQueue::new(output),
            transcript: Transcript::new(),
            state: SessionState::Idle,
            session: None,
            generation: 0,
            stats: Arc::new(CaptureStats::default()),
            events_tx,
            client_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.input.is_capturing()
    }

    pub fn is_agent_speaking(&self) -> bool {
        self.playback.is_speaking()
    }

    pub fn buffered_fragments(&self) -> usize {
        self.playback.buffered_fragments()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Id of the open (or opening) session.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    /// Keys `start` would refuse over. Empty when a session can be started.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        self.credentials.missing()
    }

    /// Session id used by the next [`SessionEvent::Start`]. `None` generates one.
    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    /// Show a local line in the transcript (greeting, errors).
    pub fn notify_system(&mut self, text: &str) {
        self.transcript.on_system(text);
        self.emit_transcript();
    }

    /// Show an agent line that did not come over the channel (greeting).
    pub fn greet(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.transcript.on_agent_reply(text);
        self.emit_transcript();
    }

    /// Replace the transcript with stored history for the chosen session.
    pub fn hydrate(&mut self, history: &[HistoryTurn]) {
        self.transcript.hydrate(history);
        self.emit_transcript();
    }

    /// Consume events until shutdown or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.stop();
        if self.playback.interrupt() {
            self.emit(ClientEvent::PlaybackEnded);
        }
        log::info!("[session] event loop stopped");
    }

    /// Apply one event. Returns false when the loop should exit.
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        log::trace!("[session] event: {:?}", event);
        match event {
            SessionEvent::Start => {
                let credentials = self.credentials.clone();
                let session_id = self.session_id.clone();
                if let Err(e) = self.start(credentials, session_id) {
                    log::warn!("[session] start refused: {}", e);
                }
            }
            SessionEvent::Stop => self.stop(),
            SessionEvent::Toggle => {
                if self.state == SessionState::Idle {
                    self.handle(SessionEvent::Start);
                } else {
                    self.stop();
                }
            }
            SessionEvent::Shutdown => return false,
            SessionEvent::ChannelOpened { generation, result } => {
                self.on_channel_opened(generation, result)
            }
            SessionEvent::Inbound { generation, text } => self.on_inbound(generation, &text),
            SessionEvent::ChannelClosed { generation, reason } => {
                self.on_channel_closed(generation, reason)
            }
            SessionEvent::PlaybackFinished { clip_id } => self.on_playback_finished(clip_id),
        }
        true
    }

    /// Begin a session: barge in on any agent audio, then open the channel.
    /// The microphone is acquired once the channel is open. Returns the
    /// generation of the new session.
    pub fn start(
        &mut self,
        credentials: Credentials,
        session_id: Option<String>,
    ) -> Result<u64, StartError> {
        if self.state != SessionState::Idle {
            return Err(StartError::NotIdle(self.state));
        }

        let missing = credentials.missing();
        if !missing.is_empty() {
            let err = StartError::MissingCredentials(missing);
            self.set_status(&err.to_string());
            return Err(err);
        }
        self.credentials = credentials;

        // The user always pre-empts the agent.
        if self.playback.interrupt() {
            log::info!("[session] agent playback interrupted");
            self.emit(ClientEvent::PlaybackEnded);
        }

        let id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let url = match protocol::channel_url(
            &self.config.host,
            self.config.secure,
            &id,
            &self.credentials,
            self.config.key_params,
        ) {
            Ok(url) => url,
            Err(e) => {
                let err = StartError::Channel(e);
                self.fail_start(&err);
                return Err(err);
            }
        };

        self.generation += 1;
        let generation = self.generation;
        log::info!("[session] starting session {} (gen={})", id, generation);
        self.session = Some(Session {
            id,
            generation,
            channel: None,
        });
        self.state = SessionState::Connecting;
        self.set_status(STATUS_CONNECTING);

        let connector = self.connector.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(url, generation, events_tx.clone()).await;
            let _ = events_tx.send(SessionEvent::ChannelOpened { generation, result });
        });
        Ok(generation)
    }

    /// End the session: stop capture, close the channel, drop buffered reply
    /// audio. A clip already playing keeps playing. No-op while idle.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.teardown();
        self.set_status(STATUS_READY);
    }

    fn on_channel_opened(&mut self, generation: u64, result: Result<Channel, String>) {
        if !self.is_current(generation) || self.state != SessionState::Connecting {
            if let Ok(channel) = result {
                log::info!("[session] releasing late channel (gen={})", generation);
                channel.close();
            }
            return;
        }

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_start(&StartError::Channel(e));
                return;
            }
        };

        let sink = FrameSink::new(channel.frame_sender(), self.stats.clone());
        if let Err(e) = self.input.start(sink) {
            channel.close();
            self.fail_start(&StartError::Microphone(e));
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.channel = Some(channel);
        }
        self.state = SessionState::Active;
        log::info!("[session] capture started (gen={})", generation);
        self.emit(ClientEvent::RecordingChanged(true));
        self.set_status(STATUS_LISTENING);
    }

    fn on_channel_closed(&mut self, generation: u64, reason: Option<String>) {
        if !self.is_current(generation) {
            log::debug!("[session] ignoring closure of old channel (gen={})", generation);
            return;
        }
        log::info!("[session] channel closed (gen={}): {:?}", generation, reason);
        self.teardown();
        match reason {
            Some(reason) => {
                self.set_status(&format!("Connection closed: {}", reason));
                self.notify_system(&reason);
            }
            None => self.set_status("Connection closed"),
        }
    }

    fn on_inbound(&mut self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            return;
        }
        let message = match protocol::decode_inbound(text) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("[session] skipping inbound message: {}", e);
                return;
            }
        };
        match message {
            InboundMessage::AudioFragment(bytes) => self.playback.push(bytes),
            InboundMessage::AudioEnd => match self.playback.finalize() {
                Ok(Some(_)) => self.emit(ClientEvent::PlaybackStarted),
                Ok(None) => log::debug!("[session] AUDIO_END with nothing buffered"),
                Err(e) => {
                    log::error!("[session] playback failed: {}", e);
                    self.set_status(&format!("Playback failed: {}", e));
                }
            },
            InboundMessage::AgentReplyText(reply) => {
                self.transcript.on_agent_reply(&reply);
                self.emit_transcript();
                self.set_status(STATUS_SPEAKING);
            }
            InboundMessage::TurnEnd => {
                let had_live = self.transcript.live_text().is_some();
                self.transcript.on_turn_end();
                if had_live {
                    self.emit_transcript();
                }
                self.emit(ClientEvent::TurnEnded);
                self.set_status(STATUS_THINKING);
            }
            InboundMessage::TranscriptFinal(final_text) => {
                self.transcript.on_final(&final_text);
                self.emit_transcript();
            }
            InboundMessage::TranscriptPartial(partial) => {
                self.transcript.on_partial(&partial);
                self.emit_transcript();
            }
        }
    }

    fn on_playback_finished(&mut self, clip_id: u64) {
        if !self.playback.finished(clip_id) {
            return;
        }
        self.emit(ClientEvent::PlaybackEnded);
        if self.state == SessionState::Active {
            self.set_status(STATUS_LISTENING);
        } else {
            self.set_status(STATUS_READY);
        }
    }

    /// Release everything the session holds and return to idle. Safe in any state.
    fn teardown(&mut self) {
        let was_capturing = self.input.is_capturing();
        self.state = SessionState::Closing;

        // Stop capture first so nothing is still feeding the channel.
        self.input.stop();
        if let Some(session) = self.session.take() {
            if let Some(channel) = session.channel {
                channel.close();
            }
            let totals = self.stats.take();
            log::info!(
                "[session] session {} ended: frames sent={} dropped={} audio={:.1}s",
                session.id,
                totals.frames_sent,
                totals.frames_dropped,
                totals.seconds_sent()
            );
        }
        self.playback.clear_buffer();
        self.state = SessionState::Idle;
        if was_capturing {
            self.emit(ClientEvent::RecordingChanged(false));
        }

        // An utterance cut off by the close ends here: kept as final if it has
        // text, dropped if empty. A later session never writes into its slot.
        if self.transcript.live_text().is_some() {
            self.transcript.on_turn_end();
            self.emit_transcript();
        }
    }

    fn fail_start(&mut self, err: &StartError) {
        log::warn!("[session] {}", err);
        self.teardown();
        let text = err.to_string();
        self.set_status(&text);
        self.notify_system(&text);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    fn set_status(&self, text: &str) {
        self.emit(ClientEvent::StatusChanged(text.to_string()));
    }

    fn emit_transcript(&self) {
        self.emit(ClientEvent::TranscriptUpdated(self.transcript.entries().to_vec()));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.client_tx.send(event);
    }
}
