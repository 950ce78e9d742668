//! Voice-agent client: streams microphone audio to a conversational agent over
//! one duplex channel and plays back its spoken replies.

pub mod audio;
pub mod channel;
pub mod credentials;
pub mod error;
pub mod history;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod state;
pub mod transcript;

pub use channel::{Channel, Connector, WsConnector};
pub use credentials::Credentials;
pub use error::StartError;
pub use session::{SessionConfig, SessionController, SessionState};
pub use state::{ClientEvent, SessionEvent};
pub use transcript::{Role, TranscriptEntry};
