use crate::session::SessionState;
use thiserror::Error;

/// Why a session could not be started. The `Display` text is what the user
/// sees as status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// `start` is only accepted while idle.
    #[error("A session is already {0:?}")]
    NotIdle(SessionState),

    /// One or more provider keys are missing or blank; no connection was attempted.
    #[error("Please provide the missing API keys: {}", .0.join(", "))]
    MissingCredentials(Vec<&'static str>),

    /// Microphone denied or unavailable after the channel opened.
    #[error("Could not start recording: {0}")]
    Microphone(String),

    /// Channel address invalid, handshake rejected, or network failure.
    #[error("Could not start recording: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_lists_names() {
        let err = StartError::MissingCredentials(vec!["google_gemini", "murf_ai"]);
        assert_eq!(
            err.to_string(),
            "Please provide the missing API keys: google_gemini, murf_ai"
        );
    }
}
