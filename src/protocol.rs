use crate::credentials::Credentials;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

const AUDIO_CHUNK_PREFIX: &str = "AUDIO_CHUNK:";
const AUDIO_END: &str = "AUDIO_END";
const AI_RESPONSE_PREFIX: &str = "AI_RESPONSE:";
const END_OF_TURN: &str = "END_OF_TURN";
const FINAL_TRANSCRIPT_PREFIX: &str = "FINAL_TRANSCRIPT:";

/// Messages parsed from the agent's text frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Interim transcript of what the user is saying (replaces the previous one).
    TranscriptPartial(String),
    /// Final transcript of the user's utterance.
    TranscriptFinal(String),
    /// Text of the agent's reply.
    AgentReplyText(String),
    /// One piece of the synthesized reply audio.
    AudioFragment(Vec<u8>),
    /// All fragments of the current reply have arrived.
    AudioEnd,
    /// The remote side detected the end of the user's turn.
    TurnEnd,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 in audio chunk: {0}")]
    InvalidAudioChunk(#[from] base64::DecodeError),
}

/// Decode one inbound text frame. Tags are checked in a fixed priority order and
/// anything unrecognised is an interim transcript.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, DecodeError> {
    if let Some(payload) = text.strip_prefix(AUDIO_CHUNK_PREFIX) {
        let bytes = BASE64.decode(payload.trim())?;
        return Ok(InboundMessage::AudioFragment(bytes));
    }
    if text == AUDIO_END {
        return Ok(InboundMessage::AudioEnd);
    }
    if let Some(reply) = text.strip_prefix(AI_RESPONSE_PREFIX) {
        return Ok(InboundMessage::AgentReplyText(reply.to_string()));
    }
    if text == END_OF_TURN {
        return Ok(InboundMessage::TurnEnd);
    }
    if let Some(transcript) = text.strip_prefix(FINAL_TRANSCRIPT_PREFIX) {
        return Ok(InboundMessage::TranscriptFinal(transcript.to_string()));
    }
    Ok(InboundMessage::TranscriptPartial(text.to_string()))
}

/// How provider keys are named in the channel query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyParamStyle {
    /// `assemblyai_key=...&google_gemini_key=...&murf_ai_key=...`
    #[default]
    Suffixed,
    /// `assemblyai=...&google_gemini=...&murf_ai=...`
    Plain,
}

impl KeyParamStyle {
    fn param_name(self, key_name: &str) -> String {
        match self {
            KeyParamStyle::Suffixed => format!("{}_key", key_name),
            KeyParamStyle::Plain => key_name.to_string(),
        }
    }
}

/// Build the `/ws` address for one session. Keys are percent-encoded.
pub fn channel_url(
    host: &str,
    secure: bool,
    session_id: &str,
    credentials: &Credentials,
    style: KeyParamStyle,
) -> Result<Url, String> {
    let scheme = if secure { "wss" } else { "ws" };
    let host = host.trim().trim_end_matches('/');
    let mut url = Url::parse(&format!("{}://{}/ws", scheme, host))
        .map_err(|e| format!("Invalid agent host '{}': {}", host, e))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("session_id", session_id);
        for (name, value) in credentials.entries() {
            query.append_pair(&style.param_name(name), value);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            assemblyai: "aai".into(),
            google_gemini: "g&m".into(),
            murf_ai: "murf".into(),
        }
    }

    #[test]
    fn decodes_tags_in_priority_order() {
        assert_eq!(
            decode_inbound("AUDIO_CHUNK:AAA=").unwrap(),
            InboundMessage::AudioFragment(vec![0, 0])
        );
        assert_eq!(decode_inbound("AUDIO_END").unwrap(), InboundMessage::AudioEnd);
        assert_eq!(
            decode_inbound("AI_RESPONSE:Hello there").unwrap(),
            InboundMessage::AgentReplyText("Hello there".into())
        );
        assert_eq!(decode_inbound("END_OF_TURN").unwrap(), InboundMessage::TurnEnd);
        assert_eq!(
            decode_inbound("FINAL_TRANSCRIPT:hello world").unwrap(),
            InboundMessage::TranscriptFinal("hello world".into())
        );
        assert_eq!(
            decode_inbound("hello").unwrap(),
            InboundMessage::TranscriptPartial("hello".into())
        );
    }

    #[test]
    fn exact_tags_do_not_match_as_prefixes() {
        assert_eq!(
            decode_inbound("AUDIO_END now").unwrap(),
            InboundMessage::TranscriptPartial("AUDIO_END now".into())
        );
        assert_eq!(
            decode_inbound("END_OF_TURNS").unwrap(),
            InboundMessage::TranscriptPartial("END_OF_TURNS".into())
        );
    }

    #[test]
    fn reply_text_keeps_colons() {
        assert_eq!(
            decode_inbound("AI_RESPONSE:Note: 3:30 works").unwrap(),
            InboundMessage::AgentReplyText("Note: 3:30 works".into())
        );
    }

    #[test]
    fn empty_text_is_an_empty_partial() {
        assert_eq!(
            decode_inbound("").unwrap(),
            InboundMessage::TranscriptPartial(String::new())
        );
    }

    #[test]
    fn bad_base64_is_a_decode_error() {
        assert!(decode_inbound("AUDIO_CHUNK:not base64!!").is_err());
    }

    #[test]
    fn channel_url_uses_suffixed_key_names() {
        let url = channel_url("localhost:8000", false, "abc", &creds(), KeyParamStyle::Suffixed)
            .unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ws");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("session_id".to_string(), "abc".to_string()),
                ("assemblyai_key".to_string(), "aai".to_string()),
                ("google_gemini_key".to_string(), "g&m".to_string()),
                ("murf_ai_key".to_string(), "murf".to_string()),
            ]
        );
        assert!(url.as_str().contains("g%26m"));
    }

    #[test]
    fn channel_url_plain_style_and_tls() {
        let url = channel_url("agent.example.com/", true, "s1", &creds(), KeyParamStyle::Plain)
            .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("agent.example.com"));
        assert!(url.query_pairs().any(|(k, v)| k == "murf_ai" && v == "murf"));
    }
}
