//! Read-only client for the agent's stored conversations.

use crate::transcript::HistoryTurn;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct ChatPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<ChatPart>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    history: Vec<ChatMessage>,
}

/// One stored conversation the user can resume.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<SessionSummary>,
}

/// Flatten a chat-history body into one turn per message. Multi-part messages
/// are joined; messages with no text are skipped.
pub fn parse_history(body: &str) -> Result<Vec<HistoryTurn>, String> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| format!("invalid history json: {}", e))?;
    Ok(resp
        .history
        .into_iter()
        .filter_map(|msg| {
            let text = msg
                .parts
                .iter()
                .map(|p| p.text.as_str())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if text.trim().is_empty() {
                None
            } else {
                Some(HistoryTurn {
                    role: msg.role,
                    text,
                })
            }
        })
        .collect())
}

pub fn parse_sessions(body: &str) -> Result<Vec<SessionSummary>, String> {
    let resp: SessionsResponse =
        serde_json::from_str(body).map_err(|e| format!("invalid sessions json: {}", e))?;
    Ok(resp.sessions)
}

/// `http_base` with `segments` appended, each percent-encoded as one path segment.
pub fn endpoint(http_base: &str, segments: &[&str]) -> Result<Url, String> {
    let mut url = Url::parse(http_base.trim())
        .map_err(|e| format!("Invalid service address '{}': {}", http_base, e))?;
    url.path_segments_mut()
        .map_err(|_| format!("Invalid service address '{}'", http_base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| format!("http client error: {}", e))
}

/// Fetch the stored turns of `session_id`. An unknown session yields no turns.
pub async fn fetch_history(http_base: &str, session_id: &str) -> Result<Vec<HistoryTurn>, String> {
    let url = endpoint(http_base, &["agent", "chat", session_id])?;
    let resp = client()?
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {}", e))?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        log::info!("[history] no stored history for session {}", session_id);
        return Ok(Vec::new());
    }
    let body = resp
        .error_for_status()
        .map_err(|e| format!("history service error: {}", e))?
        .text()
        .await
        .map_err(|e| format!("failed to read history: {}", e))?;
    let turns = parse_history(&body)?;
    log::info!("[history] loaded {} turns for session {}", turns.len(), session_id);
    Ok(turns)
}

pub async fn list_sessions(http_base: &str) -> Result<Vec<SessionSummary>, String> {
    let url = endpoint(http_base, &["agent", "sessions"])?;
    let body = client()?
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {}", e))?
        .error_for_status()
        .map_err(|e| format!("session service error: {}", e))?
        .text()
        .await
        .map_err(|e| format!("failed to read sessions: {}", e))?;
    parse_sessions(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_parts_are_joined_and_blank_messages_skipped() {
        let body = r#"{
            "name": "Trip planning",
            "history": [
                {"role": "user", "parts": [{"text": "book a flight"}]},
                {"role": "model", "parts": [{"text": "Where to?"}, {"text": "And when?"}]},
                {"role": "model", "parts": [{"text": ""}]},
                {"role": "user", "parts": []}
            ]
        }"#;
        let turns = parse_history(body).unwrap();
        assert_eq!(
            turns,
            vec![
                HistoryTurn {
                    role: "user".into(),
                    text: "book a flight".into()
                },
                HistoryTurn {
                    role: "model".into(),
                    text: "Where to?\nAnd when?".into()
                },
            ]
        );
    }

    #[test]
    fn missing_history_field_is_empty() {
        assert!(parse_history(r#"{"name": "x"}"#).unwrap().is_empty());
    }

    #[test]
    fn garbage_history_is_an_error() {
        assert!(parse_history("<html>").is_err());
    }

    #[test]
    fn session_id_is_a_single_encoded_segment() {
        let url = endpoint("http://localhost:8000", &["agent", "chat", "a b/../c?x=1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/agent/chat/a%20b%2F..%2Fc%3Fx=1"
        );
    }

    #[test]
    fn endpoint_keeps_a_base_path() {
        let url = endpoint("https://agent.example/api/", &["agent", "sessions"]).unwrap();
        assert_eq!(url.as_str(), "https://agent.example/api/agent/sessions");
    }

    #[test]
    fn endpoint_rejects_garbage_base() {
        assert!(endpoint("not a url", &["agent"]).is_err());
    }

    #[test]
    fn sessions_are_listed_in_order() {
        let body = r#"{"sessions": [{"id": "a1", "name": "First"}, {"id": "b2"}]}"#;
        let sessions = parse_sessions(body).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "First");
        assert_eq!(sessions[1].id, "b2");
        assert_eq!(sessions[1].name, "");
    }
}
