use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// The in-progress user utterance. At most one exists.
    UserLive,
    UserFinal,
    Agent,
    /// Local status or error line, never sent by the agent.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
}

/// One `{role, text}` pair from the chat-history service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: String,
    pub text: String,
}

/// Ordered chat transcript. Entries are only appended, except that the live
/// entry is finalized in place or dropped when it ends up empty.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    live: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn live_text(&self) -> Option<&str> {
        self.live.map(|i| self.entries[i].text.as_str())
    }

    pub fn on_partial(&mut self, text: &str) {
        match self.live {
            Some(i) => self.entries[i].text = text.to_string(),
            None => {
                self.live = Some(self.entries.len());
                self.entries.push(TranscriptEntry {
                    role: Role::UserLive,
                    text: text.to_string(),
                });
            }
        }
    }

    /// Finalize the live entry with its own text. An empty live entry is dropped.
    /// Returns true if a final entry was produced.
    pub fn on_turn_end(&mut self) -> bool {
        let Some(i) = self.live.take() else {
            return false;
        };
        if self.entries[i].text.trim().is_empty() {
            self.entries.remove(i);
            return false;
        }
        self.entries[i].role = Role::UserFinal;
        true
    }

    /// Finalize the live entry with `text`, or append a final entry if none is live.
    pub fn on_final(&mut self, text: &str) {
        match self.live.take() {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.role = Role::UserFinal;
                entry.text = text.to_string();
            }
            None => self.push(Role::UserFinal, text),
        }
    }

    pub fn on_agent_reply(&mut self, text: &str) {
        self.push(Role::Agent, text);
    }

    pub fn on_system(&mut self, text: &str) {
        self.push(Role::System, text);
    }

    /// Replace the transcript with a previously stored conversation.
    pub fn hydrate(&mut self, history: &[HistoryTurn]) {
        self.entries.clear();
        self.live = None;
        for turn in history {
            let role = match turn.role.as_str() {
                "user" => Role::UserFinal,
                "model" | "assistant" | "agent" | "ai" => Role::Agent,
                _ => Role::System,
            };
            self.push(role, &turn.text);
        }
    }

    fn push(&mut self, role: Role, text: &str) {
        self.entries.push(TranscriptEntry {
            role,
            text: text.to_string(),
        });
    }
}
