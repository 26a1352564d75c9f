use std::fmt;

const WORKSPACE_PREFIX: &str = "events:";
const CHAT_PREFIX: &str = "chat:";

/// A pub/sub topic. Workspace and chat channels live in disjoint namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Workspace(String),
    Chat(String),
}

impl Channel {
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Self::Workspace(workspace_id.into())
    }

    pub fn chat(session_id: impl Into<String>) -> Self {
        Self::Chat(session_id.into())
    }

    pub fn scope_id(&self) -> &str {
        match self {
            Self::Workspace(id) | Self::Chat(id) => id,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    pub fn parse(name: &str) -> Option<Self> {
        if let Some(id) = name.strip_prefix(WORKSPACE_PREFIX) {
            return (!id.is_empty()).then(|| Self::Workspace(id.to_string()));
        }
        let id = name.strip_prefix(CHAT_PREFIX)?;
        if id.is_empty() || id.starts_with("waiting:") || id.starts_with("deadline:") {
            return None;
        }
        Some(Self::Chat(id.to_string()))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workspace(id) => write!(f, "{WORKSPACE_PREFIX}{id}"),
            Self::Chat(id) => write!(f, "{CHAT_PREFIX}{id}"),
        }
    }
}

/// Key of the per-session heartbeat structure.
pub fn waiting_key(session_id: &str) -> String {
    format!("chat:waiting:{session_id}")
}

/// Key of the per-session deadline structure.
pub fn deadline_key(session_id: &str) -> String {
    format!("chat:deadline:{session_id}")
}
