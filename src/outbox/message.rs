use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stored payload of a `bead_status_change` outbox entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangePayload {
    #[serde(default)]
    pub bead_id: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub old_status: Option<String>,
    #[serde(default)]
    pub new_status: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

const UNKNOWN: &str = "unknown";

impl StatusChangePayload {
    pub fn bead_id(&self) -> &str {
        self.bead_id.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn subject(&self) -> String {
        format!("Bead status changed: {}", self.bead_id())
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "**{}** status changed from `{}` to `{}`\n\n",
            self.bead_id(),
            self.old_status.as_deref().unwrap_or(UNKNOWN),
            self.new_status.as_deref().unwrap_or(UNKNOWN),
        );
        for (label, value) in [
            ("Title", &self.title),
            ("Repo", &self.repo),
            ("Branch", &self.branch),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                body.push_str(&format!("{label}: {value}\n"));
            }
        }
        body
    }
}

/// Every notification about the same bead lands in the same thread, however
/// many times it is retried.
pub fn thread_id_for_bead(bead_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("bead:{bead_id}").as_bytes())
}

/// Cut `error` to at most `max_chars` characters.
pub fn truncate_error(error: &str, max_chars: usize) -> String {
    match error.char_indices().nth(max_chars) {
        Some((end, _)) => error[..end].to_string(),
        None => error.to_string(),
    }
}
