//! Ticket data model (§3).

use crate::intent::ProblemType;
use crate::sanitize::sanitize_string;
use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Resolved,
    Transferred,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Append-only row produced at call end.
///
/// Invariant (§3): `summary` contains no NUL byte and no raw-insult
/// tokens; every field is valid UTF-8 (guaranteed by `String`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub call_id: String,
    pub caller_number: Option<String>,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub problem_type: ProblemType,
    pub status: Status,
    pub sentiment: Sentiment,
    pub summary: String,
    pub duration_seconds: u64,
    pub tag: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    /// Sanitize every string field in place. Must be called before the
    /// ticket is persisted or passed to any downstream storage/file path.
    pub fn sanitize(&mut self) {
        if let Some(n) = &self.caller_number {
            self.caller_number = Some(sanitize_string(n));
        }
        if let Some(n) = &self.client_name {
            self.client_name = Some(sanitize_string(n));
        }
        if let Some(e) = &self.client_email {
            self.client_email = Some(sanitize_string(e));
        }
        self.summary = sanitize_string(&self.summary);
        self.tag = sanitize_string(&self.tag);
    }

    /// §8 invariant 5: no field contains byte 0x00.
    pub fn is_clean(&self) -> bool {
        let fields: Vec<&str> = [
            self.caller_number.as_deref(),
            self.client_name.as_deref(),
            self.client_email.as_deref(),
            Some(self.summary.as_str()),
            Some(self.tag.as_str()),
        ]
            .into_iter()
            .flatten()
            .collect();
        fields.iter().all(|f| !f.as_bytes().contains(&0u8))
    }
}

/// Newest-first summary of a prior ticket, as returned by `LookupHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSummary {
    pub ticket_id: String,
    pub problem_type: ProblemType,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}
