//! Directory client (C7).
//!
//! Caller/history/pending lookups and ticket insertion against the two
//! relational databases named in spec.md §6 (`clients`, `tickets`).
//! Grounded on the pack's `sqlx`-based directory-shaped examples
//! (`tjameswilliams-meeting-assistant`, `permissionlessweb-lingua-bridge`).
//! All queries are time-bounded; `TechnicianAvailable` fails open (§4.7,
//! §8 invariant 7).

use crate::intent::ProblemType;
use crate::sanitize::sanitize_string;
use crate::ticket::{ Ticket, TicketSummary };
use async_trait::async_trait;
use chrono::{ Duration as ChronoDuration, Utc };
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{ error, warn };

#[derive(Debug, Clone)]
pub struct CallerProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub box_model: Option<String>,
}

const QUERY_DEADLINE: Duration = Duration::from_secs(3);

/// Directory operations consumed by the dialog. A trait so tests can
/// substitute a deterministic fake without a live database.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup_caller(&self, phone: &str) -> Option<CallerProfile>;
    async fn lookup_history(&self, phone: &str, limit: i64) -> Vec<TicketSummary>;
    async fn lookup_pending(&self, phone: &str) -> Vec<Ticket>;
    async fn create_ticket(&self, ticket: &Ticket) -> anyhow::Result<String>;
    async fn technician_available(&self, max_active: i64, window_min: i64) -> bool;
}

/// Postgres-backed directory client.
pub struct PgDirectory {
    clients_pool: PgPool,
    tickets_pool: PgPool,
}

impl PgDirectory {
    pub async fn connect(clients_dsn: &str, tickets_dsn: &str, min: u32, max: u32) -> anyhow::Result<Self> {
        let clients_pool = PgPoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .connect(clients_dsn).await?;
        let tickets_pool = PgPoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .connect(tickets_dsn).await?;
        Ok(Self { clients_pool, tickets_pool })
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn lookup_caller(&self, phone: &str) -> Option<CallerProfile> {
        let phone = sanitize_string(phone);
        let result = tokio::time::timeout(
            QUERY_DEADLINE,
            sqlx
                ::query_as::<
                    _,
                    (Option<String>, Option<String>, Option<String>)
                >("SELECT first_name, last_name, box_model FROM clients WHERE phone_number = $1")
                .bind(&phone)
                .fetch_optional(&self.clients_pool)
        ).await;

        match result {
            Ok(Ok(Some((first_name, last_name, box_model)))) =>
                Some(CallerProfile { first_name, last_name, box_model }),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "lookup_caller query error, treating as unknown caller");
                None
            }
            Err(_) => {
                warn!("lookup_caller timed out, treating as unknown caller");
                None
            }
        }
    }

    async fn lookup_history(&self, phone: &str, limit: i64) -> Vec<TicketSummary> {
        let phone = sanitize_string(phone);
        let rows = tokio::time::timeout(
            QUERY_DEADLINE,
            sqlx
                ::query_as::<
                    _,
                    (String, String, String, chrono::DateTime<Utc>)
                >(
                    "SELECT ticket_id, problem_type, status, created_at FROM tickets \
                 WHERE caller_number = $1 ORDER BY created_at DESC LIMIT $2"
                )
                .bind(&phone)
                .bind(limit)
                .fetch_all(&self.tickets_pool)
        ).await;

        match rows {
            Ok(Ok(rows)) =>
                rows
                    .into_iter()
                    .filter_map(|(id, pt, status, created_at)| {
                        Some(TicketSummary {
                            ticket_id: id,
                            problem_type: parse_problem_type(&pt)?,
                            status: parse_status(&status)?,
                            created_at,
                        })
                    })
                    .collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "lookup_history query error, treating as no history");
                Vec::new()
            }
            Err(_) => {
                warn!("lookup_history timed out, treating as no history");
                Vec::new()
            }
        }
    }

    async fn lookup_pending(&self, phone: &str) -> Vec<Ticket> {
        let phone = sanitize_string(phone);
        let rows = tokio::time::timeout(
            QUERY_DEADLINE,
            sqlx
                ::query_as::<
                    _,
                    (String, String, String, chrono::DateTime<Utc>)
                >(
                    "SELECT ticket_id, problem_type, status, created_at FROM tickets \
                 WHERE caller_number = $1 AND status != 'resolved' \
                 ORDER BY created_at DESC LIMIT 5"
                )
                .bind(&phone)
                .fetch_all(&self.tickets_pool)
        ).await;

        match rows {
            Ok(Ok(rows)) =>
                rows
                    .into_iter()
                    .filter_map(|(id, pt, status, created_at)| {
                        Some(Ticket {
                            call_id: id,
                            caller_number: Some(phone.clone()),
                            client_name: None,
                            client_email: None,
                            problem_type: parse_problem_type(&pt)?,
                            status: parse_status(&status)?,
                            sentiment: crate::ticket::Sentiment::Neutral,
                            summary: String::new(),
                            duration_seconds: 0,
                            tag: String::new(),
                            severity: crate::ticket::Severity::Low,
                            created_at,
                        })
                    })
                    .collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "lookup_pending query error, treating as no pending");
                Vec::new()
            }
            Err(_) => {
                warn!("lookup_pending timed out, treating as no pending");
                Vec::new()
            }
        }
    }

    async fn create_ticket(&self, ticket: &Ticket) -> anyhow::Result<String> {
        let mut ticket = ticket.clone();
        ticket.sanitize();
        let result = sqlx
            ::query_scalar::<_, String>(
                "INSERT INTO tickets \
             (call_id, caller_number, client_name, client_email, problem_type, status, \
              sentiment, summary, duration_seconds, tag, severity, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) RETURNING ticket_id"
            )
            .bind(&ticket.call_id)
            .bind(&ticket.caller_number)
            .bind(&ticket.client_name)
            .bind(&ticket.client_email)
            .bind(problem_type_str(ticket.problem_type))
            .bind(status_str(ticket.status))
            .bind(sentiment_str(ticket.sentiment))
            .bind(&ticket.summary)
            .bind(ticket.duration_seconds as i64)
            .bind(&ticket.tag)
            .bind(severity_str(ticket.severity))
            .bind(ticket.created_at)
            .fetch_one(&self.tickets_pool).await;

        result.map_err(|e| {
            error!(error = %e, call_id = %ticket.call_id, "ticket insert failed, keeping recording only");
            anyhow::anyhow!("ticket insert failed: {e}")
        })
    }

    async fn technician_available(&self, max_active: i64, window_min: i64) -> bool {
        let since = Utc::now() - ChronoDuration::minutes(window_min);
        let result = tokio::time::timeout(
            QUERY_DEADLINE,
            sqlx
                ::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM tickets WHERE status = 'transferred' AND created_at > $1"
                )
                .bind(since)
                .fetch_one(&self.tickets_pool)
        ).await;

        match result {
            Ok(Ok(count)) => count < max_active,
            Ok(Err(e)) => {
                warn!(error = %e, "technician_available query error, failing open");
                true
            }
            Err(_) => {
                warn!("technician_available timed out, failing open");
                true
            }
        }
    }
}

fn parse_problem_type(s: &str) -> Option<ProblemType> {
    match s {
        "internet" => Some(ProblemType::Internet),
        "mobile" => Some(ProblemType::Mobile),
        "unknown" => Some(ProblemType::Unknown),
        _ => None,
    }
}

fn problem_type_str(p: ProblemType) -> &'static str {
    match p {
        ProblemType::Internet => "internet",
        ProblemType::Mobile => "mobile",
        ProblemType::Unknown => "unknown",
    }
}

fn parse_status(s: &str) -> Option<crate::ticket::Status> {
    use crate::ticket::Status;
    match s {
        "resolved" => Some(Status::Resolved),
        "transferred" => Some(Status::Transferred),
        "failed" => Some(Status::Failed),
        _ => None,
    }
}

fn status_str(s: crate::ticket::Status) -> &'static str {
    use crate::ticket::Status;
    match s {
        Status::Resolved => "resolved",
        Status::Transferred => "transferred",
        Status::Failed => "failed",
    }
}

fn sentiment_str(s: crate::ticket::Sentiment) -> &'static str {
    use crate::ticket::Sentiment;
    match s {
        Sentiment::Positive => "positive",
        Sentiment::Neutral => "neutral",
        Sentiment::Negative => "negative",
    }
}

fn severity_str(s: crate::ticket::Severity) -> &'static str {
    use crate::ticket::Severity;
    match s {
        Severity::Low => "LOW",
        Severity::Medium => "MEDIUM",
        Severity::High => "HIGH",
    }
}

#[cfg(test)]
pub mod fake {
    //! Deterministic in-memory directory for boundary-scenario tests
    //! (§8) that must run without a live database.
    use super::*;
    use std::sync::Mutex;

    pub struct FakeDirectory {
        pub profiles: std::collections::HashMap<String, CallerProfile>,
        pub history: std::collections::HashMap<String, Vec<TicketSummary>>,
        pub pending: std::collections::HashMap<String, Vec<Ticket>>,
        pub inserted: Mutex<Vec<Ticket>>,
        pub technician_available: bool,
        pub technician_query_errors: bool,
    }

    impl Default for FakeDirectory {
        fn default() -> Self {
            Self {
                profiles: Default::default(),
                history: Default::default(),
                pending: Default::default(),
                inserted: Mutex::new(Vec::new()),
                technician_available: true,
                technician_query_errors: false,
            }
        }
    }

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn lookup_caller(&self, phone: &str) -> Option<CallerProfile> {
            self.profiles.get(phone).cloned()
        }

        async fn lookup_history(&self, phone: &str, limit: i64) -> Vec<TicketSummary> {
            self.history
                .get(phone)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .take(limit as usize)
                .collect()
        }

        async fn lookup_pending(&self, phone: &str) -> Vec<Ticket> {
            self.pending.get(phone).cloned().unwrap_or_default()
        }

        async fn create_ticket(&self, ticket: &Ticket) -> anyhow::Result<String> {
            let mut t = ticket.clone();
            t.sanitize();
            let id = format!("ticket-{}", self.inserted.lock().unwrap().len());
            self.inserted.lock().unwrap().push(t);
            Ok(id)
        }

        async fn technician_available(&self, max_active: i64, _window_min: i64) -> bool {
            if self.technician_query_errors {
                // fail-open: errors in the real client still return true.
                return true;
            }
            self.technician_available && max_active > 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeDirectory;
    use super::*;
    use crate::ticket::{ Sentiment, Severity, Status };

    fn sample_ticket() -> Ticket {
        Ticket {
            call_id: "call-1".into(),
            caller_number: Some("0611111111".into()),
            client_name: Some("Jean".into()),
            client_email: None,
            problem_type: ProblemType::Internet,
            status: Status::Resolved,
            sentiment: Sentiment::Positive,
            summary: "fixed".into(),
            duration_seconds: 10,
            tag: "ok".into(),
            severity: Severity::Low,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fail_open_on_technician_error() {
        let dir = FakeDirectory {
            technician_query_errors: true,
            technician_available: false,
            ..Default::default()
        };
        assert!(dir.technician_available(5, 60).await, "errors must fail open (favor transfer)");
    }

    #[tokio::test]
    async fn test_technician_unavailable_when_capacity_full() {
        let dir = FakeDirectory {
            technician_available: false,
            ..Default::default()
        };
        assert!(!dir.technician_available(5, 60).await);
    }

    #[tokio::test]
    async fn test_create_ticket_sanitizes_before_storing() {
        let dir = FakeDirectory::default();
        let mut t = sample_ticket();
        t.summary = "c'est de la merde\u{0}".into();
        dir.create_ticket(&t).await.unwrap();
        let stored = dir.inserted.lock().unwrap();
        assert!(stored[0].is_clean());
    }

    #[tokio::test]
    async fn test_unknown_caller_has_no_profile() {
        let dir = FakeDirectory::default();
        assert!(dir.lookup_caller("0600000000").await.is_none());
    }
}
