use clap::Parser;
use std::collections::HashMap;

/// Realtime per-call engine for the telephony support voice-bot.
///
/// All knobs are overridable via `--flag` or the matching env var, the
/// same `clap(env)` pattern used throughout this config.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    // ── AudioSocket listener ───────────────────────────────────────────
    #[arg(long, env = "AUDIOSOCKET_HOST", default_value = "0.0.0.0")]
    pub audiosocket_host: String,

    #[arg(long, env = "AUDIOSOCKET_PORT", default_value_t = 9900)]
    pub audiosocket_port: u16,

    #[arg(long, env = "MAX_CONCURRENT_CALLS", default_value_t = 20)]
    pub max_concurrent_calls: usize,

    // ── Timeout monitor (C12) ──────────────────────────────────────────
    #[arg(long, env = "SILENCE_WARNING_TIMEOUT", default_value_t = 15)]
    pub silence_warning_timeout: u64,

    #[arg(long, env = "SILENCE_HANGUP_TIMEOUT", default_value_t = 30)]
    pub silence_hangup_timeout: u64,

    #[arg(long, env = "MAX_CALL_DURATION", default_value_t = 600)]
    pub max_call_duration: u64,

    // ── Resampler pool (C2) ─────────────────────────────────────────────
    #[arg(long, env = "PROCESS_POOL_WORKERS", default_value_t = 3)]
    pub process_pool_workers: usize,

    // ── Phrase cache (C3) ───────────────────────────────────────────────
    #[arg(long, env = "PHRASE_CACHE_DIR", default_value = "assets/cache")]
    pub phrase_cache_dir: String,

    #[arg(long, env = "DYNAMIC_CACHE_MAX_SIZE", default_value_t = 256)]
    pub dynamic_cache_max_size: usize,

    // ── Recorder (C11) ──────────────────────────────────────────────────
    #[arg(long, env = "RECORDINGS_DIR", default_value = "logs/calls")]
    pub recordings_dir: String,

    // ── STT provider (Deepgram-shaped) ──────────────────────────────────
    #[arg(long, env = "DEEPGRAM_API_KEY", default_value = "")]
    pub deepgram_api_key: String,

    #[arg(long, env = "DEEPGRAM_MODEL", default_value = "nova-2")]
    pub deepgram_model: String,

    #[arg(long, env = "DEEPGRAM_URL", default_value = "wss://api.deepgram.com/v1/listen")]
    pub deepgram_url: String,

    // ── LLM provider (Groq-shaped) ───────────────────────────────────────
    #[arg(long, env = "GROQ_API_KEY", default_value = "")]
    pub groq_api_key: String,

    #[arg(long, env = "GROQ_MODEL", default_value = "llama-3.1-70b-versatile")]
    pub groq_model: String,

    #[arg(long, env = "GROQ_URL", default_value = "https://api.groq.com/openai/v1/chat/completions")]
    pub groq_url: String,

    #[arg(long, env = "LLM_DEADLINE_SECS", default_value_t = 10)]
    pub llm_deadline_secs: u64,

    // ── TTS provider (ElevenLabs-shaped) ─────────────────────────────────
    #[arg(long, env = "ELEVENLABS_BASE_URL", default_value = "https://api.elevenlabs.io")]
    pub elevenlabs_base_url: String,

    #[arg(long, env = "ELEVENLABS_API_KEY", default_value = "")]
    pub elevenlabs_api_key: String,

    #[arg(long, env = "ELEVENLABS_VOICE_ID", default_value = "")]
    pub elevenlabs_voice_id: String,

    #[arg(long, env = "ELEVENLABS_MODEL", default_value = "eleven_turbo_v2_5")]
    pub elevenlabs_model: String,

    #[arg(long, env = "ELEVENLABS_STABILITY", default_value_t = 0.5)]
    pub elevenlabs_stability: f32,

    #[arg(long, env = "ELEVENLABS_SIMILARITY", default_value_t = 0.75)]
    pub elevenlabs_similarity: f32,

    #[arg(long, env = "ELEVENLABS_STYLE", default_value_t = 0.0)]
    pub elevenlabs_style: f32,

    #[arg(long, env = "ELEVENLABS_SPEAKER_BOOST", default_value_t = true)]
    pub elevenlabs_speaker_boost: bool,

    #[arg(long, env = "TTS_DEADLINE_SECS", default_value_t = 10)]
    pub tts_deadline_secs: u64,

    // ── PBX AMI control plane ────────────────────────────────────────────
    #[arg(long, env = "AMI_HOST", default_value = "127.0.0.1")]
    pub ami_host: String,

    #[arg(long, env = "AMI_PORT", default_value_t = 5038)]
    pub ami_port: u16,

    #[arg(long, env = "AMI_USERNAME", default_value = "")]
    pub ami_username: String,

    #[arg(long, env = "AMI_SECRET", default_value = "")]
    pub ami_secret: String,

    #[arg(long, env = "AMI_DEADLINE_SECS", default_value_t = 3)]
    pub ami_deadline_secs: u64,

    // ── Persistence ──────────────────────────────────────────────────────
    #[arg(long, env = "DB_CLIENTS_DSN", default_value = "")]
    pub db_clients_dsn: String,

    #[arg(long, env = "DB_TICKETS_DSN", default_value = "")]
    pub db_tickets_dsn: String,

    #[arg(long, env = "DB_POOL_MIN", default_value_t = 2)]
    pub db_pool_min: u32,

    #[arg(long, env = "DB_POOL_MAX", default_value_t = 10)]
    pub db_pool_max: u32,

    // ── Business hours / load shedding ───────────────────────────────────
    /// JSON map `{"0": [[8,12],[13,18]], ...}` of weekday (0=Mon..6=Sun) to
    /// `(start_hour, end_hour)` ranges. Empty/absent weekdays are closed.
    #[arg(long, env = "BUSINESS_SCHEDULE", default_value = "")]
    pub business_schedule: String,

    #[arg(long, env = "TECHNICIAN_MAX_ACTIVE_TRANSFERS", default_value_t = 5)]
    pub technician_max_active_transfers: i64,

    #[arg(long, env = "TECHNICIAN_LOAD_WINDOW_MIN", default_value_t = 60)]
    pub technician_load_window_min: i64,

    // ── Sentiment guard ───────────────────────────────────────────────────
    #[arg(long, env = "SENTIMENT_ANGER_THRESHOLD", default_value_t = 3)]
    pub sentiment_anger_threshold: u32,

    // ── Prompt authoring (§9) ─────────────────────────────────────────────
    #[arg(long, env = "PROMPTS_FILE", default_value = "config/prompts.toml")]
    pub prompts_file: String,

    // ── Observability ─────────────────────────────────────────────────────
    #[arg(long, env = "METRICS_HOST", default_value = "0.0.0.0")]
    pub metrics_host: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9100)]
    pub metrics_port: u16,
}

impl Config {
    pub fn audiosocket_addr(&self) -> String {
        format!("{}:{}", self.audiosocket_host, self.audiosocket_port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }

    pub fn resolved_pool_workers(&self) -> usize {
        if self.process_pool_workers == 0 { num_cpus() } else { self.process_pool_workers }
    }

    /// Parse `BUSINESS_SCHEDULE` into weekday → open ranges. An empty or
    /// unparsable value means "closed every day", which is the safe
    /// default for a misconfigured schedule.
    pub fn business_schedule(&self) -> HashMap<u8, Vec<(u8, u8)>> {
        if self.business_schedule.trim().is_empty() {
            return HashMap::new();
        }
        match serde_json::from_str::<HashMap<String, Vec<(u8, u8)>>>(&self.business_schedule) {
            Ok(raw) =>
                raw.into_iter()
                    .filter_map(|(k, v)| k.parse::<u8>().ok().map(|d| (d, v)))
                    .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse BUSINESS_SCHEDULE, treating as closed");
                HashMap::new()
            }
        }
    }

    /// Required settings that must be present before the admission loop
    /// starts accepting connections (§7 ConfigMissing).
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.deepgram_api_key.is_empty() {
            missing.push("DEEPGRAM_API_KEY");
        }
        if self.groq_api_key.is_empty() {
            missing.push("GROQ_API_KEY");
        }
        if self.elevenlabs_api_key.is_empty() {
            missing.push("ELEVENLABS_API_KEY");
        }
        if self.db_tickets_dsn.is_empty() {
            missing.push("DB_TICKETS_DSN");
        }
        missing
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["voicebot-core"])
    }

    #[test]
    fn test_addrs() {
        let c = base_config();
        assert_eq!(c.audiosocket_addr(), "0.0.0.0:9900");
        assert_eq!(c.metrics_addr(), "0.0.0.0:9100");
    }

    #[test]
    fn test_business_schedule_empty() {
        let c = base_config();
        assert!(c.business_schedule().is_empty());
    }

    #[test]
    fn test_business_schedule_parses() {
        let mut c = base_config();
        c.business_schedule = r#"{"0":[[8,12],[13,18]],"1":[[8,18]]}"#.to_string();
        let sched = c.business_schedule();
        assert_eq!(sched.get(&0), Some(&vec![(8, 12), (13, 18)]));
        assert_eq!(sched.get(&1), Some(&vec![(8, 18)]));
        assert!(sched.get(&6).is_none());
    }

    #[test]
    fn test_business_schedule_garbage_is_closed() {
        let mut c = base_config();
        c.business_schedule = "not json".to_string();
        assert!(c.business_schedule().is_empty());
    }

    #[test]
    fn test_missing_required_reports_all() {
        let c = base_config();
        let missing = c.missing_required();
        assert!(missing.contains(&"DEEPGRAM_API_KEY"));
        assert!(missing.contains(&"GROQ_API_KEY"));
        assert!(missing.contains(&"ELEVENLABS_API_KEY"));
        assert!(missing.contains(&"DB_TICKETS_DSN"));
    }
}
