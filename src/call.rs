//! Call session (C8) — the hub.
//!
//! One call is a small fleet of cooperating tasks sharing a single
//! owned [`CallSession`], coordinating through typed channels rather
//! than shared mutation (§9 "Cyclic/shared state"). Grounded on the
//! bridge's `transport_tcp.rs` per-connection spawn shape generalized
//! to five activities, and on `OpenAiSession`'s pattern of one struct
//! owning several task handles and exposing control methods.

use crate::config::Config;
use crate::dialog::{ self, Action, Context, DialogState };
use crate::directory::Directory;
use crate::frame;
use crate::intent::{ detect_problem_type, Intent, IntentKind, ProblemType };
use crate::llm::LlmClient;
use crate::metrics::Metrics;
use crate::phrase_cache::PhraseCache;
use crate::prompts::PromptSet;
use crate::recorder::Recorder;
use crate::resampler::{ self, ResamplerPool };
use crate::stt::{ self, SttEvent, SttMode, SttSession };
use crate::ticket::{ Sentiment, Severity, Status, Ticket };
use crate::timeout_monitor::{ self, MonitorInputs, TimeoutEvent, TimeoutMonitorConfig };
use crate::tts;
use std::collections::VecDeque;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex as StdMutex };
use std::time::{ Duration, Instant };
use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::sync::Mutex;
use tracing::{ info, warn };

/// Shared dependencies every call needs; constructed once at startup and
/// cloned (cheaply — everything inside is `Arc`-backed) per call.
#[derive(Clone)]
pub struct CallDeps {
    pub config: Arc<Config>,
    pub phrase_cache: PhraseCache,
    pub resampler: ResamplerPool,
    pub directory: Arc<dyn Directory>,
    pub llm: Arc<dyn LlmClient>,
    pub metrics: Arc<Metrics>,
    pub prompts: Arc<PromptSet>,
}

/// Owns the playout queue and speaking flag for one call; the only
/// object both the dialog activity (producer, via `say_*`) and the
/// playout-clock activity (consumer, via `next_chunk`) touch.
pub struct Speaker {
    queue: Mutex<VecDeque<Vec<u8>>>,
    is_speaking: Arc<AtomicBool>,
    /// Handles to in-flight background producers (a `say_dynamic` TTS
    /// feeder, or a `say_hybrid` producer/handoff pair) spawned by the
    /// current utterance. Drained and aborted on barge-in (§4.8).
    background: Mutex<Vec<tokio::task::AbortHandle>>,
    phrase_cache: PhraseCache,
    resampler: ResamplerPool,
    http: reqwest::Client,
    tts_base_url: String,
    tts_api_key: String,
    tts_voice_id: String,
}

impl Speaker {
    pub fn new(phrase_cache: PhraseCache, resampler: ResamplerPool, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            is_speaking: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(Vec::new()),
            phrase_cache,
            resampler,
            http: reqwest::Client::new(),
            tts_base_url: config.elevenlabs_base_url.clone(),
            tts_api_key: config.elevenlabs_api_key.clone(),
            tts_voice_id: config.elevenlabs_voice_id.clone(),
        })
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::Relaxed)
    }

    /// The same `Arc<AtomicBool>` `next_chunk`/`say_*` update, so a
    /// monitor built from this handle never drifts out of sync with
    /// whether the bot is actually speaking (§4.12).
    pub fn is_speaking_handle(&self) -> Arc<AtomicBool> {
        self.is_speaking.clone()
    }

    async fn register_background(&self, handle: tokio::task::AbortHandle) {
        let mut handles = self.background.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Pop the next outbound chunk, or 20 ms of silence if the queue is
    /// empty (§4.8: "This clock is the only path that writes audio
    /// frames back to the socket... absence of silence-filling causes
    /// the PBX to treat the stream as stalled").
    pub async fn next_chunk(&self) -> Vec<u8> {
        let mut queue = self.queue.lock().await;
        match queue.pop_front() {
            Some(chunk) => {
                if queue.is_empty() {
                    self.is_speaking.store(false, Ordering::Relaxed);
                }
                chunk
            }
            None => {
                self.is_speaking.store(false, Ordering::Relaxed);
                resampler::silence_ms(20)
            }
        }
    }

    fn enqueue_chunks(&self, chunks: Vec<Vec<u8>>, queue: &mut VecDeque<Vec<u8>>) {
        self.is_speaking.store(true, Ordering::Relaxed);
        queue.extend(chunks);
    }

    fn chunk_static(pcm: &[u8]) -> Vec<Vec<u8>> {
        pcm.chunks(resampler::FRAME_BYTES)
            .map(|c| {
                let mut padded = c.to_vec();
                padded.resize(resampler::FRAME_BYTES, 0);
                padded
            })
            .collect()
    }

    /// Play a static cached phrase. No-op (logged) if the key is unknown.
    pub async fn say_static(&self, key: &str) {
        match self.phrase_cache.get_static(key) {
            Some(pcm) => {
                let chunks = Self::chunk_static(&pcm);
                let mut queue = self.queue.lock().await;
                self.enqueue_chunks(chunks, &mut queue);
            }
            None => warn!(key = %key, "say_static: unknown phrase key"),
        }
    }

    /// Play `text` via the dynamic cache or, on a miss, a fresh TTS
    /// session streamed incrementally into the live queue. Returns as
    /// soon as the background feeder is spawned (or the cache hit is
    /// enqueued) — it never awaits the whole utterance, so the caller's
    /// event loop stays free to observe barge-in while speech is still
    /// being produced (§4.8, §5 "Say* enqueues promptly").
    pub async fn say_dynamic(self: Arc<Self>, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(pcm) = self.phrase_cache.get_dynamic(text).await {
            let chunks = Self::chunk_static(&pcm);
            let mut queue = self.queue.lock().await;
            self.enqueue_chunks(chunks, &mut queue);
            return;
        }

        self.is_speaking.store(true, Ordering::Relaxed);
        let text = text.to_string();
        let speaker = self.clone();
        let task = tokio::spawn(async move {
            let mut session = tts::spawn_tts_session(
                speaker.http.clone(),
                speaker.tts_base_url.clone(),
                speaker.tts_api_key.clone(),
                speaker.tts_voice_id.clone(),
                text,
                speaker.resampler.clone(),
                speaker.phrase_cache.clone()
            );
            while let Some(chunk) = session.next_chunk().await {
                let mut queue = speaker.queue.lock().await;
                queue.push_back(chunk);
                speaker.is_speaking.store(true, Ordering::Relaxed);
            }
        });
        self.register_background(task.abort_handle()).await;
    }

    /// Static phrase immediately, dynamic text produced in the
    /// background and handed off once the static half drains — a
    /// latency-masking primitive for personalized greetings (§4.8, §9).
    /// Like `say_dynamic`, returns once the static half is enqueued and
    /// the background producer/handoff pair is spawned; it does not
    /// await the handoff.
    pub async fn say_hybrid(self: Arc<Self>, key: &'static str, text: String) {
        if text.is_empty() {
            self.say_static(key).await;
            return;
        }

        self.say_static(key).await;

        let holding: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let producer_holding = holding.clone();
        let producer_speaker = self.clone();
        let producer_text = text;

        let producer = tokio::spawn(async move {
            let mut session = tts::spawn_tts_session(
                producer_speaker.http.clone(),
                producer_speaker.tts_base_url.clone(),
                producer_speaker.tts_api_key.clone(),
                producer_speaker.tts_voice_id.clone(),
                producer_text,
                producer_speaker.resampler.clone(),
                producer_speaker.phrase_cache.clone()
            );
            while let Some(chunk) = session.next_chunk().await {
                producer_holding.lock().await.push(chunk);
            }
        });
        let producer_abort = producer.abort_handle();

        let handoff_speaker = self.clone();
        let handoff = tokio::spawn(async move {
            // Wait for the static half to finish playing before handing
            // off (§4.8: "when the static finishes playing ... switch
            // the holding buffer's output to the live queue").
            loop {
                if handoff_speaker.queue.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            producer.await.ok();
            let produced = holding.lock().await.drain(..).collect::<Vec<_>>();
            if !produced.is_empty() {
                let mut queue = handoff_speaker.queue.lock().await;
                handoff_speaker.enqueue_chunks(produced, &mut queue);
            }
        });

        self.register_background(producer_abort).await;
        self.register_background(handoff.abort_handle()).await;
    }

    /// Atomically drain the queue, clear the speaking flag, and cancel
    /// every in-flight background producer for the current utterance
    /// (§4.8 barge-in: "any live TTS session is cancelled ... any
    /// background hybrid producer is cancelled"). Aborting a producer
    /// task drops its owned `TtsSession`, which aborts the underlying
    /// provider fetch/decode task too (`TtsSession`'s `Drop`).
    pub async fn barge_in(&self) {
        let mut queue = self.queue.lock().await;
        queue.clear();
        self.is_speaking.store(false, Ordering::Relaxed);
        drop(queue);

        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }
}

struct CallState {
    call_id: String,
    caller_number: Option<String>,
    started_at: Instant,
    last_user_speech_at: Arc<StdMutex<Instant>>,
    dialog_state: Arc<StdMutex<DialogState>>,
    context: Context,
}

/// One or more `Say*` steps to play for the INIT-phase greeting, decided
/// by a pure lookup over caller/history/pending (no I/O of its own) so
/// it can run before `CallState`/STT/the playout clock are spawned.
enum GreetingStep {
    Static(&'static str),
    Hybrid(&'static str, String),
}

/// Decide the initial dialog state and greeting for this caller. Pure:
/// takes already-resolved profile/history/pending, does no I/O, and
/// plays nothing itself — `run_call` dispatches the returned steps only
/// once STT and the playout clock are already live, so barge-in works
/// from the very first frame of the welcome (§8 "Barge-in during
/// welcome").
fn plan_greeting(
    profile: &Option<crate::directory::CallerProfile>,
    history: &[crate::ticket::TicketSummary],
    pending: &[Ticket]
) -> (DialogState, Vec<GreetingStep>) {
    match (profile, pending.is_empty(), history.is_empty()) {
        (Some(_), false, _) => {
            let ticket_desc = pending[0].problem_type;
            (
                DialogState::TicketVerification,
                vec![GreetingStep::Hybrid("ticket_found_intro", format!("{ticket_desc:?}"))],
            )
        }
        (Some(_), true, _) =>
            (DialogState::Diagnostic, vec![GreetingStep::Hybrid("personal_welcome", String::new())]),
        (None, false, false) =>
            (DialogState::TicketVerification, vec![GreetingStep::Static("returning_pending_welcome")]),
        (None, true, false) =>
            (DialogState::Diagnostic, vec![GreetingStep::Static("returning_plain_welcome")]),
        (None, _, true) =>
            (
                DialogState::AwaitingIdentity,
                vec![
                    GreetingStep::Static("greet"),
                    GreetingStep::Static("welcome"),
                    GreetingStep::Static("ask_identity")
                ],
            ),
    }
}

async fn play_greeting(speaker: &Arc<Speaker>, steps: Vec<GreetingStep>) {
    for step in steps {
        match step {
            GreetingStep::Static(key) => speaker.say_static(key).await,
            GreetingStep::Hybrid(key, text) => speaker.clone().say_hybrid(key, text).await,
        }
    }
}

/// Run one call end to end: handshake already resolved into `call_id`
/// by the admission server. Owns the socket for the lifetime of the
/// call; teardown (recorder close, ticket insert, STT close) always
/// runs, even on error paths (§5 "Call teardown").
pub async fn run_call<S>(socket: S, call_id: String, deps: CallDeps) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let (mut reader, writer) = tokio::io::split(socket);
    let writer = Arc::new(Mutex::new(writer));

    deps.metrics.record_call_start();
    let started_at = Instant::now();
    let opened_at = chrono::Utc::now();

    let speaker = Speaker::new(deps.phrase_cache.clone(), deps.resampler.clone(), &deps.config);
    let mut recorder = Recorder::open(&deps.config.recordings_dir, &call_id, opened_at).await;

    let caller_number = resolve_caller_number(&deps, &call_id).await;
    let profile = match &caller_number {
        Some(phone) => deps.directory.lookup_caller(phone).await,
        None => None,
    };
    let history = match &caller_number {
        Some(phone) => deps.directory.lookup_history(phone, 5).await,
        None => Vec::new(),
    };
    let pending = match &caller_number {
        Some(phone) => deps.directory.lookup_pending(phone).await,
        None => Vec::new(),
    };

    let business_open = is_business_hours_open(&deps.config);

    if !business_open {
        speaker.say_static("closed_hours").await;
        drain_playout(&speaker).await;
        teardown(&deps, &call_id, &caller_number, started_at, None, Status::Failed, &mut recorder).await;
        return;
    }

    let (initial_state, greeting) = plan_greeting(&profile, &history, &pending);

    let call_state = CallState {
        call_id: call_id.clone(),
        caller_number: caller_number.clone(),
        started_at,
        last_user_speech_at: Arc::new(StdMutex::new(Instant::now())),
        dialog_state: Arc::new(StdMutex::new(initial_state)),
        context: Context::default(),
    };

    let (timeout_handle, mut timeout_rx) = timeout_monitor::spawn(
        TimeoutMonitorConfig {
            warn_after: Duration::from_secs(deps.config.silence_warning_timeout),
            hangup_after: Duration::from_secs(deps.config.silence_hangup_timeout),
            max_call_duration: Duration::from_secs(deps.config.max_call_duration),
        },
        MonitorInputs {
            last_user_speech_at: call_state.last_user_speech_at.clone(),
            is_speaking: speaker.is_speaking_handle(),
            state: call_state.dialog_state.clone(),
            started_at: call_state.started_at,
        }
    );

    // STT and the playout clock must both be live before any greeting
    // audio is enqueued, or an interrupting caller during the welcome
    // has no live STT session to detect it (§8 "Barge-in during
    // welcome").
    let initial_mode = (*call_state.dialog_state.lock().unwrap()).stt_mode();
    let mut stt_session = spawn_stt_for_mode(&deps, initial_mode).await;

    let playout_speaker = speaker.clone();
    let playout_writer = writer.clone();
    let playout_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            let chunk = playout_speaker.next_chunk().await;
            let encoded = frame::encode_audio(&chunk);
            let mut w = playout_writer.lock().await;
            if tokio::io::AsyncWriteExt::write_all(&mut *w, &encoded).await.is_err() {
                break;
            }
        }
    });

    play_greeting(&speaker, greeting).await;

    let mut call_state = call_state;
    let mut final_status = Status::Failed;
    let mut final_sentiment = Sentiment::Neutral;
    let mut final_summary = String::new();

    'call: loop {
        enum Event {
            Frame(Result<frame::Frame, crate::error::CoreError>),
            Timeout(Option<TimeoutEvent>),
            Stt(Option<SttEvent>),
        }

        let stt_recv = async {
            match stt_session.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending::<Option<SttEvent>>().await,
            }
        };

        let event = tokio::select! {
            biased;

            frame = frame::read_frame(&mut reader) => Event::Frame(frame),
            t = timeout_rx.recv() => Event::Timeout(t),
            s = stt_recv => Event::Stt(s),
        };

        match event {
            Event::Frame(Ok(f)) if f.is_audio() => {
                recorder.write(&f.payload).await;
                if let Some(s) = stt_session.as_ref() {
                    s.send_audio(f.payload.clone()).await;
                }
            }
            Event::Frame(Ok(_)) => {}
            Event::Frame(Err(_)) => break 'call,

            Event::Timeout(Some(TimeoutEvent::SilenceWarning)) => {
                speaker.say_static("still_there").await;
            }
            Event::Timeout(Some(TimeoutEvent::SilenceHangup | TimeoutEvent::MaxDuration)) => {
                speaker.say_static("goodbye").await;
                drain_playout(&speaker).await;
                break 'call;
            }
            Event::Timeout(None) => {}

            Event::Stt(Some(SttEvent::SpeechStarted)) => {}
            Event::Stt(Some(SttEvent::Interim(_text))) => {
                if speaker.is_speaking() {
                    speaker.barge_in().await;
                }
            }
            Event::Stt(Some(SttEvent::Final(text))) => {
                if speaker.is_speaking() {
                    speaker.barge_in().await;
                }
                *call_state.last_user_speech_at.lock().unwrap() = Instant::now();

                let current_state = *call_state.dialog_state.lock().unwrap();

                if let Some(t) = dialog::sentiment_guard(&mut call_state.context, &text) {
                    apply_transition(&deps, &speaker, &mut call_state, t, &text).await;
                    final_status = Status::Transferred;
                    final_sentiment = Sentiment::Negative;
                    break 'call;
                }

                call_state.context.user_spoken_info = Some(text.clone());
                let intent = classify_turn(&deps, &call_state.context, current_state, &text).await;

                let transition = dialog::next_state(current_state, &mut call_state.context, &intent);
                let next_state = transition.next_state;
                let ended = apply_transition(&deps, &speaker, &mut call_state, transition, &text).await;

                match next_state {
                    DialogState::Transfer => {
                        final_status = Status::Transferred;
                    }
                    DialogState::Goodbye => {
                        final_status = Status::Resolved;
                    }
                    DialogState::Error => {
                        final_status = Status::Failed;
                    }
                    _ => {}
                }
                final_sentiment = sentiment_from_negative_count(call_state.context.negative_count);

                let actual_next = *call_state.dialog_state.lock().unwrap();
                if actual_next.stt_mode() != current_state.stt_mode() {
                    stt_session = spawn_stt_for_mode(&deps, actual_next.stt_mode()).await;
                }

                if ended {
                    break 'call;
                }
            }
            Event::Stt(Some(SttEvent::Closed)) => {
                stt_session = None;
            }
            Event::Stt(None) => {
                stt_session = None;
            }
        }
    }

    let duration = started_at.elapsed().as_secs();
    final_summary = summarize_call(&deps, &call_state.context, &final_summary).await;

    playout_handle.abort();
    timeout_handle.abort();
    if let Some(s) = stt_session.as_ref() {
        s.close();
    }

    let ticket = Ticket {
        call_id: call_state.call_id.clone(),
        caller_number: call_state.caller_number.clone(),
        client_name: None,
        client_email: call_state.context.email.clone(),
        problem_type: call_state.context.problem_type.unwrap_or(ProblemType::Unknown),
        status: final_status,
        sentiment: final_sentiment,
        summary: final_summary,
        duration_seconds: duration,
        tag: problem_tag(call_state.context.problem_type),
        severity: severity_from(&call_state.context),
        created_at: chrono::Utc::now(),
    };

    teardown(&deps, &call_state.call_id, &call_state.caller_number, started_at, Some(ticket), final_status, &mut recorder).await;
}

async fn apply_transition(
    deps: &CallDeps,
    speaker: &Arc<Speaker>,
    call_state: &mut CallState,
    transition: dialog::Transition,
    last_text: &str
) -> bool {
    let next_state = transition.next_state;
    *call_state.dialog_state.lock().unwrap() = next_state;

    // Resolve the VERIFICATION=no technician-availability branch here,
    // since it needs the directory client the dialog table doesn't own.
    // Must be checked before the action is consumed below.
    let needs_technician_check = next_state == DialogState::Transfer && matches!(transition.action, Action::None);

    match transition.action {
        Action::SayStatic(key) => speaker.say_static(key).await,
        Action::SayDynamic(text) => {
            let text = if text.is_empty() { llm_reply(deps, call_state, last_text).await } else { text };
            speaker.clone().say_dynamic(&text).await;
        }
        Action::SayHybrid(key, text) => {
            let text = if text.is_empty() { String::new() } else { text };
            speaker.clone().say_hybrid(key, text).await;
        }
        Action::SayFillerThen(key) => {
            speaker.say_static(dialog::pick_filler_phrase()).await;
            speaker.say_static(key).await;
        }
        Action::Wait(d) => tokio::time::sleep(d).await,
        Action::EndCall => {}
        Action::None => {}
    }

    if needs_technician_check {
        let available = deps.directory.technician_available(
            deps.config.technician_max_active_transfers,
            deps.config.technician_load_window_min
        ).await;
        if available {
            speaker.say_static("transfer").await;
        } else {
            speaker.clone().say_dynamic("Nous vous rappellerons des que possible.").await;
            *call_state.dialog_state.lock().unwrap() = DialogState::Goodbye;
        }
        return true;
    }

    matches!(next_state, DialogState::Transfer | DialogState::Goodbye | DialogState::Error)
}

async fn llm_reply(deps: &CallDeps, call_state: &CallState, last_text: &str) -> String {
    deps.llm.complete(&deps.prompts.reply_system, last_text).await
}

async fn classify_turn(deps: &CallDeps, ctx: &Context, state: DialogState, text: &str) -> Intent {
    if matches!(state, DialogState::Diagnostic) {
        return Intent {
            kind: IntentKind::Unclear,
            confidence: 0.0,
            extracted: crate::intent::Extracted::Problem { problem_type: detect_problem_type(text) },
            requires_clarification: false,
            off_topic: false,
            reasoning: None,
        };
    }
    if matches!(state, DialogState::TicketVerification | DialogState::Verification) {
        if dialog::keyword_no(text) {
            return Intent {
                kind: IntentKind::No,
                confidence: 1.0,
                ..deps.llm.classify_json(&deps.prompts.classify_template, text).await
            };
        }
    }
    let _ = ctx;
    deps.llm.classify_json(&deps.prompts.classify_template, text).await
}

async fn summarize_call(deps: &CallDeps, ctx: &Context, existing: &str) -> String {
    if !existing.is_empty() {
        return existing.to_string();
    }
    let user_text = ctx.user_spoken_info.clone().unwrap_or_default();
    deps.llm.complete(&deps.prompts.summary_system, &user_text).await
}

fn sentiment_from_negative_count(count: u32) -> Sentiment {
    match count {
        0 => Sentiment::Positive,
        1..=2 => Sentiment::Neutral,
        _ => Sentiment::Negative,
    }
}

fn severity_from(ctx: &Context) -> Severity {
    if ctx.negative_count >= 3 {
        Severity::High
    } else if ctx.negative_count >= 1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn problem_tag(problem_type: Option<ProblemType>) -> String {
    match problem_type {
        Some(ProblemType::Internet) => "internet_issue".to_string(),
        Some(ProblemType::Mobile) => "mobile_no_signal".to_string(),
        _ => "unknown".to_string(),
    }
}

async fn resolve_caller_number(deps: &CallDeps, call_id: &str) -> Option<String> {
    // call_id is itself the handshake identifier; when it's not phone
    // shaped (e.g. a UUID), resolve via AMI (§4.9 INIT step).
    if call_id.chars().all(|c| c.is_ascii_digit()) && call_id.len() >= 8 {
        return Some(call_id.to_string());
    }
    crate::ami::lookup_caller_number(
        &deps.config.ami_host,
        deps.config.ami_port,
        &deps.config.ami_username,
        &deps.config.ami_secret,
        call_id
    ).await
}

fn is_business_hours_open(config: &Config) -> bool {
    let schedule = config.business_schedule();
    if schedule.is_empty() {
        return false;
    }
    let now = chrono::Local::now();
    let weekday = now.weekday().num_days_from_monday() as u8;
    let hour = now.hour() as u8;
    schedule
        .get(&weekday)
        .map(|ranges| ranges.iter().any(|&(start, end)| hour >= start && hour < end))
        .unwrap_or(false)
}

async fn drain_playout(speaker: &Speaker) {
    speaker.barge_in().await;
}

async fn spawn_stt_for_mode(deps: &CallDeps, mode: SttMode) -> Option<SttSession> {
    if deps.config.deepgram_api_key.is_empty() {
        return None;
    }
    match stt::spawn_stt_session(&deps.config.deepgram_url, &deps.config.deepgram_api_key, mode, 8000).await {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(error = %e, "failed to open stt session, call proceeds without stt");
            None
        }
    }
}

/// Recorder close, ticket insert, and metrics/logging. Does not release
/// the admission slot — the accept loop releases it once this call's
/// future resolves (§4.10).
async fn teardown(
    deps: &CallDeps,
    call_id: &str,
    caller_number: &Option<String>,
    started_at: Instant,
    ticket: Option<Ticket>,
    final_status: Status,
    recorder: &mut Recorder
) {
    recorder.close().await;

    if let Some(ticket) = ticket {
        let problem_type_str = problem_tag(Some(ticket.problem_type));
        match deps.directory.create_ticket(&ticket).await {
            Ok(_) => deps.metrics.record_ticket_inserted(),
            Err(e) => warn!(error = %e, call_id = %call_id, "ticket insert failed"),
        }
        deps.metrics.record_call_end(status_str(final_status), &problem_type_str);
    } else {
        deps.metrics.record_call_end(status_str(final_status), "unknown");
    }

    info!(
        call_id = %call_id,
        caller = ?caller_number,
        duration_s = started_at.elapsed().as_secs(),
        status = status_str(final_status),
        "call ended"
    );
}

fn status_str(status: Status) -> &'static str {
    match status {
        Status::Resolved => "resolved",
        Status::Transferred => "transferred",
        Status::Failed => "failed",
    }
}

use chrono::{ Datelike, Timelike };


/// End-to-end boundary scenarios (§8), driven through `run_call` itself
/// rather than its individual pieces. The directory and LLM are the
/// in-memory fakes from their own modules; STT is a minimal
/// Deepgram-shaped WS server run locally so the dialog is actually
/// advanced by real `SttEvent::Final` events arriving over a socket,
/// not injected directly into `CallState`. TTS points at an unroutable
/// address so `say_dynamic`/`say_hybrid` fall straight through to their
/// provider-error path without a network dependency.
#[cfg(test)]
mod boundary_tests {
    use super::*;
    use crate::directory::fake::FakeDirectory;
    use crate::directory::CallerProfile;
    use crate::intent::Extracted;
    use crate::llm::fake::FakeLlmClient;
    use clap::Parser;
    use futures_util::SinkExt;
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn all_static_phrases() -> HashMap<String, Vec<u8>> {
        [
            "greet",
            "welcome",
            "ask_identity",
            "closed_hours",
            "still_there",
            "goodbye",
            "personal_welcome",
            "returning_pending_welcome",
            "returning_plain_welcome",
            "ticket_found_intro",
            "ticket_not_related",
            "ticket_transfer_ok",
            "transfer",
            "clarify_yes_no",
            "ask_problem",
            "mobile_restart_phone",
            "internet_safety_warning",
            "ask_did_it_work",
            "empathy_transfer",
            "error_generic",
            "filler_un_instant",
            "filler_je_verifie",
            "filler_ok_voyons_ca",
        ]
            .iter()
            .map(|k| (k.to_string(), vec![1u8; 320]))
            .collect()
    }

    fn open_all_week() -> String {
        r#"{"0":[[0,24]],"1":[[0,24]],"2":[[0,24]],"3":[[0,24]],"4":[[0,24]],"5":[[0,24]],"6":[[0,24]]}"#.to_string()
    }

    fn yes_intent() -> Intent {
        Intent {
            kind: IntentKind::Yes,
            confidence: 0.9,
            extracted: Extracted::None,
            requires_clarification: false,
            off_topic: false,
            reasoning: None,
        }
    }

    /// Accepts any number of sequential WS connections (the call
    /// reconnects to STT whenever the endpointing mode changes) and
    /// feeds `script` across however many of them show up, so tests
    /// don't need to predict exact reconnect boundaries.
    async fn spawn_fake_stt_server(script: Vec<(Duration, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remaining = Arc::new(Mutex::new(VecDeque::from(script)));

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                loop {
                    let next = remaining.lock().await.pop_front();
                    let Some((delay, text)) = next else {
                        break;
                    };
                    tokio::time::sleep(delay).await;
                    let payload =
                        serde_json::json!({
                        "is_final": true,
                        "channel": { "alternatives": [{ "transcript": text }] }
                    });
                    if ws.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        });

        format!("ws://{addr}")
    }

    fn base_deps(directory: Arc<dyn Directory>, llm: Arc<dyn LlmClient>, deepgram_url: Option<String>) -> CallDeps {
        let mut config = Config::parse_from(["voicebot-core"]);
        config.business_schedule = open_all_week();
        config.recordings_dir = "/nonexistent/voicebot-boundary-tests".to_string();
        config.elevenlabs_base_url = "http://127.0.0.1:0".to_string();
        if let Some(url) = deepgram_url {
            config.deepgram_api_key = "test-key".to_string();
            config.deepgram_url = url;
        }

        CallDeps {
            config: Arc::new(config),
            phrase_cache: PhraseCache::from_static(all_static_phrases(), 8),
            resampler: ResamplerPool::spawn(1),
            directory,
            llm,
            metrics: Metrics::new(),
            prompts: Arc::new(PromptSet::default()),
        }
    }

    async fn run_scenario(deps: CallDeps, call_id: &str, deadline: Duration) {
        let (client, server) = tokio::io::duplex(4096);
        let call_id = call_id.to_string();
        let handle = tokio::spawn(run_call(server, call_id, deps));
        tokio::time
            ::timeout(deadline, handle).await
            .expect("scenario did not complete within deadline")
            .expect("run_call task panicked");
        drop(client);
    }

    #[tokio::test]
    async fn test_happy_path_mobile_fix() {
        let stt_url = spawn_fake_stt_server(
            vec![
                (Duration::from_millis(10), "jean arobase acme point com"),
                (Duration::from_millis(10), "bonjour"),
                (Duration::from_millis(10), "mon portable n'a pas de reseau"),
                (Duration::from_millis(10), "continuons"),
                (Duration::from_millis(10), "oui")
            ]
        ).await;

        let directory = Arc::new(FakeDirectory::default());
        let llm = Arc::new(FakeLlmClient {
            classify_reply: yes_intent(),
            ..Default::default()
        });
        let deps = base_deps(directory.clone(), llm, Some(stt_url));

        run_scenario(deps, "0612345678", Duration::from_secs(5)).await;

        let inserted = directory.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        let ticket = &inserted[0];
        assert_eq!(ticket.problem_type, ProblemType::Mobile);
        assert_eq!(ticket.status, Status::Resolved);
        assert!(matches!(ticket.sentiment, Sentiment::Positive | Sentiment::Neutral));
        assert!(!ticket.summary.is_empty());
    }

    #[tokio::test]
    async fn test_barge_in_during_welcome_reaches_diagnostic() {
        // "personal_welcome" is played as a hybrid greeting with a large
        // static payload so it spans several playout ticks; the STT
        // final event below arrives while it would still be playing
        // under the old blocking say_hybrid, so a short overall deadline
        // only passes once barge-in can interrupt it promptly.
        let stt_url = spawn_fake_stt_server(
            vec![
                (Duration::from_millis(10), "j'ai pas internet"),
                (Duration::from_millis(10), "la suite"),
                (Duration::from_millis(10), "oui")
            ]
        ).await;

        let mut directory = FakeDirectory::default();
        directory.profiles.insert(
            "0613141516".to_string(),
            CallerProfile { first_name: Some("Jean".into()), last_name: Some("Dupont".into()), box_model: None }
        );
        let directory = Arc::new(directory);
        let llm = Arc::new(FakeLlmClient {
            classify_reply: yes_intent(),
            ..Default::default()
        });
        let deps = base_deps(directory.clone(), llm, Some(stt_url));

        run_scenario(deps, "0613141516", Duration::from_secs(5)).await;

        let inserted = directory.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].problem_type, ProblemType::Internet);
        assert_eq!(inserted[0].status, Status::Resolved);
    }

    #[tokio::test]
    async fn test_anger_fast_path_skips_llm_dialog_consult() {
        let stt_url = spawn_fake_stt_server(
            vec![(Duration::from_millis(10), "c'est de l'arnaque, vous etes incompetents, ras le bol")]
        ).await;

        let directory = Arc::new(FakeDirectory::default());
        let llm = Arc::new(FakeLlmClient::default());
        let deps = base_deps(directory.clone(), llm.clone(), Some(stt_url));

        run_scenario(deps, "0611223344", Duration::from_secs(5)).await;

        let inserted = directory.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].status, Status::Transferred);
        assert_eq!(inserted[0].sentiment, Sentiment::Negative);
        // The only LLM call allowed is the end-of-call summary fallback;
        // none should happen for dialog-turn classification/reply.
        assert!(*llm.calls.lock().unwrap() <= 1);
    }

    #[tokio::test]
    async fn test_pending_ticket_confirm_transfers() {
        let stt_url = spawn_fake_stt_server(vec![(Duration::from_millis(10), "oui")]).await;

        let mut directory = FakeDirectory::default();
        directory.profiles.insert(
            "0611111111".to_string(),
            CallerProfile { first_name: Some("Marie".into()), last_name: Some("Leroy".into()), box_model: None }
        );
        directory.pending.insert("0611111111".to_string(), vec![Ticket {
            call_id: "prior-call".into(),
            caller_number: Some("0611111111".into()),
            client_name: None,
            client_email: None,
            problem_type: ProblemType::Internet,
            status: Status::Transferred,
            sentiment: Sentiment::Neutral,
            summary: String::new(),
            duration_seconds: 0,
            tag: String::new(),
            severity: Severity::Low,
            created_at: chrono::Utc::now(),
        }]);
        let directory = Arc::new(directory);
        let llm = Arc::new(FakeLlmClient {
            classify_reply: yes_intent(),
            ..Default::default()
        });
        let deps = base_deps(directory.clone(), llm, Some(stt_url));

        run_scenario(deps, "0611111111", Duration::from_secs(5)).await;

        let inserted = directory.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].status, Status::Transferred);
    }

    #[tokio::test]
    async fn test_closed_hours_ends_call_without_a_ticket() {
        let directory = Arc::new(FakeDirectory::default());
        let llm = Arc::new(FakeLlmClient::default());
        let mut deps = base_deps(directory.clone(), llm, None);
        Arc::get_mut(&mut deps.config).unwrap().business_schedule = String::new();

        run_scenario(deps, "0699887766", Duration::from_secs(2)).await;

        assert!(directory.inserted.lock().unwrap().is_empty());
    }
}
