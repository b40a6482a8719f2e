//! Dialog FSM (C9).
//!
//! A table of `TransitionRule`s evaluated in declaration order — the
//! "replace scattered conditionals with a table" approach, generalizing
//! the bridge's declarative `PersonaTrait::ALL`/weight-table style
//! (`persona.rs`) to per-turn dialog transitions. `call.rs` drives this
//! module: it builds a `Context`, asks `next_state` for the transition
//! that applies, and executes the returned `Action`.

use crate::intent::{ detect_problem_type, Intent, IntentKind, ProblemType };
use crate::sanitize::count_negative_keywords;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    Init,
    Welcome,
    TicketVerification,
    Identification,
    AwaitingIdentity,
    Diagnostic,
    Solution,
    Verification,
    Transfer,
    Goodbye,
    Error,
}

impl DialogState {
    /// STT endpointing mode for this state (§4.9: "ask" states use
    /// `yes_no`; all others use `open`).
    pub fn stt_mode(self) -> crate::stt::SttMode {
        match self {
            DialogState::TicketVerification | DialogState::Verification | DialogState::Solution =>
                crate::stt::SttMode::YesNo,
            _ => crate::stt::SttMode::Open,
        }
    }
}

const CLARIFICATION_CAP: u32 = 2;
const CONFIRMATION_CAP: u32 = 3;
const NEGATIVE_KEYWORD_THRESHOLD: u32 = 3;
const YES_CONFIDENCE_THRESHOLD: f32 = 0.6;

/// Per-call mutable slots the FSM reads and updates each turn (§3 `Context`).
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub problem_type: Option<ProblemType>,
    pub user_spoken_info: Option<String>,
    pub email: Option<String>,
    pub negative_count: u32,
    pub force_transfer: bool,
    pub clarification_attempts: u32,
    pub confirmation_attempts: u32,
    pub fatal_error: bool,
}

/// Side effect for `call.rs` to execute after a transition is selected.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SayStatic(&'static str),
    SayDynamic(String),
    SayHybrid(&'static str, String),
    /// A random filler phrase, then the named static key — DIAGNOSTIC →
    /// SOLUTION(internet)'s "play a random filler, then safety warning"
    /// (§4.9).
    SayFillerThen(&'static str),
    /// Pause before continuing (SOLUTION → VERIFICATION, §4.9).
    Wait(std::time::Duration),
    EndCall,
    None,
}

/// Closed list of filler phrases played before a longer static warning,
/// so the caller hears something while the warning itself (already
/// cached) is looked up. Keyed like the rest of the static phrase set.
pub const FILLER_PHRASE_KEYS: &[&str] = &["filler_un_instant", "filler_je_verifie", "filler_ok_voyons_ca"];

/// Pick one filler phrase at random (§4.9 "a random filler").
pub fn pick_filler_phrase() -> &'static str {
    use rand::seq::SliceRandom;
    FILLER_PHRASE_KEYS.choose(&mut rand::thread_rng()).copied().unwrap_or(FILLER_PHRASE_KEYS[0])
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub next_state: DialogState,
    pub action: Action,
}

/// Apply the pre-FSM sentiment guard (§4.9). Call this before
/// `next_state` on every final transcript; if it fires, skip the FSM
/// entirely for this turn and use the returned transition.
pub fn sentiment_guard(ctx: &mut Context, transcript: &str) -> Option<Transition> {
    ctx.negative_count += count_negative_keywords(transcript);
    if ctx.negative_count >= NEGATIVE_KEYWORD_THRESHOLD {
        ctx.force_transfer = true;
        return Some(Transition {
            next_state: DialogState::Transfer,
            action: Action::SayStatic("empathy_transfer"),
        });
    }
    None
}

/// Select the first applicable transition for `state` given `ctx` and the
/// current turn's `intent`, in declaration order (§4.9 tie-break rule).
pub fn next_state(state: DialogState, ctx: &mut Context, intent: &Intent) -> Transition {
    // Universal rules, checked before any per-state rule (§4.9: "any...").
    if !matches!(state, DialogState::Transfer | DialogState::Goodbye | DialogState::Error) {
        if ctx.force_transfer {
            return Transition { next_state: DialogState::Transfer, action: Action::None };
        }
    }
    if !matches!(state, DialogState::Error) && ctx.fatal_error {
        return Transition { next_state: DialogState::Error, action: Action::SayStatic("error_generic") };
    }

    match state {
        DialogState::TicketVerification => {
            if intent.is_yes(YES_CONFIDENCE_THRESHOLD) {
                Transition { next_state: DialogState::Transfer, action: Action::SayStatic("ticket_transfer_ok") }
            } else if intent.is_no() {
                Transition { next_state: DialogState::Diagnostic, action: Action::SayStatic("ticket_not_related") }
            } else {
                ctx.clarification_attempts += 1;
                if ctx.clarification_attempts > CLARIFICATION_CAP {
                    Transition { next_state: DialogState::Transfer, action: Action::SayStatic("transfer") }
                } else {
                    Transition {
                        next_state: DialogState::TicketVerification,
                        action: Action::SayStatic("clarify_yes_no"),
                    }
                }
            }
        }

        DialogState::AwaitingIdentity | DialogState::Identification => {
            if let Some(email) = crate::intent::normalize_email(
                ctx.user_spoken_info.as_deref().unwrap_or("")
            ) {
                ctx.email = Some(email);
                Transition { next_state: DialogState::Identification, action: Action::SayDynamic(String::new()) }
            } else if state == DialogState::Identification {
                Transition { next_state: DialogState::Diagnostic, action: Action::SayDynamic(String::new()) }
            } else {
                ctx.clarification_attempts += 1;
                if ctx.clarification_attempts > CLARIFICATION_CAP {
                    Transition { next_state: DialogState::Transfer, action: Action::SayStatic("transfer") }
                } else {
                    Transition { next_state: DialogState::AwaitingIdentity, action: Action::SayStatic("ask_identity") }
                }
            }
        }

        DialogState::Diagnostic => {
            let detected = ctx.problem_type.unwrap_or_else(||
                ctx.user_spoken_info
                    .as_deref()
                    .map(detect_problem_type)
                    .unwrap_or(ProblemType::Unknown)
            );
            ctx.problem_type = Some(detected);
            match detected {
                ProblemType::Internet =>
                    Transition {
                        next_state: DialogState::Solution,
                        action: Action::SayFillerThen("internet_safety_warning"),
                    },
                ProblemType::Mobile =>
                    Transition {
                        next_state: DialogState::Solution,
                        action: Action::SayStatic("mobile_restart_phone"),
                    },
                ProblemType::Unknown => {
                    ctx.clarification_attempts += 1;
                    if ctx.clarification_attempts > CLARIFICATION_CAP {
                        Transition { next_state: DialogState::Transfer, action: Action::SayStatic("transfer") }
                    } else {
                        Transition { next_state: DialogState::Diagnostic, action: Action::SayStatic("ask_problem") }
                    }
                }
            }
        }

        DialogState::Solution => {
            Transition {
                next_state: DialogState::Verification,
                action: Action::Wait(std::time::Duration::from_secs(2)),
            }
        }

        DialogState::Verification => {
            if intent.is_yes(YES_CONFIDENCE_THRESHOLD) {
                Transition { next_state: DialogState::Goodbye, action: Action::SayHybrid("goodbye", String::new()) }
            } else if intent.is_no() {
                // call.rs resolves the technician-availability branch and
                // overrides next_state/action accordingly (§4.9).
                Transition { next_state: DialogState::Transfer, action: Action::None }
            } else {
                ctx.confirmation_attempts += 1;
                if ctx.confirmation_attempts > CONFIRMATION_CAP {
                    Transition { next_state: DialogState::Transfer, action: Action::SayStatic("transfer") }
                } else {
                    Transition { next_state: DialogState::Verification, action: Action::SayStatic("ask_did_it_work") }
                }
            }
        }

        DialogState::Init | DialogState::Welcome | DialogState::Transfer | DialogState::Goodbye =>
            Transition { next_state: state, action: Action::None },

        DialogState::Error => Transition { next_state: DialogState::Error, action: Action::EndCall },
    }
}

/// Check whether an LLM-derived intent carries a "no" signal beyond
/// `IntentKind::No` — bare keyword negation from a degraded/unclear
/// classification still counts (§4.9: "Intent.is_no OR keyword-no").
pub fn keyword_no(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["non", "no", "pas du tout"].iter().any(|kw| lowered.trim() == *kw || lowered.starts_with(&format!("{kw} ")))
}

pub fn clarification_cap_exceeded(ctx: &Context) -> bool {
    ctx.clarification_attempts > CLARIFICATION_CAP
}

pub fn confirmation_cap_exceeded(ctx: &Context) -> bool {
    ctx.confirmation_attempts > CONFIRMATION_CAP
}

/// Timestamp marker helper for call.rs's `LastUserSpeechAt` bookkeeping;
/// kept here since it's part of the same turn-taking contract as the FSM.
pub fn mark_speech(now: Instant) -> Instant {
    now
}
