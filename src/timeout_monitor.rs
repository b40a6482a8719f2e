//! Clock/timeout monitor (C12).
//!
//! Ticks once per second for the life of a call, grounded on the
//! bridge's `stats::stats_reporter` interval-loop shape. Emits a
//! [`TimeoutEvent`] on an mpsc channel whenever `call.rs`'s timeout
//! monitor activity should act; it never touches call state directly.

use crate::dialog::DialogState;
use std::time::{ Duration, Instant };
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// "Are you still there?" — reset the silence timer after this fires.
    SilenceWarning,
    /// Silence exceeded the hangup threshold — play `goodbye`, end call.
    SilenceHangup,
    /// Call exceeded its maximum duration — play `goodbye`, end call.
    MaxDuration,
}

pub struct TimeoutMonitorConfig {
    pub warn_after: Duration,
    pub hangup_after: Duration,
    pub max_call_duration: Duration,
}

/// Shared snapshot the monitor reads each tick; `call.rs` updates these
/// fields as the call progresses (last speech time, bot-speaking flag,
/// current state).
pub struct MonitorInputs {
    pub last_user_speech_at: std::sync::Arc<std::sync::Mutex<Instant>>,
    pub is_speaking: std::sync::Arc<std::sync::atomic::AtomicBool>,
    pub state: std::sync::Arc<std::sync::Mutex<DialogState>>,
    pub started_at: Instant,
}

/// Spawn the per-call one-second tick loop. Returns a handle and the
/// receiver side of the event channel; dropping/aborting the handle
/// stops the monitor at call teardown.
pub fn spawn(cfg: TimeoutMonitorConfig, inputs: MonitorInputs) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<TimeoutEvent>) {
    let (tx, rx) = mpsc::channel(8);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let now = Instant::now();

            if now.duration_since(inputs.started_at) > cfg.max_call_duration {
                let _ = tx.send(TimeoutEvent::MaxDuration).await;
                break;
            }

            let state = *inputs.state.lock().unwrap();
            if matches!(state, DialogState::Init | DialogState::Goodbye) {
                continue;
            }
            if inputs.is_speaking.load(std::sync::atomic::Ordering::Relaxed) {
                continue;
            }

            let last_speech = *inputs.last_user_speech_at.lock().unwrap();
            let silence = now.duration_since(last_speech);

            if silence > cfg.hangup_after {
                let _ = tx.send(TimeoutEvent::SilenceHangup).await;
                break;
            }
            if silence > cfg.warn_after {
                *inputs.last_user_speech_at.lock().unwrap() = now;
                if tx.send(TimeoutEvent::SilenceWarning).await.is_err() {
                    break;
                }
            }
        }
    });

    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{ Arc, Mutex };

    fn inputs(last_speech: Instant, started_at: Instant, state: DialogState) -> MonitorInputs {
        MonitorInputs {
            last_user_speech_at: Arc::new(Mutex::new(last_speech)),
            is_speaking: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(state)),
            started_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_warning_fires_after_threshold() {
        let now = Instant::now();
        let cfg = TimeoutMonitorConfig {
            warn_after: Duration::from_secs(2),
            hangup_after: Duration::from_secs(100),
            max_call_duration: Duration::from_secs(10_000),
        };
        let (_handle, mut rx) = spawn(cfg, inputs(now, now, DialogState::Diagnostic));

        tokio::time::advance(Duration::from_secs(3)).await;
        let event = rx.recv().await;
        assert_eq!(event, Some(TimeoutEvent::SilenceWarning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_fires_after_threshold() {
        let now = Instant::now();
        let cfg = TimeoutMonitorConfig {
            warn_after: Duration::from_secs(1),
            hangup_after: Duration::from_secs(3),
            max_call_duration: Duration::from_secs(10_000),
        };
        let (_handle, mut rx) = spawn(cfg, inputs(now, now, DialogState::Diagnostic));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(TimeoutEvent::SilenceWarning));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(rx.recv().await, Some(TimeoutEvent::SilenceHangup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_fires_regardless_of_speech() {
        let now = Instant::now();
        let cfg = TimeoutMonitorConfig {
            warn_after: Duration::from_secs(1000),
            hangup_after: Duration::from_secs(1000),
            max_call_duration: Duration::from_secs(5),
        };
        let (_handle, mut rx) = spawn(cfg, inputs(now, now, DialogState::Diagnostic));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(TimeoutEvent::MaxDuration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_state_never_warns() {
        let now = Instant::now();
        let cfg = TimeoutMonitorConfig {
            warn_after: Duration::from_secs(1),
            hangup_after: Duration::from_secs(2),
            max_call_duration: Duration::from_secs(10_000),
        };
        let (handle, mut rx) = spawn(cfg, inputs(now, now, DialogState::Init));

        tokio::time::advance(Duration::from_secs(3)).await;
        handle.abort();
        assert!(rx.try_recv().is_err(), "INIT state must never trigger a silence event");
    }
}
