use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use crate::shared::time::now_secs;

pub const POLL_LOOP_ID: &str = "poll";
pub const JANITOR_LOOP_ID: &str = "janitor";

const STOP_CHECK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum LoopEvent {
    Started {
        loop_id: String,
        at: i64,
    },
    Heartbeat {
        loop_id: String,
        at: i64,
    },
    Error {
        loop_id: String,
        at: i64,
        message: String,
    },
    Panicked {
        loop_id: String,
        at: i64,
        message: String,
    },
    Stopped {
        loop_id: String,
        at: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopHealth {
    pub state: LoopState,
    pub last_heartbeat: Option<i64>,
    pub last_error: Option<String>,
}

impl Default for LoopHealth {
    fn default() -> Self {
        Self {
            state: LoopState::Stopped,
            last_heartbeat: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopLog {
    pub level: &'static str,
    pub event: &'static str,
    pub message: String,
}

/// Folds one loop event into the health table. Returns the log line the
/// supervisor should write, if any.
pub fn apply_loop_event(
    loops: &mut BTreeMap<String, LoopHealth>,
    active: &mut BTreeSet<String>,
    event: LoopEvent,
) -> Option<LoopLog> {
    match event {
        LoopEvent::Started { loop_id, at } => {
            let entry = loops.entry(loop_id.clone()).or_default();
            entry.state = LoopState::Running;
            entry.last_heartbeat = Some(at);
            entry.last_error = None;
            Some(LoopLog {
                level: "info",
                event: "loop.started",
                message: format!("loop={loop_id}"),
            })
        }
        LoopEvent::Heartbeat { loop_id, at } => {
            let entry = loops.entry(loop_id).or_default();
            entry.state = LoopState::Running;
            entry.last_heartbeat = Some(at);
            None
        }
        LoopEvent::Error {
            loop_id,
            at,
            message,
        } => {
            let entry = loops.entry(loop_id.clone()).or_default();
            entry.state = LoopState::Error;
            entry.last_heartbeat = Some(at);
            entry.last_error = Some(message.clone());
            Some(LoopLog {
                level: "warn",
                event: "loop.error",
                message: format!("loop={loop_id} error={message}"),
            })
        }
        LoopEvent::Panicked {
            loop_id,
            at,
            message,
        } => {
            let entry = loops.entry(loop_id.clone()).or_default();
            entry.state = LoopState::Error;
            entry.last_heartbeat = Some(at);
            entry.last_error = Some(format!("panicked: {message}"));
            Some(LoopLog {
                level: "error",
                event: "loop.panicked",
                message: format!("loop={loop_id} panic={message}"),
            })
        }
        LoopEvent::Stopped { loop_id, at } => {
            let entry = loops.entry(loop_id.clone()).or_default();
            entry.state = LoopState::Stopped;
            entry.last_heartbeat = Some(at);
            active.remove(&loop_id);
            Some(LoopLog {
                level: "info",
                event: "loop.stopped",
                message: format!("loop={loop_id}"),
            })
        }
    }
}

/// Returns `false` if `stop` was raised before `total` elapsed.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(STOP_CHECK);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}

/// Runs `tick` every `interval` until `stop` is raised. A tick that returns
/// `Err` is reported and the loop carries on. A panicking tick raises `stop`
/// and ends the loop.
pub(crate) fn run_periodic<F>(
    loop_id: &str,
    interval: Duration,
    stop: &AtomicBool,
    events: &Sender<LoopEvent>,
    mut tick: F,
) where
    F: FnMut() -> Result<(), String>,
{
    let _ = events.send(LoopEvent::Started {
        loop_id: loop_id.to_string(),
        at: now_secs(),
    });
    while !stop.load(Ordering::Relaxed) {
        let event = match panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
            Ok(Ok(())) => LoopEvent::Heartbeat {
                loop_id: loop_id.to_string(),
                at: now_secs(),
            },
            Ok(Err(message)) => LoopEvent::Error {
                loop_id: loop_id.to_string(),
                at: now_secs(),
                message,
            },
            Err(payload) => {
                stop.store(true, Ordering::Relaxed);
                let _ = events.send(LoopEvent::Panicked {
                    loop_id: loop_id.to_string(),
                    at: now_secs(),
                    message: panic_message(payload.as_ref()),
                });
                break;
            }
        };
        let _ = events.send(event);
        if !sleep_with_stop(stop, interval) {
            break;
        }
    }
    let _ = events.send(LoopEvent::Stopped {
        loop_id: loop_id.to_string(),
        at: now_secs(),
    });
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn events_drive_health_transitions() {
        let mut loops = BTreeMap::new();
        let mut active = BTreeSet::from([POLL_LOOP_ID.to_string()]);

        apply_loop_event(
            &mut loops,
            &mut active,
            LoopEvent::Started {
                loop_id: POLL_LOOP_ID.to_string(),
                at: 1,
            },
        );
        assert_eq!(loops[POLL_LOOP_ID].state, LoopState::Running);

        let log = apply_loop_event(
            &mut loops,
            &mut active,
            LoopEvent::Error {
                loop_id: POLL_LOOP_ID.to_string(),
                at: 2,
                message: "fetch failed".to_string(),
            },
        )
        .expect("error is logged");
        assert_eq!(log.level, "warn");
        assert_eq!(loops[POLL_LOOP_ID].last_error.as_deref(), Some("fetch failed"));

        apply_loop_event(
            &mut loops,
            &mut active,
            LoopEvent::Stopped {
                loop_id: POLL_LOOP_ID.to_string(),
                at: 3,
            },
        );
        assert_eq!(loops[POLL_LOOP_ID].state, LoopState::Stopped);
        assert!(active.is_empty());
    }

    #[test]
    fn periodic_loop_survives_failing_ticks() {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();
        let mut calls = 0;
        run_periodic("t", Duration::ZERO, &stop, &tx, || {
            calls += 1;
            match calls {
                1 | 2 => Err(format!("tick {calls} failed")),
                _ => {
                    stop.store(true, Ordering::Relaxed);
                    Ok(())
                }
            }
        });
        drop(tx);

        let events = rx.iter().collect::<Vec<_>>();
        assert!(matches!(events.first(), Some(LoopEvent::Started { .. })));
        assert!(matches!(events.last(), Some(LoopEvent::Stopped { .. })));
        let errors = events
            .iter()
            .filter(|event| matches!(event, LoopEvent::Error { .. }))
            .count();
        assert_eq!(errors, 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn panicking_tick_raises_stop_and_ends_the_loop() {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();
        let mut calls = 0;
        run_periodic("t", Duration::ZERO, &stop, &tx, || {
            calls += 1;
            if calls == 2 {
                panic!("tick exploded");
            }
            Ok(())
        });
        drop(tx);

        assert!(stop.load(Ordering::Relaxed));
        assert_eq!(calls, 2);
        let events = rx.iter().collect::<Vec<_>>();
        let panicked = events.iter().find_map(|event| match event {
            LoopEvent::Panicked { message, .. } => Some(message.clone()),
            _ => None,
        });
        assert_eq!(panicked.as_deref(), Some("tick exploded"));
        assert!(matches!(events.last(), Some(LoopEvent::Stopped { .. })));

        let mut loops = BTreeMap::new();
        let mut active = BTreeSet::from(["t".to_string()]);
        for event in events {
            apply_loop_event(&mut loops, &mut active, event);
        }
        assert_eq!(
            loops["t"].last_error.as_deref(),
            Some("panicked: tick exploded")
        );
        assert!(active.is_empty());
    }

    #[test]
    fn sleep_with_stop_returns_early_when_stopped() {
        let stop = AtomicBool::new(true);
        assert!(!sleep_with_stop(&stop, Duration::from_secs(5)));
    }
}
