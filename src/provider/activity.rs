use serde_json::Value;
use std::time::{Duration, Instant};

const SALIENT_KEYS: &[&str] = &["file_path", "command", "pattern", "query"];
const MAX_ARGUMENT_CHARS: usize = 80;

/// Short human description of a tool call, e.g. `Bash: cargo test`.
pub fn describe_tool(name: &str, input: &Value) -> String {
    let argument = SALIENT_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match argument {
        Some(argument) => format!("{name}: {}", truncate_chars(argument, MAX_ARGUMENT_CHARS)),
        None => name.to_string(),
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    let first_line = value.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max && first_line.len() == value.len() {
        return value.to_string();
    }
    let mut out = first_line.chars().take(max).collect::<String>();
    out.push_str("...");
    out
}

/// Rate limiter for activity notifications.
#[derive(Debug, Clone)]
pub struct ActivityThrottle {
    min_interval: Duration,
    last_emitted: Option<Instant>,
}

impl ActivityThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emitted: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emitted {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emitted = Some(now);
                true
            }
        }
    }
}
