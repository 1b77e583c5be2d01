#![deny(clippy::unwrap_used)]

use ccx_shared::RunRequestData;
use uuid::Uuid;

// Correlates every log line belonging to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: callers only need enough to grep logs, not a full UUID.
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug)]
pub struct LogEvent {
    pub info: LogEventInfo,
    pub time: std::time::Instant,
    pub trace_id: TraceId,
}

#[derive(Debug)]
pub enum LogEventInfo {
    TaskStart { request: RunRequestData },
    StateTransition { from: String, to: String },
    Retry { phase: String, attempt: u32 },
    TaskEnd { success: bool },
}

pub fn log(info: LogEventInfo, trace_id: TraceId) {
    let event = LogEvent {
        info,
        time: std::time::Instant::now(),
        trace_id,
    };
    log::info!("[{}] {:?}", event.trace_id, event.info);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_short_and_distinct() {
        let a = TraceId::new();
        let b = TraceId::new();
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string().len(), 8);
    }
}
