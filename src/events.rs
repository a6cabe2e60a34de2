//! Status channel for the operator: every processing step reports what it did here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

pub trait EventSink {
    fn emit(&mut self, event: StatusEvent);

    fn info(&mut self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.emit(StatusEvent { level: Level::Info, message: message.into(), count: None });
    }

    fn success(&mut self, message: impl Into<String>, count: Option<usize>)
    where
        Self: Sized,
    {
        self.emit(StatusEvent { level: Level::Success, message: message.into(), count });
    }

    fn warning(&mut self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.emit(StatusEvent { level: Level::Warning, message: message.into(), count: None });
    }

    fn error(&mut self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.emit(StatusEvent { level: Level::Error, message: message.into(), count: None });
    }
}

/// Ordered in-memory log; also mirrors each event to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<StatusEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[StatusEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<StatusEvent> {
        self.events
    }

    pub fn has_errors(&self) -> bool {
        self.events.iter().any(|e| e.level == Level::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &StatusEvent> {
        self.events.iter().filter(|e| e.level == Level::Warning)
    }
}

impl EventSink for EventLog {
    fn emit(&mut self, event: StatusEvent) {
        match event.level {
            Level::Info => tracing::info!(count = ?event.count, "{}", event.message),
            Level::Success => tracing::info!(count = ?event.count, "ok: {}", event.message),
            Level::Warning => tracing::warn!(count = ?event.count, "{}", event.message),
            Level::Error => tracing::error!(count = ?event.count, "{}", event.message),
        }
        self.events.push(event);
    }
}
