//! Reference event model for spans and workflow steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SpanStart,
    SpanEnd,
    StepStart,
    StepEnd,
    Custom,
}

impl EventKind {
    pub fn is_start(&self) -> bool {
        matches!(self, EventKind::SpanStart | EventKind::StepStart)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, EventKind::SpanEnd | EventKind::StepEnd)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub kind: EventKind,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl TelemetryEvent {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            kind,
            name: name.into(),
            timestamp: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The matching end event, sharing id and parent with this start event
    pub fn end(&self) -> Option<Self> {
        let kind = match self.kind {
            EventKind::SpanStart => EventKind::SpanEnd,
            EventKind::StepStart => EventKind::StepEnd,
            _ => return None,
        };

        Some(Self {
            id: self.id,
            parent_id: self.parent_id,
            kind,
            name: self.name.clone(),
            timestamp: Utc::now(),
            attributes: BTreeMap::new(),
        })
    }

    /// Time since the given start event, if it is the start of this one
    pub fn duration_since(&self, start: &TelemetryEvent) -> Option<chrono::Duration> {
        if start.id != self.id || !start.kind.is_start() || !self.kind.is_end() {
            return None;
        }
        Some(self.timestamp - start.timestamp)
    }
}
