use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_KEY_LEN: usize = 10;
const MAX_PREVIEW_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetryEventType {
    Keystroke,
    MouseMove,
    MouseClick,
    MouseScroll,
    CodeInsert,
    CodeDelete,
    CodePaste,
}

impl TelemetryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryEventType::Keystroke => "keystroke",
            TelemetryEventType::MouseMove => "mouse-move",
            TelemetryEventType::MouseClick => "mouse-click",
            TelemetryEventType::MouseScroll => "mouse-scroll",
            TelemetryEventType::CodeInsert => "code-insert",
            TelemetryEventType::CodeDelete => "code-delete",
            TelemetryEventType::CodePaste => "code-paste",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventMetadata {
    Key {
        key: String,
        ctrl: bool,
        alt: bool,
        shift: bool,
        meta: bool,
    },
    Click {
        x: f64,
        y: f64,
        button: u8,
    },
    Pointer {
        x: f64,
        y: f64,
    },
    Scroll {
        scroll_x: f64,
        scroll_y: f64,
    },
    CodeEdit {
        position: usize,
        length: usize,
        preview: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub event_type: TelemetryEventType,
    pub question_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: EventMetadata,
}

/// Body of `POST /attempts/{attemptId}/audit-events`
#[derive(Debug, Serialize)]
pub struct AuditEventsRequest<'a> {
    pub events: &'a [TelemetryEvent],
}

/// What kind of field had focus when a key went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputTarget {
    Text,
    Password,
    CodeEditor,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        ctrl: false,
        alt: false,
        shift: false,
        meta: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeEditKind {
    Insert,
    Delete,
    Paste,
}

impl CodeEditKind {
    pub fn event_type(&self) -> TelemetryEventType {
        match self {
            CodeEditKind::Insert => TelemetryEventType::CodeInsert,
            CodeEditKind::Delete => TelemetryEventType::CodeDelete,
            CodeEditKind::Paste => TelemetryEventType::CodePaste,
        }
    }
}

/// Structured edit operation reported by the editor integration
#[derive(Debug, Clone)]
pub struct CodeEdit {
    pub kind: CodeEditKind,
    pub position: usize,
    pub length: usize,
    pub content: String,
}

/// Single visible characters are kept as-is; named keys ("ArrowLeft",
/// "Backspace") are cut to 10 characters.
pub fn sanitize_key(key: &str) -> String {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_control() => key.to_string(),
        _ => key.chars().take(MAX_KEY_LEN).collect(),
    }
}

pub fn content_preview(content: &str) -> String {
    content.chars().take(MAX_PREVIEW_LEN).collect()
}
