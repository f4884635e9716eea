pub mod answer;
pub mod sync;
pub mod telemetry;

pub use answer::{AbandonedAnswer, AnswerRecord, SaveAnswerRequest};
pub use sync::{NetworkStatus, SkipReason, SyncOutcome, SyncReport, SyncState, SyncTrigger};
pub use telemetry::{
    CodeEdit, CodeEditKind, EventMetadata, InputTarget, Modifiers, TelemetryEvent,
    TelemetryEventType,
};
