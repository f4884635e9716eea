pub mod answer_queue;
pub mod api_client;
pub mod network_monitor;
pub mod session;
pub mod sync_scheduler;
pub mod telemetry_recorder;

pub use answer_queue::{DurableAnswerQueue, FileQueueStorage, MemoryQueueStorage, QueueStorage};
pub use api_client::{AttemptApi, HttpAttemptApi};
pub use network_monitor::{HealthProbe, NetworkMonitor};
pub use session::AttemptSession;
pub use sync_scheduler::SyncScheduler;
pub use telemetry_recorder::{FlushTrigger, TelemetryRecorder};
