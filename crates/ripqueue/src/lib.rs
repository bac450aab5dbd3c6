pub mod cache;
pub mod engine;
pub mod error;
pub mod job;
pub mod runner;
pub mod settings;
pub mod store;
pub mod worker;

pub use engine::{EncodingEngine, EngineConfig, NotificationEvent};
pub use error::{EngineError, Result, RipqueueError, RunnerError, SettingsError, StoreError};
pub use job::{HistoryEntry, Job, JobDescriptor, JobPhase, JobStatus, Progress};
pub use runner::{CommandBuilder, HandBrakeCommand, Invocation, ProcessRunner, ProgressSink};
pub use settings::{load_settings, save_settings, NotificationSettings, Settings};
pub use store::{EncodeRecord, MetadataStore, StoreChange, StoreEvent};
