//! Sweep execution: selection, approval, queueing, and a bounded worker pool
//! whose cancellation reaches every spawned script.

pub mod cancel;
pub mod confirm;
pub mod manifest;
pub mod query;
pub mod scheduler;
pub mod signals;
pub mod worker;

pub use cancel::CancellationToken;
pub use confirm::{AutoApprove, Confirm, ConfirmRequest, Decline, StdinPrompt};
pub use manifest::RunManifest;
pub use query::{query_status, render_histogram};
pub use scheduler::{
    Coordinator, NoProgress, Progress, SweepOutcome, SweepPlan, SweepReport,
    SweepRequest, SweepTally,
};
pub use signals::SignalAdapter;
pub use worker::{execute, Job, RfOutcome, WorkerReport};
