//! Scheduling: the cron trigger, crash recovery, the job service and the
//! engine that drives them.

mod engine;
mod handle;
mod recovery;
mod service;
mod trigger;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use recovery::RecoverySweep;
pub use service::{JobService, SubmitReceipt};
pub use trigger::CronTrigger;
pub use types::{SchedulerError, SchedulerState};
