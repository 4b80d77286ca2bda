pub mod poll_scheduler;
#[cfg(feature = "api")]
pub mod api_service;

pub use poll_scheduler::{PollScheduler, SchedulerHandle, SchedulerState, TickReport};
#[cfg(feature = "api")]
pub use api_service::{ApiService, ApiServiceState};
