pub mod scheduler;

pub use scheduler::{ReconciliationScheduler, ScheduleConfig};
