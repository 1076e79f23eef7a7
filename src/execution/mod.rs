pub mod dispatcher;
pub mod retry;

pub use dispatcher::{DispatchTicket, Dispatcher, HttpJobRunner, RequestReason};
pub use retry::RetryPolicy;
