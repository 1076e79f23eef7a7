pub mod conflict;
pub mod observer;
pub mod pusher;

pub use conflict::ConflictChecker;
pub use observer::FeedObserver;
pub use pusher::PricePusher;
