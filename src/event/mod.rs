//! Reactor building blocks: readiness multiplexing, timers, and cross-thread
//! wakeups.

mod notify;
mod poller;
mod timer;

pub use self::notify::Notifier;
pub use self::poller::{EventCallback, EventPoller, Interest};
pub use self::timer::{Timer, TimerId, TimerJob, TimerQueue};
