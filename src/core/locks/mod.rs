pub mod condvar;
pub mod mutex;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
