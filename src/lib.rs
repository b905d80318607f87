//! # Locksentry
//!
//! Runtime deadlock detection and history-driven prevention for
//! multithreaded programs.
//!
//! Locksentry observes every acquisition and release of its tracked mutexes
//! and every tracked thread's lifecycle, and works in two stages:
//!
//! - **Detection.** Each thread records, for every lock it acquires while
//!   holding others, a *dependency*: "lock X acquired while holding the
//!   ordered set S". At finalization the per-thread stores are merged and
//!   searched for chains of dependencies from distinct threads that close
//!   into a cycle: a potential deadlock, found no matter how the run was
//!   actually scheduled. An optional monitor thread runs the same search
//!   against the live holding state and fail-stops the process on a
//!   confirmed deadlock.
//! - **Prevention.** Confirmed cycles are persisted, keyed by the call
//!   stacks of the participating locks' initialization sites. On the next
//!   run, a new mutex whose init site matches the history is transparently
//!   backed by its merge set's shared lock, so the conflicting orderings
//!   collapse onto one lock and the deadlock cannot recur.
//!
//! ## Usage
//!
//! ```no_run
//! use locksentry::{Locksentry, Mutex};
//!
//! Locksentry::new()
//!     .with_live_detection()
//!     .start()
//!     .expect("failed to start locksentry");
//!
//! let mutex = Mutex::new(0);
//! *mutex.lock() += 1;
//!
//! // At the end of the run, analyze everything that was recorded.
//! if let Some(analysis) = locksentry::finalize() {
//!     for cycle in &analysis.cycles {
//!         eprintln!("potential deadlock over locks {:?}", cycle.locks);
//!     }
//! }
//! ```

mod core;

pub use crate::core::analyzer::{Analysis, CycleReport};
pub use crate::core::locks::{Condvar, Mutex, MutexGuard};
pub use crate::core::prevention::history;
pub use crate::core::thread;
pub use crate::core::types::{DeadlockInfo, LockId, ThreadIndex};

use crate::core::context::{DeadlockCallback, Engine, EngineConfig};
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Locksentry configuration builder.
pub struct Locksentry {
    history_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    #[cfg(feature = "report-file")]
    report_path: Option<PathBuf>,
    live_detection: bool,
    callback: DeadlockCallback,
}

impl Default for Locksentry {
    fn default() -> Self {
        Self::new()
    }
}

impl Locksentry {
    /// Create a new builder with default settings.
    ///
    /// By default:
    /// - prevention is disabled (no history file)
    /// - live detection is disabled
    /// - the deadlock callback reports the cycle and exits with status 0
    pub fn new() -> Self {
        Locksentry {
            history_path: None,
            log_path: None,
            #[cfg(feature = "report-file")]
            report_path: None,
            live_detection: false,
            callback: Box::new(|info: DeadlockInfo| {
                eprintln!(
                    "Deadlock detected: {}",
                    serde_json::to_string_pretty(&info)
                        .unwrap_or_else(|_| format!("{info:?}"))
                );
                std::process::exit(0);
            }),
        }
    }

    /// Enable prevention with an explicit history file.
    ///
    /// The file is read at startup (an absent or malformed file just leaves
    /// prevention disabled) and rewritten at finalization.
    pub fn with_history<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.history_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enable prevention with the conventional per-executable history file,
    /// `<executable>_deadlock.info`.
    pub fn with_default_history(self) -> Self {
        match default_history_path() {
            Some(path) => self.with_history(path),
            None => self,
        }
    }

    /// Write a JSON-lines dump of all recorded dependencies at finalization.
    pub fn with_log<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.log_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Write a human-readable cycle report at finalization.
    #[cfg(feature = "report-file")]
    pub fn with_report<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.report_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Run the background monitor that samples the live holding state and
    /// fail-stops the process on a confirmed deadlock.
    pub fn with_live_detection(mut self) -> Self {
        self.live_detection = true;
        self
    }

    /// Replace the deadlock callback invoked on a confirmed live deadlock.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeadlockInfo) + Send + Sync + 'static,
    {
        self.callback = Box::new(callback);
        self
    }

    /// Install the engine and register the calling thread.
    ///
    /// # Errors
    /// Fails if locksentry was already started or the signal handlers cannot
    /// be installed.
    pub fn start(self) -> Result<()> {
        Engine::start(EngineConfig {
            history_path: self.history_path,
            log_path: self.log_path,
            #[cfg(feature = "report-file")]
            report_path: self.report_path,
            live_detection: self.live_detection,
            callback: self.callback,
        })?;
        Ok(())
    }
}

/// Run the offline analysis: aggregate all per-thread dependency stores,
/// detect lock-order cycles, write the configured outputs and, in
/// prevention mode, rewrite the deadlock history.
///
/// Returns `None` if locksentry was never started or was already finalized.
pub fn finalize() -> Option<Analysis> {
    Engine::installed().and_then(|engine| engine.finalize())
}

/// The conventional history file location for the current executable.
pub fn default_history_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let mut name = exe.file_name()?.to_os_string();
    name.push("_deadlock.info");
    Some(exe.with_file_name(name))
}
