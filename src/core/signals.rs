//! Termination-signal handling.
//!
//! The common termination signals flush the analysis (report and deadlock
//! history) and exit with status 0 instead of the default disposition, so a
//! monitored program killed mid-run still leaves a usable history behind.

use crate::core::context::Engine;
use anyhow::{Result, bail};
use std::sync::{Arc, OnceLock};

static SIGNAL_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

const SIGNALS: &[libc::c_int] = &[libc::SIGINT, libc::SIGQUIT, libc::SIGHUP, libc::SIGTERM];

extern "C" fn handle_signal(signal: libc::c_int) {
    eprintln!("locksentry: received signal {signal}, generating report");
    if let Some(engine) = SIGNAL_ENGINE.get() {
        let _ = engine.finalize();
    }
    std::process::exit(0);
}

/// Install the handlers for all termination signals.
pub fn install(engine: Arc<Engine>) -> Result<()> {
    let _ = SIGNAL_ENGINE.set(engine);
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_RESTART | libc::SA_NODEFER;
        action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for &signal in SIGNALS {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                bail!("failed to install handler for signal {signal}");
            }
        }
    }
    Ok(())
}
