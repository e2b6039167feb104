//! Ctrl-C handling
//!
//! Scripts run in their own process groups, so a terminal interrupt only
//! reaches keel. The first SIGINT/SIGTERM cancels the run through its
//! [`CancelToken`]; the default disposition is then restored so a second
//! interrupt terminates immediately.

use std::time::Duration;
use workflow::CancelToken;

#[cfg(unix)]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_signal: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    pub fn install() {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }

    pub fn restore_default() {
        // SAFETY: resetting to SIG_DFL has no preconditions.
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
        }
    }

    pub fn interrupted() -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}

#[cfg(not(unix))]
mod imp {
    pub fn install() {}
    pub fn restore_default() {}
    pub fn interrupted() -> bool {
        false
    }
}

/// Cancel `token` when the process is interrupted
pub fn cancel_on_interrupt(token: &CancelToken) {
    imp::install();
    let token = token.clone();
    let spawned = std::thread::Builder::new()
        .name("keel-signal".to_string())
        .spawn(move || {
            while !imp::interrupted() {
                if token.is_cancelled() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            crate::ui::warn("Interrupted, stopping running scripts (press Ctrl-C again to force)");
            token.cancel();
            imp::restore_default();
        });
    if let Err(e) = spawned {
        log::warn!("Could not start signal watcher: {e}");
        imp::restore_default();
    }
}
