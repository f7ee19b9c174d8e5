//! Signal trampoline.
//!
//! The handler only records the signal number; the interpreter observes it
//! on the next dispatch and raises *caught-signal*, so no interpreter state
//! is ever touched from handler context.

use std::sync::atomic::{AtomicI32, Ordering};

static SIGVAL: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
pub const SIGINT: i32 = libc::SIGINT;
#[cfg(unix)]
pub const SIGSEGV: i32 = libc::SIGSEGV;
#[cfg(not(unix))]
pub const SIGINT: i32 = 2;
#[cfg(not(unix))]
pub const SIGSEGV: i32 = 11;

#[cfg(unix)]
extern "C" fn sig_hdlr(sig: libc::c_int) {
    SIGVAL.store(sig, Ordering::SeqCst);
}

/// Install handlers for the signals the interpreter recovers from.
#[cfg(unix)]
pub fn install() {
    let handler: extern "C" fn(libc::c_int) = sig_hdlr;
    unsafe {
        for sig in &[
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGHUP,
            libc::SIGBUS,
            libc::SIGSEGV,
            libc::SIGFPE,
        ] {
            libc::signal(*sig, handler as libc::sighandler_t);
        }
    }
}

#[cfg(not(unix))]
pub fn install() {}

/// Re-arm a single handler after delivery.
#[cfg(unix)]
pub fn reinstall(sig: i32) {
    let handler: extern "C" fn(libc::c_int) = sig_hdlr;
    unsafe {
        libc::signal(sig, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub fn reinstall(_sig: i32) {}

/// Take the pending signal number, zero if none.
pub fn take() -> i32 {
    SIGVAL.swap(0, Ordering::SeqCst)
}
