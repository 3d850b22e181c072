//! SIGINT/SIGTERM hook that clears the accept-loop flag.

use std::io;
use std::sync::atomic::AtomicBool;

/// True while the proxy should keep accepting. The signal handler clears
/// it; the acceptor re-checks it after every accept return.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_signum: libc::c_int) {
    // Only async-signal-safe work here: a single atomic store.
    RUNNING.store(false, std::sync::atomic::Ordering::SeqCst);
}

/// Installs handlers for SIGINT and SIGTERM.
///
/// `sa_flags` deliberately omits `SA_RESTART` so a signal interrupts the
/// blocking `accept` with `EINTR` instead of silently restarting it; that
/// interruption is what lets the accept loop observe the cleared flag.
pub fn install() -> io::Result<()> {
    // SAFETY: the sigaction struct is zero-initialized and filled with a
    // valid handler pointer and an empty mask before use; the handler
    // itself only stores to an atomic.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = (handle_signal as extern "C" fn(libc::c_int)) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;

        for signum in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}
