//! Process signal handling inside a worker.
//!
//! Fatal signals get a last-resort handler that writes one fixed line to
//! stderr and exits without unwinding. SIGTERM and SIGINT only raise a
//! [`StopFlag`] that the dispatch loop checks between commands.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

const FATAL_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
];

const FATAL_PREFIX: &[u8] = b"ioworker: fatal signal ";

/// Cooperative stop request shared with the dispatch loop.
#[derive(Clone)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Raise `flag` on SIGTERM or SIGINT.
pub fn install_stop_handlers(flag: StopFlag) -> io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => tracing::info!("SIGTERM received"),
            _ = int.recv() => tracing::info!("SIGINT received"),
        }
        flag.request();
    });
    Ok(())
}

/// Install the fatal-signal handler for SIGSEGV, SIGILL, SIGABRT, SIGBUS and
/// SIGFPE.
pub fn install_fatal_handlers() -> io::Result<()> {
    for sig in FATAL_SIGNALS {
        // SAFETY: the handler only touches a stack buffer and calls
        // async-signal-safe functions (write, _exit).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = fatal_handler as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Write `prefix` followed by the decimal signal number and a newline into
/// `buf`. Returns the number of bytes used.
fn format_fatal_line(sig: libc::c_int, buf: &mut [u8; 64]) -> usize {
    let mut len = 0;
    for &b in FATAL_PREFIX {
        buf[len] = b;
        len += 1;
    }

    let mut digits = [0u8; 12];
    let mut n = sig.unsigned_abs();
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    while count > 0 {
        count -= 1;
        buf[len] = digits[count];
        len += 1;
    }

    buf[len] = b'\n';
    len + 1
}

extern "C" fn fatal_handler(sig: libc::c_int) {
    let mut buf = [0u8; 64];
    let len = format_fatal_line(sig, &mut buf);
    // SAFETY: write(2) and _exit(2) are async-signal-safe.
    unsafe {
        libc::write(2, buf.as_ptr() as *const libc::c_void, len);
        libc::_exit(1);
    }
}
