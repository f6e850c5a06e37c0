// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local terminal plumbing for the default session.
//!
//! The agent holds the user's terminal: raw mode on its own stdin/stdout,
//! keystrokes forwarded to the main shell, Ctrl+\ reserved for graceful
//! shutdown.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::termios;
use tokio::sync::mpsc;

/// Shutdown key: Ctrl+\ (ASCII 0x1c).
pub const SHUTDOWN_KEY: u8 = 0x1c;

/// RAII guard that restores the original terminal attributes on drop.
///
/// Stores a raw fd (stdin) and the original termios state. The fd is valid
/// for the lifetime of the process (stdin never closes), so this is safe.
pub struct RawModeGuard {
    fd: i32,
    original: termios::Termios,
}

impl RawModeGuard {
    /// Put stdin into raw mode. Fails when stdin is not a terminal.
    pub fn enter() -> anyhow::Result<Self> {
        let fd = std::io::stdin().as_raw_fd();
        let borrowed = borrow_fd(fd);
        let original = termios::tcgetattr(borrowed)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &raw)?;
        Ok(Self { fd, original })
    }

    /// Install a panic hook that restores the terminal even on unwind.
    pub fn install_panic_restore(&self) {
        let restored = Arc::new(AtomicBool::new(false));
        let raw_termios: nix::libc::termios = self.original.clone().into();
        let fd = self.fd;
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !restored.swap(true, Ordering::SeqCst) {
                // SAFETY: Restoring terminal attributes in panic hook; fd is
                // stdin which remains valid for the lifetime of the process.
                #[allow(unsafe_code)]
                unsafe {
                    nix::libc::tcsetattr(fd, nix::libc::TCSAFLUSH, &raw_termios);
                }
            }
            prev_hook(info);
        }));
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let borrowed = borrow_fd(self.fd);
        let _ = termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &self.original);
    }
}

/// Create a `BorrowedFd` from a raw fd that we know is valid.
fn borrow_fd(fd: i32) -> BorrowedFd<'static> {
    // SAFETY: stdin fd 0 is valid for the lifetime of the process.
    #[allow(unsafe_code)]
    unsafe {
        BorrowedFd::borrow_raw(fd)
    }
}

/// Current local terminal size as (cols, rows).
pub fn terminal_size() -> Option<(u16, u16)> {
    let fd = std::io::stdout().as_raw_fd();
    let mut ws = nix::libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
    // SAFETY: TIOCGWINSZ ioctl reads terminal size into a winsize struct.
    // The fd is stdout which is valid, and ws is a properly-initialized
    // stack variable with the correct layout for this ioctl.
    #[allow(unsafe_code)]
    let ret = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

/// Spawn a blocking thread reading raw bytes from stdin.
///
/// The channel closes on stdin EOF; a headless agent just keeps running on
/// its other inputs.
pub fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let stdin = std::io::stdin();
        let mut handle = stdin.lock();
        let mut buf = [0u8; 4096];
        loop {
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}
