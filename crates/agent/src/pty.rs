// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Native PTY sessions.
//!
//! Each session runs a login shell under a PTY spawned via `forkpty`. The
//! master fd is nonblocking and driven through `AsyncFd`. Writes are
//! serialized by a per-PTY lock so local keystrokes and viewer input cannot
//! shred each other's escape sequences.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

/// Newtype wrapper around `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
struct MasterFd(OwnedFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// One shell running under a PTY.
pub struct Pty {
    master: AsyncFd<MasterFd>,
    child: Pid,
    write_lock: Mutex<()>,
    cols: AtomicU16,
    rows: AtomicU16,
}

impl Pty {
    /// Spawn a login shell under a fresh PTY.
    ///
    /// The child runs `{shell} -l` with `TERM=xterm-256color`, chdir'd into
    /// `working_dir` when one is given.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn_shell(
        shell: &str,
        working_dir: Option<&Path>,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                if let Some(dir) = working_dir {
                    // A missing directory falls back to wherever the agent
                    // runs; the shell still comes up.
                    let _ = std::env::set_current_dir(dir);
                }
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("TETHER", "1");

                let argv: Vec<CString> = [shell, "-l"]
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid shell path")?;
                execvp(&argv[0], &argv).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let master = AsyncFd::new(MasterFd(master)).context("AsyncFd::new failed")?;
                Ok(Self {
                    master,
                    child,
                    write_lock: Mutex::new(()),
                    cols: AtomicU16::new(cols),
                    rows: AtomicU16::new(rows),
                })
            }
        }
    }

    /// Read the next output chunk. Returns 0 at end of stream; EIO from a
    /// closed slave side is normalized to 0.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            let result = guard.try_io(|inner| {
                nix::unistd::read(&inner.get_ref().0, buf).map_err(io_err)
            });
            match result {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write bytes to the shell, whole-envelope atomic under the per-PTY
    /// lock.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let _serialized = self.write_lock.lock().await;
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.master.writable().await?;
            let result = guard.try_io(|inner| {
                nix::unistd::write(&inner.get_ref().0, &data[offset..]).map_err(io_err)
            });
            match result {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Apply new geometry. Zero rows or cols are ignored, and resizing to
    /// the current size is a no-op.
    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<bool> {
        if cols == 0 || rows == 0 {
            return Ok(false);
        }
        if self.cols.load(Ordering::Relaxed) == cols && self.rows.load(Ordering::Relaxed) == rows {
            return Ok(false);
        }
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);

        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is properly
        // initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(true)
    }

    /// Current geometry as (cols, rows).
    pub fn geometry(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    pub fn child_pid(&self) -> i32 {
        self.child.as_raw()
    }

    /// Ask the shell to hang up. Escalates to SIGKILL shortly after.
    pub fn shutdown(&self) {
        let _ = kill(self.child, Signal::SIGHUP);
        let child = self.child;
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
        });
    }

    /// Block until the child exits; returns the wire exit code
    /// (128 + signal for signal deaths).
    pub async fn wait_exit(&self) -> anyhow::Result<i32> {
        let pid = self.child;
        tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")?
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        let _ = kill(self.child, Signal::SIGHUP);
        let _ = waitpid(self.child, Some(WaitPidFlag::WNOHANG));
    }
}

fn wait_for_exit(pid: Pid) -> anyhow::Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            // Already reaped (shutdown path won the race).
            Err(nix::errno::Errno::ECHILD) => return Ok(0),
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

/// Set the given file descriptor to non-blocking mode.
fn set_nonblocking(fd: &impl std::os::fd::AsFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
