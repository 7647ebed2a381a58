//! PTY/process primitive: fork a child program under a fresh
//! pseudo-terminal and keep the handles the master needs to supervise it.
//!
//! The child becomes a session leader with the PTY slave as its controlling
//! terminal, gets the slave on stdin/stdout/stderr, and `execvp`s the
//! requested program. If exec fails, the child reports the error on the
//! status fd (or the PTY itself when there is none) and exits 127 so the
//! failure can be surfaced by whoever launched the master.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{self, LocalFlags, SpecialCharacterIndices, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult, Pid};
use thiserror::Error;

use crate::channel::{read_fd, write_fd};
use crate::terminal::MOVE_TO_BOTTOM;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("child argv is empty")]
    ArgvEmpty,

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to read pty terminal attributes: {0}")]
    Termios(#[source] nix::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[source] nix::Error),
}

/// A live PTY with the child process running on its slave side.
pub struct ProcessPty {
    master: OwnedFd,
    child: Pid,
    /// Most recent termios read back from the PTY; refreshed after every
    /// output batch so redraw eligibility tracks the child's mode changes.
    term: Termios,
    /// Most recent window size pushed by any client.
    ws: libc::winsize,
}

impl ProcessPty {
    /// Fork `argv` under a fresh PTY.
    ///
    /// `initial_term`, when given, seeds the slave's terminal settings
    /// (typically the settings of the terminal the session was launched
    /// from). The window size is left zeroed; the first attacher pushes a
    /// real one. `status_fd` receives the child's diagnostic if `execvp`
    /// fails; it is expected to be close-on-exec so a successful exec
    /// closes it.
    pub fn spawn(
        argv: &[CString],
        initial_term: Option<&Termios>,
        status_fd: Option<RawFd>,
    ) -> Result<Self, PtyError> {
        if argv.is_empty() {
            return Err(PtyError::ArgvEmpty);
        }

        let pty = openpty(None, initial_term).map_err(PtyError::OpenPty)?;

        // Cache the slave termios before forking so the parent never has to
        // race the child's first mode change.
        let term = termios::tcgetattr(&pty.slave).map_err(PtyError::Termios)?;

        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Parent { child } => {
                drop(pty.slave);
                Ok(Self {
                    master: pty.master,
                    child,
                    term,
                    ws: zero_winsize(),
                })
            }
            ForkResult::Child => exec_child(pty.slave, pty.master, argv, status_fd),
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn child_pid(&self) -> Pid {
        self.child
    }

    /// Last-known slave termios.
    pub fn termios(&self) -> &Termios {
        &self.term
    }

    /// Last window size pushed by a client.
    pub fn winsize(&self) -> libc::winsize {
        self.ws
    }

    /// Read a batch of child output from the master side.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.master.as_raw_fd(), buf)
    }

    /// Write input bytes to the child. Best-effort: callers that can drop
    /// input (keyboard data) ignore the result.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        write_fd(self.master.as_raw_fd(), data)
    }

    /// Re-read the PTY's terminal settings into the cache.
    pub fn refresh_termios(&mut self) -> Result<(), PtyError> {
        self.term = termios::tcgetattr(&self.master).map_err(PtyError::Termios)?;
        Ok(())
    }

    /// Record and push a new window size onto the PTY. The ioctl result is
    /// ignored like any other best-effort terminal nudge.
    pub fn set_winsize(&mut self, ws: libc::winsize) {
        self.ws = ws;
        unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &self.ws,
            );
        }
    }

    /// True when the child looks like a full-screen program that will
    /// repaint on a form-feed: echo off, character-at-a-time reads.
    pub fn wants_ctrl_l_redraw(&self) -> bool {
        let lflags = self.term.local_flags;
        !lflags.intersects(LocalFlags::ECHO | LocalFlags::ICANON)
            && self.term.control_chars[SpecialCharacterIndices::VMIN as usize] == 1
    }

    /// Deliver `sig` to the PTY's foreground job, trying progressively
    /// blunter instruments: a master-side ioctl, the foreground process
    /// group, and finally the child's own process group.
    pub fn kill_foreground(&self, sig: Signal) {
        let fd = self.master.as_raw_fd();

        #[cfg(target_os = "linux")]
        {
            if unsafe { libc::ioctl(fd, libc::TIOCSIG as libc::c_ulong, sig as libc::c_int) } >= 0
            {
                return;
            }
        }

        let mut pgrp: libc::pid_t = -1;
        if unsafe { libc::ioctl(fd, libc::TIOCGPGRP as libc::c_ulong, &mut pgrp) } >= 0
            && pgrp != -1
            && kill(Pid::from_raw(-pgrp), sig).is_ok()
        {
            return;
        }

        let _ = kill(Pid::from_raw(-self.child.as_raw()), sig);
    }

    /// Reap the child if it has already exited.
    pub fn try_reap(&self) -> Option<WaitStatus> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => None,
            Ok(status) => Some(status),
        }
    }

    /// Block until the child exits and return its status.
    pub fn wait(&self) -> Result<WaitStatus, PtyError> {
        waitpid(self.child, None).map_err(PtyError::Wait)
    }
}

impl AsFd for ProcessPty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

fn zero_winsize() -> libc::winsize {
    libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Child half of [`ProcessPty::spawn`]. Never returns: either `execvp`
/// replaces the image or the child `_exit`s with 127.
fn exec_child(slave: OwnedFd, master: OwnedFd, argv: &[CString], status_fd: Option<RawFd>) -> ! {
    let _ = setsid();

    let slave_raw = slave.as_raw_fd();
    unsafe {
        libc::ioctl(slave_raw, libc::TIOCSCTTY as libc::c_ulong, 0);
    }

    let _ = dup2(slave_raw, libc::STDIN_FILENO);
    let _ = dup2(slave_raw, libc::STDOUT_FILENO);
    let _ = dup2(slave_raw, libc::STDERR_FILENO);
    if slave_raw > libc::STDERR_FILENO {
        drop(slave);
    } else {
        std::mem::forget(slave);
    }
    drop(master);

    let _ = execvp(&argv[0], argv);

    // Exec failed. Point stdout at the status pipe when we have one so the
    // diagnostic reaches the launcher instead of a half-dead PTY.
    let err = io::Error::last_os_error();
    match status_fd {
        Some(fd) => {
            let _ = dup2(fd, libc::STDOUT_FILENO);
        }
        None => {
            let _ = write_fd(libc::STDOUT_FILENO, MOVE_TO_BOTTOM);
            let _ = write_fd(libc::STDOUT_FILENO, b"\r\n");
        }
    }
    let msg = format!(
        "dmux: could not execute {}: {}\r\n",
        argv[0].to_string_lossy(),
        err
    );
    let _ = write_fd(libc::STDOUT_FILENO, msg.as_bytes());

    unsafe { libc::_exit(127) }
}
