//! Local terminal control for the attacher.
//!
//! The attacher owns the terminal it runs on: it snapshots the settings at
//! startup, switches to raw mode for the duration of the session, and must
//! restore the original settings on every exit path (including suspend,
//! signals, and panics). [`RawTerminal`] holds both termios images and
//! restores on drop.

use std::io::{self, Write};
use std::os::fd::AsRawFd;

use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
    Termios,
};
use thiserror::Error;

/// VT100 clear screen + cursor home.
pub const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[J";

/// VT100 make cursor visible.
pub const CURSOR_SHOW: &[u8] = b"\x1b[?25h";

/// Move the cursor to the bottom of the screen (row 999 clamps).
/// Banners are printed from here so they land below the session content.
pub const MOVE_TO_BOTTOM: &[u8] = b"\x1b[999H";

/// Disabled control-character slot value.
#[cfg(target_os = "linux")]
const VDISABLE: u8 = 0;
#[cfg(not(target_os = "linux"))]
const VDISABLE: u8 = 0xff;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to read terminal attributes: {0}")]
    GetAttr(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetAttr(#[source] nix::Error),

    #[error("failed to query window size: {0}")]
    WindowSize(#[source] io::Error),
}

/// Strip a termios image down to raw mode: byte-at-a-time input, no echo,
/// no line editing, no signal generation, no output post-processing.
pub(crate) fn apply_raw_settings(term: &mut Termios) {
    term.input_flags &= !(InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON
        | InputFlags::IXOFF);
    term.output_flags &= !OutputFlags::OPOST;
    term.local_flags &= !(LocalFlags::ECHO
        | LocalFlags::ECHONL
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);
    term.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    term.control_flags |= ControlFlags::CS8;
    term.control_chars[SpecialCharacterIndices::VLNEXT as usize] = VDISABLE;
    term.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    term.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

/// Snapshot of the attacher's terminal with raw-mode switching.
///
/// Dropping restores the original settings and re-shows the cursor, so the
/// terminal comes back usable on every exit path.
pub struct RawTerminal {
    orig: Termios,
    raw: Termios,
}

impl RawTerminal {
    /// Snapshot the current settings of stdin's terminal.
    pub fn new() -> Result<Self, TerminalError> {
        let stdin = io::stdin();
        let orig = termios::tcgetattr(&stdin).map_err(TerminalError::GetAttr)?;
        let mut raw = orig.clone();
        apply_raw_settings(&mut raw);
        Ok(Self { orig, raw })
    }

    /// The settings captured at startup.
    pub fn orig(&self) -> &Termios {
        &self.orig
    }

    /// The terminal's suspend character (usually `^Z`), from the original
    /// settings; raw mode does not touch the `VSUSP` slot.
    pub fn suspend_char(&self) -> u8 {
        self.orig.control_chars[SpecialCharacterIndices::VSUSP as usize]
    }

    /// Switch the terminal into raw mode.
    pub fn enter_raw(&self) -> Result<(), TerminalError> {
        let stdin = io::stdin();
        termios::tcsetattr(&stdin, SetArg::TCSADRAIN, &self.raw).map_err(TerminalError::SetAttr)
    }

    /// Restore the settings captured at startup.
    pub fn restore(&self) -> Result<(), TerminalError> {
        let stdin = io::stdin();
        termios::tcsetattr(&stdin, SetArg::TCSADRAIN, &self.orig).map_err(TerminalError::SetAttr)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = self.restore();
        let mut stdout = io::stdout();
        let _ = stdout.write_all(CURSOR_SHOW);
        let _ = stdout.flush();
    }
}

/// Snapshot stdin's termios if stdin is a terminal.
///
/// The master hands this to the PTY so the child starts with the settings
/// of the terminal the session was launched from.
pub fn snapshot() -> Option<Termios> {
    termios::tcgetattr(&io::stdin()).ok()
}

/// Current window size of stdin's terminal.
pub fn window_size() -> Result<libc::winsize, TerminalError> {
    let stdin = io::stdin();
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe {
        libc::ioctl(
            stdin.as_raw_fd(),
            libc::TIOCGWINSZ as libc::c_ulong,
            &mut ws,
        )
    };
    if rc < 0 {
        return Err(TerminalError::WindowSize(io::Error::last_os_error()));
    }
    Ok(ws)
}

/// Window size to advertise when stdin is not a terminal.
pub fn window_size_or_zero() -> libc::winsize {
    window_size().unwrap_or(libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    })
}
