//! The attacher: a short-lived process that relays the user's terminal to a
//! running session.
//!
//! An attacher rendezvouses with the master for a slot, connects to the
//! slot's channel pair, puts the local terminal into raw mode, and then
//! shuttles bytes: stdin is framed into packets toward the master, and the
//! unframed PTY stream from the master is written verbatim to stdout.
//! Detach, suspend, window-size changes, and fatal signals are all handled
//! here; the master only ever sees packets and release bytes.
//!
//! Push mode is the degenerate non-interactive variant: it takes a slot and
//! forwards stdin as PUSH packets until EOF, never attaching and never
//! touching the terminal.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{self, raise, SigHandler, Signal};
use nix::unistd::{access, AccessFlags};
use signal_hook::consts as sigconsts;
use signal_hook::low_level;
use thiserror::Error;

use crate::channel::{self, ChannelError, ChannelPair};
use crate::config::AttachOptions;
use crate::protocol::{
    ControlRequest, Packet, PacketType, BUFSIZE, MAX_CLIENTS, WINSIZE_LEN,
};
use crate::terminal::{self, RawTerminal, TerminalError, CLEAR_SCREEN, MOVE_TO_BOTTOM};

/// Set by the fatal-signal handlers; the I/O loop observes it after `poll`
/// returns and exits through the normal cleanup path.
static DIE_SIGNAL: AtomicI32 = AtomicI32::new(0);
/// Set by the SIGWINCH handler (and by a leading form-feed on stdin).
static WIN_CHANGED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("no session at {0}")]
    SessionNotFound(PathBuf),

    #[error("server is full")]
    ServerFull,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error("failed to install signal handler: {0}")]
    Signals(#[source] io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// True when `session` has a live-looking rendezvous endpoint. Wrappers use
/// this to probe without producing an error message.
pub fn session_exists(session: &Path) -> bool {
    access(&channel::miso_path(session), AccessFlags::R_OK).is_ok()
}

/// Attach interactively to `session`. Returns the process exit code:
/// 0 after a clean detach or master EOF, 1 after an I/O error or fatal
/// signal.
pub fn attach(session: &Path, opts: &AttachOptions) -> Result<i32, AttachError> {
    if !session_exists(session) {
        return Err(AttachError::SessionNotFound(session.to_path_buf()));
    }

    let (index, pipes) = request_slot(session)?;

    // Snapshot before raw mode; the guard restores on every exit path.
    let term = RawTerminal::new()?;
    install_signal_handlers()?;
    term.enter_raw()?;

    let mut stdout = io::stdout();
    stdout.write_all(CLEAR_SCREEN)?;
    stdout.flush()?;

    send_packet(&pipes, &Packet::bare(PacketType::Attach))?;
    send_packet(
        &pipes,
        &Packet::redraw(opts.redraw, &terminal::window_size_or_zero()),
    )?;

    session_loop(session, index, &pipes, &term, opts)
}

/// Push mode: forward stdin to the session as PUSH packets until EOF.
pub fn push(session: &Path) -> Result<i32, AttachError> {
    if !session_exists(session) {
        return Err(AttachError::SessionNotFound(session.to_path_buf()));
    }

    let (index, pipes) = request_slot(session)?;
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let mut data = [0u8; WINSIZE_LEN];
    loop {
        match channel::read_fd(libc::STDIN_FILENO, &mut data) {
            Ok(0) => {
                let _ = release_slot(session, index);
                return Ok(0);
            }
            Ok(n) => send_packet(&pipes, &Packet::push(&data[..n]))?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = release_slot(session, index);
                return Err(e.into());
            }
        }
    }
}

/// Rendezvous with the master: send a create byte, read back the assigned
/// slot index, and connect to the slot's channel pair.
fn request_slot(session: &Path) -> Result<(u8, ChannelPair), AttachError> {
    // The rendezvous opens block until the master has the other ends open.
    eprintln!("note: if you see this message forever, check for stale pipe files");

    let rendezvous = channel::connect_pair(session)?;
    channel::write_all(
        rendezvous.mosi.as_raw_fd(),
        &[ControlRequest::Create.to_byte()],
    )?;
    let mut reply = [0u8; 1];
    channel::read_all(rendezvous.miso.as_raw_fd(), &mut reply)?;
    drop(rendezvous);

    if reply[0] as usize >= MAX_CLIENTS {
        return Err(AttachError::ServerFull);
    }

    let pipes = channel::connect_pair(&channel::slot_base(session, reply[0]))?;
    Ok((reply[0], pipes))
}

/// Hand the slot back to the master.
fn release_slot(session: &Path, index: u8) -> Result<(), AttachError> {
    let rendezvous = channel::connect_pair(session)?;
    channel::write_all(
        rendezvous.mosi.as_raw_fd(),
        &[ControlRequest::Release(index).to_byte()],
    )?;
    Ok(())
}

fn send_packet(pipes: &ChannelPair, pkt: &Packet) -> Result<(), AttachError> {
    channel::write_all(pipes.mosi.as_raw_fd(), &pkt.encode())?;
    Ok(())
}

fn install_signal_handlers() -> Result<(), AttachError> {
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGXFSZ, SigHandler::SigIgn);
    }
    for sig in [
        sigconsts::SIGHUP,
        sigconsts::SIGTERM,
        sigconsts::SIGINT,
        sigconsts::SIGQUIT,
    ] {
        // Handlers only store into atomics; the loop does the real work.
        unsafe {
            low_level::register(sig, move || {
                DIE_SIGNAL.store(sig, Ordering::SeqCst);
            })
        }
        .map_err(AttachError::Signals)?;
    }
    unsafe {
        low_level::register(sigconsts::SIGWINCH, || {
            WIN_CHANGED.store(true, Ordering::SeqCst);
        })
    }
    .map_err(AttachError::Signals)?;
    Ok(())
}

/// Print a status line below the session content. Best-effort; the
/// terminal is in raw mode, hence the explicit carriage returns.
fn banner(text: &str) {
    let mut stdout = io::stdout();
    let _ = stdout.write_all(MOVE_TO_BOTTOM);
    let _ = stdout.write_all(b"\r\n");
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.write_all(b"\r\n");
    let _ = stdout.flush();
}

enum KeyOutcome {
    Forwarded,
    Detach,
}

/// The attacher's I/O loop: relay PTY output to stdout and keyboard input
/// to the master until something ends the session.
fn session_loop(
    session: &Path,
    index: u8,
    pipes: &ChannelPair,
    term: &RawTerminal,
    opts: &AttachOptions,
) -> Result<i32, AttachError> {
    let suspend_char = term.suspend_char();
    let mut stdout = io::stdout();

    loop {
        let die_sig = DIE_SIGNAL.swap(0, Ordering::SeqCst);
        if die_sig != 0 {
            if die_sig == sigconsts::SIGHUP || die_sig == sigconsts::SIGINT {
                banner("[detached]");
            } else {
                banner(&format!("[got signal {die_sig} - dying]"));
            }
            let _ = release_slot(session, index);
            return Ok(1);
        }

        let stdin_fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        let mut pfds = [
            PollFd::new(&pipes.miso, PollFlags::POLLIN),
            PollFd::new(&stdin_fd, PollFlags::POLLIN),
        ];
        let (miso_ready, stdin_ready) = match poll(&mut pfds, -1) {
            Ok(_) => {
                let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                (
                    pfds[0].revents().unwrap_or(PollFlags::empty()).intersects(readable),
                    pfds[1].revents().unwrap_or(PollFlags::empty()).intersects(readable),
                )
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => (false, false),
            Err(e) => {
                banner("[poll failed]");
                return Err(AttachError::Io(io::Error::from_raw_os_error(e as i32)));
            }
        };

        // Session output first, so a full batch lands before more input.
        if miso_ready {
            let mut buf = [0u8; BUFSIZE];
            match channel::read_fd(pipes.miso.as_raw_fd(), &mut buf) {
                Ok(0) => {
                    banner("[EOF]");
                    return Ok(0);
                }
                Ok(n) => {
                    stdout.write_all(&buf[..n])?;
                    stdout.flush()?;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    banner("[read returned an error]");
                    return Ok(1);
                }
            }
        }

        if stdin_ready {
            let mut data = [0u8; WINSIZE_LEN];
            match channel::read_fd(libc::STDIN_FILENO, &mut data) {
                Ok(0) => return Ok(1),
                Ok(n) => {
                    match process_keyboard(pipes, term, opts, suspend_char, &data[..n])? {
                        KeyOutcome::Forwarded => {}
                        KeyOutcome::Detach => {
                            banner("[detached]");
                            let _ = release_slot(session, index);
                            return Ok(0);
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return Ok(1),
            }
        }

        if WIN_CHANGED.swap(false, Ordering::SeqCst) {
            send_packet(pipes, &Packet::winch(&terminal::window_size_or_zero()))?;
        }
    }
}

/// Handle one keyboard read: suspend, detach, and form-feed get special
/// treatment; everything else is pushed through verbatim.
fn process_keyboard(
    pipes: &ChannelPair,
    term: &RawTerminal,
    opts: &AttachOptions,
    suspend_char: u8,
    data: &[u8],
) -> Result<KeyOutcome, AttachError> {
    let first = data[0];

    if opts.suspend && first == suspend_char {
        let mut pkt = Packet::push(data);

        // Let go of the session and the terminal, stop, and on resume put
        // everything back and ask for a repaint.
        pkt.kind = PacketType::Detach;
        send_packet(pipes, &pkt)?;

        term.restore()?;
        let mut stdout = io::stdout();
        let _ = stdout.write_all(MOVE_TO_BOTTOM);
        let _ = stdout.write_all(b"\r\n");
        let _ = stdout.flush();

        let _ = raise(Signal::SIGTSTP);

        term.enter_raw()?;
        pkt.kind = PacketType::Attach;
        send_packet(pipes, &pkt)?;
        send_packet(
            pipes,
            &Packet::redraw(opts.redraw, &terminal::window_size_or_zero()),
        )?;
        return Ok(KeyOutcome::Forwarded);
    }

    if first == opts.detach_char {
        return Ok(KeyOutcome::Detach);
    }

    if first == 0x0c {
        // Form-feed doubles as a local "repaint my size" request.
        WIN_CHANGED.store(true, Ordering::SeqCst);
    }

    send_packet(pipes, &Packet::push(data))?;
    Ok(KeyOutcome::Forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PACKET_LEN;

    /// Master-side stand-in: create the rendezvous pair and answer one
    /// create request by hand.
    #[test]
    fn request_slot_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("sess");
        let rendezvous = channel::create_pair(&session, false).unwrap();

        // Pre-create the slot pair the fake master will hand out.
        let base = channel::slot_base(&session, 3);
        let _slot_pair = channel::create_pair(&base, true).unwrap();

        // Queue the reply before the client asks; the fifo buffers it.
        channel::write_all(rendezvous.miso.as_raw_fd(), &[3u8]).unwrap();

        let (index, pipes) = request_slot(&session).unwrap();
        assert_eq!(index, 3);

        // The create byte is waiting on the rendezvous mosi.
        let mut byte = [0u8; 1];
        channel::read_all(rendezvous.mosi.as_raw_fd(), &mut byte).unwrap();
        assert_eq!(ControlRequest::from_byte(byte[0]), ControlRequest::Create);

        // And the slot channel is connected in the right directions.
        send_packet(&pipes, &Packet::bare(PacketType::Attach)).unwrap();
        let mut frame = [0u8; PACKET_LEN];
        channel::read_all(_slot_pair.mosi.as_raw_fd(), &mut frame).unwrap();
        assert_eq!(
            Packet::decode(&frame).unwrap().kind,
            PacketType::Attach
        );
    }

    #[test]
    fn request_slot_full_server() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("sess");
        let rendezvous = channel::create_pair(&session, false).unwrap();
        channel::write_all(rendezvous.miso.as_raw_fd(), &[MAX_CLIENTS as u8]).unwrap();

        match request_slot(&session) {
            Err(AttachError::ServerFull) => {}
            other => panic!("expected ServerFull, got {other:?}"),
        }
    }

    #[test]
    fn release_byte_reaches_rendezvous() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("sess");
        let rendezvous = channel::create_pair(&session, false).unwrap();

        release_slot(&session, 9).unwrap();

        let mut byte = [0u8; 1];
        channel::read_all(rendezvous.mosi.as_raw_fd(), &mut byte).unwrap();
        assert_eq!(
            ControlRequest::from_byte(byte[0]),
            ControlRequest::Release(9)
        );
    }

    #[test]
    fn missing_session_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("nope");
        assert!(!session_exists(&session));

        match attach(&session, &AttachOptions::default()) {
            Err(AttachError::SessionNotFound(path)) => assert_eq!(path, session),
            other => panic!("expected SessionNotFound, got {other:?}"),
        }
    }
}
