//! The session master: a long-lived process that owns the PTY and fans its
//! output out to every attached client.
//!
//! The master multiplexes three kinds of readiness over one `poll(2)` loop:
//! the rendezvous channel (admission bytes), every live client channel
//! (fixed-size packets), and the PTY itself (raw output to fan out). All
//! state lives on this single thread; signals only flip atomics that the
//! loop observes after `poll` returns, so teardown always runs through the
//! normal exit path.
//!
//! Clients are tracked in a fixed table of 127 slots. A slot owns the
//! master-side ends of its channel pair and the pair's filesystem names;
//! releasing a slot closes the fds and unlinks the names together, while
//! dropping a dead client closes only the fds (the names linger until a
//! release byte or teardown, as the admission protocol expects).

use std::ffi::CString;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::termios::Termios;
use nix::unistd::{dup2, fork, setsid, ForkResult};
use signal_hook::consts as sigconsts;
use signal_hook::flag as sigflag;
use thiserror::Error;

use crate::channel::{self, ChannelError, ChannelPair};
use crate::protocol::{
    ControlRequest, Packet, PacketType, RedrawMethod, BUFSIZE, MAX_CLIENTS, PACKET_LEN,
    WINSIZE_LEN,
};
use crate::pty::{ProcessPty, PtyError};

#[derive(Error, Debug)]
pub enum MasterError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("failed to poll session descriptors: {0}")]
    Poll(#[source] nix::Error),

    #[error("failed to fork session master: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to create status pipe: {0}")]
    StatusPipe(#[source] io::Error),

    #[error("failed to install signal handler: {0}")]
    Signals(#[source] io::Error),

    #[error("rendezvous channel failed: {0}")]
    Rendezvous(#[source] ChannelError),
}

/// How the master is launched.
#[derive(Debug, Clone, Copy)]
pub struct MasterOptions {
    /// Hold off reading the PTY until the first client attaches. Output
    /// meanwhile accumulates in the kernel-side PTY buffer.
    pub wait_attach: bool,
    /// Fork and run the master as a daemon; the caller's process returns
    /// once the child program is known to have exec'd (or failed to).
    pub daemonize: bool,
    /// Default redraw method applied when a client requests `Unspec`.
    pub redraw: RedrawMethod,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            wait_attach: true,
            daemonize: true,
            redraw: RedrawMethod::Unspec,
        }
    }
}

/// One connected client: the master-side fds of its channel pair plus the
/// pair's base path for unlinking.
struct ClientSlot {
    pair: ChannelPair,
    base: PathBuf,
    attached: bool,
}

/// Fixed-capacity client table indexed by the slot numbers that appear on
/// the wire.
struct SlotTable {
    slots: [Option<ClientSlot>; MAX_CLIENTS],
}

impl SlotTable {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn live(&self) -> impl Iterator<Item = (u8, &ClientSlot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|s| (index as u8, s)))
    }

    fn get(&self, index: u8) -> Option<&ClientSlot> {
        self.slots.get(index as usize)?.as_ref()
    }

    fn get_mut(&mut self, index: u8) -> Option<&mut ClientSlot> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    fn any_attached(&self) -> bool {
        self.live().any(|(_, slot)| slot.attached)
    }

    /// Allocate the lowest-indexed free slot and create its channel pair
    /// with non-blocking master endpoints. `None` means the table is full.
    fn allocate(&mut self, session: &Path) -> Result<Option<u8>, ChannelError> {
        let Some(index) = self.slots.iter().position(|slot| slot.is_none()) else {
            return Ok(None);
        };
        let base = channel::slot_base(session, index as u8);
        let pair = channel::create_pair(&base, true)?;
        self.slots[index] = Some(ClientSlot {
            pair,
            base,
            attached: false,
        });
        Ok(Some(index as u8))
    }

    /// Release a slot named on the wire: close its fds and unlink its
    /// endpoints. Stale or out-of-range indices are ignored.
    fn release(&mut self, index: u8) -> bool {
        let Some(entry) = self.slots.get_mut(index as usize) else {
            return false;
        };
        match entry.take() {
            Some(slot) => {
                channel::unlink_pair(&slot.base);
                true
            }
            None => false,
        }
    }

    /// Drop a dead client: close its fds but leave the filesystem
    /// endpoints for the release path or teardown to collect.
    fn drop_slot(&mut self, index: u8) {
        if let Some(entry) = self.slots.get_mut(index as usize) {
            entry.take();
        }
    }

    /// Close and unlink every live slot.
    fn unlink_all(&mut self) {
        for entry in &mut self.slots {
            if let Some(slot) = entry.take() {
                channel::unlink_pair(&slot.base);
            }
        }
    }
}

/// Start a session master for `argv` on `session`.
///
/// With `daemonize` set this forks: the daemon half never returns, and the
/// calling half blocks only until the child program execs (reported through
/// a close-on-exec status pipe), then returns 0 — or relays the exec
/// diagnostic to stderr, kills the daemon, and returns 1. In foreground
/// mode the call runs the master loop to completion.
pub fn run(
    session: &Path,
    argv: &[CString],
    initial_term: Option<&Termios>,
    opts: &MasterOptions,
) -> Result<i32, MasterError> {
    let rendezvous = channel::create_pair(session, false)?;
    channel::set_cloexec(rendezvous.miso.as_raw_fd())?;
    channel::set_cloexec(rendezvous.mosi.as_raw_fd())?;

    if !opts.daemonize {
        // Keep a copy of the launching terminal's stderr for exec-failure
        // reporting; the master is about to point its stdio at /dev/null.
        let status = dup_stderr_cloexec();
        return master_process(rendezvous, session, argv, initial_term, opts, status);
    }

    let (status_rd, status_wr) = status_pipe()?;

    match unsafe { fork() }.map_err(MasterError::Fork)? {
        ForkResult::Child => {
            drop(status_rd);
            let code = master_process(
                rendezvous,
                session,
                argv,
                initial_term,
                opts,
                Some(status_wr),
            )
            .unwrap_or(1);
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(status_wr);
            drop(rendezvous);

            // A successful exec closes the write end (FD_CLOEXEC); any
            // bytes mean the child program could not be started.
            let mut buf = [0u8; 1024];
            loop {
                match channel::read_fd(status_rd.as_raw_fd(), &mut buf) {
                    Ok(0) => return Ok(0),
                    Ok(n) => {
                        let _ = io::stderr().write_all(&buf[..n]);
                        let _ = kill(child, Signal::SIGTERM);
                        return Ok(1);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Ok(0),
                }
            }
        }
    }
}

/// The master process proper: session setup, the event loop, teardown.
fn master_process(
    rendezvous: ChannelPair,
    session: &Path,
    argv: &[CString],
    initial_term: Option<&Termios>,
    opts: &MasterOptions,
    status_fd: Option<OwnedFd>,
) -> Result<i32, MasterError> {
    // Disassociate from the launching terminal; harmless when already a
    // session leader.
    let _ = setsid();

    let shutdown = Arc::new(AtomicBool::new(false));
    let child_died = Arc::new(AtomicBool::new(false));
    for sig in [sigconsts::SIGINT, sigconsts::SIGTERM] {
        sigflag::register(sig, Arc::clone(&shutdown)).map_err(MasterError::Signals)?;
    }
    sigflag::register(sigconsts::SIGCHLD, Arc::clone(&child_died))
        .map_err(MasterError::Signals)?;
    for sig in [
        Signal::SIGPIPE,
        Signal::SIGXFSZ,
        Signal::SIGHUP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
    ] {
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigIgn);
        }
    }

    create_marker(session);

    let default_redraw = match opts.redraw {
        RedrawMethod::Unspec => RedrawMethod::CtrlL,
        other => other,
    };

    let mut pty = match ProcessPty::spawn(
        argv,
        initial_term,
        status_fd.as_ref().map(|fd| fd.as_raw_fd()),
    ) {
        Ok(pty) => pty,
        Err(e) => {
            if let Some(fd) = &status_fd {
                let msg = format!("dmux: {e}\n");
                let _ = channel::write_fd(fd.as_raw_fd(), msg.as_bytes());
            }
            channel::unlink_pair(session);
            let _ = std::fs::remove_file(session);
            return Err(e.into());
        }
    };
    drop(status_fd);

    tracing::info!(
        session = %session.display(),
        child = pty.child_pid().as_raw(),
        "session master running"
    );

    redirect_stdio_to_null();

    let mut table = SlotTable::new();
    let result = event_loop(
        &rendezvous,
        session,
        &mut table,
        &mut pty,
        default_redraw,
        opts.wait_attach,
        &shutdown,
        &child_died,
    );

    table.unlink_all();
    channel::unlink_pair(session);
    let _ = std::fs::remove_file(session);

    result
}

/// Which descriptor a readiness entry belongs to.
#[derive(Debug, Clone, Copy)]
enum Source {
    Rendezvous,
    Client(u8),
    Pty,
}

#[allow(clippy::too_many_arguments)]
fn event_loop(
    rendezvous: &ChannelPair,
    session: &Path,
    table: &mut SlotTable,
    pty: &mut ProcessPty,
    default_redraw: RedrawMethod,
    mut wait_attach: bool,
    shutdown: &AtomicBool,
    child_died: &AtomicBool,
) -> Result<i32, MasterError> {
    let mut has_attached = false;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("fatal signal received, shutting session down");
            return Ok(1);
        }

        if wait_attach && table.any_attached() {
            wait_attach = false;
        }
        // Once the child is dead the PTY is about to EOF; poll it even in
        // waitattach mode so the master does not idle on a corpse.
        let poll_pty = !wait_attach || child_died.load(Ordering::Relaxed);

        let now_attached = table.any_attached();
        if now_attached != has_attached {
            update_marker_mode(session, now_attached);
            has_attached = now_attached;
        }

        let pty_fd = pty.as_fd();
        let mut sources = Vec::with_capacity(2 + table.len());
        let mut pfds = Vec::with_capacity(2 + table.len());
        sources.push(Source::Rendezvous);
        pfds.push(PollFd::new(&rendezvous.mosi, PollFlags::POLLIN));
        for (index, slot) in table.live() {
            sources.push(Source::Client(index));
            pfds.push(PollFd::new(&slot.pair.mosi, PollFlags::POLLIN));
        }
        if poll_pty {
            sources.push(Source::Pty);
            pfds.push(PollFd::new(&pty_fd, PollFlags::POLLIN));
        }

        match poll(&mut pfds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(MasterError::Poll(e)),
        }

        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let ready: Vec<(Source, bool)> = sources
            .iter()
            .zip(pfds.iter())
            .map(|(source, pfd)| {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                (*source, revents.intersects(readable))
            })
            .collect();
        drop(pfds);

        for (source, is_ready) in ready {
            if !is_ready {
                continue;
            }
            match source {
                Source::Rendezvous => admission(rendezvous, session, table)?,
                Source::Client(index) => {
                    // The slot can disappear mid-round via a release byte.
                    let Some(slot) = table.get_mut(index) else {
                        continue;
                    };
                    if let ClientAction::Drop = client_activity(slot, pty, default_redraw) {
                        tracing::debug!(index, "client channel closed, dropping slot");
                        table.drop_slot(index);
                    }
                }
                Source::Pty => {
                    if let PtyStatus::Eof = fanout(pty, rendezvous, table)? {
                        let status = pty.try_reap();
                        tracing::info!(?status, "child exited, shutting session down");
                        return Ok(0);
                    }
                }
            }
        }
    }
}

/// Handle one admission byte on the rendezvous channel.
fn admission(
    rendezvous: &ChannelPair,
    session: &Path,
    table: &mut SlotTable,
) -> Result<(), MasterError> {
    let mut byte = [0u8; 1];
    channel::read_all(rendezvous.mosi.as_raw_fd(), &mut byte).map_err(MasterError::Rendezvous)?;

    match ControlRequest::from_byte(byte[0]) {
        ControlRequest::Create => {
            let reply = match table.allocate(session)? {
                Some(index) => {
                    tracing::debug!(index, clients = table.len(), "client slot created");
                    index
                }
                None => {
                    tracing::warn!("slot table full, refusing client");
                    MAX_CLIENTS as u8
                }
            };
            channel::write_all(rendezvous.miso.as_raw_fd(), &[reply])
                .map_err(MasterError::Rendezvous)?;
        }
        ControlRequest::Release(index) => {
            if table.release(index) {
                tracing::debug!(index, clients = table.len(), "client slot released");
            }
        }
    }
    Ok(())
}

enum ClientAction {
    Keep,
    Drop,
}

/// Read and apply one packet from a client channel.
fn client_activity(
    slot: &mut ClientSlot,
    pty: &mut ProcessPty,
    default_redraw: RedrawMethod,
) -> ClientAction {
    let mut buf = [0u8; PACKET_LEN];
    match channel::read_fd(slot.pair.mosi.as_raw_fd(), &mut buf) {
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::Interrupted =>
        {
            return ClientAction::Keep
        }
        Err(_) | Ok(0) => return ClientAction::Drop,
        // A partial frame means the writer died mid-packet.
        Ok(n) if n < PACKET_LEN => return ClientAction::Drop,
        Ok(_) => {}
    }

    let Some(pkt) = Packet::decode(&buf) else {
        // Unknown packet types are ignored; the channel is trusted.
        return ClientAction::Keep;
    };

    match pkt.kind {
        PacketType::Push => {
            if (pkt.len as usize) <= WINSIZE_LEN {
                let _ = pty.write(&pkt.payload[..pkt.len as usize]);
            }
        }
        PacketType::Attach => slot.attached = true,
        PacketType::Detach => slot.attached = false,
        PacketType::Winch => pty.set_winsize(pkt.winsize()),
        PacketType::Redraw => redraw(pty, &pkt, default_redraw),
    }
    ClientAction::Keep
}

/// Apply a REDRAW packet: push the window size, then nudge the child with
/// the requested method.
fn redraw(pty: &mut ProcessPty, pkt: &Packet, default: RedrawMethod) {
    let mut method = RedrawMethod::from_u8(pkt.len);
    if method == Some(RedrawMethod::Unspec) {
        method = Some(default);
    }
    if method == Some(RedrawMethod::None) {
        return;
    }

    pty.set_winsize(pkt.winsize());

    match method {
        Some(RedrawMethod::CtrlL) => {
            // Only nudge full-screen programs; a shell would just echo it.
            if pty.wants_ctrl_l_redraw() {
                let _ = pty.write(b"\x0c");
            }
        }
        Some(RedrawMethod::Winch) => pty.kill_foreground(Signal::SIGWINCH),
        _ => {}
    }
}

enum PtyStatus {
    Alive,
    Eof,
}

enum BatchWrite {
    Done,
    WouldBlock,
    Failed,
}

/// Write a full fan-out batch to one client, non-blocking.
fn write_batch(fd: RawFd, data: &[u8]) -> BatchWrite {
    let mut written = 0;
    while written < data.len() {
        match channel::write_fd(fd, &data[written..]) {
            Ok(0) => return BatchWrite::WouldBlock,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return BatchWrite::WouldBlock,
            Err(_) => return BatchWrite::Failed,
        }
    }
    BatchWrite::Done
}

/// Read one batch of PTY output and fan it out to attached clients.
///
/// The inner wait-then-send loop blocks until at least one attached client
/// can take the batch, while also watching the rendezvous channel so a
/// pending admission is never starved behind stuck clients. Clients that
/// are not writable this round simply miss the batch; there is no
/// per-client queue.
fn fanout(
    pty: &mut ProcessPty,
    rendezvous: &ChannelPair,
    table: &mut SlotTable,
) -> Result<PtyStatus, MasterError> {
    let mut buf = [0u8; BUFSIZE];
    let len = match pty.read(&mut buf) {
        Ok(0) => return Ok(PtyStatus::Eof),
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(PtyStatus::Alive),
        Err(_) => return Ok(PtyStatus::Eof),
    };
    // Keep the cached termios current; redraw eligibility depends on it.
    pty.refresh_termios()?;
    let data = &buf[..len];

    loop {
        let targets: Vec<(u8, RawFd)> = table
            .live()
            .filter(|(_, slot)| slot.attached)
            .map(|(index, slot)| (index, slot.pair.miso.as_raw_fd()))
            .collect();
        if targets.is_empty() {
            // Nobody is attached: the batch is dropped by design, so an
            // idle session accumulates nothing in user space.
            return Ok(PtyStatus::Alive);
        }

        let borrowed: Vec<BorrowedFd<'_>> = targets
            .iter()
            .map(|(_, fd)| unsafe { BorrowedFd::borrow_raw(*fd) })
            .collect();
        let mut pfds = Vec::with_capacity(targets.len() + 1);
        pfds.push(PollFd::new(&rendezvous.mosi, PollFlags::POLLIN));
        for fd in &borrowed {
            pfds.push(PollFd::new(fd, PollFlags::POLLOUT));
        }

        if poll(&mut pfds, -1).is_err() {
            return Ok(PtyStatus::Alive);
        }

        let rendezvous_ready = pfds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
        let writable: Vec<u8> = targets
            .iter()
            .zip(pfds.iter().skip(1))
            .filter(|(_, pfd)| {
                pfd.revents()
                    .unwrap_or(PollFlags::empty())
                    .intersects(PollFlags::POLLOUT | PollFlags::POLLERR)
            })
            .map(|((index, _), _)| *index)
            .collect();
        drop(pfds);

        let mut sent = 0usize;
        let mut failed: Vec<u8> = Vec::new();
        for index in writable {
            let Some(slot) = table.get(index) else {
                continue;
            };
            match write_batch(slot.pair.miso.as_raw_fd(), data) {
                BatchWrite::Done => sent += 1,
                BatchWrite::WouldBlock => {}
                BatchWrite::Failed => failed.push(index),
            }
        }

        if !failed.is_empty() {
            for index in failed {
                tracing::debug!(index, "write to client failed, dropping slot");
                table.drop_slot(index);
            }
            return Ok(PtyStatus::Alive);
        }
        // Spurious wake: every ready client hit EAGAIN and no admission is
        // pending, so wait again rather than dropping the batch.
        if !rendezvous_ready && sent == 0 {
            continue;
        }
        return Ok(PtyStatus::Alive);
    }
}

fn status_pipe() -> Result<(OwnedFd, OwnedFd), MasterError> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(MasterError::StatusPipe(io::Error::last_os_error()));
    }
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    channel::set_cloexec(rd.as_raw_fd())?;
    channel::set_cloexec(wr.as_raw_fd())?;
    Ok((rd, wr))
}

fn dup_stderr_cloexec() -> Option<OwnedFd> {
    let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
    if fd < 0 {
        return None;
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    channel::set_cloexec(owned.as_raw_fd()).ok()?;
    Some(owned)
}

fn redirect_stdio_to_null() {
    if let Ok(null) = nix::fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty()) {
        let _ = dup2(null, libc::STDIN_FILENO);
        let _ = dup2(null, libc::STDOUT_FILENO);
        let _ = dup2(null, libc::STDERR_FILENO);
        if null > libc::STDERR_FILENO {
            let _ = nix::unistd::close(null);
        }
    }
}

/// Create the marker file whose user-execute bit advertises "a client is
/// attached" to outside tooling.
fn create_marker(session: &Path) {
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(session)
    {
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "could not create session marker file"),
    }
}

/// Mirror the attached-client state onto the marker's user-execute bit.
fn update_marker_mode(session: &Path, attached: bool) {
    let Ok(meta) = std::fs::metadata(session) else {
        return;
    };
    let old_mode = meta.permissions().mode();
    let new_mode = if attached {
        old_mode | 0o100
    } else {
        old_mode & !0o100
    };
    if new_mode != old_mode {
        let _ = std::fs::set_permissions(session, std::fs::Permissions::from_mode(new_mode));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_base(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("sess")
    }

    #[test]
    fn allocate_assigns_lowest_free_index() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_base(&dir);
        let mut table = SlotTable::new();

        assert_eq!(table.allocate(&session).unwrap(), Some(0));
        assert_eq!(table.allocate(&session).unwrap(), Some(1));
        assert_eq!(table.allocate(&session).unwrap(), Some(2));
        assert_eq!(table.len(), 3);

        assert!(table.release(1));
        assert_eq!(table.len(), 2);

        // The freed middle slot is reused before a new high index.
        assert_eq!(table.allocate(&session).unwrap(), Some(1));
        assert_eq!(table.len(), 3);

        table.unlink_all();
    }

    #[test]
    fn allocation_creates_and_release_unlinks_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_base(&dir);
        let mut table = SlotTable::new();

        let index = table.allocate(&session).unwrap().unwrap();
        let base = channel::slot_base(&session, index);
        assert!(channel::miso_path(&base).exists());
        assert!(channel::mosi_path(&base).exists());

        assert!(table.release(index));
        assert!(!channel::miso_path(&base).exists());
        assert!(!channel::mosi_path(&base).exists());
    }

    #[test]
    fn release_of_free_or_bogus_slot_is_ignored() {
        let mut table = SlotTable::new();
        assert!(!table.release(0));
        assert!(!table.release(126));
        // An index past the table must not panic either.
        assert!(!table.release(200));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn drop_slot_keeps_filesystem_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_base(&dir);
        let mut table = SlotTable::new();

        let index = table.allocate(&session).unwrap().unwrap();
        let base = channel::slot_base(&session, index);

        table.drop_slot(index);
        assert_eq!(table.len(), 0);
        // The fds are closed but the names stay for release/teardown.
        assert!(channel::miso_path(&base).exists());
        assert!(channel::mosi_path(&base).exists());

        // A release byte for the now-free slot is a no-op.
        assert!(!table.release(index));

        channel::unlink_pair(&base);
    }

    #[test]
    fn table_fills_at_127_clients() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_base(&dir);
        let mut table = SlotTable::new();

        for expected in 0..MAX_CLIENTS as u8 {
            assert_eq!(table.allocate(&session).unwrap(), Some(expected));
        }
        assert_eq!(table.len(), MAX_CLIENTS);
        assert_eq!(table.allocate(&session).unwrap(), None);

        table.unlink_all();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn attached_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_base(&dir);
        let mut table = SlotTable::new();

        let a = table.allocate(&session).unwrap().unwrap();
        let b = table.allocate(&session).unwrap().unwrap();
        assert!(!table.any_attached());

        table.get_mut(a).unwrap().attached = true;
        assert!(table.any_attached());

        table.get_mut(a).unwrap().attached = false;
        table.get_mut(b).unwrap().attached = true;
        assert!(table.any_attached());

        table.release(b);
        assert!(!table.any_attached());

        table.unlink_all();
    }

    #[test]
    fn marker_mode_tracks_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_base(&dir);

        create_marker(&session);
        let mode = std::fs::metadata(&session).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        update_marker_mode(&session, true);
        let mode = std::fs::metadata(&session).unwrap().permissions().mode();
        assert_eq!(mode & 0o100, 0o100);

        update_marker_mode(&session, false);
        let mode = std::fs::metadata(&session).unwrap().permissions().mode();
        assert_eq!(mode & 0o100, 0);
    }
}
