//! Named-pipe channel layer.
//!
//! Every channel is a pair of FIFOs derived from a base path: `{base}_miso`
//! carries master-to-client bytes and `{base}_mosi` carries client-to-master
//! bytes. The master opens both FIFOs of every pair read/write so that a
//! reader and a writer always exist; its writes then fail with `EAGAIN`
//! instead of raising `SIGPIPE` when the peer is gone, and its opens never
//! block. Clients open each FIFO in its natural direction, blocking.
//!
//! FIFOs are created mode 0600. Creation is idempotent: an existing FIFO is
//! reused, which lets a master adopt endpoints left behind by a crashed
//! predecessor.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to create fifo {path}: {source}")]
    CreateFifo {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to change fd flags: {0}")]
    FdFlags(#[source] nix::Error),

    #[error("channel i/o: {0}")]
    Io(#[from] io::Error),
}

/// Both endpoints of one channel.
///
/// On the master side both fds are open read/write; on the client side
/// `miso` is read-only and `mosi` is write-only.
#[derive(Debug)]
pub struct ChannelPair {
    pub miso: OwnedFd,
    pub mosi: OwnedFd,
}

/// Append a suffix to a path's final component.
fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the master-to-client FIFO for `base`.
pub fn miso_path(base: &Path) -> PathBuf {
    with_suffix(base, "_miso")
}

/// Path of the client-to-master FIFO for `base`.
pub fn mosi_path(base: &Path) -> PathBuf {
    with_suffix(base, "_mosi")
}

/// Base path of a per-client channel pair: `{session}_{index}`.
pub fn slot_base(session: &Path, index: u8) -> PathBuf {
    with_suffix(session, &format!("_{index}"))
}

fn mkfifo_and_open(path: &Path, nonblocking: bool) -> Result<OwnedFd, ChannelError> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
        Err(source) => {
            return Err(ChannelError::CreateFifo {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let raw = open(path, OFlag::O_RDWR, Mode::empty()).map_err(|source| ChannelError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    if nonblocking {
        set_nonblocking(fd.as_raw_fd())?;
    }
    Ok(fd)
}

/// Create (or adopt) a channel pair, master side.
///
/// Both fds are opened read/write so writes without a peer return `EAGAIN`
/// rather than generating `SIGPIPE`, and so client opens never block on a
/// missing counterpart.
pub fn create_pair(base: &Path, nonblocking: bool) -> Result<ChannelPair, ChannelError> {
    Ok(ChannelPair {
        miso: mkfifo_and_open(&miso_path(base), nonblocking)?,
        mosi: mkfifo_and_open(&mosi_path(base), nonblocking)?,
    })
}

/// Connect to an existing channel pair, client side: `miso` read-only,
/// `mosi` write-only, both blocking.
pub fn connect_pair(base: &Path) -> Result<ChannelPair, ChannelError> {
    let open_end = |path: PathBuf, flags: OFlag| -> Result<OwnedFd, ChannelError> {
        let raw =
            open(&path, flags, Mode::empty()).map_err(|source| ChannelError::Open { path, source })?;
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    };

    Ok(ChannelPair {
        miso: open_end(miso_path(base), OFlag::O_RDONLY)?,
        mosi: open_end(mosi_path(base), OFlag::O_WRONLY)?,
    })
}

/// Remove both filesystem endpoints of a pair. Missing files are ignored.
pub fn unlink_pair(base: &Path) {
    let _ = std::fs::remove_file(miso_path(base));
    let _ = std::fs::remove_file(mosi_path(base));
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<(), ChannelError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(ChannelError::FdFlags)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(ChannelError::FdFlags)?;
    Ok(())
}

/// Mark a descriptor close-on-exec.
pub fn set_cloexec(fd: RawFd) -> Result<(), ChannelError> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(ChannelError::FdFlags)?;
    Ok(())
}

/// Single `read(2)` on a raw fd.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Single `write(2)` on a raw fd.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Read exactly `buf.len()` bytes, retrying on `EINTR`/`EAGAIN`.
///
/// Used on the blocking rendezvous channel and for small fixed-size
/// handshakes, where a short read means the peer broke the protocol.
pub fn read_all(fd: RawFd, buf: &mut [u8]) -> Result<(), ChannelError> {
    let mut done = 0;
    while done < buf.len() {
        match read_fd(fd, &mut buf[done..]) {
            Ok(0) => {
                return Err(ChannelError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("channel closed after {done} of {} bytes", buf.len()),
                )))
            }
            Ok(n) => done += n,
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(ChannelError::Io(e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, retrying on `EINTR`/`EAGAIN`.
pub fn write_all(fd: RawFd, buf: &[u8]) -> Result<(), ChannelError> {
    let mut done = 0;
    while done < buf.len() {
        match write_fd(fd, &buf[done..]) {
            Ok(0) => {
                return Err(ChannelError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("channel accepted {done} of {} bytes", buf.len()),
                )))
            }
            Ok(n) => done += n,
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(ChannelError::Io(e)),
        }
    }
    Ok(())
}
