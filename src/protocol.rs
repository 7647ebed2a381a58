//! Wire protocol between attachers and the session master.
//!
//! Two formats share the session's named pipes:
//!
//! - The **rendezvous** channel carries single admission bytes: high bit set
//!   requests a new client slot, high bit clear releases the slot named by
//!   the low seven bits. The master replies with the assigned slot index;
//!   any reply `>= 127` means the server is full.
//! - Each **client** channel carries fixed-size 10-byte packets from client
//!   to master: a type byte, a length byte, and an 8-byte payload that is
//!   either raw input bytes or a `winsize`. The master-to-client direction
//!   is unframed raw PTY output.
//!
//! Packets are padded to the payload size so frames stay fixed-length on a
//! stream transport. The winsize travels in native byte order; both ends of
//! a session live on the same host.

use std::mem;
use std::str::FromStr;

/// Size of the buffer used for the raw PTY output stream.
pub const BUFSIZE: usize = 4096;

/// Number of client slots a master serves. Slot indices fit in the low
/// seven bits of an admission byte, so 127 is a protocol limit.
pub const MAX_CLIENTS: usize = 127;

/// Admission byte requesting a new slot.
pub const CREATE_REQUEST: u8 = 0x80;

/// Wire size of a `winsize` payload: four native-order `u16` fields.
pub const WINSIZE_LEN: usize = mem::size_of::<libc::winsize>();

/// Total wire size of a client-to-master packet.
pub const PACKET_LEN: usize = 2 + WINSIZE_LEN;

/// Packet type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Raw input bytes for the child program.
    Push = 0,
    /// The client wants PTY output fanned out to it.
    Attach = 1,
    /// Stop fanning output to this client (slot stays allocated).
    Detach = 2,
    /// Window size change; payload carries the new `winsize`.
    Winch = 3,
    /// Ask the child to repaint; the length byte carries the method.
    Redraw = 4,
}

impl PacketType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Push),
            1 => Some(Self::Attach),
            2 => Some(Self::Detach),
            3 => Some(Self::Winch),
            4 => Some(Self::Redraw),
            _ => None,
        }
    }
}

/// How a freshly attached client asks the child to repaint the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RedrawMethod {
    /// Let the master pick its configured default.
    #[default]
    Unspec = 0,
    /// Do not request a repaint.
    None = 1,
    /// Write a form-feed to the PTY if the child looks full-screen.
    CtrlL = 2,
    /// Deliver SIGWINCH to the child's foreground process group.
    Winch = 3,
}

impl RedrawMethod {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unspec),
            1 => Some(Self::None),
            2 => Some(Self::CtrlL),
            3 => Some(Self::Winch),
            _ => None,
        }
    }
}

impl FromStr for RedrawMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "ctrl_l" => Ok(Self::CtrlL),
            "winch" => Ok(Self::Winch),
            other => Err(format!(
                "unknown redraw method {other:?} (expected none, ctrl_l, or winch)"
            )),
        }
    }
}

/// A decoded admission byte from the rendezvous channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Allocate a slot; the master replies with the assigned index.
    Create,
    /// Free the named slot. Stale indices are ignored by the master.
    Release(u8),
}

impl ControlRequest {
    pub fn from_byte(byte: u8) -> Self {
        if byte & CREATE_REQUEST != 0 {
            Self::Create
        } else {
            Self::Release(byte & 0x7f)
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Create => CREATE_REQUEST,
            Self::Release(index) => index & 0x7f,
        }
    }
}

/// Serialize a `winsize` into its wire form.
pub fn encode_winsize(ws: &libc::winsize) -> [u8; WINSIZE_LEN] {
    let mut buf = [0u8; WINSIZE_LEN];
    buf[0..2].copy_from_slice(&ws.ws_row.to_ne_bytes());
    buf[2..4].copy_from_slice(&ws.ws_col.to_ne_bytes());
    buf[4..6].copy_from_slice(&ws.ws_xpixel.to_ne_bytes());
    buf[6..8].copy_from_slice(&ws.ws_ypixel.to_ne_bytes());
    buf
}

/// Deserialize a `winsize` from its wire form.
pub fn decode_winsize(buf: &[u8; WINSIZE_LEN]) -> libc::winsize {
    libc::winsize {
        ws_row: u16::from_ne_bytes([buf[0], buf[1]]),
        ws_col: u16::from_ne_bytes([buf[2], buf[3]]),
        ws_xpixel: u16::from_ne_bytes([buf[4], buf[5]]),
        ws_ypixel: u16::from_ne_bytes([buf[6], buf[7]]),
    }
}

/// A client-to-master packet. Always exactly [`PACKET_LEN`] bytes on the
/// wire; unused payload bytes are zero.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub kind: PacketType,
    /// For [`PacketType::Push`]: number of meaningful payload bytes.
    /// For [`PacketType::Redraw`]: the requested [`RedrawMethod`] byte.
    pub len: u8,
    pub payload: [u8; WINSIZE_LEN],
}

impl Packet {
    /// A packet with no meaningful payload (ATTACH / DETACH).
    pub fn bare(kind: PacketType) -> Self {
        Self {
            kind,
            len: 0,
            payload: [0u8; WINSIZE_LEN],
        }
    }

    /// A PUSH packet carrying up to [`WINSIZE_LEN`] input bytes.
    ///
    /// Longer input must be split by the caller; this truncates.
    pub fn push(data: &[u8]) -> Self {
        let take = data.len().min(WINSIZE_LEN);
        let mut payload = [0u8; WINSIZE_LEN];
        payload[..take].copy_from_slice(&data[..take]);
        Self {
            kind: PacketType::Push,
            len: take as u8,
            payload,
        }
    }

    /// A WINCH packet carrying the new window size.
    pub fn winch(ws: &libc::winsize) -> Self {
        Self {
            kind: PacketType::Winch,
            len: WINSIZE_LEN as u8,
            payload: encode_winsize(ws),
        }
    }

    /// A REDRAW packet carrying the requested method and current size.
    pub fn redraw(method: RedrawMethod, ws: &libc::winsize) -> Self {
        Self {
            kind: PacketType::Redraw,
            len: method as u8,
            payload: encode_winsize(ws),
        }
    }

    /// Encode into the fixed wire frame.
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.len;
        buf[2..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode a wire frame. Returns `None` for unknown packet types, which
    /// the master silently ignores.
    pub fn decode(buf: &[u8; PACKET_LEN]) -> Option<Self> {
        let kind = PacketType::from_u8(buf[0])?;
        let mut payload = [0u8; WINSIZE_LEN];
        payload.copy_from_slice(&buf[2..]);
        Some(Self {
            kind,
            len: buf[1],
            payload,
        })
    }

    /// Interpret the payload as a window size.
    pub fn winsize(&self) -> libc::winsize {
        decode_winsize(&self.payload)
    }
}
