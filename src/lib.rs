//! dmux - detachable terminal-session multiplexer
//!
//! A long-lived master process owns a pseudo-terminal running a child
//! program; any number of short-lived attachers connect to it over named
//! pipes to drive the child interactively. Detaching leaves the child
//! running; reattaching restores control. Unlike its single-client
//! ancestors, one session fans PTY output out to every attached client at
//! once, without letting a stuck client block the rest.
//!
//! Architecture:
//! - `channel`: FIFO pairs (`{session}_miso` / `{session}_mosi`) with the
//!   open discipline that makes master-side writes peer-independent
//! - `protocol`: the fixed-size packet frame and the one-byte admission
//!   protocol spoken over those pipes
//! - `pty`: fork-a-child-under-a-PTY primitive with exec-failure reporting
//! - `master`: the single-threaded poll loop multiplexing rendezvous,
//!   clients, and the PTY
//! - `client`: the attacher (raw terminal, packet framing, suspend/detach)
//!   and push mode
//! - `terminal`, `config`: local terminal control and runtime options

pub mod channel;
pub mod client;
pub mod config;
pub mod master;
pub mod protocol;
pub mod pty;
pub mod terminal;
