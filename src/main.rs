//! dmux - detachable terminal-session multiplexer
//!
//! One binary, three roles: `new` starts a session master (and normally
//! attaches to it), `attach` joins a running session, `push` feeds a
//! session's stdin without taking the terminal over.

use std::ffi::CString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dmux::client::{self, AttachError};
use dmux::config::{self, AttachOptions};
use dmux::master::{self, MasterOptions};
use dmux::protocol::RedrawMethod;
use dmux::terminal;

#[derive(Parser, Debug)]
#[command(name = "dmux", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session master running COMMAND, then attach to it
    New {
        /// Session path; all channel endpoints derive from it
        session: PathBuf,

        /// Start detached: daemonize the master but do not attach
        #[arg(short = 'n', long)]
        detached: bool,

        /// Start detached and keep the master in the foreground
        #[arg(short = 'N', long)]
        foreground: bool,

        #[command(flatten)]
        terminal: TerminalArgs,

        /// Program to run in the session, with its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Attach to a running session
    Attach {
        /// Session path given to `new`
        session: PathBuf,

        #[command(flatten)]
        terminal: TerminalArgs,
    },

    /// Forward stdin to a running session without attaching
    Push {
        /// Session path given to `new`
        session: PathBuf,
    },
}

#[derive(Args, Debug)]
struct TerminalArgs {
    /// Detach character, literal or caret notation (e.g. "^\")
    #[arg(short = 'e', long, default_value = r"^\")]
    detach_char: String,

    /// Disable detaching on the terminal's suspend character (^Z)
    #[arg(long)]
    no_suspend: bool,

    /// Redraw method requested on attach: none, ctrl_l, or winch
    #[arg(short = 'r', long)]
    redraw: Option<RedrawMethod>,
}

impl TerminalArgs {
    fn to_options(&self) -> Result<AttachOptions, DmuxError> {
        Ok(AttachOptions {
            detach_char: config::parse_key_spec(&self.detach_char)?,
            suspend: !self.no_suspend,
            redraw: self.redraw.unwrap_or(RedrawMethod::Unspec),
        })
    }
}

#[derive(Error, Debug)]
enum DmuxError {
    #[error("bad detach character: {0}")]
    DetachChar(#[from] config::KeySpecError),

    #[error("command contains a NUL byte")]
    NulInCommand,

    #[error(transparent)]
    Master(#[from] master::MasterError),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dmux=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            match &e {
                DmuxError::Attach(AttachError::ServerFull) => eprintln!("error: server is full"),
                other => eprintln!("dmux: {other}"),
            }
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: Cli) -> Result<i32, DmuxError> {
    match cli.command {
        Command::New {
            session,
            detached,
            foreground,
            terminal: term_args,
            command,
        } => {
            let opts = term_args.to_options()?;
            let argv = command
                .iter()
                .map(|arg| CString::new(arg.as_str()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| DmuxError::NulInCommand)?;

            // Seed the child's terminal settings from the launching
            // terminal when there is one.
            let initial_term = terminal::snapshot();

            let attach_after = !detached && !foreground;
            let master_opts = MasterOptions {
                wait_attach: attach_after,
                daemonize: !foreground,
                redraw: opts.redraw,
            };

            let code = master::run(&session, &argv, initial_term.as_ref(), &master_opts)?;
            if code != 0 || !attach_after {
                return Ok(code);
            }
            Ok(client::attach(&session, &opts)?)
        }

        Command::Attach {
            session,
            terminal: term_args,
        } => {
            let opts = term_args.to_options()?;
            Ok(client::attach(&session, &opts)?)
        }

        Command::Push { session } => Ok(client::push(&session)?),
    }
}

/// Map errors onto the documented exit codes: 2 for "no session" and
/// "server full", 1 for everything else.
fn exit_code_for(err: &DmuxError) -> u8 {
    match err {
        DmuxError::Attach(AttachError::ServerFull)
        | DmuxError::Attach(AttachError::SessionNotFound(_)) => 2,
        _ => 1,
    }
}
