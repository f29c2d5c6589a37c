//! Bridge from an operator console thread into a single-threaded event loop.
//!
//! The loop owns every socket and buffer, so other threads never touch them.
//! Instead they push text lines onto a bounded queue and wake the loop's
//! `poll` call. The loop drains the queue once per iteration, after handling
//! readiness events, in the order lines were pushed. A pushed line is only
//! guaranteed to be seen after that wake-up, never synchronously.

use mio::{Registry, Token, Waker};
use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info};

/// Failures of [`Control::send`].
#[derive(Debug, Error)]
pub enum ControlError {
    /// The event loop has stopped and dropped its end of the queue.
    #[error("event loop is gone")]
    EventLoopGone,

    /// The line was queued but the loop could not be woken.
    #[error("failed to wake event loop: {0}")]
    Wake(#[from] io::Error),
}

/// Sending side of the command queue, cloneable across threads.
#[derive(Clone)]
pub struct Control {
    tx: SyncSender<String>,
    waker: Arc<Waker>,
}

impl Control {
    /// Queue a line for the event loop and wake it.
    ///
    /// Blocks while the queue is full.
    pub fn send(&self, line: impl Into<String>) -> Result<(), ControlError> {
        self.tx
            .send(line.into())
            .map_err(|_| ControlError::EventLoopGone)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Receiving side of the command queue, owned by the event loop.
pub struct CommandQueue {
    rx: Receiver<String>,
}

impl CommandQueue {
    /// Take every line queued so far, oldest first, without blocking.
    pub fn drain(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::from_fn(move || match self.rx.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        })
    }
}

/// Create a command queue of `capacity` lines whose sender wakes `registry`
/// through a waker registered under `token`.
pub fn command_channel(
    registry: &Registry,
    token: Token,
    capacity: usize,
) -> io::Result<(Control, CommandQueue)> {
    let waker = Arc::new(Waker::new(registry, token)?);
    let (tx, rx) = mpsc::sync_channel(capacity);
    Ok((Control { tx, waker }, CommandQueue { rx }))
}

/// Spawn a thread forwarding every line of `input` to `control`.
///
/// The thread ends when input is exhausted or the event loop is gone.
pub fn spawn_console<R>(input: R, control: Control) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(error = %e, "Console read failed");
                        break;
                    }
                };
                if let Err(e) = control.send(line) {
                    debug!(error = %e, "Console stopping");
                    return;
                }
            }
            info!("Console input closed");
        })
}

/// Operator commands understood by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Report the number of connected clients.
    Info,
    /// Stop accepting new clients; existing ones are unaffected.
    Shutdown,
    /// Close every connection and stop the event loop.
    ShutdownNow,
    /// Anything else; reported and ignored.
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "INFO" => ControlCommand::Info,
            "SHUTDOWN" => ControlCommand::Shutdown,
            "SHUTDOWNNOW" => ControlCommand::ShutdownNow,
            other => ControlCommand::Unknown(other.to_string()),
        }
    }
}
