//! Initiator side of the channel.
//!
//! A reader thread drains the worker's stream into a queue. `call` sends
//! one request and then waits on that queue, handing every event to the
//! caller's observer until the matching response arrives. Liveness is
//! judged by heartbeats alone: silence longer than the grace period ends
//! the call with [`RpcError::HeartbeatLost`].

use std::io::{Read, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::codec::{FrameReader, FrameWriter};
use super::message::{Call, Message, Outcome, Reply, WorkerEvent};
use super::RpcError;

/// Longest wait between observer ticks.
const TICK: Duration = Duration::from_millis(100);

enum Inbound {
    Frame(Message),
    Closed,
    Failed(RpcError),
}

/// Receives worker events while a call is in flight.
pub trait CallObserver {
    fn on_event(&mut self, event: WorkerEvent);

    /// Runs at least every tick while waiting. An error aborts the call.
    fn on_tick(&mut self) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Observer that drops every event.
pub struct IgnoreEvents;

impl CallObserver for IgnoreEvents {
    fn on_event(&mut self, _event: WorkerEvent) {}
}

pub struct RpcClient {
    writer: FrameWriter<Box<dyn Write + Send>>,
    inbound: Receiver<Inbound>,
    next_id: u64,
    grace: Duration,
    last_heartbeat: Instant,
}

impl RpcClient {
    /// Starts the reader thread over `reader` and sends requests on `writer`.
    pub fn connect<R, W>(reader: R, writer: W, grace: Duration) -> Result<Self, RpcError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = channel();
        thread::Builder::new()
            .name("rpc-reader".into())
            .spawn(move || {
                let mut frames = FrameReader::new(reader);
                loop {
                    let inbound = match frames.next_frame() {
                        Ok(Some(message)) => Inbound::Frame(message),
                        Ok(None) => Inbound::Closed,
                        Err(e) => Inbound::Failed(e),
                    };
                    let done = !matches!(inbound, Inbound::Frame(_));
                    if tx.send(inbound).is_err() || done {
                        break;
                    }
                }
            })?;

        Ok(Self {
            writer: FrameWriter::new(Box::new(writer)),
            inbound: rx,
            next_id: 1,
            grace,
            last_heartbeat: Instant::now(),
        })
    }

    /// Sends `call` and waits for its response, the deadline, or loss of
    /// the worker, whichever comes first.
    pub fn call(
        &mut self,
        call: Call,
        deadline: Option<Instant>,
        observer: &mut dyn CallObserver,
    ) -> Result<Reply, RpcError> {
        let method = call.method();
        let id = self.next_id;
        self.next_id += 1;
        debug!("rpc -> {} #{}", method, id);
        self.writer.send(&Message::Request { id, call })?;

        loop {
            observer.on_tick()?;

            let now = Instant::now();
            let silent = now.saturating_duration_since(self.last_heartbeat);
            if silent > self.grace {
                return Err(RpcError::HeartbeatLost {
                    silent_ms: millis(silent),
                    grace_ms: millis(self.grace),
                });
            }
            let mut wait = (self.grace - silent).min(TICK);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(RpcError::DeadlineExceeded {
                        method: method.to_string(),
                    });
                }
                wait = wait.min(deadline - now);
            }

            match self.inbound.recv_timeout(wait.max(Duration::from_millis(1))) {
                Ok(Inbound::Frame(Message::Event { payload })) => {
                    if let WorkerEvent::Heartbeat { .. } = payload {
                        self.last_heartbeat = Instant::now();
                    }
                    observer.on_event(payload);
                }
                Ok(Inbound::Frame(Message::Response { id: got, outcome })) => {
                    if got != id {
                        warn!("Ignoring response #{} while waiting for #{}", got, id);
                        continue;
                    }
                    debug!("rpc <- {} #{}", method, id);
                    return match outcome {
                        Outcome::Ok { reply } => Ok(reply),
                        Outcome::Error { error } => Err(RpcError::Remote {
                            category: error.category,
                            message: error.message,
                        }),
                    };
                }
                Ok(Inbound::Frame(Message::Request { .. })) => {
                    return Err(RpcError::Protocol("worker sent a request".into()));
                }
                Ok(Inbound::Failed(e)) => return Err(e),
                Ok(Inbound::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(RpcError::Disconnected);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
