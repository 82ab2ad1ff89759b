use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use mavlink::common::{MavCmd, MavModeFlag, COMMAND_LONG_DATA, REQUEST_DATA_STREAM_DATA};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::config::StreamRates;
use crate::error::{Error, Result};
use crate::mode::{VehicleMode, VehicleType};
use crate::protocol::{AckResult, Frame, MavMessage};

/// Sender half of the outbound byte channel of an open link.
pub(crate) type Outbound = mpsc::UnboundedSender<Vec<u8>>;

/// System and component commands are addressed to, as announced in the
/// header of the vehicle's heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    pub system: u8,
    pub component: u8,
}

/// Commands the vehicle understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode(VehicleMode),
    Arm,
    Disarm,
    /// fire and forget, no acknowledgement is expected
    SetStreamRate(StreamRates),
}

impl Command {
    /// Builds a mode change, accepting either the mode label or its number.
    /// Fails with `InvalidMode` if the vehicle type has no such mode.
    pub fn set_mode(vehicle_type: VehicleType, mode: &str) -> Result<Command> {
        vehicle_type
            .mode_by_label(mode)
            .or_else(|| {
                mode.trim()
                    .parse::<u32>()
                    .ok()
                    .and_then(|number| vehicle_type.mode(number))
            })
            .map(Command::SetMode)
            .ok_or_else(|| Error::InvalidMode {
                vehicle_type,
                mode: mode.to_string(),
            })
    }

    /// COMMAND_LONG carrying this command, `None` for stream rate requests.
    fn to_message(&self, target: Target) -> Option<(MavCmd, MavMessage)> {
        let (command, param1, param2) = match self {
            Command::SetMode(mode) => (
                MavCmd::MAV_CMD_DO_SET_MODE,
                MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                mode.number() as f32,
            ),
            Command::Arm => (MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 1.0, 0.0),
            Command::Disarm => (MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 0.0, 0.0),
            Command::SetStreamRate(_) => return None,
        };
        let message = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target.system,
            target_component: target.component,
            command,
            confirmation: 0,
            param1,
            param2,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        });
        Some((command, message))
    }
}

/// Resolves once with the outcome of a sent command: acknowledged,
/// rejected, timed out or cut off by a disconnect.
#[derive(Debug)]
pub struct CommandHandle {
    seq: u16,
    reply: oneshot::Receiver<Result<()>>,
}

impl CommandHandle {
    fn resolved(seq: u16) -> Self {
        let (tx, reply) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self { seq, reply }
    }

    /// Local sequence id, reported back in timeout and rejection errors.
    pub fn seq(&self) -> u16 {
        self.seq
    }
}

impl Future for CommandHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply).poll(cx).map(|reply| {
            reply.unwrap_or_else(|_| Err(Error::connection_lost("dispatcher dropped")))
        })
    }
}

struct Pending {
    seq: u16,
    command: u32,
    reply: oneshot::Sender<Result<()>>,
    timer: JoinHandle<()>,
}

/// The link commands currently go out on.
struct Attached {
    outbound: Outbound,
    target: Target,
    /// MAVLink header sequence, wraps
    sequence: u8,
}

impl Attached {
    fn transmit(&mut self, message: MavMessage) -> Result<()> {
        let frame = Frame::outbound(self.sequence, message);
        self.sequence = self.sequence.wrapping_add(1);
        let bytes = frame.encode().map_err(|e| Error::Encode {
            message: e.to_string(),
        })?;
        self.outbound
            .send(bytes)
            .map_err(|_| Error::connection_lost("link closed while sending"))
    }

    fn transmit_rates(&mut self, rates: &StreamRates) {
        for (channel, rate_hz) in rates.iter() {
            let request = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
                req_message_rate: rate_hz,
                target_system: self.target.system,
                target_component: self.target.component,
                req_stream_id: channel as u8,
                start_stop: (rate_hz > 0) as u8,
            });
            if let Err(e) = self.transmit(request) {
                warn!(error = %e, "could not request stream rates");
                return;
            }
        }
        debug!(channels = rates.len(), "stream rates requested");
    }
}

struct DispatcherInner {
    next_seq: AtomicU16,
    timeout: Duration,
    runtime: Handle,
    /// locked before `pending` whenever both are needed
    link: Mutex<Option<Attached>>,
    /// oldest first
    pending: Mutex<VecDeque<Pending>>,
}

/// Serialises commands onto the active link and matches acknowledgements
/// to them.
///
/// A COMMAND_ACK only names the command it answers, so an ack resolves the
/// oldest outstanding command of that kind.
///
/// Cheaply cloneable; `send` may be called from any task or thread.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_pending(pending: &Mutex<VecDeque<Pending>>, seq: u16) -> Option<Pending> {
    let mut pending = lock(pending);
    let index = pending.iter().position(|p| p.seq == seq)?;
    pending.remove(index)
}

impl CommandDispatcher {
    /// Timeout timers run on the runtime this is created in.
    ///
    /// # Panics
    ///
    /// Outside of a Tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                next_seq: AtomicU16::new(1),
                timeout,
                runtime: Handle::current(),
                link: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Sends the command and returns a handle for its outcome.
    ///
    /// Fails with `NotConnected`, without transmitting anything, unless the
    /// link is up.
    pub fn send(&self, command: Command) -> Result<CommandHandle> {
        // held until the command is registered and sent, so a concurrent
        // detach either runs first or finds the command pending
        let mut link = lock(&self.inner.link);
        let attached = link.as_mut().ok_or(Error::NotConnected)?;
        let (id, message) = match command.to_message(attached.target) {
            Some(message) => message,
            None => {
                if let Command::SetStreamRate(rates) = &command {
                    attached.transmit_rates(rates);
                }
                return Ok(CommandHandle::resolved(0));
            }
        };

        let seq = self.next_seq();
        let (reply, rx) = oneshot::channel();
        let timer = self.inner.runtime.spawn(expire(
            Arc::downgrade(&self.inner),
            seq,
            self.inner.timeout,
        ));
        // registered before the frame leaves, a fast ack must find it
        lock(&self.inner.pending).push_back(Pending {
            seq,
            command: id as u32,
            reply,
            timer,
        });

        if let Err(e) = attached.transmit(message) {
            if let Some(pending) = take_pending(&self.inner.pending, seq) {
                pending.timer.abort();
            }
            return Err(e);
        }
        debug!(seq, ?command, "command sent");
        Ok(CommandHandle { seq, reply: rx })
    }

    /// Asks the vehicle to stream each channel at the given rate.
    /// Nothing is acknowledged; a wrong rate only shows as missing telemetry.
    pub fn set_stream_rates(&self, rates: StreamRates) -> Result<()> {
        let mut link = lock(&self.inner.link);
        let attached = link.as_mut().ok_or(Error::NotConnected)?;
        attached.transmit_rates(&rates);
        Ok(())
    }

    /// Resolves the oldest command waiting for an ack of `command`. Acks for
    /// commands that were already resolved (or never sent) are dropped, an
    /// in-progress ack leaves the command waiting.
    pub fn acknowledge(&self, command: u32, result: AckResult) {
        if result == AckResult::InProgress {
            trace!(command, "command in progress");
            return;
        }
        let pending = {
            let mut pending = lock(&self.inner.pending);
            pending
                .iter()
                .position(|p| p.command == command)
                .and_then(|index| pending.remove(index))
        };
        match pending {
            Some(pending) => {
                pending.timer.abort();
                let seq = pending.seq;
                let outcome = match result {
                    AckResult::Accepted => Ok(()),
                    result => Err(Error::CommandRejected { seq, result }),
                };
                debug!(seq, command, %result, "command acknowledged");
                let _ = pending.reply.send(outcome);
            }
            None => trace!(command, "ignoring ack without pending command"),
        }
    }

    /// Number of commands still waiting for an acknowledgement.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub(crate) fn attach(&self, outbound: Outbound, target: Target) {
        *lock(&self.inner.link) = Some(Attached {
            outbound,
            target,
            sequence: 0,
        });
    }

    /// Detaches the link and fails everything outstanding with
    /// `ConnectionLost`.
    pub(crate) fn detach(&self, reason: &str) {
        let drained: Vec<Pending> = {
            let mut link = lock(&self.inner.link);
            link.take();
            lock(&self.inner.pending).drain(..).collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), reason, "failing outstanding commands");
        }
        for pending in drained {
            pending.timer.abort();
            let _ = pending.reply.send(Err(Error::connection_lost(reason)));
        }
    }

    fn next_seq(&self) -> u16 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("timeout", &self.inner.timeout)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

async fn expire(inner: Weak<DispatcherInner>, seq: u16, timeout: Duration) {
    sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(pending) = take_pending(&inner.pending, seq) {
        warn!(seq, "command timed out");
        let _ = pending.reply.send(Err(Error::CommandTimeout {
            seq,
            timeout_ms: timeout.as_millis() as u64,
        }));
    }
}
