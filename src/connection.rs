//! Link lifecycle: opening the transport, waiting for the first heartbeat,
//! feeding decoded frames into telemetry and the command dispatcher, and
//! tearing everything down again.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use mavlink::Message as _;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionParams, LinkConfig};
use crate::dispatcher::{CommandDispatcher, Outbound, Target};
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, Notification};
use crate::protocol::{Event, FrameDecoder};
use crate::telemetry::TelemetryStore;
use crate::transport::Connector;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// transport opened (or opening), no heartbeat yet
    Connecting,
    Connected,
    /// The link broke or never came up. Carries the reason.
    Failed(String),
}

impl ConnectionState {
    /// `Connecting` or `Connected`; a new connect is refused while active.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Resolves once the first heartbeat arrived, or with the reason the
/// attempt failed.
#[derive(Debug)]
pub struct ConnectHandle {
    done: oneshot::Receiver<Result<()>>,
}

impl Future for ConnectHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.done).poll(cx).map(|done| {
            done.unwrap_or_else(|_| Err(Error::connection_lost("connection attempt cancelled")))
        })
    }
}

#[derive(Debug, Default)]
struct Session {
    /// bumped on every connect and disconnect; a link task only touches
    /// shared state while its generation is current
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct ManagerInner {
    config: LinkConfig,
    connector: Box<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
    bus: EventBus,
    telemetry: Arc<TelemetryStore>,
    dispatcher: CommandDispatcher,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManagerInner {
    /// Caller holds the session lock.
    fn set_state(&self, state: ConnectionState) {
        info!(?state, "connection state");
        self.state.send_replace(state.clone());
        self.bus.publish(Notification::ConnectionStateChanged(state));
    }

    fn establish(&self, generation: u64, outbound: Outbound, target: Target) -> bool {
        let session = lock(&self.session);
        if session.generation != generation {
            return false;
        }
        self.dispatcher.attach(outbound, target);
        self.set_state(ConnectionState::Connected);
        true
    }

    fn fail(&self, generation: u64, error: &Error) {
        let session = lock(&self.session);
        if session.generation != generation {
            debug!(%error, "stale link task ended");
            return;
        }
        warn!(%error, "link failed");
        self.dispatcher.detach(&error.to_string());
        self.set_state(ConnectionState::Failed(error.to_string()));
    }
}

/// Owns the one link to the vehicle.
///
/// At most one connection is active at a time. Inbound frames are routed to
/// the [`TelemetryStore`] and acknowledgements to the [`CommandDispatcher`],
/// which can only send while the state is `Connected`.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: LinkConfig,
        connector: impl Connector,
        bus: EventBus,
        telemetry: Arc<TelemetryStore>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector: Box::new(connector),
                state,
                session: Mutex::new(Session::default()),
                bus,
                telemetry,
                dispatcher,
            }),
        }
    }

    /// Starts connecting in the background.
    ///
    /// Parameters are checked before anything else happens. While another
    /// connection is `Connecting` or `Connected` this fails with
    /// `AlreadyConnected` and leaves that connection alone.
    pub fn connect(&self, params: ConnectionParams) -> Result<ConnectHandle> {
        params.validate()?;

        let mut session = lock(&self.inner.session);
        if self.inner.state.borrow().is_active() {
            return Err(Error::AlreadyConnected);
        }
        session.generation += 1;
        let generation = session.generation;

        let (done, rx) = oneshot::channel();
        info!(%params, "connecting");
        self.inner.set_state(ConnectionState::Connecting);
        session.task = Some(tokio::spawn(run_link(
            Arc::clone(&self.inner),
            generation,
            params,
            done,
        )));
        Ok(ConnectHandle { done: rx })
    }

    /// Closes the link. Outstanding commands fail with `ConnectionLost`.
    ///
    /// Returns once the transport has been released. Calling it while
    /// already disconnected does nothing.
    pub async fn disconnect(&self) {
        let task = {
            let mut session = lock(&self.inner.session);
            session.generation += 1;
            self.inner.dispatcher.detach("disconnected");
            if *self.inner.state.borrow() != ConnectionState::Disconnected {
                self.inner.set_state(ConnectionState::Disconnected);
            }
            session.task.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Receiver marked changed on every state transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner.session).task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

async fn run_link(
    inner: Arc<ManagerInner>,
    generation: u64,
    params: ConnectionParams,
    done: oneshot::Sender<Result<()>>,
) {
    let mut done = Some(done);
    let error = drive(&inner, generation, &params, &mut done).await;
    inner.fail(generation, &error);
    if let Some(done) = done.take() {
        let _ = done.send(Err(error));
    }
}

/// Runs the link until it breaks and returns why.
async fn drive(
    inner: &ManagerInner,
    generation: u64,
    params: &ConnectionParams,
    done: &mut Option<oneshot::Sender<Result<()>>>,
) -> Error {
    let mut link = match inner.connector.open(&params.transport).await {
        Ok(link) => link,
        Err(e) => return Error::connection_lost(format!("cannot open {}: {}", params, e)),
    };
    debug!(%params, "transport open, waiting for heartbeat");

    let handshake_timeout = inner.config.handshake_timeout;
    let handshake = sleep(handshake_timeout);
    tokio::pin!(handshake);
    let mut decoder = FrameDecoder::new();
    let mut connected = false;

    loop {
        let chunk = tokio::select! {
            chunk = link.inbound.recv() => chunk,
            _ = &mut handshake, if !connected => {
                return Error::HandshakeTimeout {
                    timeout_ms: handshake_timeout.as_millis() as u64,
                };
            }
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Error::connection_lost(format!("transport error: {}", e)),
            None => return Error::connection_lost("transport closed"),
        };

        decoder.push(&bytes);
        while let Some(frame) = decoder.next_frame() {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "dropping corrupt frame");
                    continue;
                }
            };

            let Some(event) = Event::from_message(&frame.message) else {
                trace!(id = frame.message.message_id(), "ignoring message");
                continue;
            };

            let handshake_done = !connected && matches!(event, Event::Heartbeat { .. });
            if handshake_done {
                // commands go to whoever sent the first heartbeat
                let target = Target {
                    system: frame.header.system_id,
                    component: frame.header.component_id,
                };
                if !inner.establish(generation, link.outbound.clone(), target) {
                    return Error::connection_lost("connection superseded");
                }
                connected = true;
                if let Err(e) = inner
                    .dispatcher
                    .set_stream_rates(inner.config.stream_rates.clone())
                {
                    warn!(error = %e, "could not request stream rates");
                }
            }

            match event {
                Event::CommandAck { command, result } => {
                    inner.dispatcher.acknowledge(command, result)
                }
                ref event => inner.telemetry.apply_event(event),
            }

            // the caller sees the heartbeat's telemetry once connect resolves
            if handshake_done {
                if let Some(done) = done.take() {
                    let _ = done.send(Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use mavlink::common::{MavCmd, MavMessage, MavResult};

    use crate::config::{StreamChannel, StreamRates};
    use crate::dispatcher::Command;
    use crate::protocol::testing::{command_ack, copter_heartbeat, vehicle_frame, VEHICLE_SYSTEM_ID};
    use crate::protocol::Frame;
    use crate::transport::{Link, LinkPeer, QueuedConnector};

    struct Fixture {
        manager: ConnectionManager,
        connector: Arc<QueuedConnector>,
        dispatcher: CommandDispatcher,
        telemetry: Arc<TelemetryStore>,
        bus: EventBus,
    }

    fn fixture(config: LinkConfig) -> Fixture {
        let bus = EventBus::new();
        let telemetry = Arc::new(TelemetryStore::new(bus.clone()));
        let dispatcher = CommandDispatcher::new(config.command_timeout);
        let connector = Arc::new(QueuedConnector::new());
        let manager = ConnectionManager::new(
            config,
            Arc::clone(&connector),
            bus.clone(),
            Arc::clone(&telemetry),
            dispatcher.clone(),
        );
        Fixture {
            manager,
            connector,
            dispatcher,
            telemetry,
            bus,
        }
    }

    impl Fixture {
        fn link(&self) -> LinkPeer {
            let (link, peer) = Link::in_memory();
            self.connector.push(link);
            peer
        }
    }

    fn heartbeat() -> Frame {
        vehicle_frame(copter_heartbeat(5, false))
    }

    fn quiet() -> LinkConfig {
        LinkConfig {
            stream_rates: StreamRates::empty(),
            ..LinkConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_heartbeat_completes_the_connect() {
        let config = LinkConfig {
            stream_rates: StreamRates::empty().with(StreamChannel::Position, 5),
            ..LinkConfig::default()
        };
        let f = fixture(config);
        let mut peer = f.link();

        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        assert_eq!(f.manager.state(), ConnectionState::Connecting);

        peer.send_frame(&heartbeat()).await;
        assert_eq!(handle.await, Ok(()));
        assert!(f.manager.is_connected());

        // configured rates go out as soon as the link is up
        let request = peer.recv_frame().await.unwrap();
        match request.message {
            MavMessage::REQUEST_DATA_STREAM(data) => {
                assert_eq!(data.req_stream_id, StreamChannel::Position as u8);
                assert_eq!(data.req_message_rate, 5);
                assert_eq!(data.start_stop, 1);
                assert_eq!(data.target_system, VEHICLE_SYSTEM_ID);
            }
            other => panic!("expected REQUEST_DATA_STREAM, got {:?}", other),
        }

        // the heartbeat itself reached telemetry
        assert_eq!(
            f.telemetry.snapshot().mode.map(|m| m.label()),
            Some("Loiter")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_active_is_refused() {
        let f = fixture(quiet());
        let peer = f.link();

        let _handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        assert_eq!(
            f.manager.connect(ConnectionParams::udp(14551)).err(),
            Some(Error::AlreadyConnected)
        );
        assert_eq!(f.manager.state(), ConnectionState::Connecting);

        peer.send_frame(&heartbeat()).await;
        f.manager
            .watch()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(
            f.manager.connect(ConnectionParams::usb("/dev/ttyUSB0", 57600)).err(),
            Some(Error::AlreadyConnected)
        );
        assert!(f.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_parameters_are_rejected_before_anything_starts() {
        let f = fixture(quiet());

        let err = f.manager.connect(ConnectionParams::udp(0)).err();
        assert!(matches!(err, Some(Error::InvalidParameter { .. })));
        let err = f.manager.connect(ConnectionParams::usb("", 57600)).err();
        assert!(matches!(err, Some(Error::InvalidParameter { .. })));
        let err = f.manager.connect(ConnectionParams::usb("/dev/ttyACM0", 1234)).err();
        assert!(matches!(err, Some(Error::InvalidParameter { .. })));

        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_vehicle_fails_the_handshake() {
        let f = fixture(quiet());
        let _peer = f.link();

        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        assert_eq!(
            handle.await,
            Err(Error::HandshakeTimeout { timeout_ms: 5000 })
        );
        assert!(matches!(f.manager.state(), ConnectionState::Failed(_)));

        // a failed link may be retried
        let peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        peer.send_frame(&heartbeat()).await;
        assert_eq!(handle.await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_is_reported() {
        let f = fixture(quiet());

        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        assert!(matches!(handle.await, Err(Error::ConnectionLost { .. })));
        assert!(matches!(f.manager.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_every_outstanding_command() {
        let f = fixture(quiet());
        let mut peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        peer.send_frame(&heartbeat()).await;
        handle.await.unwrap();

        let commands: Vec<_> = (0..3)
            .map(|_| f.dispatcher.send(Command::Arm).unwrap())
            .collect();
        assert_eq!(f.dispatcher.outstanding(), 3);

        f.manager.disconnect().await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        for command in commands {
            assert!(matches!(command.await, Err(Error::ConnectionLost { .. })));
        }
        assert!(matches!(
            f.dispatcher.send(Command::Disarm),
            Err(Error::NotConnected)
        ));

        // transport released: pending writes drain, then the link is gone
        while peer.recv_frame().await.is_some() {}
        assert!(peer.is_closed());

        // idempotent
        f.manager.disconnect().await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_racing_a_disconnect_fail_with_connection_lost() {
        let f = fixture(LinkConfig {
            command_timeout: Duration::from_millis(500),
            ..quiet()
        });

        for _ in 0..50 {
            let peer = f.link();
            let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
            peer.send_frame(&heartbeat()).await;
            handle.await.unwrap();

            let dispatcher = f.dispatcher.clone();
            let sender = std::thread::spawn(move || {
                (0..200)
                    .filter_map(|_| dispatcher.send(Command::Arm).ok())
                    .collect::<Vec<_>>()
            });
            f.manager.disconnect().await;
            let commands = tokio::task::spawn_blocking(move || sender.join())
                .await
                .unwrap()
                .unwrap();

            // anything accepted before the link went away is cut off by it,
            // nothing is left behind to time out later
            for command in commands {
                assert!(matches!(command.await, Err(Error::ConnectionLost { .. })));
            }
            assert_eq!(f.dispatcher.outstanding(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acks_are_routed_to_the_dispatcher() {
        let f = fixture(quiet());
        let mut peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        peer.send_frame(&heartbeat()).await;
        handle.await.unwrap();

        let arm = f.dispatcher.send(Command::Arm).unwrap();
        let sent = peer.recv_frame().await.unwrap();
        match sent.message {
            MavMessage::COMMAND_LONG(data) => {
                assert_eq!(data.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                assert_eq!(data.target_system, VEHICLE_SYSTEM_ID);
            }
            other => panic!("expected COMMAND_LONG, got {:?}", other),
        }

        // unrelated acks leave the command alone
        peer.send_frame(&vehicle_frame(command_ack(
            MavCmd::MAV_CMD_DO_SET_MODE,
            MavResult::MAV_RESULT_ACCEPTED,
        )))
        .await;
        peer.send_frame(&vehicle_frame(command_ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_ACCEPTED,
        )))
        .await;
        assert_eq!(arm.await, Ok(()));
        assert_eq!(f.dispatcher.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_closure_fails_the_link() {
        let f = fixture(quiet());
        let peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        peer.send_frame(&heartbeat()).await;
        handle.await.unwrap();
        let pending = f.dispatcher.send(Command::Disarm).unwrap();

        drop(peer);
        f.manager
            .watch()
            .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
            .await
            .unwrap();
        assert!(matches!(pending.await, Err(Error::ConnectionLost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_fails_the_link() {
        let f = fixture(quiet());
        let peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        peer.send_frame(&heartbeat()).await;
        handle.await.unwrap();

        peer.fail(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled"))
            .await;
        let state = f
            .manager
            .watch()
            .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
            .await
            .unwrap()
            .clone();
        match state {
            ConnectionState::Failed(reason) => assert!(reason.contains("cable pulled")),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_published_in_order() {
        let f = fixture(quiet());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        f.bus.subscribe(move |n: &Notification| {
            if let Notification::ConnectionStateChanged(state) = n {
                let _ = tx.send(state.clone());
            }
        });

        let peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();
        peer.send_frame(&heartbeat()).await;
        handle.await.unwrap();
        f.manager.disconnect().await;

        assert_eq!(rx.recv().await, Some(ConnectionState::Connecting));
        assert_eq!(rx.recv().await, Some(ConnectionState::Connected));
        assert_eq!(rx.recv().await, Some(ConnectionState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_handshake_cancels_the_attempt() {
        let f = fixture(quiet());
        let _peer = f.link();
        let handle = f.manager.connect(ConnectionParams::udp(14550)).unwrap();

        f.manager.disconnect().await;
        assert!(matches!(handle.await, Err(Error::ConnectionLost { .. })));
        // the aborted attempt must not overwrite the state later
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }
}
