//! Byte transports underneath the link.
//!
//! A transport is opened into a [`Link`]: a receiver of inbound byte chunks
//! and a sender for outbound frames. The actual socket or serial port is
//! owned by background tasks (or threads, for the blocking serial API) that
//! stop as soon as the link is dropped, which is how resources get released
//! on disconnect.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::TransportKind;
use crate::protocol::{Frame, FrameDecoder};

const INBOUND_CHANNEL_SIZE: usize = 64;
const UDP_BUFFER_SIZE: usize = 2048;
const SERIAL_BUFFER_SIZE: usize = 1024;
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// An opened transport, as seen by the link task.
#[derive(Debug)]
pub struct Link {
    pub(crate) inbound: mpsc::Receiver<io::Result<Vec<u8>>>,
    pub(crate) outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Link {
    pub fn new(
        inbound: mpsc::Receiver<io::Result<Vec<u8>>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Link {
        Link { inbound, outbound }
    }

    /// A link whose other end is driven in-process, e.g. by a simulator.
    pub fn in_memory() -> (Link, LinkPeer) {
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Link::new(in_rx, out_tx),
            LinkPeer {
                inbound: in_tx,
                outbound: out_rx,
                decoder: FrameDecoder::new(),
            },
        )
    }
}

/// The vehicle side of an in-memory [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    inbound: mpsc::Sender<io::Result<Vec<u8>>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: FrameDecoder,
}

impl LinkPeer {
    /// Returns `false` once the link has been dropped.
    pub async fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.inbound.send(Ok(bytes)).await.is_ok()
    }

    pub async fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(bytes) => self.send_bytes(bytes).await,
            Err(e) => {
                warn!(error = %e, "cannot encode frame");
                false
            }
        }
    }

    /// Injects a transport failure.
    pub async fn fail(&self, error: io::Error) -> bool {
        self.inbound.send(Err(error)).await.is_ok()
    }

    /// Next frame written by the link, `None` once it is closed.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            while let Some(frame) = self.decoder.next_frame() {
                if let Ok(frame) = frame {
                    return Some(frame);
                }
            }
            let bytes = self.outbound.recv().await?;
            self.decoder.push(&bytes);
        }
    }

    /// true once the link side has been dropped
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

pub type OpenFuture = Pin<Box<dyn Future<Output = io::Result<Link>> + Send>>;

/// Opens transports. Implemented by [`SystemConnector`] for real hardware;
/// tests and simulators provide their own.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, transport: &TransportKind) -> OpenFuture;
}

/// UDP server socket or serial port, depending on the transport kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn open(&self, transport: &TransportKind) -> OpenFuture {
        match transport.clone() {
            TransportKind::Network { port } => Box::pin(open_udp(port)),
            TransportKind::Serial { device, baud_rate } => {
                Box::pin(open_serial(device, baud_rate))
            }
        }
    }
}

/// Links handed out in order, one per `open`. Opening with an empty queue
/// fails like an absent device would.
#[derive(Debug, Default)]
pub struct QueuedConnector {
    links: Mutex<VecDeque<Link>>,
}

impl QueuedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, link: Link) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(link);
    }
}

impl Connector for QueuedConnector {
    fn open(&self, transport: &TransportKind) -> OpenFuture {
        let link = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let transport = transport.to_string();
        Box::pin(async move {
            link.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no link available for {}", transport),
                )
            })
        })
    }
}

impl<C: Connector> Connector for Arc<C> {
    fn open(&self, transport: &TransportKind) -> OpenFuture {
        (**self).open(transport)
    }
}

/// Binds `0.0.0.0:<port>` and answers whichever peer spoke last.
async fn open_udp(port: u16) -> io::Result<Link> {
    let socket = Arc::new(UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?);
    info!(port, "listening for vehicle on udp");

    let (in_tx, in_rx) = mpsc::channel::<io::Result<Vec<u8>>>(INBOUND_CHANNEL_SIZE);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    let reader_socket = Arc::clone(&socket);
    let reader_peer = Arc::clone(&peer);
    tokio::spawn(async move {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                received = reader_socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => {
                        trace!(len, %addr, "udp datagram");
                        let previous = reader_peer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .replace(addr);
                        if previous != Some(addr) {
                            debug!(%addr, "vehicle peer address");
                        }
                        if in_tx.send(Ok(buf[..len].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = in_tx.send(Err(e)).await;
                        break;
                    }
                },
                _ = in_tx.closed() => break,
            }
        }
        debug!(port, "udp reader stopped");
    });

    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            let addr = *peer.lock().unwrap_or_else(PoisonError::into_inner);
            match addr {
                Some(addr) => {
                    if let Err(e) = socket.send_to(&data, addr).await {
                        warn!(error = %e, %addr, "udp send failed");
                    }
                }
                None => trace!("no vehicle heard yet, dropping outbound frame"),
            }
        }
        debug!("udp writer stopped");
    });

    Ok(Link::new(in_rx, out_tx))
}

/// The serialport API is blocking, so reader and writer run on their own
/// threads and talk to the link through channels.
async fn open_serial(device: String, baud_rate: u32) -> io::Result<Link> {
    let name = device.clone();
    let port = tokio::task::spawn_blocking(move || {
        serialport::new(&name, baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()
    })
    .await
    .map_err(io::Error::other)??;
    let mut writer = port.try_clone()?;
    let reader = port;
    info!(%device, baud_rate, "serial port open");

    let (in_tx, in_rx) = mpsc::channel::<io::Result<Vec<u8>>>(INBOUND_CHANNEL_SIZE);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    std::thread::spawn(move || read_blocking(reader, in_tx));

    std::thread::spawn(move || {
        while let Some(data) = out_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                warn!(error = %e, "serial write failed");
                break;
            }
        }
        debug!("serial writer stopped");
    });

    Ok(Link::new(in_rx, out_tx))
}

/// Forwards whatever `reader` yields until the link is dropped or the
/// reader fails. Reads that time out or come back empty just poll again.
fn read_blocking(mut reader: impl Read, in_tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut buf = [0u8; SERIAL_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(len) if len > 0 => {
                if in_tx.blocking_send(Ok(buf[..len].to_vec())).is_err() {
                    break;
                }
            }
            Ok(_) => {
                if in_tx.is_closed() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if in_tx.is_closed() {
                    break;
                }
            }
            Err(e) => {
                let _ = in_tx.blocking_send(Err(e));
                break;
            }
        }
    }
    debug!("serial reader stopped");
}
