use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 单个UDP数据报的最大长度
pub const MAX_DATAGRAM: usize = 65536;

/// 发送队列长度
const OUTBOUND_QUEUE: usize = 1024;

/// 连续接收失败时的最长等待
const MAX_RECV_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,
}

/// Datagram transport used by the engine.
///
/// Sending only queues the datagram; it never blocks on the network.
pub trait Transport: Send + Sync {
    fn send_datagram(&self, data: Vec<u8>, addr: SocketAddr) -> Result<(), TransportError>;

    /// Port we are reachable on, as announced to peers
    fn local_port(&self) -> u16;

    fn close(&self) {}
}

/// DHT网络传输层
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    outbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// 绑定UDP端口并启动发送任务
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("DHT transport bound to {}", local_addr);

        let (outbound, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(OUTBOUND_QUEUE);
        let send_socket = Arc::clone(&socket);
        let sender = tokio::spawn(async move {
            while let Some((data, target)) = rx.recv().await {
                if let Err(e) = send_socket.send_to(&data, target).await {
                    debug!("Failed to send datagram to {}: {}", target, e);
                }
            }
            debug!("DHT transport send task stopped");
        });

        Ok(Self {
            socket,
            local_addr,
            outbound,
            tasks: Mutex::new(vec![sender]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn open_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// 启动接收任务，每个数据报交给 `handler`
    pub fn spawn_receiver<F>(&self, handler: F)
    where
        F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
    {
        let socket = Arc::clone(&self.socket);
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            let mut failures = 0u32;

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        failures = 0;
                        handler(&buffer[..len], addr);
                    }
                    Err(e) if is_transient(e.kind()) => {
                        // Windows 上对端关闭会在这里报错，继续接收
                        debug!("Ignoring receive error: {}", e);
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        if failures == 1 {
                            warn!("Failed to receive datagram: {}", e);
                        }
                        tokio::time::sleep(recv_backoff(failures)).await;
                    }
                }
            }
        });

        self.tasks.lock().push(task);
    }
}

impl Transport for UdpTransport {
    fn send_datagram(&self, data: Vec<u8>, addr: SocketAddr) -> Result<(), TransportError> {
        self.outbound.try_send((data, addr)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("DHT transport on {} closed", self.local_addr);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}

/// 第 n 次连续失败后的等待时间, 从 10ms 起翻倍
fn recv_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(10);
    (Duration::from_millis(10) * (1u32 << shift)).min(MAX_RECV_BACKOFF)
}

/// In-memory transport recording every datagram, for tests and embedding
pub struct MemoryTransport {
    port: u16,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    closed: Mutex<bool>,
}

impl MemoryTransport {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    /// Drains the datagrams sent so far
    pub fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drains sent datagrams as text lines
    pub fn take_lines(&self) -> Vec<(String, SocketAddr)> {
        self.take_sent()
            .into_iter()
            .map(|(data, addr)| (String::from_utf8_lossy(&data).into_owned(), addr))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Transport for MemoryTransport {
    fn send_datagram(&self, data: Vec<u8>, addr: SocketAddr) -> Result<(), TransportError> {
        if *self.closed.lock() {
            error!("Send on closed memory transport");
            return Err(TransportError::Closed);
        }
        self.sent.lock().push((data, addr));
        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}
