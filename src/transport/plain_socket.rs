use super::{
    Message, Transport, TransportConfig, TransportError, TransportState, MAX_FRAME_LEN,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Plain blocking-socket transport backend.
///
/// The no-dependency fallback used when the multiplexing backend is not
/// available: ordinary `std::net` sockets driven by dedicated OS threads (an
/// accept thread plus one reader thread per connection) which feed the same
/// inbox contract the mux backend provides. Slower under many concurrent
/// workers, but functionally identical.
pub struct PlainSocketTransport {
    state: TransportState,
    local_addr: Option<SocketAddr>,
    peers: Arc<Mutex<HashMap<String, TcpStream>>>,
    inbox: Option<mpsc::Receiver<Message>>,
    client_stream: Option<TcpStream>,
    shutdown: Arc<AtomicBool>,
    send_timeout: Duration,
    recv_timeout: Option<Duration>,
}

impl Default for PlainSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainSocketTransport {
    pub fn new() -> Self {
        let defaults = TransportConfig::default();
        Self {
            state: TransportState::Uninitialized,
            local_addr: None,
            peers: Arc::new(Mutex::new(HashMap::new())),
            inbox: None,
            client_stream: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            send_timeout: defaults.send_timeout,
            recv_timeout: defaults.recv_timeout,
        }
    }

    fn writer_for(&self, target: &str) -> Result<TcpStream, TransportError> {
        if let Some(stream) = &self.client_stream {
            return Ok(stream.try_clone()?);
        }
        let peers = self.peers.lock();
        let stream = peers
            .get(target)
            .ok_or_else(|| TransportError::Unreachable(target.to_string()))?;
        Ok(stream.try_clone()?)
    }
}

/// Read one length-prefixed envelope frame (blocking).
fn read_frame(stream: &mut TcpStream) -> Result<Message, TransportError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        )));
    }
    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame)?;
    Message::from_bytes(&frame)
}

/// Write one length-prefixed envelope frame (blocking).
fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<(), TransportError> {
    let frame = message.to_bytes()?;
    stream.write_all(&(frame.len() as u32).to_le_bytes())?;
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

fn accept_loop(
    listener: TcpListener,
    peers: Arc<Mutex<HashMap<String, TcpStream>>>,
    inbox: mpsc::Sender<Message>,
    shutdown: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let peers = Arc::clone(&peers);
                let inbox = inbox.clone();
                std::thread::spawn(move || serve_connection(stream, peers, inbox));
            }
            Err(e) => {
                warn!("Failed to accept worker connection: {}", e);
            }
        }
    }
    debug!("Plain socket accept loop stopped");
}

fn serve_connection(
    mut stream: TcpStream,
    peers: Arc<Mutex<HashMap<String, TcpStream>>>,
    inbox: mpsc::Sender<Message>,
) {
    // The first envelope a connection sends identifies its node; register the
    // writer before forwarding it so replies can be routed immediately.
    let first = match read_frame(&mut stream) {
        Ok(message) => message,
        Err(e) => {
            debug!("Connection dropped before identifying itself: {}", e);
            return;
        }
    };
    let node_id = first.node_id.clone();
    match stream.try_clone() {
        Ok(writer) => {
            peers.lock().insert(node_id.clone(), writer);
        }
        Err(e) => {
            warn!("Failed to clone stream for node {}: {}", node_id, e);
            return;
        }
    }
    if inbox.blocking_send(first).is_err() {
        peers.lock().remove(&node_id);
        return;
    }

    loop {
        match read_frame(&mut stream) {
            Ok(message) => {
                if inbox.blocking_send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Connection to node {} closed: {}", node_id, e);
                break;
            }
        }
    }
    peers.lock().remove(&node_id);
}

fn client_reader_loop(mut stream: TcpStream, inbox: mpsc::Sender<Message>) {
    loop {
        match read_frame(&mut stream) {
            Ok(message) => {
                if inbox.blocking_send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Connection to master closed: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for PlainSocketTransport {
    async fn bind(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Plain socket transport binding on: {}", addr);

        let listener = TcpListener::bind(&addr)?;
        self.local_addr = Some(listener.local_addr()?);
        self.send_timeout = config.send_timeout;
        self.recv_timeout = config.recv_timeout;
        self.shutdown.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(config.inbox_depth);
        self.inbox = Some(rx);

        let peers = Arc::clone(&self.peers);
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::spawn(move || accept_loop(listener, peers, tx, shutdown));

        self.state = TransportState::Connected;
        Ok(())
    }

    async fn connect(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let addr_str = format!("{}:{}", config.host, config.port);
        debug!("Plain socket transport connecting to: {}", addr_str);

        let addr = addr_str.to_socket_addrs()?.next().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("could not resolve {}", addr_str),
            ))
        })?;
        let stream = TcpStream::connect_timeout(&addr, config.send_timeout)?;
        stream.set_nodelay(true)?;
        self.send_timeout = config.send_timeout;
        self.recv_timeout = config.recv_timeout;

        let (tx, rx) = mpsc::channel(config.inbox_depth);
        self.inbox = Some(rx);
        let reader = stream.try_clone()?;
        std::thread::spawn(move || client_reader_loop(reader, tx));
        self.client_stream = Some(stream);

        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, target: &str, message: &Message) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }

        let mut stream = self.writer_for(target)?;
        let bound = self.send_timeout;
        let message = message.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            stream.set_write_timeout(Some(bound))?;
            write_frame(&mut stream, &message)
        })
        .await
        .map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;

        match outcome {
            Err(TransportError::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(TransportError::Timeout(bound))
            }
            other => other,
        }
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        let bound = self.recv_timeout;
        let inbox = self.inbox.as_mut().ok_or(TransportError::NotConnected)?;
        match bound {
            Some(bound) => match tokio::time::timeout(bound, inbox.recv()).await {
                Ok(Some(message)) => Ok(message),
                Ok(None) => Err(TransportError::NotConnected),
                Err(_) => Err(TransportError::Timeout(bound)),
            },
            None => inbox.recv().await.ok_or(TransportError::NotConnected),
        }
    }

    async fn disconnect(&mut self, node_id: &str) -> Result<(), TransportError> {
        if let Some(stream) = self.peers.lock().remove(node_id) {
            // Shutting the socket down unblocks the reader thread, which
            // abandons any in-flight operation for this node.
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Disconnected node {}", node_id);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("Closing plain socket transport");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(stream) = self.client_stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let streams: Vec<TcpStream> = self.peers.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Wake the accept thread so it observes the shutdown flag.
        if let Some(addr) = self.local_addr.take() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }
        self.inbox = None;
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Plain Socket"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageKind;

    fn test_config(port: u16) -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        }
    }

    async fn bound_pair() -> (PlainSocketTransport, PlainSocketTransport) {
        let mut master = PlainSocketTransport::new();
        master.bind(&test_config(0)).await.unwrap();
        let port = master.local_addr().unwrap().port();

        let mut worker = PlainSocketTransport::new();
        worker.connect(&test_config(port)).await.unwrap();
        (master, worker)
    }

    #[tokio::test]
    async fn test_plain_socket_round_trip() {
        let (mut master, mut worker) = bound_pair().await;

        worker
            .send(
                "master",
                &Message::new(MessageKind::NodeReady, "worker-1", vec![]),
            )
            .await
            .unwrap();

        let ready = master.receive().await.unwrap();
        assert_eq!(ready.kind, MessageKind::NodeReady);
        assert_eq!(ready.node_id, "worker-1");

        master
            .send(
                "worker-1",
                &Message::new(MessageKind::Command, "master", vec![9, 9]),
            )
            .await
            .unwrap();
        let command = worker.receive().await.unwrap();
        assert_eq!(command.kind, MessageKind::Command);
        assert_eq!(command.payload, vec![9, 9]);

        worker.close().await.unwrap();
        master.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_socket_preserves_per_sender_order() {
        let (mut master, mut worker) = bound_pair().await;

        for i in 0..50u8 {
            worker
                .send(
                    "master",
                    &Message::new(MessageKind::Report, "worker-1", vec![i]),
                )
                .await
                .unwrap();
        }
        for i in 0..50u8 {
            let message = master.receive().await.unwrap();
            assert_eq!(message.payload, vec![i]);
        }

        worker.close().await.unwrap();
        master.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_socket_recv_timeout_yields_timeout_error() {
        let mut master = PlainSocketTransport::new();
        master
            .bind(&TransportConfig {
                recv_timeout: Some(Duration::from_millis(50)),
                ..test_config(0)
            })
            .await
            .unwrap();

        let err = master.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));

        master.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_socket_send_to_unknown_node_is_unreachable() {
        let mut master = PlainSocketTransport::new();
        master.bind(&test_config(0)).await.unwrap();

        let err = master
            .send(
                "ghost",
                &Message::new(MessageKind::Command, "master", vec![]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(ref id) if id == "ghost"));

        master.close().await.unwrap();
    }
}
