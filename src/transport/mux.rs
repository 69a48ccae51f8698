use super::{
    Message, Transport, TransportConfig, TransportError, TransportState, MAX_FRAME_LEN,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Asynchronous multiplexing transport backend.
///
/// The master side accepts any number of worker connections; one reader task
/// per connection forwards decoded envelopes into a single inbox, and writers
/// are addressed by node id. A connection is associated with its node id by
/// the first envelope it sends (workers announce themselves with
/// `NodeReady`), so the master can route commands back to it from then on.
pub struct MuxTransport {
    state: TransportState,
    local_addr: Option<SocketAddr>,
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    inbox: Option<mpsc::Receiver<Message>>,
    accept_task: Option<JoinHandle<()>>,
    client: Option<ClientChannel>,
    send_timeout: Duration,
    recv_timeout: Option<Duration>,
}

struct Peer {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Set once the reader task is running; absent only during adoption.
    reader: Option<JoinHandle<()>>,
}

struct ClientChannel {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

impl Default for MuxTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxTransport {
    pub fn new() -> Self {
        let defaults = TransportConfig::default();
        Self {
            state: TransportState::Uninitialized,
            local_addr: None,
            peers: Arc::new(Mutex::new(HashMap::new())),
            inbox: None,
            accept_task: None,
            client: None,
            send_timeout: defaults.send_timeout,
            recv_timeout: defaults.recv_timeout,
        }
    }
}

/// Read one length-prefixed envelope frame.
async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Message, TransportError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        )));
    }
    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame).await?;
    Message::from_bytes(&frame)
}

/// Write one length-prefixed envelope frame.
async fn write_frame(
    stream: &mut OwnedWriteHalf,
    message: &Message,
) -> Result<(), TransportError> {
    let frame = message.to_bytes()?;
    stream.write_all(&(frame.len() as u32).to_le_bytes()).await?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Configure socket options for low latency, the same way on both sides.
fn tune_socket(stream: TcpStream, buffer_size: usize) -> Result<TcpStream, TransportError> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(TcpStream::from_std(std_stream)?)
}

/// Associate a fresh connection with a node id and start its reader task.
async fn adopt_connection(
    stream: TcpStream,
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    inbox: mpsc::Sender<Message>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let first = match read_frame(&mut read_half).await {
        Ok(message) => message,
        Err(e) => {
            debug!("Connection dropped before identifying itself: {}", e);
            return;
        }
    };
    let node_id = first.node_id.clone();
    debug!("Connection identified as node {}", node_id);

    // Register the writer before the first message becomes visible, so the
    // master can address this node as soon as it sees the message. The reader
    // starts only afterwards to keep per-sender ordering intact.
    {
        let mut peers = peers.lock().await;
        let previous = peers.insert(
            node_id.clone(),
            Peer {
                writer: Arc::new(Mutex::new(write_half)),
                reader: None,
            },
        );
        // A reconnecting node replaces its stale connection.
        if let Some(previous) = previous {
            if let Some(reader) = previous.reader {
                reader.abort();
            }
        }
    }

    if inbox.send(first).await.is_err() {
        peers.lock().await.remove(&node_id);
        return;
    }

    let reader = tokio::spawn(reader_loop(node_id.clone(), read_half, inbox));
    let mut peers = peers.lock().await;
    match peers.get_mut(&node_id) {
        Some(peer) => peer.reader = Some(reader),
        // Disconnected while adopting; abandon the reader.
        None => reader.abort(),
    }
}

async fn reader_loop(
    node_id: String,
    mut read_half: OwnedReadHalf,
    inbox: mpsc::Sender<Message>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(message) => {
                if inbox.send(message).await.is_err() {
                    debug!("Inbox closed, stopping reader for node {}", node_id);
                    break;
                }
            }
            Err(e) => {
                debug!("Connection to node {} closed: {}", node_id, e);
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for MuxTransport {
    async fn bind(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Mux transport binding on: {}", addr);

        let listener = TcpListener::bind(&addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        self.send_timeout = config.send_timeout;
        self.recv_timeout = config.recv_timeout;

        let (tx, rx) = mpsc::channel(config.inbox_depth);
        self.inbox = Some(rx);

        let peers = Arc::clone(&self.peers);
        let buffer_size = config.buffer_size;
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted worker connection from {}", peer_addr);
                        let stream = match tune_socket(stream, buffer_size) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("Failed to tune accepted socket: {}", e);
                                continue;
                            }
                        };
                        tokio::spawn(adopt_connection(
                            stream,
                            Arc::clone(&peers),
                            tx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept worker connection: {}", e);
                        break;
                    }
                }
            }
        }));

        self.state = TransportState::Connected;
        Ok(())
    }

    async fn connect(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Mux transport connecting to: {}", addr);

        let stream = TcpStream::connect(&addr).await?;
        let stream = tune_socket(stream, config.buffer_size)?;
        self.send_timeout = config.send_timeout;
        self.recv_timeout = config.recv_timeout;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.inbox_depth);
        self.inbox = Some(rx);
        let reader = tokio::spawn(reader_loop("master".to_string(), read_half, tx));
        self.client = Some(ClientChannel {
            writer: Arc::new(Mutex::new(write_half)),
            reader,
        });

        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send(&mut self, target: &str, message: &Message) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }

        let writer = if let Some(client) = &self.client {
            Arc::clone(&client.writer)
        } else {
            let peers = self.peers.lock().await;
            let peer = peers
                .get(target)
                .ok_or_else(|| TransportError::Unreachable(target.to_string()))?;
            Arc::clone(&peer.writer)
        };

        let bound = self.send_timeout;
        match timeout(bound, async {
            let mut writer = writer.lock().await;
            write_frame(&mut writer, message).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(bound)),
        }
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        let bound = self.recv_timeout;
        let inbox = self.inbox.as_mut().ok_or(TransportError::NotConnected)?;
        match bound {
            Some(bound) => match timeout(bound, inbox.recv()).await {
                Ok(Some(message)) => Ok(message),
                Ok(None) => Err(TransportError::NotConnected),
                Err(_) => Err(TransportError::Timeout(bound)),
            },
            None => inbox.recv().await.ok_or(TransportError::NotConnected),
        }
    }

    async fn disconnect(&mut self, node_id: &str) -> Result<(), TransportError> {
        if let Some(peer) = self.peers.lock().await.remove(node_id) {
            if let Some(reader) = peer.reader {
                reader.abort();
            }
            debug!("Disconnected node {}", node_id);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("Closing mux transport");
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(client) = self.client.take() {
            client.reader.abort();
        }
        let mut peers = self.peers.lock().await;
        for (_, peer) in peers.drain() {
            if let Some(reader) = peer.reader {
                reader.abort();
            }
        }
        drop(peers);
        self.inbox = None;
        self.local_addr = None;
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Mux"
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

    async fn bound_pair() -> (MuxTransport, MuxTransport) {
        let mut master = MuxTransport::new();
        master.bind(&test_config(0)).await.unwrap();
        let port = master.local_addr().unwrap().port();

        let mut worker = MuxTransport::new();
        worker.connect(&test_config(port)).await.unwrap();
        (master, worker)
    }

    #[tokio::test]
    async fn test_mux_round_trip() {
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
                &Message::new(MessageKind::Command, "master", vec![1, 2, 3]),
            )
            .await
            .unwrap();
        let command = worker.receive().await.unwrap();
        assert_eq!(command.kind, MessageKind::Command);
        assert_eq!(command.payload, vec![1, 2, 3]);

        worker.close().await.unwrap();
        master.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mux_preserves_per_sender_order() {
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
    async fn test_mux_send_to_unknown_node_is_unreachable() {
        let mut master = MuxTransport::new();
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

    #[tokio::test]
    async fn test_mux_recv_timeout_yields_timeout_error() {
        let mut master = MuxTransport::new();
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
    async fn test_mux_send_times_out_when_peer_never_reads() {
        let mut master = MuxTransport::new();
        master
            .bind(&TransportConfig {
                send_timeout: Duration::from_millis(100),
                buffer_size: 4096,
                ..test_config(0)
            })
            .await
            .unwrap();
        let addr = master.local_addr().unwrap();

        // A raw connection that identifies itself and then never reads, so
        // the master's writes back up once the socket buffers fill.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let frame = Message::new(MessageKind::NodeReady, "worker-1", vec![])
            .to_bytes()
            .unwrap();
        stream
            .write_all(&(frame.len() as u32).to_le_bytes())
            .await
            .unwrap();
        stream.write_all(&frame).await.unwrap();
        master.receive().await.unwrap();

        let big = Message::new(MessageKind::Command, "master", vec![0u8; 1 << 20]);
        let mut timed_out = false;
        for _ in 0..64 {
            match master.send("worker-1", &big).await {
                Ok(()) => continue,
                Err(TransportError::Timeout(_)) => {
                    timed_out = true;
                    break;
                }
                Err(e) => panic!("unexpected send error: {e}"),
            }
        }
        assert!(timed_out);

        drop(stream);
        master.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mux_disconnect_abandons_node() {
        let (mut master, mut worker) = bound_pair().await;

        worker
            .send(
                "master",
                &Message::new(MessageKind::NodeReady, "worker-1", vec![]),
            )
            .await
            .unwrap();
        master.receive().await.unwrap();

        master.disconnect("worker-1").await.unwrap();
        let err = master
            .send(
                "worker-1",
                &Message::new(MessageKind::Command, "master", vec![]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));

        worker.close().await.unwrap();
        master.close().await.unwrap();
    }
}
