//! Newline-delimited JSON broadcast server.
//!
//! Clients connect over TCP and only ever receive. Each accepted connection
//! gets its own bounded line queue drained by a writer task; the fan-out loop
//! serializes an event once and hands the line to every queue without
//! waiting. A client whose queue is full, whose write fails or times out, or
//! that hangs up is removed from the set and closed. New clients receive
//! events published after they connect, never a backlog: lines for events
//! stamped before a client registered are withheld from it even when they
//! were still queued in the bus at connect time.

use chrono::{DateTime, Utc};
use drift_common::Event;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Line = Arc<str>;

struct Client {
    tx: mpsc::Sender<Line>,
    connected_at: DateTime<Utc>,
}

/// Live connections, shared by the accept loop, the fan-out loop and writers
#[derive(Clone, Default)]
pub struct ClientSet {
    inner: Arc<Mutex<HashMap<u64, Client>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientSet {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(&self, tx: mpsc::Sender<Line>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Client {
            tx,
            connected_at: Utc::now(),
        };
        self.lock().insert(id, client);
        id
    }

    fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Queue a line for every client connected by `ts`, pruning stalled or
    /// closed ones
    fn send_all(&self, line: &Line, ts: DateTime<Utc>) {
        self.lock().retain(|id, client| {
            if ts < client.connected_at {
                return true;
            }
            match client.tx.try_send(Line::clone(line)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Client {} stalled, dropping connection", id);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Forget every client; writers flush what is queued and close
    fn close_all(&self) -> usize {
        let mut clients = self.lock();
        let count = clients.len();
        clients.clear();
        count
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Client>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct BroadcastServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    clients: ClientSet,
    write_timeout: Duration,
    client_queue: usize,
}

impl BroadcastServer {
    /// Bind the listening socket
    pub async fn bind<A: ToSocketAddrs>(addr: A, write_timeout: Duration, client_queue: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Broadcast server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            clients: ClientSet::default(),
            write_timeout,
            client_queue: client_queue.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the live connection set
    pub fn clients(&self) -> ClientSet {
        self.clients.clone()
    }

    /// Accept clients and stream `events` to them until cancelled
    pub async fn run(self, events: mpsc::Receiver<Event>, cancel: CancellationToken) {
        // Each writer holds a clone; recv() returns None once all have exited
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        tokio::join!(
            self.accept_loop(done_tx, cancel.clone()),
            self.fanout_loop(events, cancel.clone()),
        );

        let closed = self.clients.close_all();
        info!("Broadcast server closing {} connections", closed);
        let _ = done_rx.recv().await;
        info!("Broadcast server stopped");
    }

    async fn accept_loop(&self, done_tx: mpsc::Sender<()>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.register(stream, peer, done_tx.clone()),
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
            }
        }
    }

    fn register(&self, stream: TcpStream, peer: SocketAddr, done_tx: mpsc::Sender<()>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let (lines_tx, lines_rx) = mpsc::channel(self.client_queue);
        let id = self.clients.insert(lines_tx);
        info!("Client {} connected from {} ({} live)", id, peer, self.clients.len());

        let (reader, writer) = stream.into_split();
        let clients = self.clients.clone();
        let write_timeout = self.write_timeout;
        tokio::spawn(async move {
            client_writer(id, peer, reader, writer, lines_rx, write_timeout, clients).await;
            drop(done_tx);
        });
    }

    async fn fanout_loop(&self, mut events: mpsc::Receiver<Event>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.broadcast(&event),
                    None => {
                        info!("Event stream closed");
                        break;
                    }
                },
            }
        }
    }

    fn broadcast(&self, event: &Event) {
        let line: Line = match event.to_json_line() {
            Ok(line) => line.into(),
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.kind(), e);
                return;
            }
        };
        debug!("Broadcasting {}", line.trim_end());
        self.clients.send_all(&line, event.timestamp());
    }
}

async fn client_writer(
    id: u64,
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut lines: mpsc::Receiver<Line>,
    write_timeout: Duration,
    clients: ClientSet,
) {
    let mut discard = [0u8; 512];
    let reason = loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => match timeout(write_timeout, writer.write_all(line.as_bytes())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break format!("write failed: {}", e),
                    Err(_) => break "write timed out".to_string(),
                },
                None => break "server closed connection".to_string(),
            },
            // Clients never speak; reading only notices hang-ups early
            read = reader.read(&mut discard) => match read {
                Ok(0) => break "client hung up".to_string(),
                Ok(_) => {}
                Err(e) => break format!("read failed: {}", e),
            },
        }
    };

    clients.remove(id);
    let _ = timeout(write_timeout, writer.shutdown()).await;
    info!("Client {} ({}) disconnected: {}", id, peer, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_common::{SettingRef, Value};
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn wait_for_clients(clients: &ClientSet, n: usize) {
        for _ in 0..500 {
            if clients.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, have {}", n, clients.len());
    }

    fn event(n: i64) -> Event {
        Event::mutation(SettingRef::new("ns", "x"), n.into(), (n + 1).into())
    }

    #[tokio::test]
    async fn test_every_client_gets_every_line_in_order() {
        let server = BroadcastServer::bind("127.0.0.1:0", Duration::from_millis(500), 16)
            .await
            .unwrap();
        let addr = server.local_addr();
        let clients = server.clients();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(rx, cancel.clone()));

        let a = TcpStream::connect(addr).await.unwrap();
        let b = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&clients, 2).await;

        for n in 0..3 {
            tx.send(event(n)).await.unwrap();
        }

        for stream in [a, b] {
            let mut lines = BufReader::new(stream).lines();
            for n in 0..3 {
                let line = lines.next_line().await.unwrap().unwrap();
                match Event::from_json_line(&line).unwrap() {
                    Event::Mutation { old, .. } => assert_eq!(old, Value::Integer(n)),
                    other => panic!("unexpected event {:?}", other),
                }
            }
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_hung_up_client_is_pruned() {
        let server = BroadcastServer::bind("127.0.0.1:0", Duration::from_millis(500), 16)
            .await
            .unwrap();
        let addr = server.local_addr();
        let clients = server.clients();
        let (_tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(rx, cancel.clone()));

        let gone = TcpStream::connect(addr).await.unwrap();
        let _kept = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&clients, 2).await;

        drop(gone);
        wait_for_clients(&clients, 1).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let server = BroadcastServer::bind("127.0.0.1:0", Duration::from_millis(500), 16)
            .await
            .unwrap();
        let addr = server.local_addr();
        let clients = server.clients();
        let (_tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(rx, cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&clients, 1).await;

        cancel.cancel();
        handle.await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_client_times_out_without_stalling_others() {
        let server = BroadcastServer::bind("127.0.0.1:0", Duration::from_millis(200), 1024)
            .await
            .unwrap();
        let addr = server.local_addr();
        let clients = server.clients();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(rx, cancel.clone()));

        // Connected but never reads; the socket buffers fill and writes block
        let _stuck = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&clients, 1).await;
        let reader = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&clients, 2).await;

        const LINES: usize = 400;
        let reading = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut received = 0;
            while received < LINES {
                match lines.next_line().await {
                    Ok(Some(_)) => received += 1,
                    _ => break,
                }
            }
            received
        });

        let process = "x".repeat(64 * 1024);
        for pid in 0..LINES as u32 {
            tx.send(Event::connection(process.as_str(), pid, "10.0.0.1:443")).await.unwrap();
        }

        let received = timeout(Duration::from_secs(20), reading).await.unwrap().unwrap();
        assert_eq!(received, LINES);
        wait_for_clients(&clients, 1).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_full_queue_drops_client() {
        let clients = ClientSet::default();
        let (tx, _rx) = mpsc::channel(1);
        clients.insert(tx);

        let line: Line = Arc::from("{}\n");
        clients.send_all(&line, Utc::now());
        assert_eq!(clients.len(), 1);
        clients.send_all(&line, Utc::now());
        assert_eq!(clients.len(), 0);
    }

    #[test]
    fn test_events_stamped_before_connect_are_withheld() {
        let clients = ClientSet::default();
        let (tx, mut rx) = mpsc::channel(4);
        clients.insert(tx);

        let line: Line = Arc::from("{}\n");
        clients.send_all(&line, Utc::now() - chrono::Duration::seconds(1));
        assert!(rx.try_recv().is_err());

        clients.send_all(&line, Utc::now());
        assert_eq!(rx.try_recv().unwrap(), line);
        assert_eq!(clients.len(), 1);
    }
}
