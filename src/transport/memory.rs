//! In-process transport.
//!
//! A process-wide hub routes connects to listeners by port and delivers
//! frames on per-direction threads, so callback concurrency looks exactly
//! like the socket transport. Backs the integration tests and single-host
//! setups; hosts are not routed, so every listener needs its own port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use super::{ClientDelegate, ClientTransport, ConnectionId, ServerDelegate, ServerTransport};

static HUB: Lazy<Hub> = Lazy::new(Hub::default);

#[derive(Default)]
struct Hub {
    listeners: Mutex<HashMap<u16, Arc<ServerInner>>>,
}

enum Frame {
    Data(Vec<u8>),
    Close,
}

struct ServerInner {
    delegate: Weak<dyn ServerDelegate>,
    connections: Mutex<HashMap<ConnectionId, Sender<Frame>>>,
    next_id: AtomicUsize,
    open: AtomicBool,
    port: u16,
}

/// In-process listener.
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl ServerTransport for MemoryServer {
    fn bind(port: u16, _path: &str, delegate: Weak<dyn ServerDelegate>) -> Option<Self> {
        let mut listeners = HUB.listeners.lock();
        if let Some(existing) = listeners.get(&port) {
            if existing.open.load(Ordering::SeqCst) {
                debug!(port, "memory: port taken");
                return None;
            }
        }

        let inner = Arc::new(ServerInner {
            delegate,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            port,
        });
        listeners.insert(port, Arc::clone(&inner));
        debug!(port, "memory: listening");
        Some(Self { inner })
    }

    fn send(&self, id: ConnectionId, data: &[u8]) -> bool {
        let sender = match self.inner.connections.lock().get(&id) {
            Some(s) => s.clone(),
            None => return false,
        };
        let _ = sender.send(Frame::Data(data.to_vec()));
        true
    }

    fn broadcast(&self, data: &[u8]) {
        let senders: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        for sender in senders {
            let _ = sender.send(Frame::Data(data.to_vec()));
        }
    }

    fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    fn close(&self) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<_> = self.inner.connections.lock().drain().collect();
        for (_, sender) in connections {
            let _ = sender.send(Frame::Close);
        }
        let mut listeners = HUB.listeners.lock();
        if let Some(current) = listeners.get(&self.inner.port) {
            if Arc::ptr_eq(current, &self.inner) {
                listeners.remove(&self.inner.port);
            }
        }
        debug!(port = self.inner.port, "memory: closed");
    }
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct ClientInner {
    to_server: Sender<Frame>,
    closed: AtomicBool,
}

/// One in-process connection.
pub struct MemoryClient {
    inner: Arc<ClientInner>,
}

impl MemoryClient {
    fn pump_server_side(
        server: Arc<ServerInner>,
        id: ConnectionId,
        from_client: Receiver<Frame>,
    ) {
        loop {
            match from_client.recv() {
                Ok(Frame::Data(data)) => {
                    let Some(delegate) = server.delegate.upgrade() else {
                        break;
                    };
                    delegate.on_data(id, &data);
                }
                Ok(Frame::Close) | Err(_) => break,
            }
        }
        if server.connections.lock().remove(&id).is_some() {
            if let Some(delegate) = server.delegate.upgrade() {
                delegate.on_close(id);
            }
        }
    }

    fn pump_client_side(delegate: Weak<dyn ClientDelegate>, from_server: Receiver<Frame>) {
        loop {
            match from_server.recv() {
                Ok(Frame::Data(data)) => {
                    let Some(delegate) = delegate.upgrade() else {
                        break;
                    };
                    delegate.on_data(&data);
                }
                Ok(Frame::Close) | Err(_) => break,
            }
        }
        if let Some(delegate) = delegate.upgrade() {
            delegate.on_close();
        }
    }
}

impl ClientTransport for MemoryClient {
    fn connect(
        host: &str,
        port: u16,
        _path: &str,
        delegate: Weak<dyn ClientDelegate>,
    ) -> Option<Self> {
        let server = {
            let listeners = HUB.listeners.lock();
            let server = listeners.get(&port)?;
            if !server.open.load(Ordering::SeqCst) {
                return None;
            }
            Arc::clone(server)
        };
        let server_delegate = server.delegate.upgrade()?;

        let (to_server, from_client) = mpsc::channel();
        let (to_client, from_server) = mpsc::channel();

        let id = server.next_id.fetch_add(1, Ordering::SeqCst);
        server.connections.lock().insert(id, to_client);
        if !server.open.load(Ordering::SeqCst) {
            // Lost a race against a concurrent close.
            server.connections.lock().remove(&id);
            return None;
        }

        {
            let server = Arc::clone(&server);
            thread::spawn(move || Self::pump_server_side(server, id, from_client));
        }
        thread::spawn(move || Self::pump_client_side(delegate, from_server));

        server_delegate.on_connect(id);
        server_delegate.on_ready(id);
        debug!(host, port, id, "memory: connected");

        Some(Self {
            inner: Arc::new(ClientInner {
                to_server,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn send(&self, data: &[u8]) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            let _ = self.inner.to_server.send(Frame::Data(data.to_vec()));
        }
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.to_server.send(Frame::Close);
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingServer {
        data: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
        closed: Mutex<Vec<ConnectionId>>,
    }

    impl ServerDelegate for RecordingServer {
        fn on_data(&self, id: ConnectionId, data: &[u8]) {
            self.data.lock().push((id, data.to_vec()));
        }

        fn on_close(&self, id: ConnectionId) {
            self.closed.lock().push(id);
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        data: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl ClientDelegate for RecordingClient {
        fn on_data(&self, data: &[u8]) {
            self.data.lock().push(data.to_vec());
        }

        fn on_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn routes_frames_and_closes() {
        let server_delegate = Arc::new(RecordingServer::default());
        let server = MemoryServer::bind(
            41001,
            "/ws",
            Arc::downgrade(&server_delegate) as Weak<dyn ServerDelegate>,
        )
        .expect("free port");

        let client_delegate = Arc::new(RecordingClient::default());
        let client = MemoryClient::connect(
            "anywhere.local.",
            41001,
            "/ws",
            Arc::downgrade(&client_delegate) as Weak<dyn ClientDelegate>,
        )
        .expect("listener present");

        client.send(b"hello");
        assert!(wait_until(Duration::from_secs(1), || {
            !server_delegate.data.lock().is_empty()
        }));
        let id = server_delegate.data.lock()[0].0;

        assert!(server.send(id, b"welcome"));
        assert!(wait_until(Duration::from_secs(1), || {
            !client_delegate.data.lock().is_empty()
        }));

        client.close();
        assert!(wait_until(Duration::from_secs(1), || {
            server_delegate.closed.lock().contains(&id)
        }));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn connect_without_listener_fails() {
        let delegate = Arc::new(RecordingClient::default());
        assert!(MemoryClient::connect(
            "nowhere.local.",
            41002,
            "/ws",
            Arc::downgrade(&delegate) as Weak<dyn ClientDelegate>,
        )
        .is_none());
    }

    #[test]
    fn double_bind_is_refused_until_close() {
        let delegate = Arc::new(RecordingServer::default());
        let weak = || Arc::downgrade(&delegate) as Weak<dyn ServerDelegate>;

        let first = MemoryServer::bind(41003, "/ws", weak()).expect("free port");
        assert!(MemoryServer::bind(41003, "/ws", weak()).is_none());
        first.close();
        assert!(MemoryServer::bind(41003, "/ws", weak()).is_some());
    }

    #[test]
    fn server_close_reaches_client() {
        let server_delegate = Arc::new(RecordingServer::default());
        let server = MemoryServer::bind(
            41004,
            "/ws",
            Arc::downgrade(&server_delegate) as Weak<dyn ServerDelegate>,
        )
        .expect("free port");

        let client_delegate = Arc::new(RecordingClient::default());
        let _client = MemoryClient::connect(
            "anywhere.local.",
            41004,
            "/ws",
            Arc::downgrade(&client_delegate) as Weak<dyn ClientDelegate>,
        )
        .expect("listener present");

        server.close();
        assert!(wait_until(Duration::from_secs(1), || {
            client_delegate.closed.load(Ordering::SeqCst)
        }));
    }
}
