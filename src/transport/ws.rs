//! Blocking WebSocket transport.
//!
//! One accept thread per listener, one read thread per connection. Reads
//! and writes share a socket through a cloned file descriptor, giving each
//! connection an owned reader (no lock held while blocked on the network)
//! and a mutex-guarded writer. Peers of this protocol never send
//! WebSocket-level pings, so the reader half never writes.

use std::collections::HashMap;
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::{Role, WebSocket};
use tungstenite::Message;

use super::{ClientDelegate, ClientTransport, ConnectionId, ServerDelegate, ServerTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

type SharedWriter = Arc<Mutex<WebSocket<TcpStream>>>;

struct ServerInner {
    delegate: Weak<dyn ServerDelegate>,
    connections: Mutex<HashMap<ConnectionId, SharedWriter>>,
    next_id: AtomicUsize,
    shutdown: AtomicBool,
    local_port: u16,
}

/// Listening WebSocket endpoint.
pub struct WsServer {
    inner: Arc<ServerInner>,
}

impl WsServer {
    /// The bound port; useful when binding port 0.
    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    fn accept_loop(listener: TcpListener, inner: Arc<ServerInner>, path: String) {
        loop {
            if inner.shutdown.load(Ordering::SeqCst) || inner.delegate.upgrade().is_none() {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "server: inbound socket");
                    let inner = Arc::clone(&inner);
                    let path = path.clone();
                    thread::spawn(move || Self::run_connection(stream, inner, path));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "server: accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn run_connection(stream: TcpStream, inner: Arc<ServerInner>, path: String) {
        if stream.set_nonblocking(false).is_err() || stream.set_nodelay(true).is_err() {
            return;
        }

        let check_path = |request: &Request, response: Response| {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut reject = ErrorResponse::new(None);
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        };

        let mut reader = match tungstenite::accept_hdr(stream, check_path) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "server: handshake failed");
                return;
            }
        };

        let writer_stream = match reader.get_ref().try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "server: socket clone failed");
                return;
            }
        };
        let writer = WebSocket::from_raw_socket(writer_stream, Role::Server, None);

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        inner
            .connections
            .lock()
            .insert(id, Arc::new(Mutex::new(writer)));

        {
            let Some(delegate) = inner.delegate.upgrade() else {
                inner.connections.lock().remove(&id);
                return;
            };
            delegate.on_connect(id);
            delegate.on_ready(id);
        }
        info!(id, "server: connection ready");

        loop {
            match reader.read() {
                Ok(Message::Binary(data)) => {
                    let Some(delegate) = inner.delegate.upgrade() else {
                        break;
                    };
                    delegate.on_data(id, &data);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(id, error = %e, "server: read ended");
                    break;
                }
            }
        }

        // First path to remove the id delivers the close; a listener
        // shutdown drains the map up front, making this a no-op.
        if inner.connections.lock().remove(&id).is_some() {
            if let Some(delegate) = inner.delegate.upgrade() {
                delegate.on_close(id);
            }
            info!(id, "server: connection closed");
        }
    }
}

impl ServerTransport for WsServer {
    fn bind(port: u16, path: &str, delegate: Weak<dyn ServerDelegate>) -> Option<Self> {
        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(l) => l,
            Err(e) => {
                warn!(port, error = %e, "server: bind failed");
                return None;
            }
        };
        listener.set_nonblocking(true).ok()?;
        let local_port = listener.local_addr().ok()?.port();

        let inner = Arc::new(ServerInner {
            delegate,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            local_port,
        });

        let accept_inner = Arc::clone(&inner);
        let path = path.to_string();
        thread::spawn(move || Self::accept_loop(listener, accept_inner, path));

        info!(port = local_port, "server: listening");
        Some(Self { inner })
    }

    fn send(&self, id: ConnectionId, data: &[u8]) -> bool {
        let writer = match self.inner.connections.lock().get(&id) {
            Some(w) => Arc::clone(w),
            None => return false,
        };
        let mut ws = writer.lock();
        if let Err(e) = ws.send(Message::Binary(data.to_vec())) {
            debug!(id, error = %e, "server: send failed");
            let _ = ws.get_ref().shutdown(Shutdown::Both);
        }
        true
    }

    fn broadcast(&self, data: &[u8]) {
        let writers: Vec<_> = self
            .inner
            .connections
            .lock()
            .iter()
            .map(|(id, w)| (*id, Arc::clone(w)))
            .collect();
        for (id, writer) in writers {
            let mut ws = writer.lock();
            if let Err(e) = ws.send(Message::Binary(data.to_vec())) {
                debug!(id, error = %e, "server: broadcast send failed");
                let _ = ws.get_ref().shutdown(Shutdown::Both);
            }
        }
    }

    fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let writers: Vec<_> = self.inner.connections.lock().drain().collect();
        for (_, writer) in writers {
            let mut ws = writer.lock();
            let _ = ws.close(None);
            let _ = ws.flush();
            let _ = ws.get_ref().shutdown(Shutdown::Both);
        }
        info!(port = self.inner.local_port, "server: closed");
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct ClientInner {
    delegate: Weak<dyn ClientDelegate>,
    writer: Mutex<WebSocket<TcpStream>>,
    closed: AtomicBool,
}

/// One outgoing WebSocket connection.
pub struct WsClient {
    inner: Arc<ClientInner>,
}

impl WsClient {
    fn read_loop(mut reader: WebSocket<TcpStream>, inner: Arc<ClientInner>) {
        loop {
            match reader.read() {
                Ok(Message::Binary(data)) => {
                    let Some(delegate) = inner.delegate.upgrade() else {
                        break;
                    };
                    delegate.on_data(&data);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "client: read ended");
                    break;
                }
            }
        }

        if !inner.closed.swap(true, Ordering::SeqCst) {
            if let Some(delegate) = inner.delegate.upgrade() {
                delegate.on_close();
            }
            info!("client: disconnected");
        }
    }
}

impl ClientTransport for WsClient {
    fn connect(
        host: &str,
        port: u16,
        path: &str,
        delegate: Weak<dyn ClientDelegate>,
    ) -> Option<Self> {
        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next()?,
            Err(e) => {
                debug!(host, port, error = %e, "client: resolution failed");
                return None;
            }
        };

        let stream = match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                debug!(host, port, error = %e, "client: connect failed");
                return None;
            }
        };
        stream.set_nodelay(true).ok();

        let url = format!("ws://{host}:{port}{path}");
        let reader = match tungstenite::client(url.as_str(), stream) {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(host, port, error = %e, "client: handshake failed");
                return None;
            }
        };

        let writer_stream = reader.get_ref().try_clone().ok()?;
        let writer = WebSocket::from_raw_socket(writer_stream, Role::Client, None);

        let inner = Arc::new(ClientInner {
            delegate,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        });

        let read_inner = Arc::clone(&inner);
        thread::spawn(move || Self::read_loop(reader, read_inner));

        info!(host, port, "client: connected");
        Some(Self { inner })
    }

    fn send(&self, data: &[u8]) {
        let mut ws = self.inner.writer.lock();
        if let Err(e) = ws.send(Message::Binary(data.to_vec())) {
            debug!(error = %e, "client: send failed");
            let _ = ws.get_ref().shutdown(Shutdown::Both);
        }
    }

    fn close(&self) {
        let mut ws = self.inner.writer.lock();
        let _ = ws.close(None);
        let _ = ws.flush();
        let _ = ws.get_ref().shutdown(Shutdown::Both);
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingServer {
        ready: Mutex<Vec<ConnectionId>>,
        data: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
        closed: Mutex<Vec<ConnectionId>>,
    }

    impl ServerDelegate for RecordingServer {
        fn on_ready(&self, id: ConnectionId) {
            self.ready.lock().push(id);
        }

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
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn exchanges_frames_both_ways() {
        let server_delegate = Arc::new(RecordingServer::default());
        let server = WsServer::bind(
            0,
            "/ws",
            Arc::downgrade(&server_delegate) as Weak<dyn ServerDelegate>,
        )
        .expect("bind on an ephemeral port");
        let port = server.local_port();

        let client_delegate = Arc::new(RecordingClient::default());
        let client = WsClient::connect(
            "127.0.0.1",
            port,
            "/ws",
            Arc::downgrade(&client_delegate) as Weak<dyn ClientDelegate>,
        )
        .expect("connect to local listener");

        assert!(wait_until(Duration::from_secs(2), || {
            !server_delegate.ready.lock().is_empty()
        }));
        let id = server_delegate.ready.lock()[0];

        client.send(b"to-server");
        assert!(wait_until(Duration::from_secs(2), || {
            !server_delegate.data.lock().is_empty()
        }));
        assert_eq!(server_delegate.data.lock()[0], (id, b"to-server".to_vec()));

        assert!(server.send(id, b"to-client"));
        assert!(wait_until(Duration::from_secs(2), || {
            !client_delegate.data.lock().is_empty()
        }));
        assert_eq!(client_delegate.data.lock()[0], b"to-client".to_vec());

        client.close();
        assert!(wait_until(Duration::from_secs(2), || {
            server_delegate.closed.lock().contains(&id)
        }));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn connect_to_nothing_fails_fast() {
        let delegate = Arc::new(RecordingClient::default());
        // Port 1 on localhost is not listening.
        let client = WsClient::connect(
            "127.0.0.1",
            1,
            "/ws",
            Arc::downgrade(&delegate) as Weak<dyn ClientDelegate>,
        );
        assert!(client.is_none());
    }

    #[test]
    fn send_to_unknown_id_reports_false() {
        let delegate = Arc::new(RecordingServer::default());
        let server = WsServer::bind(
            0,
            "/ws",
            Arc::downgrade(&delegate) as Weak<dyn ServerDelegate>,
        )
        .expect("bind on an ephemeral port");
        assert!(!server.send(42, b"nobody-home"));
    }
}
