//! Shared harness for the multi-peer integration tests: a scripted
//! discovery driver and a poll-until-converged helper. No sockets and no
//! mDNS; elections run over the in-process transport.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ensemble::discovery::{BrowseHit, Discovery};

struct StubInner {
    host_name: String,
    port: u16,
    running: AtomicBool,
    hits: Mutex<Vec<BrowseHit>>,
}

/// A discovery driver whose browse results are scripted by the test.
/// Cloneable so the test keeps a handle after the peer takes ownership.
/// Scripted hits survive stop/start: the test environment does not forget
/// its neighbours.
#[derive(Clone)]
pub struct StubDiscovery {
    inner: Arc<StubInner>,
}

impl StubDiscovery {
    pub fn new(host_name: &str, port: u16) -> Self {
        Self {
            inner: Arc::new(StubInner {
                host_name: host_name.to_string(),
                port,
                running: AtomicBool::new(false),
                hits: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Script a resolved browse result.
    pub fn script_hit(&self, name: &str, host: &str, port: u16) {
        self.inner.hits.lock().push(BrowseHit {
            name: name.to_string(),
            host: host.to_string(),
            port,
        });
    }

    /// Script an unresolved browse result (empty host).
    pub fn script_unresolved(&self, name: &str) {
        self.inner.hits.lock().push(BrowseHit {
            name: name.to_string(),
            host: String::new(),
            port: 0,
        });
    }
}

impl Discovery for StubDiscovery {
    fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn port(&self) -> u16 {
        self.inner.port
    }

    fn host_name(&self) -> String {
        self.inner.host_name.clone()
    }

    fn browse(&self) -> Vec<BrowseHit> {
        self.inner.hits.lock().clone()
    }

    fn resolve(&self, _name: &str) {}
}

/// Route crate logs into the test harness. Safe to call from every test.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Poll `pred` until it holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Tick every peer in order until the predicate holds. Handoff drains run
/// inline, so rounds involving one can take half a second.
pub fn run_ticks_until(
    timeout: Duration,
    mut tick_all: impl FnMut(),
    mut pred: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        tick_all();
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}
