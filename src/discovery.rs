//! DNS-SD peer advertisement and browsing.
//!
//! The election core only needs the small [`Discovery`] interface; the
//! production implementation drives an mDNS daemon. Registration uses the
//! conformed machine name so every peer can be recognised, and skipped,
//! by name alone.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Error;

/// How long a targeted re-query keeps draining resolution events.
const RESOLVE_DRAIN: Duration = Duration::from_secs(3);

/// One browse result. `host` is empty until the advertisement has been
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseHit {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl BrowseHit {
    pub fn is_unresolved(&self) -> bool {
        self.host.is_empty()
    }
}

/// The advertisement driver the discovery tick consults. Implementations
/// own their threads; every method is callable from any thread.
pub trait Discovery: Send + Sync + 'static {
    /// Start advertising and browsing. Idempotent.
    fn start(&self);

    /// Stop advertising and browsing, forgetting accumulated hits.
    /// Idempotent.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// The advertised listener port.
    fn port(&self) -> u16;

    /// This node's conformed FQDN, ending `.local.`.
    fn host_name(&self) -> String;

    /// Current browse results, resolved and unresolved alike.
    fn browse(&self) -> Vec<BrowseHit>;

    /// Nudge resolution of a named peer.
    fn resolve(&self, name: &str);
}

fn raw_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".into())
}

/// Map `.` and `_` to `-` and strip trailing `-`: the registrable form of a
/// machine name.
fn conform_instance(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c == '.' || c == '_' { '-' } else { c })
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// This machine's conformed FQDN, ending `.local.`.
pub fn local_host_name() -> String {
    format!("{}.local.", conform_instance(&raw_hostname()))
}

/// mDNS implementation of [`Discovery`].
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    instance: String,
    host_fqdn: String,
    ip: IpAddr,
    port: u16,
    running: Arc<AtomicBool>,
    fullname: Mutex<Option<String>>,
    hits: Arc<Mutex<Vec<BrowseHit>>>,
}

impl MdnsDiscovery {
    /// Create the daemon for a registration name (advertised as
    /// `_<service>._tcp.`) and a listener port.
    pub fn new(service: &str, port: u16) -> Result<Self, Error> {
        let daemon = ServiceDaemon::new()?;
        let ip = local_ip_address::local_ip()?;
        let instance = conform_instance(&raw_hostname());
        let host_fqdn = format!("{instance}.local.");
        Ok(Self {
            daemon,
            service_type: format!("_{service}._tcp.local."),
            instance,
            host_fqdn,
            ip,
            port,
            running: Arc::new(AtomicBool::new(false)),
            fullname: Mutex::new(None),
            hits: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn apply_event(hits: &Mutex<Vec<BrowseHit>>, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceFound(_ty, fullname) => {
                let name = instance_of(&fullname);
                let mut hits = hits.lock();
                // A found-but-unresolved entry must not clobber a
                // resolved one.
                if !hits.iter().any(|h| h.name == name) {
                    hits.push(BrowseHit {
                        name,
                        host: String::new(),
                        port: 0,
                    });
                }
            }
            ServiceEvent::ServiceResolved(info) => {
                let name = instance_of(info.get_fullname());
                let hit = BrowseHit {
                    name: name.clone(),
                    host: info.get_hostname().to_string(),
                    port: info.get_port(),
                };
                let mut hits = hits.lock();
                match hits.iter_mut().find(|h| h.name == name) {
                    Some(existing) => *existing = hit,
                    None => hits.push(hit),
                }
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                let name = instance_of(&fullname);
                hits.lock().retain(|h| h.name != name);
            }
            _ => {}
        }
    }

    fn spawn_drain(
        &self,
        receiver: mdns_sd::Receiver<ServiceEvent>,
        running: Option<Arc<AtomicBool>>,
    ) {
        let hits = Arc::clone(&self.hits);
        thread::spawn(move || {
            let started = std::time::Instant::now();
            loop {
                while let Ok(event) = receiver.try_recv() {
                    Self::apply_event(&hits, event);
                }
                match &running {
                    // The long-lived drain follows the running flag.
                    Some(flag) => {
                        if !flag.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    // A targeted re-query drain is short-lived.
                    None => {
                        if started.elapsed() > RESOLVE_DRAIN {
                            break;
                        }
                    }
                }
                thread::sleep(Duration::from_millis(200));
            }
        });
    }
}

/// The instance portion of a DNS-SD fullname.
fn instance_of(fullname: &str) -> String {
    fullname.split('.').next().unwrap_or(fullname).to_string()
}

impl Discovery for MdnsDiscovery {
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let props: &[(&str, &str)] = &[];
        let service = ServiceInfo::new(
            &self.service_type,
            &self.instance,
            &self.host_fqdn,
            &self.ip.to_string(),
            self.port,
            props,
        );
        match service {
            Ok(service) => {
                let fullname = service.get_fullname().to_string();
                match self.daemon.register(service) {
                    Ok(()) => {
                        *self.fullname.lock() = Some(fullname);
                        info!(
                            instance = %self.instance,
                            port = self.port,
                            "discovery: registered"
                        );
                    }
                    Err(e) => warn!(error = %e, "discovery: registration failed"),
                }
            }
            Err(e) => warn!(error = %e, "discovery: bad service info"),
        }

        match self.daemon.browse(&self.service_type) {
            Ok(receiver) => self.spawn_drain(receiver, Some(Arc::clone(&self.running))),
            Err(e) => warn!(error = %e, "discovery: browse failed"),
        }
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.daemon.stop_browse(&self.service_type);
        if let Some(fullname) = self.fullname.lock().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(error = %e, "discovery: unregister failed");
            }
        }
        self.hits.lock().clear();
        info!(instance = %self.instance, "discovery: stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn host_name(&self) -> String {
        self.host_fqdn.clone()
    }

    fn browse(&self) -> Vec<BrowseHit> {
        self.hits.lock().clone()
    }

    fn resolve(&self, name: &str) {
        if !self.is_running() {
            return;
        }
        debug!(name, "discovery: re-querying");
        match self.daemon.browse(&self.service_type) {
            Ok(receiver) => self.spawn_drain(receiver, None),
            Err(e) => debug!(error = %e, "discovery: re-query failed"),
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        let registered = self.fullname.lock().is_some();
        self.stop();
        let _ = self.daemon.shutdown();
        if registered {
            // Give the daemon time to send its goodbye packet.
            thread::sleep(Duration::from_millis(300));
        }
    }
}
