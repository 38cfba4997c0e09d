use thiserror::Error;

/// Failures surfaced while bringing a peer up.
///
/// Everything that can go wrong after startup is recovered locally: failed
/// connection attempts are retried by the discovery tick, undecodable frames
/// are logged and dropped, and socket loss arrives as a close callback.
#[derive(Debug, Error)]
pub enum Error {
    /// The DNS-SD daemon could not be created or the service could not be
    /// registered.
    #[error("service discovery failure: {0}")]
    Discovery(#[from] mdns_sd::Error),

    /// No usable local address to advertise.
    #[error("no usable local address: {0}")]
    LocalAddress(#[from] local_ip_address::Error),
}
