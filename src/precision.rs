//! The shared precision clock.
//!
//! The host advances the clock in fixed-size blocks (audio buffers or an
//! equivalent cadence) through [`PrecisionTimer::progress`]. Followers
//! periodically run a four-timestamp exchange with the coordinator and
//! slew their offset by a damped, median-clamped step: a one-off
//! round-trip spike cannot yank the clock, steady drift is corrected.

use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunk;
use crate::discovery::{Discovery, MdnsDiscovery};
use crate::error::Error;
use crate::peer::{NetworkPeer, PeerConfig, PeerDelegate};
use crate::timing::TimeStamp;
use crate::transport::{ClientTransport, ConnectionId, ServerTransport, WsClient, WsServer};
use crate::{codec::Stream, DEFAULT_SAMPLING_RATE};

/// Monotonic runs shorter than this mean a large correction just landed.
const STABLE_RUN_SECS: f64 = 0.1;

/// Filter taps for the slew limiter.
const FILTER_TAPS: usize = 5;

static CPU_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the first use of the process-wide CPU clock.
fn cpu_time_stamp() -> f64 {
    CPU_EPOCH.elapsed().as_secs_f64()
}

/// Fixed-size median filter: a circular buffer of the last `N` inputs,
/// zero-seeded, returning the rank-`N/2` element on every push.
pub struct MedianFilter<T, const N: usize> {
    memory: [T; N],
    cursor: usize,
}

impl<T: Copy + Default + PartialOrd, const N: usize> MedianFilter<T, N> {
    pub fn new() -> Self {
        Self {
            memory: [T::default(); N],
            cursor: 0,
        }
    }

    /// Store the input, then report the median of the window.
    pub fn push(&mut self, input: T) -> T {
        self.memory[self.cursor] = input;
        self.cursor = (self.cursor + 1) % N;

        let mut order: [usize; N] = core::array::from_fn(|i| i);
        order.sort_unstable_by(|&a, &b| {
            self.memory[a]
                .partial_cmp(&self.memory[b])
                .unwrap_or(Ordering::Equal)
        });
        self.memory[order[N / 2]]
    }

    pub fn reset(&mut self) {
        self.memory = [T::default(); N];
        self.cursor = 0;
    }
}

impl<T: Copy + Default + PartialOrd, const N: usize> Default for MedianFilter<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// NTP-style offset from one exchange. The caller passes the coordinator's
/// receive time for both server-side timestamps: the coordinator does not
/// distinguish its receive and send instants.
fn calculate_offset(t1: TimeStamp, t2: TimeStamp, t3: TimeStamp, t4: TimeStamp) -> TimeStamp {
    ((t2 - t1) + (t3 - t4)).half()
}

struct ClockState {
    sampling_rate: f64,
    count: u64,
    monotonic_count: u64,
    offset: TimeStamp,
    last_timestamp: TimeStamp,
    reference: f64,
    filter: MedianFilter<TimeStamp, FILTER_TAPS>,
}

impl ClockState {
    fn new() -> Self {
        Self {
            sampling_rate: DEFAULT_SAMPLING_RATE,
            count: 0,
            monotonic_count: 0,
            offset: TimeStamp::default(),
            last_timestamp: TimeStamp::default(),
            reference: 0.0,
            filter: MedianFilter::new(),
        }
    }

    fn as_time(&self) -> TimeStamp {
        self.offset + TimeStamp::from_samples(self.count, self.sampling_rate)
    }
}

/// A sample-count-driven clock distributed over a [`NetworkPeer`].
/// Followers call [`sync`](Self::sync) at their own cadence; the
/// coordinator answers exchanges implicitly.
pub struct PrecisionTimer<S: ServerTransport, C: ClientTransport, D: Discovery> {
    peer: NetworkPeer<S, C, D>,
    clock: Mutex<ClockState>,
}

/// The production timer: WebSocket transports and mDNS discovery.
pub type LanPrecisionTimer = PrecisionTimer<WsServer, WsClient, MdnsDiscovery>;

impl LanPrecisionTimer {
    /// Build a timer on the production stack.
    pub fn open(config: PeerConfig) -> Result<Arc<Self>, Error> {
        let discovery = MdnsDiscovery::new(&config.service, config.port)?;
        Ok(Self::new(config, discovery))
    }
}

impl<S, C, D> PrecisionTimer<S, C, D>
where
    S: ServerTransport,
    C: ClientTransport,
    D: Discovery,
{
    /// Build a timer around an externally constructed discovery driver and
    /// register it as the peer's payload handler.
    pub fn new(config: PeerConfig, discovery: D) -> Arc<Self> {
        let timer = Arc::new(Self {
            peer: NetworkPeer::new(config, discovery),
            clock: Mutex::new(ClockState::new()),
        });
        let delegate_arc: Arc<dyn PeerDelegate> = timer.clone();
        let delegate: Weak<dyn PeerDelegate> = Arc::downgrade(&delegate_arc);
        timer.peer.set_delegate(delegate);
        timer
    }

    /// The embedded peer; the host drives its `discover` tick.
    pub fn network(&self) -> &NetworkPeer<S, C, D> {
        &self.peer
    }

    /// Advance the clock by a processed block. Safe to call from a
    /// realtime-sensitive thread; the only block is a short uncontended
    /// mutex.
    pub fn progress(&self, count: u64) {
        let mut clock = self.clock.lock();
        if clock.count == 0 {
            clock.reference = cpu_time_stamp();
        }
        clock.count += count;

        let now = clock.as_time();
        if now <= clock.last_timestamp {
            // The offset slewed us backwards past the previous reading;
            // a new monotonic run starts here.
            clock.monotonic_count = 0;
        } else {
            clock.monotonic_count += count;
        }
        clock.last_timestamp = now;
    }

    /// Corrected time: offset plus samples at the sampling rate.
    pub fn as_time(&self) -> TimeStamp {
        self.clock.lock().as_time()
    }

    /// Corrected time as a signed sample count.
    pub fn as_samples(&self) -> i64 {
        let clock = self.clock.lock();
        clock.offset.as_samples(clock.sampling_rate) + clock.count as i64
    }

    /// The timestamp placed in sync exchanges.
    pub fn timestamp(&self) -> TimeStamp {
        self.as_time()
    }

    pub fn count(&self) -> u64 {
        self.clock.lock().count
    }

    /// Seconds of the current monotonic run.
    pub fn monotonic_time(&self) -> f64 {
        let clock = self.clock.lock();
        clock.monotonic_count as f64 / clock.sampling_rate
    }

    /// False while the clock is within a fresh correction; runs shorter
    /// than 100 ms mean a large recent slew.
    pub fn is_stable(&self) -> bool {
        self.monotonic_time() >= STABLE_RUN_SECS
    }

    /// Restart counting from `count`. The accumulated offset survives a
    /// reset; the filter and the monotonic run do not.
    pub fn reset(&self, count: u64) {
        let mut clock = self.clock.lock();
        clock.count = count;
        clock.monotonic_count = 0;
        clock.last_timestamp = TimeStamp::default();
        clock.filter.reset();
    }

    pub fn set_sampling_rate(&self, sampling_rate: f64) {
        self.clock.lock().sampling_rate = sampling_rate;
    }

    pub fn sampling_rate(&self) -> f64 {
        self.clock.lock().sampling_rate
    }

    /// The CPU-clock baseline: captured at the first advance after a
    /// reset, then pinned to the negated offset by each sync step.
    pub fn reference(&self) -> f64 {
        self.clock.lock().reference
    }

    /// Initiate one offset exchange with the coordinator. Only followers
    /// sync; anywhere else this is a no-op.
    pub fn sync(&self) {
        if !self.peer.is_client_connected() {
            return;
        }
        let t1 = self.timestamp();
        self.peer.send_from_client(&chunk!["Sync", t1]);
    }

    fn apply_offset_sample(&self, t1: TimeStamp, t2: TimeStamp, t3: TimeStamp) {
        let mut clock = self.clock.lock();

        // The coordinator's receive time stands in for its send time.
        let offset = calculate_offset(t1, t2, t2, t3).as_secs_f64();

        // Damp small offsets non-linearly, then cap the step at eight
        // times the recent median magnitude so an outlier round trip
        // cannot yank the clock.
        let damp = offset.abs().clamp(0.1, 1.0);
        let alter_raw = offset * damp;
        let compare = clock
            .filter
            .push(TimeStamp::new(alter_raw))
            .as_secs_f64()
            .abs()
            * 8.0;
        let alter = alter_raw.clamp(-compare, compare);

        clock.offset = clock.offset + TimeStamp::new(alter);
        clock.reference = -clock.offset.as_secs_f64();

        debug!(
            offset_ms = offset * 1000.0,
            applied_ms = alter * 1000.0,
            roundtrip_ms = (t3 - t1).as_secs_f64() * 1000.0,
            "sync step applied"
        );
    }
}

impl<S, C, D> PeerDelegate for PrecisionTimer<S, C, D>
where
    S: ServerTransport,
    C: ClientTransport,
    D: Discovery,
{
    fn receive_as_server(&self, id: ConnectionId, stream: &mut Stream<'_>) {
        if stream.is_next_tag("Sync") {
            let Ok(t1) = stream.get::<TimeStamp>() else {
                warn!(id, "undecodable Sync; dropping");
                return;
            };
            // Capture immediately: this instant serves as both receive and
            // send time in the reply.
            let t2 = self.timestamp();
            self.peer.send_to_client(id, &chunk!["Respond", t1, t2]);
        }
    }

    fn receive_as_client(&self, stream: &mut Stream<'_>) {
        if stream.is_next_tag("Respond") {
            let parsed = (|| -> Result<(TimeStamp, TimeStamp), crate::CodecError> {
                Ok((stream.get::<TimeStamp>()?, stream.get::<TimeStamp>()?))
            })();
            let Ok((t1, t2)) = parsed else {
                warn!("undecodable Respond; dropping");
                return;
            };
            let t3 = self.timestamp();
            self.apply_offset_sample(t1, t2, t3);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::BrowseHit;

    /// An inert discovery driver so tests can build timers without mDNS.
    struct NullDiscovery;

    impl Discovery for NullDiscovery {
        fn start(&self) {}
        fn stop(&self) {}
        fn is_running(&self) -> bool {
            false
        }
        fn port(&self) -> u16 {
            0
        }
        fn host_name(&self) -> String {
            "null.local.".into()
        }
        fn browse(&self) -> Vec<BrowseHit> {
            Vec::new()
        }
        fn resolve(&self, _name: &str) {}
    }

    type TestTimer =
        PrecisionTimer<crate::transport::MemoryServer, crate::transport::MemoryClient, NullDiscovery>;

    fn test_timer() -> Arc<TestTimer> {
        TestTimer::new(PeerConfig::default(), NullDiscovery)
    }

    #[test]
    fn median_of_last_inputs_zero_padded() {
        let mut filter: MedianFilter<f64, 5> = MedianFilter::new();
        // One negative input against four zero seeds: the median is zero.
        assert_eq!(filter.push(-1.0), 0.0);
        assert_eq!(filter.push(-1.0), 0.0);
        // Three like inputs take the median.
        assert_eq!(filter.push(-1.0), -1.0);
        assert_eq!(filter.push(5.0), -1.0);
        assert_eq!(filter.push(2.0), -1.0);
        // The window wraps, replacing the oldest: [7, -1, -1, 5, 2].
        assert_eq!(filter.push(7.0), 2.0);
    }

    #[test]
    fn median_filter_resets_to_zero() {
        let mut filter: MedianFilter<f64, 5> = MedianFilter::new();
        for _ in 0..5 {
            filter.push(9.0);
        }
        assert_eq!(filter.push(9.0), 9.0);
        filter.reset();
        assert_eq!(filter.push(9.0), 0.0);
    }

    #[test]
    fn offset_formula_matches_four_timestamp_form() {
        let t1 = TimeStamp::new(10.0);
        let t2 = TimeStamp::new(11.0);
        let t3 = TimeStamp::new(11.5);
        let t4 = TimeStamp::new(12.0);
        assert_eq!(
            calculate_offset(t1, t2, t3, t4).as_secs_f64(),
            ((11.0 - 10.0) + (11.5 - 12.0)) / 2.0
        );
    }

    #[test]
    fn progress_is_strictly_monotone_without_syncs() {
        let timer = test_timer();
        let mut previous = timer.as_time();
        for _ in 0..32 {
            timer.progress(512);
            let now = timer.as_time();
            assert!(now > previous);
            previous = now;
        }
        assert_eq!(timer.count(), 32 * 512);
        assert!(timer.is_stable());
    }

    #[test]
    fn filter_warmup_suppresses_first_corrections() {
        let timer = test_timer();
        timer.progress(44100); // local time 1.0s

        // Server runs half a second behind, zero round trip: raw offset
        // -0.5, damped to -0.25 per step.
        let sample = |timer: &TestTimer| {
            let t1 = timer.timestamp();
            let t2 = t1 - TimeStamp::new(0.5);
            let t3 = timer.timestamp();
            timer.apply_offset_sample(t1, t2, t3);
        };

        // Two samples against the zero-seeded filter are fully clamped.
        sample(&timer);
        assert_eq!(timer.as_time().as_secs_f64(), 1.0);
        sample(&timer);
        assert_eq!(timer.as_time().as_secs_f64(), 1.0);

        // The third sample owns the median and the step applies.
        sample(&timer);
        assert_eq!(timer.as_time().as_secs_f64(), 0.75);
    }

    #[test]
    fn negative_slew_resets_monotonic_run() {
        let timer = test_timer();
        timer.progress(44100);
        assert!(timer.is_stable());

        // Warm the filter until a -0.25s step lands (see above).
        for _ in 0..3 {
            let t1 = timer.timestamp();
            let t2 = t1 - TimeStamp::new(0.5);
            let t3 = timer.timestamp();
            timer.apply_offset_sample(t1, t2, t3);
        }

        // The next small advance still reads earlier than the previous
        // one: the monotonic run starts over.
        timer.progress(64);
        assert_eq!(timer.monotonic_time(), 0.0);
        assert!(!timer.is_stable());

        // And from there it grows again.
        timer.progress(64);
        assert!(timer.monotonic_time() > 0.0);
    }

    #[test]
    fn reset_restarts_counts_but_keeps_offset() {
        let timer = test_timer();
        timer.progress(4410);

        for _ in 0..3 {
            let t1 = timer.timestamp();
            let t2 = t1 - TimeStamp::new(0.5);
            let t3 = timer.timestamp();
            timer.apply_offset_sample(t1, t2, t3);
        }
        let offset_time = timer.as_time().as_secs_f64() - 4410.0 / 44100.0;
        assert!(offset_time < 0.0);

        timer.reset(0);
        assert_eq!(timer.count(), 0);
        assert_eq!(timer.monotonic_time(), 0.0);
        // The offset survives: corrected time restarts from it.
        assert!((timer.as_time().as_secs_f64() - offset_time).abs() < 1e-12);
    }

    #[test]
    fn sampling_rate_feeds_conversions() {
        let timer = test_timer();
        timer.set_sampling_rate(48_000.0);
        timer.progress(48_000);
        assert_eq!(timer.as_time().as_secs_f64(), 1.0);
        assert_eq!(timer.as_samples(), 48_000);
    }
}
