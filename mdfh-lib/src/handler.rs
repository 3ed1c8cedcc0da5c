//! Feed handler assembly: configuration, resource lifecycle, and the
//! ingress loop tying ring → dissection → decode → sequencing together.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Sender};
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::cpu;
use crate::frame::{udp_payload, PacketFilter};
use crate::logger::{LogLevel, RecordLogger};
use crate::message::{decode_datagram, Slots};
use crate::ring::{PacketRing, RingConfig};
use crate::sequencer::{Sequencer, DEFAULT_WINDOW};
use crate::timer::{GapTimer, DEFAULT_GAP_TIMEOUT};
use crate::{Error, Result};

/// Everything the handler needs to run; see the field defaults.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Config {
    /// Interface the ring socket binds to, e.g. `eth0`.
    pub interface: String,
    #[builder(default = Ipv4Addr::new(239, 1, 1, 1))]
    pub group: Ipv4Addr,
    #[builder(default = 30001)]
    pub port: u16,
    #[builder(default)]
    pub ring: RingConfig,
    /// Sequencer window capacity; power of two.
    #[builder(default = DEFAULT_WINDOW)]
    pub window: usize,
    #[builder(default = DEFAULT_GAP_TIMEOUT)]
    pub gap_timeout: Duration,
    #[builder(default)]
    pub log_level: LogLevel,
    #[builder(default, setter(strip_option))]
    pub ingress_cpu: Option<usize>,
    #[builder(default, setter(strip_option))]
    pub timer_cpu: Option<usize>,
}

/// Holds the IGMP membership for the group while the ring listens.
///
/// The AF_PACKET socket sees every frame on the interface but never speaks
/// IGMP, so without this the switch may simply not forward the group.
struct Membership {
    sock: UdpSocket,
    group: Ipv4Addr,
}

impl Membership {
    fn join(group: Ipv4Addr) -> Result<Self> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|source| Error::Setup {
            op: "bind(membership socket)",
            source,
        })?;
        sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|source| Error::Setup {
                op: "join_multicast_v4",
                source,
            })?;
        Ok(Membership { sock, group })
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let _ = self.sock.leave_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED);
    }
}

pub struct FeedHandler {
    cfg: Config,
    sequencer: Arc<Sequencer>,
}

impl FeedHandler {
    /// # Errors
    /// [`Error::Config`] for an invalid window capacity.
    pub fn new(cfg: Config) -> Result<Self> {
        let sequencer = Arc::new(Sequencer::new(cfg.window)?);
        Ok(FeedHandler { cfg, sequencer })
    }

    /// Read-only handle for observers; snapshots via [`Sequencer::stats`].
    #[must_use]
    pub fn sequencer(&self) -> Arc<Sequencer> {
        Arc::clone(&self.sequencer)
    }

    /// Run the feed until a fatal error.
    ///
    /// The timer is joined and all ring resources released on every exit
    /// path; release order is membership, ring mapping + socket, timer.
    ///
    /// # Errors
    /// Setup failures, or [`Error::WindowExceeded`] from the sequencer.
    pub fn run(&self) -> Result<()> {
        let timer = GapTimer::spawn(
            self.sequencer(),
            self.cfg.gap_timeout,
            self.cfg.timer_cpu,
        );
        let zult = self.ingress();
        timer.stop();
        zult
    }

    fn ingress(&self) -> Result<()> {
        let mut ring = PacketRing::open(&self.cfg.interface, self.cfg.ring)?;
        let _membership = Membership::join(self.cfg.group)?;

        if let Some(id) = self.cfg.ingress_cpu {
            if let Err(err) = cpu::pin_to_cpu(id) {
                warn!(cpu = id, %err, "failed to pin ingress thread");
            }
        }

        let filter = PacketFilter::new(self.cfg.group, self.cfg.port);
        let mut slots = Slots::default();
        let mut logger = RecordLogger::new(self.cfg.log_level, io::stdout());
        if self.cfg.log_level == LogLevel::Verbose {
            logger = logger.with_latency();
        }

        info!(
            interface = %self.cfg.interface,
            group = %self.cfg.group,
            port = self.cfg.port,
            window = self.cfg.window,
            "listening for frames"
        );

        loop {
            let Some(block) = ring.next_block() else {
                // Ring empty; the only place the ingress thread waits.
                std::hint::spin_loop();
                continue;
            };
            for frame in block.frames() {
                let Some(payload) = udp_payload(frame, &filter) else {
                    continue;
                };
                if let Err(err) = decode_datagram(payload, &mut slots, &self.sequencer, &mut logger)
                {
                    match err {
                        Error::WindowExceeded { .. } => return Err(err),
                        err => warn!(%err, "datagram dropped"),
                    }
                }
            }
        }
    }

    /// Log a [`Stats`](crate::sequencer::Stats) snapshot every `interval`
    /// until stopped.
    #[must_use]
    pub fn spawn_stats_reporter(&self, interval: Duration) -> StatsReporter {
        StatsReporter::spawn(self.sequencer(), interval)
    }
}

/// Periodic observer thread over the shared sequencer counters.
pub struct StatsReporter {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl StatsReporter {
    fn spawn(sequencer: Arc<Sequencer>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(interval);
        let handle = thread::Builder::new()
            .name("stats".into())
            .spawn(move || {
                let mut last = (Instant::now(), sequencer.stats().parsed);
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            let stats = sequencer.stats();
                            let now = Instant::now();
                            let elapsed = now.duration_since(last.0).as_secs_f64();
                            let rate = if elapsed > 0.0 {
                                (stats.parsed.saturating_sub(last.1)) as f64 / elapsed
                            } else {
                                0.0
                            };
                            last = (now, stats.parsed);
                            info!(
                                parsed = stats.parsed,
                                duplicates = stats.duplicates,
                                out_of_order = stats.out_of_order,
                                lost = stats.lost,
                                next_seq = stats.next_seq,
                                rate_per_sec = rate as u64,
                                "feed stats"
                            );
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .expect("failed to spawn stats thread");
        StatsReporter { stop_tx, handle }
    }

    /// Stop and join the reporter.
    pub fn stop(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            warn!("stats reporter panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = Config::builder().interface("eth0".to_string()).build();
        assert_eq!(cfg.group, Ipv4Addr::new(239, 1, 1, 1));
        assert_eq!(cfg.port, 30001);
        assert_eq!(cfg.window, DEFAULT_WINDOW);
        assert_eq!(cfg.gap_timeout, Duration::from_millis(5));
        assert_eq!(cfg.log_level, LogLevel::Off);
        assert!(cfg.ingress_cpu.is_none());
    }

    #[test]
    fn bad_window_rejected_at_construction() {
        let cfg = Config::builder()
            .interface("eth0".to_string())
            .window(1000)
            .build();
        assert!(matches!(FeedHandler::new(cfg), Err(Error::Config(_))));
    }

    #[test]
    fn stats_reporter_stops_cleanly() {
        let cfg = Config::builder()
            .interface("eth0".to_string())
            .window(16)
            .build();
        let handler = FeedHandler::new(cfg).unwrap();
        let observer = handler.sequencer();
        observer.observe(1).unwrap();

        let reporter = handler.spawn_stats_reporter(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(10));
        reporter.stop();
        assert_eq!(observer.stats().parsed, 1);
    }
}
