use std::io::stderr;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mdfh::handler::{Config, FeedHandler};
use mdfh::logger::LogLevel;
use mdfh::replay::Replayer;
use mdfh::ring::RingConfig;
use mdfh::summary::summarize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum Format {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the multicast feed from a packet ring on an interface.
    ///
    /// Requires CAP_NET_RAW for the AF_PACKET ring. Runs until killed or
    /// until the sequence window is exceeded.
    Listen {
        /// Interface to capture on, e.g. eth0.
        interface: String,

        /// Multicast group to filter for.
        #[arg(short, long, default_value = "239.1.1.1")]
        group: Ipv4Addr,

        /// UDP destination port to filter for.
        #[arg(short, long, default_value_t = 30001)]
        port: u16,

        /// Ring block size in bytes; multiple of page and frame size.
        #[arg(long, default_value_t = 1 << 17)]
        block_size: usize,

        /// Number of ring blocks.
        #[arg(long, default_value_t = 64)]
        block_count: usize,

        /// Ring frame size in bytes.
        #[arg(long, default_value_t = 2048)]
        frame_size: usize,

        /// Sequencer window capacity; power of two.
        #[arg(short, long, default_value_t = mdfh::sequencer::DEFAULT_WINDOW)]
        window: usize,

        /// Gap timeout in milliseconds.
        #[arg(long, value_name = "ms", default_value_t = 5)]
        gap_timeout: u64,

        /// Per-record output level.
        #[arg(short, long, default_value_t = LogLevel::Off)]
        log_level: LogLevel,

        /// Pin the ingress loop to this CPU.
        #[arg(long, value_name = "cpu")]
        ingress_cpu: Option<usize>,

        /// Pin the gap timer to this CPU.
        #[arg(long, value_name = "cpu")]
        timer_cpu: Option<usize>,

        /// Seconds between stats reports; 0 disables.
        #[arg(long, value_name = "secs", default_value_t = 5)]
        stats_interval: u64,
    },

    /// Replay a binary record dump to the multicast group.
    Replay {
        /// Dump of concatenated records.
        input: PathBuf,

        /// Multicast group to send to.
        #[arg(short, long, default_value = "239.1.1.1")]
        group: Ipv4Addr,

        /// UDP destination port.
        #[arg(short, long, default_value_t = 30001)]
        port: u16,

        /// Pause between datagrams, in microseconds.
        #[arg(short, long, value_name = "us")]
        interval: Option<u64>,

        /// Stop after this many passes over the dump; loops forever if
        /// not given.
        #[arg(short, long)]
        loops: Option<u64>,
    },

    /// Summarize a binary record dump.
    Info {
        /// Dump of concatenated records.
        input: PathBuf,

        /// Output format.
        #[arg(short, long, default_value = "text")]
        format: Format,

        /// Sequencer window capacity used for integrity accounting.
        #[arg(short, long, default_value_t = mdfh::sequencer::DEFAULT_WINDOW)]
        window: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_env("MDFH_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Listen {
            interface,
            group,
            port,
            block_size,
            block_count,
            frame_size,
            window,
            gap_timeout,
            log_level,
            ingress_cpu,
            timer_cpu,
            stats_interval,
        } => {
            let ring = RingConfig::builder()
                .block_size(block_size)
                .block_count(block_count)
                .frame_size(frame_size)
                .build();
            let mut cfg = Config::builder()
                .interface(interface)
                .group(group)
                .port(port)
                .ring(ring)
                .window(window)
                .gap_timeout(Duration::from_millis(gap_timeout))
                .log_level(log_level)
                .build();
            cfg.ingress_cpu = ingress_cpu;
            cfg.timer_cpu = timer_cpu;

            let handler = FeedHandler::new(cfg).context("constructing feed handler")?;
            let reporter = (stats_interval > 0)
                .then(|| handler.spawn_stats_reporter(Duration::from_secs(stats_interval)));

            let zult = handler.run();
            if let Some(reporter) = reporter {
                reporter.stop();
            }
            zult.context("feed handler exited")
        }

        Commands::Replay {
            input,
            group,
            port,
            interval,
            loops,
        } => {
            let replayer = Replayer::new(
                &input,
                group,
                port,
                interval.map(Duration::from_micros),
            )
            .with_context(|| format!("loading dump {input:?}"))?;
            replayer.run(loops).context("replaying dump")
        }

        Commands::Info {
            input,
            format,
            window,
        } => {
            let file = std::fs::File::open(&input).with_context(|| format!("opening {input:?}"))?;
            let summary = summarize(std::io::BufReader::new(file), window)
                .with_context(|| format!("summarizing {input:?}"))?;

            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                Format::Text => {
                    info!(path = %input.display(), "dump summarized");
                    println!("records: {}  bytes: {}", summary.count, summary.bytes);
                    for (tag, kind) in &summary.kinds {
                        println!("  [{tag}] count={} bytes={}", kind.count, kind.bytes);
                    }
                    let s = &summary.stats;
                    println!(
                        "sequence: parsed={} duplicates={} out_of_order={} lost={} next={} highest={}",
                        s.parsed, s.duplicates, s.out_of_order, s.lost, s.next_seq, s.highest_seq
                    );
                }
            }
            Ok(())
        }
    }
}
