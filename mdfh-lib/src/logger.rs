//! Per-record output sink.
//!
//! Distinct from the `tracing` diagnostics: this is the downstream consumer
//! surface, emitting one line per parsed record at a configurable level.
//! The sink is provided once at construction and written through directly,
//! so the hot path never allocates.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use crate::message::Record;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// No record output.
    #[default]
    Off,
    /// Human-readable, one line per record.
    Verbose,
    /// key=value tokens for machine parsing.
    Raw,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(LogLevel::Off),
            "verbose" => Ok(LogLevel::Verbose),
            "raw" => Ok(LogLevel::Raw),
            other => Err(format!("unknown log level {other:?} (off|verbose|raw)")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Off => "off",
            LogLevel::Verbose => "verbose",
            LogLevel::Raw => "raw",
        })
    }
}

/// hh:mm:ss.nnnnnnnnn rendering of an ns-since-midnight timestamp.
struct Clock(u64);

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_sec = self.0 / 1_000_000_000;
        let nsec = self.0 % 1_000_000_000;
        let h = total_sec / 3600;
        let m = total_sec % 3600 / 60;
        let s = total_sec % 60;
        write!(f, "{h:02}:{m:02}:{s:02}.{nsec:09}")
    }
}

/// Nanoseconds since local midnight, for wire-to-parse latency against the
/// record timestamps.
#[must_use]
pub fn ns_since_midnight() -> u64 {
    use chrono::Timelike;
    let now = chrono::Local::now();
    u64::from(now.num_seconds_from_midnight()) * 1_000_000_000 + u64::from(now.nanosecond())
}

pub struct RecordLogger<W: Write> {
    level: LogLevel,
    /// Append host-clock latency to verbose lines.
    measure_latency: bool,
    out: W,
}

impl<W: Write> RecordLogger<W> {
    pub fn new(level: LogLevel, out: W) -> Self {
        RecordLogger {
            level,
            measure_latency: false,
            out,
        }
    }

    /// Suffix verbose lines with `now − record.timestamp` in nanoseconds.
    /// Only meaningful for live traffic stamped against the same midnight.
    #[must_use]
    pub fn with_latency(mut self) -> Self {
        self.measure_latency = true;
        self
    }

    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Give back the sink, e.g. to inspect a captured buffer.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Emit one record at the configured level.
    ///
    /// # Errors
    /// Write errors from the sink.
    #[inline]
    pub fn log(&mut self, record: Record<'_>) -> io::Result<()> {
        match self.level {
            LogLevel::Off => Ok(()),
            LogLevel::Verbose => self.verbose(record),
            LogLevel::Raw => self.raw(record),
        }
    }

    fn verbose(&mut self, record: Record<'_>) -> io::Result<()> {
        let clock = Clock(record.timestamp());
        match record {
            Record::Trade(t) => {
                let verb = if t.tag == b'A' { "Order Added" } else { "Trade" };
                let side = if t.side == b'B' { "Buy" } else { "Sell" };
                write!(
                    self.out,
                    "[{clock}] | {verb}: [{}]: {} of ${} to {side} @ {}",
                    t.order_ref,
                    t.shares,
                    t.stock_str(),
                    t.price,
                )?;
            }
            Record::Executed(e) => {
                write!(
                    self.out,
                    "[{clock}] | Order executed: [{}]: {} shares",
                    e.order_ref, e.executed_shares,
                )?;
            }
            Record::ExecutedWithPrice(x) => {
                write!(
                    self.out,
                    "[{clock}] | Order executed: [{}]: {} @ {} (printable={})",
                    x.order_ref,
                    x.executed_shares,
                    x.executed_price,
                    x.printable as char,
                )?;
            }
            Record::SystemEvent(s) => match s.event_code {
                b'O' => write!(self.out, "[{clock}] | *MARKET OPEN*")?,
                b'C' => write!(self.out, "[{clock}] | *MARKET CLOSE*")?,
                other => write!(self.out, "[{clock}] | *SYSTEM EVENT {}*", other as char)?,
            },
            Record::Cancelled(c) => {
                write!(
                    self.out,
                    "[{clock}] | Order cancelled: [{}]: {} shares",
                    c.order_ref, c.cancelled_shares,
                )?;
            }
        }
        if self.measure_latency {
            let delta = ns_since_midnight().saturating_sub(record.timestamp());
            write!(self.out, " | +{delta} ns")?;
        }
        writeln!(self.out)
    }

    fn raw(&mut self, record: Record<'_>) -> io::Result<()> {
        let tag = record.tag() as char;
        let ts = record.timestamp();
        let seq = record.sequence();
        match record {
            Record::Trade(t) => writeln!(
                self.out,
                "[{tag}] ts={ts} seq={seq} ref={} side={} shares={} stock={} price={}",
                t.order_ref,
                t.side as char,
                t.shares,
                t.stock_str().trim_end(),
                t.price,
            ),
            Record::Executed(e) => writeln!(
                self.out,
                "[{tag}] ts={ts} seq={seq} ref={} executed={}",
                e.order_ref, e.executed_shares,
            ),
            Record::ExecutedWithPrice(x) => writeln!(
                self.out,
                "[{tag}] ts={ts} seq={seq} ref={} executed={} printable={} price={}",
                x.order_ref,
                x.executed_shares,
                x.printable as char,
                x.executed_price,
            ),
            Record::SystemEvent(s) => writeln!(
                self.out,
                "[{tag}] ts={ts} seq={seq} event={}",
                s.event_code as char,
            ),
            Record::Cancelled(c) => writeln!(
                self.out,
                "[{tag}] ts={ts} seq={seq} ref={} cancelled={}",
                c.order_ref, c.cancelled_shares,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{OrderCancelled, SystemEvent, Trade};

    fn sample_trade() -> Trade {
        Trade {
            tag: b'A',
            // 09:30:00.000000500
            timestamp: 34_200_000_000_500,
            sequence: 9,
            order_ref: 1234,
            side: b'B',
            shares: 100,
            stock: *b"AAPL    ",
            price: 18_250,
        }
    }

    fn logged(level: LogLevel, record: Record<'_>) -> String {
        let mut logger = RecordLogger::new(level, Vec::new());
        logger.log(record).unwrap();
        String::from_utf8(logger.out).unwrap()
    }

    #[test]
    fn off_writes_nothing() {
        let t = sample_trade();
        assert!(logged(LogLevel::Off, Record::Trade(&t)).is_empty());
    }

    #[test]
    fn verbose_trade_line() {
        let t = sample_trade();
        assert_eq!(
            logged(LogLevel::Verbose, Record::Trade(&t)),
            "[09:30:00.000000500] | Order Added: [1234]: 100 of $AAPL     to Buy @ 18250\n"
        );
    }

    #[test]
    fn raw_trade_line() {
        let t = sample_trade();
        assert_eq!(
            logged(LogLevel::Raw, Record::Trade(&t)),
            "[A] ts=34200000000500 seq=9 ref=1234 side=B shares=100 stock=AAPL price=18250\n"
        );
    }

    #[test]
    fn verbose_system_event() {
        let s = SystemEvent {
            timestamp: 0,
            sequence: 1,
            event_code: b'O',
        };
        assert_eq!(
            logged(LogLevel::Verbose, Record::SystemEvent(&s)),
            "[00:00:00.000000000] | *MARKET OPEN*\n"
        );
    }

    #[test]
    fn raw_cancel_line() {
        let c = OrderCancelled {
            timestamp: 1,
            sequence: 2,
            order_ref: 3,
            cancelled_shares: 4,
        };
        assert_eq!(
            logged(LogLevel::Raw, Record::Cancelled(&c)),
            "[C] ts=1 seq=2 ref=3 cancelled=4\n"
        );
    }

    #[test]
    fn clock_covers_the_trading_day() {
        assert_eq!(Clock(0).to_string(), "00:00:00.000000000");
        assert_eq!(
            Clock(16 * 3600 * 1_000_000_000 + 1).to_string(),
            "16:00:00.000000001"
        );
    }

    #[test]
    fn level_parsing_round_trips() {
        for level in [LogLevel::Off, LogLevel::Verbose, LogLevel::Raw] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn midnight_clock_is_within_a_day() {
        assert!(ns_since_midnight() < 24 * 3600 * 1_000_000_000);
    }
}
