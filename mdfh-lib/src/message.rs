//! ITCH-style record types and the per-datagram decoder.
//!
//! Records are fixed-length, big-endian, and not self-delimiting: the first
//! byte of every record is a tag that determines both the variant and the
//! number of bytes to advance within the datagram. The tag→size table here is
//! the single source of truth for record framing; the replay packer uses the
//! same table.
//!
//! All records share an 11-byte header prefix: tag(1), timestamp(6, ns since
//! midnight zero-extended to 64 bits), sequence number(4).

use std::io::Write;

use crate::bytes::{read_stock, read_timestamp, read_u32, read_u64};
use crate::logger::RecordLogger;
use crate::sequencer::Sequencer;
use crate::{Error, Result};

/// Common header length: tag + timestamp + sequence number.
pub const HEADER_LEN: usize = 11;

/// Order-add (`A`) and trade (`P`) share this layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct Trade {
    /// Tag byte, `A` or `P`.
    pub tag: u8,
    pub timestamp: u64,
    pub sequence: u32,
    pub order_ref: u64,
    /// `B` or `S`.
    pub side: u8,
    pub shares: u32,
    /// Left-justified, space-padded ASCII, kept verbatim.
    pub stock: [u8; 8],
    pub price: u32,
}

impl Trade {
    pub const LEN: usize = 36;

    /// The stock symbol as a string slice, padding included.
    #[must_use]
    pub fn stock_str(&self) -> &str {
        std::str::from_utf8(&self.stock).unwrap_or("????????")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OrderExecuted {
    pub timestamp: u64,
    pub sequence: u32,
    pub order_ref: u64,
    pub executed_shares: u32,
}

impl OrderExecuted {
    pub const LEN: usize = 23;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OrderExecutedWithPrice {
    pub timestamp: u64,
    pub sequence: u32,
    pub order_ref: u64,
    pub executed_shares: u32,
    /// `Y` or `N`.
    pub printable: u8,
    pub executed_price: u32,
}

impl OrderExecutedWithPrice {
    pub const LEN: usize = 28;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEvent {
    pub timestamp: u64,
    pub sequence: u32,
    /// `O` market open, `C` market close.
    pub event_code: u8,
}

impl SystemEvent {
    pub const LEN: usize = 12;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OrderCancelled {
    pub timestamp: u64,
    pub sequence: u32,
    pub order_ref: u64,
    pub cancelled_shares: u32,
}

impl OrderCancelled {
    pub const LEN: usize = 23;
}

/// Canonical record size for a tag, or `None` for a tag outside the closed
/// set.
#[must_use]
pub const fn record_size(tag: u8) -> Option<usize> {
    match tag {
        b'A' | b'P' => Some(Trade::LEN),
        b'E' => Some(OrderExecuted::LEN),
        b'X' => Some(OrderExecutedWithPrice::LEN),
        b'S' => Some(SystemEvent::LEN),
        b'C' => Some(OrderCancelled::LEN),
        _ => None,
    }
}

/// One reusable slot per record variant.
///
/// The slots are owned by the ingress loop and overwritten in place by each
/// decoded record of the matching variant; nothing decoded outlives the
/// iteration that produced it.
#[derive(Debug, Default)]
pub struct Slots {
    pub trade: Trade,
    pub executed: OrderExecuted,
    pub executed_with_price: OrderExecutedWithPrice,
    pub system: SystemEvent,
    pub cancelled: OrderCancelled,
}

/// A borrowed view of the record most recently decoded into a slot.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
    Trade(&'a Trade),
    Executed(&'a OrderExecuted),
    ExecutedWithPrice(&'a OrderExecutedWithPrice),
    SystemEvent(&'a SystemEvent),
    Cancelled(&'a OrderCancelled),
}

impl Record<'_> {
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Record::Trade(t) => t.tag,
            Record::Executed(_) => b'E',
            Record::ExecutedWithPrice(_) => b'X',
            Record::SystemEvent(_) => b'S',
            Record::Cancelled(_) => b'C',
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        match self {
            Record::Trade(t) => t.timestamp,
            Record::Executed(e) => e.timestamp,
            Record::ExecutedWithPrice(x) => x.timestamp,
            Record::SystemEvent(s) => s.timestamp,
            Record::Cancelled(c) => c.timestamp,
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u32 {
        match self {
            Record::Trade(t) => t.sequence,
            Record::Executed(e) => e.sequence,
            Record::ExecutedWithPrice(x) => x.sequence,
            Record::SystemEvent(s) => s.sequence,
            Record::Cancelled(c) => c.sequence,
        }
    }
}

fn decode_trade(buf: &[u8], t: &mut Trade) -> usize {
    let mut off = 0;
    t.tag = buf[off];
    off += 1;
    t.timestamp = read_timestamp(buf, &mut off);
    t.sequence = read_u32(buf, &mut off);
    t.order_ref = read_u64(buf, &mut off);
    t.side = buf[off];
    off += 1;
    t.shares = read_u32(buf, &mut off);
    t.stock = read_stock(buf, &mut off);
    t.price = read_u32(buf, &mut off);
    Trade::LEN
}

fn decode_executed(buf: &[u8], e: &mut OrderExecuted) -> usize {
    let mut off = 1;
    e.timestamp = read_timestamp(buf, &mut off);
    e.sequence = read_u32(buf, &mut off);
    e.order_ref = read_u64(buf, &mut off);
    e.executed_shares = read_u32(buf, &mut off);
    OrderExecuted::LEN
}

fn decode_executed_with_price(buf: &[u8], x: &mut OrderExecutedWithPrice) -> usize {
    let mut off = 1;
    x.timestamp = read_timestamp(buf, &mut off);
    x.sequence = read_u32(buf, &mut off);
    x.order_ref = read_u64(buf, &mut off);
    x.executed_shares = read_u32(buf, &mut off);
    x.printable = buf[off];
    off += 1;
    x.executed_price = read_u32(buf, &mut off);
    OrderExecutedWithPrice::LEN
}

fn decode_system_event(buf: &[u8], s: &mut SystemEvent) -> usize {
    let mut off = 1;
    s.timestamp = read_timestamp(buf, &mut off);
    s.sequence = read_u32(buf, &mut off);
    s.event_code = buf[off];
    SystemEvent::LEN
}

fn decode_cancelled(buf: &[u8], c: &mut OrderCancelled) -> usize {
    let mut off = 1;
    c.timestamp = read_timestamp(buf, &mut off);
    c.sequence = read_u32(buf, &mut off);
    c.order_ref = read_u64(buf, &mut off);
    c.cancelled_shares = read_u32(buf, &mut off);
    OrderCancelled::LEN
}

/// Decode every record packed into `payload`, in payload order.
///
/// Each record is decoded into its variant's slot, handed to the logger, and
/// its sequence number classified by the sequencer. The cursor advances by
/// the canonical size of each tag.
///
/// # Errors
/// [`Error::UnknownTag`] or [`Error::Truncated`] when the payload cannot be
/// framed; records before the failure have already been classified, the
/// remainder of the datagram is discarded, and the sequencer is never
/// notified for discarded bytes. [`Error::WindowExceeded`] propagates from
/// the sequencer and is fatal to the caller.
pub fn decode_datagram<W: Write>(
    payload: &[u8],
    slots: &mut Slots,
    sequencer: &Sequencer,
    logger: &mut RecordLogger<W>,
) -> Result<()> {
    let mut pos = 0;
    while pos < payload.len() {
        let tag = payload[pos];
        let Some(size) = record_size(tag) else {
            return Err(Error::UnknownTag { tag, offset: pos });
        };
        let remaining = payload.len() - pos;
        if size > remaining {
            return Err(Error::Truncated {
                tag: tag as char,
                offset: pos,
                need: size,
                remaining,
            });
        }

        let buf = &payload[pos..pos + size];
        let seq = match tag {
            b'A' | b'P' => {
                decode_trade(buf, &mut slots.trade);
                logger.log(Record::Trade(&slots.trade))?;
                slots.trade.sequence
            }
            b'E' => {
                decode_executed(buf, &mut slots.executed);
                logger.log(Record::Executed(&slots.executed))?;
                slots.executed.sequence
            }
            b'X' => {
                decode_executed_with_price(buf, &mut slots.executed_with_price);
                logger.log(Record::ExecutedWithPrice(&slots.executed_with_price))?;
                slots.executed_with_price.sequence
            }
            b'S' => {
                decode_system_event(buf, &mut slots.system);
                logger.log(Record::SystemEvent(&slots.system))?;
                slots.system.sequence
            }
            b'C' => {
                decode_cancelled(buf, &mut slots.cancelled);
                logger.log(Record::Cancelled(&slots.cancelled))?;
                slots.cancelled.sequence
            }
            // record_size already rejected everything else
            _ => unreachable!(),
        };
        sequencer.observe(seq)?;
        pos += size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::logger::LogLevel;
    use crate::testdata::{executed, order_add, system_event, trade, with_price};

    fn run(payload: &[u8], sequencer: &Sequencer) -> Result<()> {
        let mut slots = Slots::default();
        let mut logger = RecordLogger::new(LogLevel::Off, Vec::new());
        decode_datagram(payload, &mut slots, sequencer, &mut logger)
    }

    #[test]
    fn trade_fields_round_trip() {
        let dat = order_add(34_200_000_000_001, 7, 9_000_000_001, b'B', 250, b"AAPL    ", 18_250);
        assert_eq!(dat.len(), Trade::LEN);

        let mut t = Trade::default();
        assert_eq!(decode_trade(&dat, &mut t), Trade::LEN);
        assert_eq!(t.tag, b'A');
        assert_eq!(t.timestamp, 34_200_000_000_001);
        assert_eq!(t.sequence, 7);
        assert_eq!(t.order_ref, 9_000_000_001);
        assert_eq!(t.side, b'B');
        assert_eq!(t.shares, 250);
        assert_eq!(t.stock_str(), "AAPL    ");
        assert_eq!(t.price, 18_250);
    }

    #[test]
    fn executed_with_price_fields_round_trip() {
        let dat = with_price(1_000, 42, 77, 10, b'Y', 999);
        assert_eq!(dat.len(), OrderExecutedWithPrice::LEN);

        let mut x = OrderExecutedWithPrice::default();
        assert_eq!(
            decode_executed_with_price(&dat, &mut x),
            OrderExecutedWithPrice::LEN
        );
        assert_eq!(x.timestamp, 1_000);
        assert_eq!(x.sequence, 42);
        assert_eq!(x.order_ref, 77);
        assert_eq!(x.executed_shares, 10);
        assert_eq!(x.printable, b'Y');
        assert_eq!(x.executed_price, 999);
    }

    #[test_case(b'A', Some(36); "order add")]
    #[test_case(b'P', Some(36); "trade")]
    #[test_case(b'E', Some(23); "executed")]
    #[test_case(b'X', Some(28); "executed with price")]
    #[test_case(b'S', Some(12); "system event")]
    #[test_case(b'C', Some(23); "cancelled")]
    #[test_case(b'Z', None; "unknown")]
    #[test_case(0x00, None; "nul")]
    fn size_table(tag: u8, expected: Option<usize>) {
        assert_eq!(record_size(tag), expected);
    }

    #[test]
    fn golden_system_event_bytes() {
        let dat = hex::decode("53000000000001000000024f").unwrap();
        assert_eq!(dat.len(), SystemEvent::LEN);

        let mut s = SystemEvent::default();
        decode_system_event(&dat, &mut s);
        assert_eq!(s.timestamp, 1);
        assert_eq!(s.sequence, 2);
        assert_eq!(s.event_code, b'O');
    }

    #[test]
    fn three_record_datagram_decodes_clean() {
        // 36 + 23 + 12 = 71 bytes, sequence numbers 10, 11, 12
        let mut payload = order_add(1, 10, 5, b'B', 100, b"MSFT    ", 42);
        payload.extend_from_slice(&executed(2, 11, 5, 100));
        payload.extend_from_slice(&system_event(3, 12, b'O'));
        assert_eq!(payload.len(), 71);

        let seq = Sequencer::new(16).unwrap();
        run(&payload, &seq).unwrap();

        let stats = seq.stats();
        assert_eq!(stats.parsed, 3);
        assert_eq!(stats.next_seq, 13);
    }

    #[test]
    fn unknown_tag_stops_datagram_after_prior_records() {
        let mut payload = order_add(1, 1, 5, b'S', 10, b"GME     ", 4);
        payload.push(b'Z');

        let seq = Sequencer::new(16).unwrap();
        let err = run(&payload, &seq).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownTag { tag: b'Z', offset: 36 }
        ));

        // Exactly one observation reached the sequencer.
        assert_eq!(seq.stats().parsed, 1);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let full = trade(1, 1, 5, b'B', 10, b"IBM     ", 4);
        let payload = &full[..Trade::LEN - 1];

        let seq = Sequencer::new(16).unwrap();
        let err = run(payload, &seq).unwrap_err();
        match err {
            Error::Truncated {
                tag,
                offset,
                need,
                remaining,
            } => {
                assert_eq!(tag, 'P');
                assert_eq!(offset, 0);
                assert_eq!(need, 36);
                assert_eq!(remaining, 35);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
        assert_eq!(seq.stats().parsed, 0);
    }

    #[test]
    fn cursor_reaching_len_exactly_is_clean() {
        let mut payload = Vec::new();
        for (i, code) in [b'O', b'C'].iter().enumerate() {
            payload.extend_from_slice(&system_event(50, i as u32 + 1, *code));
        }
        let seq = Sequencer::new(16).unwrap();
        assert!(run(&payload, &seq).is_ok());
        assert_eq!(seq.stats().parsed, 2);
    }

    #[test]
    fn all_variants_in_one_datagram() {
        let mut payload = order_add(1, 1, 11, b'B', 5, b"A       ", 9);
        payload.extend_from_slice(&trade(2, 2, 12, b'S', 6, b"B       ", 8));
        payload.extend_from_slice(&executed(3, 3, 13, 7));
        payload.extend_from_slice(&with_price(4, 4, 14, 8, b'N', 7));
        payload.extend_from_slice(&system_event(5, 5, b'C'));
        payload.extend_from_slice(&crate::testdata::cancelled(6, 6, 15, 9));

        let seq = Sequencer::new(16).unwrap();
        run(&payload, &seq).unwrap();
        let stats = seq.stats();
        assert_eq!(stats.parsed, 6);
        assert_eq!(stats.next_seq, 7);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.out_of_order, 0);
    }
}
