//! Offline accounting over a recorded record stream.
//!
//! Streams a dump through the framing table and a private sequencer to
//! report what a live session over the same bytes would have counted.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};

use serde::Serialize;

use crate::bytes::read_u32;
use crate::message::{record_size, HEADER_LEN};
use crate::sequencer::{Sequencer, Stats};
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Serialize)]
pub struct KindSummary {
    pub count: u64,
    pub bytes: u64,
}

/// Totals for one dump: per-tag record counts plus the sequence-integrity
/// counters a fresh window would have produced.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Summary {
    pub count: u64,
    pub bytes: u64,
    pub kinds: BTreeMap<char, KindSummary>,
    pub stats: Stats,
}

impl Summary {
    fn add(&mut self, tag: u8, size: usize) {
        self.count += 1;
        self.bytes += size as u64;
        let kind = self.kinds.entry(tag as char).or_default();
        kind.count += 1;
        kind.bytes += size as u64;
    }
}

/// Read concatenated records from `reader` until EOF and account for them.
///
/// # Errors
/// [`Error::UnknownTag`] for a tag outside the closed set,
/// [`Error::Truncated`] when the stream ends inside a record, and any I/O
/// error from the reader.
pub fn summarize<R: Read>(mut reader: R, window: usize) -> Result<Summary> {
    let sequencer = Sequencer::new(window)?;
    let mut summary = Summary::default();
    let mut buf = [0u8; 64];
    let mut offset = 0usize;

    loop {
        // Tag byte first; a clean EOF here ends the stream.
        match reader.read_exact(&mut buf[..1]) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let tag = buf[0];
        let Some(size) = record_size(tag) else {
            return Err(Error::UnknownTag { tag, offset });
        };
        if let Err(err) = reader.read_exact(&mut buf[1..size]) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(Error::Truncated {
                    tag: tag as char,
                    offset,
                    need: size,
                    remaining: 0,
                });
            }
            return Err(err.into());
        }

        let mut cursor = HEADER_LEN - 4;
        let seq = read_u32(&buf, &mut cursor);
        sequencer.observe(seq)?;
        summary.add(tag, size);
        offset += size;
    }

    summary.stats = sequencer.stats();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::{cancelled, executed, order_add, system_event, trade};

    #[test]
    fn accounts_per_kind_and_integrity() {
        let mut dump = Vec::new();
        dump.extend_from_slice(&system_event(1, 1, b'O'));
        dump.extend_from_slice(&order_add(2, 2, 10, b'B', 5, b"ONE     ", 9));
        dump.extend_from_slice(&trade(3, 4, 11, b'S', 6, b"TWO     ", 8)); // 3 skipped
        dump.extend_from_slice(&executed(4, 3, 10, 5)); // heals the hole
        dump.extend_from_slice(&cancelled(5, 5, 11, 1));
        dump.extend_from_slice(&cancelled(6, 5, 11, 1)); // duplicate

        let summary = summarize(&dump[..], 16).unwrap();
        assert_eq!(summary.count, 6);
        assert_eq!(summary.bytes, dump.len() as u64);

        assert_eq!(summary.kinds[&'S'].count, 1);
        assert_eq!(summary.kinds[&'A'].count, 1);
        assert_eq!(summary.kinds[&'P'].count, 1);
        assert_eq!(summary.kinds[&'E'].count, 1);
        assert_eq!(summary.kinds[&'C'].count, 2);

        // seq 4 counts out-of-order on arrival and parsed once drained.
        assert_eq!(summary.stats.parsed, 5);
        assert_eq!(summary.stats.out_of_order, 1);
        assert_eq!(summary.stats.duplicates, 1);
        assert_eq!(summary.stats.lost, 0);
        assert_eq!(summary.stats.next_seq, 6);
    }

    #[test]
    fn empty_stream_is_a_clean_zero() {
        let summary = summarize(&[][..], 16).unwrap();
        assert_eq!(summary.count, 0);
        assert!(summary.kinds.is_empty());
    }

    #[test]
    fn unknown_tag_reports_offset() {
        let mut dump = system_event(1, 1, b'O');
        dump.push(b'!');
        let err = summarize(&dump[..], 16).unwrap_err();
        assert!(matches!(err, Error::UnknownTag { tag: b'!', offset: 12 }));
    }

    #[test]
    fn truncated_final_record_is_an_error() {
        let mut dump = system_event(1, 1, b'O');
        let full = executed(2, 2, 9, 1);
        dump.extend_from_slice(&full[..10]);
        let err = summarize(&dump[..], 16).unwrap_err();
        assert!(matches!(err, Error::Truncated { tag: 'E', .. }));
    }

    #[test]
    fn serializes_to_json() {
        let dump = system_event(1, 1, b'O');
        let summary = summarize(&dump[..], 16).unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["kinds"]["S"]["count"], 1);
        assert_eq!(json["stats"]["parsed"], 1);
    }
}
