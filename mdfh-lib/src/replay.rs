//! Multicast replay of a recorded record stream.
//!
//! Reads a binary dump of concatenated records and retransmits it to the
//! multicast group, packing as many whole records into each datagram as fit
//! the MTU-derived budget. Records are never split across datagrams; the
//! packer walks the same tag→size table the decoder dispatches on.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::message::record_size;
use crate::{Error, Result};

/// Largest UDP payload that fits a 1500-byte MTU after the 20-byte IP and
/// 8-byte UDP headers.
pub const MAX_DATAGRAM: usize = 1472;

/// Slice the next datagram's worth of whole records out of `data`.
///
/// Advances `pos` past the returned records; returns `Ok(None)` once the
/// dump is exhausted.
///
/// # Errors
/// [`Error::UnknownTag`] or [`Error::Truncated`] for a malformed dump.
pub fn next_datagram<'a>(data: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>> {
    if *pos >= data.len() {
        return Ok(None);
    }
    let start = *pos;
    let mut end = start;
    while end < data.len() {
        let tag = data[end];
        let Some(size) = record_size(tag) else {
            return Err(Error::UnknownTag { tag, offset: end });
        };
        if end + size > data.len() {
            return Err(Error::Truncated {
                tag: tag as char,
                offset: end,
                need: size,
                remaining: data.len() - end,
            });
        }
        if end + size - start > MAX_DATAGRAM {
            break;
        }
        end += size;
    }
    *pos = end;
    Ok(Some(&data[start..end]))
}

pub struct Replayer {
    sock: UdpSocket,
    dest: SocketAddrV4,
    data: Vec<u8>,
    /// Pause between datagrams; `None` sends flat out.
    interval: Option<Duration>,
}

impl Replayer {
    /// Load `path` and prepare a sending socket with multicast TTL 1.
    ///
    /// # Errors
    /// I/O errors reading the dump or configuring the socket.
    pub fn new(
        path: &Path,
        group: Ipv4Addr,
        port: u16,
        interval: Option<Duration>,
    ) -> Result<Self> {
        let data = std::fs::read(path)?;
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sock.set_multicast_ttl_v4(1)?;
        info!(path = %path.display(), bytes = data.len(), %group, port, "replay source loaded");
        Ok(Replayer {
            sock,
            dest: SocketAddrV4::new(group, port),
            data,
            interval,
        })
    }

    /// Stream the dump to the group, `loops` times (`None` forever).
    ///
    /// # Errors
    /// Malformed dump or socket send failure.
    pub fn run(&self, loops: Option<u64>) -> Result<()> {
        let mut iteration = 0u64;
        loop {
            let mut pos = 0;
            let mut datagrams = 0u64;
            while let Some(dgram) = next_datagram(&self.data, &mut pos)? {
                self.sock.send_to(dgram, self.dest)?;
                datagrams += 1;
                if let Some(pause) = self.interval {
                    thread::sleep(pause);
                }
            }
            iteration += 1;
            debug!(iteration, datagrams, "dump replayed");
            if loops.is_some_and(|n| iteration >= n) {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Trade;
    use crate::testdata::{executed, system_event, trade};

    fn pack_all(data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(d) = next_datagram(data, &mut pos).unwrap() {
            out.push(d.to_vec());
        }
        out
    }

    #[test]
    fn packs_up_to_the_datagram_budget() {
        // 41 trades: 40 fit in 1440 bytes, the 41st would cross 1472.
        let mut dump = Vec::new();
        for i in 1..=41u32 {
            dump.extend_from_slice(&trade(1, i, 7, b'B', 1, b"T       ", 2));
        }

        let datagrams = pack_all(&dump);
        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0].len(), 40 * Trade::LEN);
        assert!(datagrams[0].len() <= MAX_DATAGRAM);
        assert_eq!(datagrams[1].len(), Trade::LEN);
    }

    #[test]
    fn never_splits_a_record() {
        let mut dump = Vec::new();
        for i in 1..=200u32 {
            match i % 3 {
                0 => dump.extend_from_slice(&trade(1, i, 7, b'S', 1, b"MIX     ", 2)),
                1 => dump.extend_from_slice(&executed(1, i, 7, 1)),
                _ => dump.extend_from_slice(&system_event(1, i, b'O')),
            }
        }

        let mut total = 0;
        for dgram in pack_all(&dump) {
            assert!(dgram.len() <= MAX_DATAGRAM);
            // Each datagram must itself re-frame cleanly.
            let mut pos = 0;
            while pos < dgram.len() {
                let size = record_size(dgram[pos]).expect("datagram split a record");
                pos += size;
            }
            assert_eq!(pos, dgram.len());
            total += dgram.len();
        }
        assert_eq!(total, dump.len());
    }

    #[test]
    fn empty_dump_yields_nothing() {
        let mut pos = 0;
        assert!(next_datagram(&[], &mut pos).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_in_dump_is_an_error() {
        let mut dump = executed(1, 1, 7, 1);
        dump.push(b'q');
        let mut pos = 0;
        // A malformed dump fails the pack outright.
        assert!(matches!(
            next_datagram(&dump, &mut pos),
            Err(Error::UnknownTag { tag: b'q', .. })
        ));
    }

    #[test]
    fn dump_ending_mid_record_is_an_error() {
        let full = trade(1, 1, 7, b'B', 1, b"CUT     ", 2);
        let mut pos = 0;
        assert!(matches!(
            next_datagram(&full[..20], &mut pos),
            Err(Error::Truncated { .. })
        ));
    }
}
