#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A record tag that is not part of the closed tag set. Decoding of the
    /// containing datagram stops at the offending byte.
    #[error("unknown message tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    /// The canonical record size would overrun the datagram.
    #[error("truncated {tag} record at offset {offset}: need {need} bytes, {remaining} remain")]
    Truncated {
        tag: char,
        offset: usize,
        need: usize,
        remaining: usize,
    },

    /// The spread between the retirement cursor and the highest observed
    /// sequence number no longer fits the window. Either the feed is badly
    /// misbehaving or the window is misconfigured; classification state can
    /// not be trusted past this point.
    #[error("sequence window exceeded: next={next} highest={highest} capacity={capacity}")]
    WindowExceeded {
        next: u32,
        highest: u32,
        capacity: usize,
    },

    #[error("invalid config: {0}")]
    Config(String),

    /// Raw errno from ring or socket setup, with the failing operation.
    #[error("{op}: {source}")]
    Setup {
        op: &'static str,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
