//! Record encoders shared by the unit tests.

fn header(tag: u8, timestamp: u64, sequence: u32) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&timestamp.to_be_bytes()[2..]);
    out.extend_from_slice(&sequence.to_be_bytes());
    out
}

fn trade_like(
    tag: u8,
    timestamp: u64,
    sequence: u32,
    order_ref: u64,
    side: u8,
    shares: u32,
    stock: &[u8; 8],
    price: u32,
) -> Vec<u8> {
    let mut out = header(tag, timestamp, sequence);
    out.extend_from_slice(&order_ref.to_be_bytes());
    out.push(side);
    out.extend_from_slice(&shares.to_be_bytes());
    out.extend_from_slice(stock);
    out.extend_from_slice(&price.to_be_bytes());
    out
}

pub fn order_add(
    timestamp: u64,
    sequence: u32,
    order_ref: u64,
    side: u8,
    shares: u32,
    stock: &[u8; 8],
    price: u32,
) -> Vec<u8> {
    trade_like(b'A', timestamp, sequence, order_ref, side, shares, stock, price)
}

pub fn trade(
    timestamp: u64,
    sequence: u32,
    order_ref: u64,
    side: u8,
    shares: u32,
    stock: &[u8; 8],
    price: u32,
) -> Vec<u8> {
    trade_like(b'P', timestamp, sequence, order_ref, side, shares, stock, price)
}

pub fn executed(timestamp: u64, sequence: u32, order_ref: u64, shares: u32) -> Vec<u8> {
    let mut out = header(b'E', timestamp, sequence);
    out.extend_from_slice(&order_ref.to_be_bytes());
    out.extend_from_slice(&shares.to_be_bytes());
    out
}

pub fn with_price(
    timestamp: u64,
    sequence: u32,
    order_ref: u64,
    shares: u32,
    printable: u8,
    price: u32,
) -> Vec<u8> {
    let mut out = header(b'X', timestamp, sequence);
    out.extend_from_slice(&order_ref.to_be_bytes());
    out.extend_from_slice(&shares.to_be_bytes());
    out.push(printable);
    out.extend_from_slice(&price.to_be_bytes());
    out
}

pub fn system_event(timestamp: u64, sequence: u32, event_code: u8) -> Vec<u8> {
    let mut out = header(b'S', timestamp, sequence);
    out.push(event_code);
    out
}

pub fn cancelled(timestamp: u64, sequence: u32, order_ref: u64, shares: u32) -> Vec<u8> {
    let mut out = header(b'C', timestamp, sequence);
    out.extend_from_slice(&order_ref.to_be_bytes());
    out.extend_from_slice(&shares.to_be_bytes());
    out
}
