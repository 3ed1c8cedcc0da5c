//! TPACKET_V3 receive ring shared with the kernel.
//!
//! A PACKET_RX_RING maps a set of blocks into this process; the kernel fills
//! a block with variable-length frames and flips its status word to hand
//! ownership to user space. The consumer walks every frame in the block and
//! flips the status back, all without a copy or a syscall per packet.
//!
//! Ownership handshake: the status word is read with a volatile load
//! followed by an acquire fence, and returned with a release fence followed
//! by a volatile store, pairing with the kernel's own barriers.

use std::ffi::CString;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use tracing::info;
use typed_builder::TypedBuilder;

use crate::{Error, Result};

/// Kernel ABI for PACKET_MMAP v3, from uapi/linux/if_packet.h. Declared
/// locally; `libc` supplies the syscalls and portable socket types.
mod tpacket {
    #![allow(non_camel_case_types)]

    pub const PACKET_RX_RING: libc::c_int = 5;
    pub const PACKET_VERSION: libc::c_int = 10;
    pub const TPACKET_V3: libc::c_int = 2;

    pub const TP_STATUS_KERNEL: u32 = 0;
    pub const TP_STATUS_USER: u32 = 1;

    #[repr(C)]
    pub struct tpacket_req3 {
        pub tp_block_size: u32,
        pub tp_block_nr: u32,
        pub tp_frame_size: u32,
        pub tp_frame_nr: u32,
        pub tp_retire_blk_tov: u32,
        pub tp_sizeof_priv: u32,
        pub tp_feature_req_word: u32,
    }

    #[repr(C)]
    pub struct tpacket_bd_ts {
        pub ts_sec: u32,
        pub ts_usec: u32,
    }

    #[repr(C)]
    pub struct tpacket_hdr_v1 {
        pub block_status: u32,
        pub num_pkts: u32,
        pub offset_to_first_pkt: u32,
        pub blk_len: u32,
        pub seq_num: u64,
        pub ts_first_pkt: tpacket_bd_ts,
        pub ts_last_pkt: tpacket_bd_ts,
    }

    // The uapi union tpacket_bd_header_u has bh1 as its only member.
    #[repr(C)]
    pub struct tpacket_block_desc {
        pub version: u32,
        pub offset_to_priv: u32,
        pub bh1: tpacket_hdr_v1,
    }

    #[repr(C)]
    pub struct tpacket_hdr_variant1 {
        pub tp_rxhash: u32,
        pub tp_vlan_tci: u32,
        pub tp_vlan_tpid: u16,
        pub tp_padding: u16,
    }

    #[repr(C)]
    pub struct tpacket3_hdr {
        pub tp_next_offset: u32,
        pub tp_sec: u32,
        pub tp_nsec: u32,
        pub tp_snaplen: u32,
        pub tp_len: u32,
        pub tp_status: u32,
        pub tp_mac: u16,
        pub tp_net: u16,
        pub hv1: tpacket_hdr_variant1,
        pub tp_padding: [u8; 8],
    }
}

/// Ring geometry. Block size must be a multiple of both the page size and
/// the frame size.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct RingConfig {
    #[builder(default = 1 << 17)]
    pub block_size: usize,
    #[builder(default = 64)]
    pub block_count: usize,
    #[builder(default = 2048)]
    pub frame_size: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RingConfig {
    /// Total bytes of the shared mapping.
    ///
    /// # Errors
    /// [`Error::Config`] when the geometry overflows the address space.
    pub fn map_len(&self) -> Result<usize> {
        self.block_size
            .checked_mul(self.block_count)
            .ok_or_else(|| Error::Config("ring dimensions overflow the address space".into()))
    }

    fn frame_count(&self) -> usize {
        self.block_size / self.frame_size * self.block_count
    }

    fn validate(&self) -> Result<()> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if self.block_size == 0 || self.block_size % page != 0 {
            return Err(Error::Config(format!(
                "block size {} is not a multiple of the page size {page}",
                self.block_size
            )));
        }
        if self.frame_size == 0 || self.block_size % self.frame_size != 0 {
            return Err(Error::Config(format!(
                "block size {} is not a multiple of the frame size {}",
                self.block_size, self.frame_size
            )));
        }
        if self.block_count == 0 {
            return Err(Error::Config("ring needs at least one block".into()));
        }
        self.map_len().map(|_| ())
    }
}

fn setup_err(op: &'static str) -> Error {
    Error::Setup {
        op,
        source: std::io::Error::last_os_error(),
    }
}

/// The mapped RX ring bound to one interface.
#[derive(Debug)]
pub struct PacketRing {
    fd: OwnedFd,
    map: *mut u8,
    map_len: usize,
    cfg: RingConfig,
    block_idx: usize,
}

// The mapping is owned exclusively; the raw pointers do not alias anything
// another thread can reach.
unsafe impl Send for PacketRing {}

impl PacketRing {
    /// Open an AF_PACKET socket for IPv4 frames on `interface`, request a
    /// TPACKET_V3 RX ring, and map it.
    ///
    /// # Errors
    /// [`Error::Config`] for bad geometry, [`Error::Setup`] for any failing
    /// syscall (these require CAP_NET_RAW).
    pub fn open(interface: &str, cfg: RingConfig) -> Result<Self> {
        cfg.validate()?;
        let map_len = cfg.map_len()?;

        let ifname = CString::new(interface)
            .map_err(|_| Error::Config(format!("bad interface name {interface:?}")))?;
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(setup_err("if_nametoindex"));
        }

        let proto_be = i32::from((libc::ETH_P_IP as u16).to_be());
        let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto_be) };
        if raw < 0 {
            return Err(setup_err("socket(AF_PACKET, SOCK_RAW)"));
        }
        // From here the fd closes on every failure path.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // The version must be in place before the ring is requested or the
        // kernel lays the ring out for TPACKET_V1.
        let version = tpacket::TPACKET_V3;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                tpacket::PACKET_VERSION,
                ptr::addr_of!(version).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(setup_err("setsockopt(PACKET_VERSION)"));
        }

        let req = tpacket::tpacket_req3 {
            tp_block_size: cfg.block_size as u32,
            tp_block_nr: cfg.block_count as u32,
            tp_frame_size: cfg.frame_size as u32,
            tp_frame_nr: cfg.frame_count() as u32,
            // 0 lets the kernel pick its default block-retire timeout, so a
            // partially filled block still reaches us under light traffic.
            tp_retire_blk_tov: 0,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                tpacket::PACKET_RX_RING,
                ptr::addr_of!(req).cast(),
                std::mem::size_of::<tpacket::tpacket_req3>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(setup_err("setsockopt(PACKET_RX_RING)"));
        }

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = (libc::ETH_P_IP as u16).to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(setup_err("bind(sockaddr_ll)"));
        }

        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(setup_err("mmap(PACKET_RX_RING)"));
        }

        info!(
            interface,
            ifindex,
            blocks = cfg.block_count,
            block_size = cfg.block_size,
            frames = cfg.frame_count(),
            "rx ring mapped"
        );

        Ok(PacketRing {
            fd,
            map: map.cast(),
            map_len,
            cfg,
            block_idx: 0,
        })
    }

    fn block_desc(&self, idx: usize) -> *mut tpacket::tpacket_block_desc {
        debug_assert!(idx < self.cfg.block_count);
        // Each block starts on a block_size boundary inside the mapping.
        unsafe { self.map.add(idx * self.cfg.block_size) }.cast()
    }

    /// The current block, if the kernel has handed it over; `None` while
    /// the kernel still owns it (callers busy-poll). Blocks are consumed in
    /// ring order; the returned handle releases the block on drop.
    pub fn next_block(&mut self) -> Option<Block<'_>> {
        let desc = self.block_desc(self.block_idx);
        // SAFETY: desc points into the live mapping; the status word is
        // written concurrently by the kernel, hence volatile + fence.
        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*desc).bh1.block_status)) };
        if status & tpacket::TP_STATUS_USER == 0 {
            return None;
        }
        fence(Ordering::Acquire);

        self.block_idx = (self.block_idx + 1) % self.cfg.block_count;
        Some(Block {
            desc,
            _ring: PhantomData,
        })
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        // SAFETY: map/map_len came from a successful mmap and are unmapped
        // exactly once. The fd closes itself afterwards.
        unsafe {
            libc::munmap(self.map.cast(), self.map_len);
        }
    }
}

/// One kernel-released block. Dropping it returns the block to the kernel.
pub struct Block<'r> {
    desc: *mut tpacket::tpacket_block_desc,
    _ring: PhantomData<&'r mut PacketRing>,
}

impl<'r> Block<'r> {
    #[must_use]
    pub fn num_frames(&self) -> u32 {
        unsafe { (*self.desc).bh1.num_pkts }
    }

    /// Iterate the raw link-layer frames in this block.
    #[must_use]
    pub fn frames(&self) -> Frames<'_> {
        let first = unsafe { (*self.desc).bh1.offset_to_first_pkt };
        Frames {
            hdr: unsafe { self.desc.cast::<u8>().add(first as usize) }.cast(),
            remaining: self.num_frames(),
            _block: PhantomData,
        }
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        // Hand the block back only after all frame reads are done.
        fence(Ordering::Release);
        // SAFETY: the descriptor outlives this handle (it lives in the
        // ring mapping) and no frame slice borrowed from it survives drop.
        unsafe {
            ptr::write_volatile(
                ptr::addr_of_mut!((*self.desc).bh1.block_status),
                tpacket::TP_STATUS_KERNEL,
            );
        }
    }
}

pub struct Frames<'b> {
    hdr: *const tpacket::tpacket3_hdr,
    remaining: u32,
    _block: PhantomData<&'b Block<'b>>,
}

impl<'b> Iterator for Frames<'b> {
    type Item = &'b [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let hdr = self.hdr;
        // SAFETY: hdr walks frame headers the kernel wrote inside the block;
        // num_pkts bounds the walk and tp_next_offset chains the headers.
        let frame = unsafe {
            let next_offset = (*hdr).tp_next_offset as usize;
            // Warm the next frame's header while this one is processed.
            prefetch(hdr.cast::<u8>().add(next_offset));

            let mac = (*hdr).tp_mac as usize;
            let snaplen = (*hdr).tp_snaplen as usize;
            let bytes = std::slice::from_raw_parts(hdr.cast::<u8>().add(mac), snaplen);

            self.hdr = hdr.cast::<u8>().add(next_offset).cast();
            bytes
        };
        self.remaining -= 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

#[inline(always)]
fn prefetch(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch has no memory effects; any address is allowed.
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(ptr.cast::<i8>());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

#[cfg(test)]
mod tests {
    use super::tpacket;
    use super::*;
    use std::mem::size_of;

    #[test]
    fn default_geometry_is_valid() {
        RingConfig::default().validate().unwrap();
        assert_eq!(RingConfig::default().map_len().unwrap(), 64 << 17);
    }

    #[test]
    fn block_size_must_be_page_multiple() {
        let cfg = RingConfig::builder().block_size(10_000).build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn block_size_must_be_frame_multiple() {
        let cfg = RingConfig::builder()
            .block_size(1 << 17)
            .frame_size(1000)
            .build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_blocks_rejected() {
        let cfg = RingConfig::builder().block_count(0).build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_ring_rejected() {
        let cfg = RingConfig::builder()
            .block_size(1 << 17)
            .block_count(usize::MAX / 4)
            .build();
        assert!(cfg.map_len().is_err());
    }

    #[test]
    fn kernel_abi_layout() {
        // Sizes pinned by uapi/linux/if_packet.h.
        assert_eq!(size_of::<tpacket::tpacket_req3>(), 28);
        assert_eq!(size_of::<tpacket::tpacket_hdr_v1>(), 40);
        assert_eq!(size_of::<tpacket::tpacket_block_desc>(), 48);
        assert_eq!(size_of::<tpacket::tpacket3_hdr>(), 48);
    }

    #[test]
    fn unknown_interface_fails_setup() {
        let err = PacketRing::open("no-such-interface-0", RingConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
    }
}
