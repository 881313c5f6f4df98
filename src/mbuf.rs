//! Packet buffers and the size-bucketed buffer pool.
//!
//! A simplified take on the DPDK/BSD mbuf model: fixed-capacity segments
//! with headroom, chained into packets, recycled through per-size free
//! lists. The pool is strictly per worker; nothing here is thread safe.
//!
//! The upstream intrusive circular list is reworked into a safe shape: the
//! head segment owns its auxiliary segments in a deque, and an empty chain
//! is simply `nb_segs == 1` with no auxiliaries. Multicast attach/detach is
//! not supported, so a reference count is not modeled.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::counter_rec;
use crate::counters::{Counter, CounterDb, Severity};

/// Extra bytes allocated in front of every buffer for header prepends.
pub const MBUF_HEADROOM: u16 = 64;

/// Largest allocatable packet. Requests above this panic.
pub const MAX_PACKET_SIZE: u16 = 9 * 1024;

/// Port value of a freshly reset mbuf.
pub const MBUF_INVALID_PORT: u16 = 0xffff;

/// Bucket cap sizes, smallest first.
const BUCKET_SIZES: [u16; 7] = [128, 256, 512, 1024, 2048, 4096, MAX_PACKET_SIZE];

/// A chunk of packet data. The head of a chain additionally tracks the
/// totals (`pkt_len`, `nb_segs`) and owns the auxiliary segments.
#[derive(Debug)]
pub struct Mbuf {
    buf: Box<[u8]>,
    bucket: u8,
    data_off: u16,
    data_len: u16,
    pkt_len: u32,
    nb_segs: u16,
    vport: u16,
    timestamp: u64,
    aux: VecDeque<Mbuf>,
}

impl Mbuf {
    fn new(bucket: u8, size: u16) -> Self {
        let cap = size as usize + MBUF_HEADROOM as usize;
        Mbuf {
            buf: vec![0u8; cap].into_boxed_slice(),
            bucket,
            data_off: MBUF_HEADROOM,
            data_len: 0,
            pkt_len: 0,
            nb_segs: 1,
            vport: MBUF_INVALID_PORT,
            timestamp: 0,
            aux: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        debug_assert!(self.aux.is_empty());
        self.data_off = MBUF_HEADROOM;
        self.data_len = 0;
        self.pkt_len = 0;
        self.nb_segs = 1;
        self.vport = MBUF_INVALID_PORT;
        self.timestamp = 0;
    }

    /// Total bytes across the chain. Valid on the head segment.
    pub fn pkt_len(&self) -> u32 {
        self.pkt_len
    }

    /// Bytes held by this segment alone.
    pub fn data_len(&self) -> u16 {
        self.data_len
    }

    pub fn nb_segs(&self) -> u16 {
        self.nb_segs
    }

    pub fn is_contiguous(&self) -> bool {
        self.nb_segs == 1
    }

    pub fn vport(&self) -> u16 {
        self.vport
    }

    pub fn set_vport(&mut self, vport: u16) {
        self.vport = vport;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, ts: u64) {
        self.timestamp = ts;
    }

    /// Unused bytes in front of the data in this segment.
    pub fn headroom(&self) -> u16 {
        self.data_off
    }

    /// Unused bytes behind the data in this segment.
    pub fn tailroom(&self) -> u16 {
        self.buf.len() as u16 - self.data_off - self.data_len
    }

    /// Valid bytes of this segment.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_off as usize..(self.data_off + self.data_len) as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off as usize..(self.data_off + self.data_len) as usize]
    }

    /// All segments, head first.
    pub fn segs(&self) -> impl Iterator<Item = &Mbuf> {
        std::iter::once(self).chain(self.aux.iter().map(|m| {
            debug_assert!(m.aux.is_empty());
            m
        }))
    }

    /// Copy of all chained bytes, head to tail.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkt_len as usize);
        for seg in self.segs() {
            out.extend_from_slice(seg.data());
        }
        out
    }

    /// Write bytes in front of the current data. The caller must check
    /// [`Mbuf::headroom`] first; exceeding it is a programmer error.
    pub fn prepend(&mut self, d: &[u8]) {
        let size = d.len() as u16;
        if size > self.data_off {
            panic!("prepend {} bytes to mbuf with headroom {}", size, self.data_off);
        }
        self.data_off -= size;
        self.data_len += size;
        self.pkt_len += size as u32;
        self.buf[self.data_off as usize..(self.data_off + size) as usize].copy_from_slice(d);
    }

    /// Write bytes into the tail segment's tailroom. The caller must check
    /// the tail segment's [`Mbuf::tailroom`] first.
    pub fn append(&mut self, d: &[u8]) {
        let size = d.len() as u16;
        let pkt_add = size as u32;
        let last = self.last_seg_mut();
        let room = last.buf.len() as u16 - last.data_off - last.data_len;
        if size > room {
            panic!("append {} bytes to mbuf with tailroom {}", size, room);
        }
        let off = (last.data_off + last.data_len) as usize;
        last.buf[off..off + size as usize].copy_from_slice(d);
        last.data_len += size;
        self.pkt_len += pkt_add;
    }

    /// Drop `n` bytes from the end of the tail segment.
    pub fn trim(&mut self, n: u16) {
        let last = self.last_seg_mut();
        if n > last.data_len {
            panic!("trim {} bigger than tail segment len {}", n, last.data_len);
        }
        last.data_len -= n;
        self.pkt_len -= n as u32;
    }

    /// Drop `n` bytes from the start of the head segment. Unlike the write
    /// operations this takes untrusted lengths from parsed frames, so
    /// underflow is a recoverable error.
    pub fn adj(&mut self, n: u16) -> Result<(), MbufError> {
        if n > self.data_len {
            return Err(MbufError::Underflow { want: n, have: self.data_len });
        }
        self.data_off += n;
        self.data_len -= n;
        self.pkt_len -= n as u32;
        Ok(())
    }

    /// Chain a single-segment mbuf at the tail.
    pub fn append_mbuf(&mut self, m: Mbuf) {
        assert!(m.is_contiguous(), "appended mbuf must be a single segment");
        self.pkt_len += m.data_len as u32;
        self.nb_segs += 1;
        self.aux.push_back(m);
    }

    /// Unchain and return the first auxiliary segment.
    pub fn detach_first(&mut self) -> Option<Mbuf> {
        let m = self.aux.pop_front()?;
        self.pkt_len -= m.data_len as u32;
        self.nb_segs -= 1;
        Some(m)
    }

    /// Unchain and return the last auxiliary segment.
    pub fn detach_last(&mut self) -> Option<Mbuf> {
        let m = self.aux.pop_back()?;
        self.pkt_len -= m.data_len as u32;
        self.nb_segs -= 1;
        Some(m)
    }

    /// Build a fresh contiguous copy of a multi-segment chain.
    pub fn contiguous(&self, pool: &mut MbufPool) -> Mbuf {
        assert!(!self.is_contiguous(), "mbuf is already contiguous");
        let mut m = pool.alloc(self.pkt_len as u16);
        m.set_vport(self.vport);
        m.set_timestamp(self.timestamp);
        for seg in self.segs() {
            m.append(seg.data());
        }
        m
    }

    /// Verify the chain invariants, panicking on violation. Test aid.
    pub fn sanity_check(&self) {
        let mut pkt_len = 0u32;
        let mut segs = 0u16;
        for seg in self.segs() {
            assert!(seg.data_off as usize + seg.data_len as usize <= seg.buf.len());
            pkt_len += seg.data_len as u32;
            segs += 1;
        }
        assert_eq!(pkt_len, self.pkt_len, "pkt_len does not match chained data");
        assert_eq!(segs, self.nb_segs, "nb_segs does not match chain length");
    }

    /// K12-style hex rendering of the whole chain: `aa|bb|cc|`.
    pub fn k12_string(&self) -> String {
        let mut s = String::with_capacity(self.pkt_len as usize * 3);
        for seg in self.segs() {
            for b in seg.data() {
                s.push_str(&format!("{:02x}|", b));
            }
        }
        s
    }

    fn last_seg_mut(&mut self) -> &mut Mbuf {
        if self.aux.is_empty() { self } else { self.aux.back_mut().unwrap() }
    }
}

impl fmt::Display for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mbuf pktlen {} segs {} vport {}",
            self.pkt_len, self.nb_segs, self.vport
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MbufError {
    #[error("cannot remove {want} bytes from segment holding {have}")]
    Underflow { want: u16, have: u16 },
}

/// Per-bucket allocation statistics.
///
/// `in_use = alloc + cache_alloc - free - cache_free` must return to zero
/// before teardown.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub alloc: Counter<u64>,
    pub free: Counter<u64>,
    pub cache_alloc: Counter<u64>,
    pub cache_free: Counter<u64>,
}

impl PoolStats {
    pub fn in_use(&self) -> u64 {
        (self.alloc.get() + self.cache_alloc.get())
            .wrapping_sub(self.free.get() + self.cache_free.get())
    }

    fn new_db(&self, name: String) -> CounterDb {
        let mut db = CounterDb::new(name);
        db.add(counter_rec!(self.alloc, "mbufAlloc", "allocation of mbufs", "ops", Severity::Info));
        db.add(counter_rec!(self.free, "mbufFree", "deallocation of mbufs", "ops", Severity::Info));
        db.add(counter_rec!(
            self.cache_alloc,
            "mbufAllocCache",
            "allocation of mbufs from cache",
            "ops",
            Severity::Info
        ));
        db.add(counter_rec!(
            self.cache_free,
            "mbufFreeCache",
            "deallocation of mbufs to cache",
            "ops",
            Severity::Info
        ));
        db
    }
}

#[derive(Debug)]
struct Bucket {
    size: u16,
    cache: Vec<Mbuf>,
    max_cache: u32,
    stats: PoolStats,
    cdb: Rc<CounterDb>,
}

impl Bucket {
    fn new(size: u16, max_cache: u32) -> Self {
        let stats = PoolStats::default();
        let cdb = Rc::new(stats.new_db(format!("mbuf-{}", size)));
        Bucket { size, cache: Vec::new(), max_cache, stats, cdb }
    }
}

/// Free-list allocator with one bucket per cap size.
#[derive(Debug)]
pub struct MbufPool {
    buckets: Vec<Bucket>,
}

impl MbufPool {
    /// `max_cache` caps how many freed buffers each bucket retains.
    pub fn new(max_cache: u32) -> Self {
        let buckets = BUCKET_SIZES.iter().map(|&s| Bucket::new(s, max_cache)).collect();
        MbufPool { buckets }
    }

    pub fn max_packet_size(&self) -> u16 {
        MAX_PACKET_SIZE
    }

    /// Allocate from the smallest bucket whose cap covers `size`.
    /// A request above [`MAX_PACKET_SIZE`] is a programmer error.
    pub fn alloc(&mut self, size: u16) -> Mbuf {
        let idx = self
            .buckets
            .iter()
            .position(|b| size <= b.size)
            .unwrap_or_else(|| panic!("mbuf alloc size too big: {}", size));
        let bucket = &mut self.buckets[idx];
        if let Some(mut m) = bucket.cache.pop() {
            bucket.stats.cache_alloc.inc();
            m.reset();
            m
        } else {
            bucket.stats.alloc.inc();
            Mbuf::new(idx as u8, bucket.size)
        }
    }

    /// Allocate and fill from a byte slice.
    pub fn alloc_from(&mut self, vport: u16, data: &[u8]) -> Mbuf {
        let mut m = self.alloc(data.len() as u16);
        m.set_vport(vport);
        m.append(data);
        m
    }

    /// Return a chain to its buckets. Segments above the cache ceiling are
    /// dropped to the allocator and counted as real frees.
    pub fn free(&mut self, mut m: Mbuf) {
        while let Some(seg) = m.detach_last() {
            self.free_seg(seg);
        }
        self.free_seg(m);
    }

    fn free_seg(&mut self, mut seg: Mbuf) {
        debug_assert!(seg.aux.is_empty());
        let bucket = &mut self.buckets[seg.bucket as usize];
        if (bucket.cache.len() as u32) < bucket.max_cache {
            seg.reset();
            bucket.cache.push(seg);
            bucket.stats.cache_free.inc();
        } else {
            bucket.stats.free.inc();
        }
    }

    /// Outstanding buffers across all buckets.
    pub fn in_use(&self) -> u64 {
        self.buckets.iter().map(|b| b.stats.in_use()).sum()
    }

    /// Teardown: drop the caches after verifying nothing is still out.
    /// A non-zero balance is a leak and aborts the worker.
    pub fn release(&mut self) {
        for b in &mut self.buckets {
            let in_use = b.stats.in_use();
            if in_use != 0 {
                panic!("mbuf leak: pool {} still has {} buffers in use", b.size, in_use);
            }
            debug!(bucket = b.size, cached = b.cache.len(), "releasing mbuf cache");
            b.cache.clear();
        }
    }

    /// Per-bucket counter dbs for registration with the worker context.
    pub fn counter_dbs(&self) -> Vec<Rc<CounterDb>> {
        self.buckets.iter().map(|b| b.cdb.clone()).collect()
    }
}
