//! # Page Format
//!
//! Every 4 KiB page begins with a 48-byte header followed by its two fence
//! keys, a slot directory growing forward and a record heap growing
//! backward:
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       2     record_count     Number of records in this page
//! 2       2     prefix_len       Bytes shared by every key (from fences)
//! 4       2     free_start       Offset where the slot directory ends
//! 6       2     free_end         Offset where the record heap begins
//! 8       2     lower_len        Lower fence key length
//! 10      2     upper_len        Upper fence key length
//! 12      2     flags            HAS_MODEL, OVERFLOW
//! 14      2     (reserved)
//! 16      8     overflow         SegmentId of the overflow page (0 = none)
//! 24      8     model_slope      Model line, valid only with HAS_MODEL
//! 32      8     model_intercept
//! 40      4     sequence         Rewrite sequence number of the segment
//! 44      4     checksum         CRC32 over the page, checksum field zeroed
//! 48      8     lower fence      Smallest key that belongs to this page
//! 56      8     upper fence      Smallest key of the NEXT page (exclusive)
//! 64      ...   slot directory   record_count x 2-byte record offsets
//! ...     ...   free space
//! ...     ...   record heap      Records, growing from the end of the page
//! ```
//!
//! Records are stored with the fence-derived common prefix stripped: each
//! heap entry is `[suffix_len u16][value_len u16][suffix][value]`. Because
//! keys are fixed-width big-endian integers, every key in
//! `[lower, upper)` shares the byte prefix common to `lower` and
//! `upper - 1`, so suffix comparison preserves key order.
//!
//! The slot directory is kept sorted by key, so lookups binary-search the
//! suffixes. Updating a key with a same-length value overwrites in place;
//! other updates and removals leak heap space until the page is rebuilt by
//! a flatten, rewrite or reorganization — the same policy the compacting
//! structures upstream rely on.
//!
//! An all-zero header marks a free (or zeroed-out) slot; recovery and the
//! free list both rely on that convention.
//!
//! `Page`/`PageMut` are views over borrowed buffers and hold no
//! synchronization; the buffer manager's latches provide mutual exclusion.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::key::{self, Key, KEY_SIZE};
use crate::model::Line64;
use crate::storage::SegmentId;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 48;

/// Offset of the first slot: header plus the two fixed-width fences.
pub const PAGE_CONTENT_START: usize = PAGE_HEADER_SIZE + 2 * KEY_SIZE;

/// Space available for slots and records.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_CONTENT_START;

/// Per-record bookkeeping: one slot plus the two length fields.
pub const PAGE_RECORD_METADATA: usize = 6;

pub const PAGE_FLAG_HAS_MODEL: u16 = 0x1;
pub const PAGE_FLAG_OVERFLOW: u16 = 0x2;

const CHECKSUM_OFFSET: usize = 44;
const LOWER_FENCE_OFFSET: usize = PAGE_HEADER_SIZE;
const UPPER_FENCE_OFFSET: usize = PAGE_HEADER_SIZE + KEY_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct PageHeader {
    record_count: u16,
    prefix_len: u16,
    free_start: u16,
    free_end: u16,
    lower_len: u16,
    upper_len: u16,
    flags: u16,
    reserved: u16,
    overflow: u64,
    model_slope: f64,
    model_intercept: f64,
    sequence: u32,
    checksum: u32,
}

impl PageHeader {
    // Page buffers are plain byte arrays with no alignment guarantee, so the
    // header is copied in and out rather than reinterpreted in place.
    fn load(data: &[u8]) -> PageHeader {
        PageHeader::read_from_bytes(&data[..PAGE_HEADER_SIZE]).unwrap()
    }

    fn store(&self, data: &mut [u8]) {
        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }
}

/// Computes the page checksum: CRC32 with the checksum field itself zeroed.
pub fn compute_checksum(data: &[u8]) -> u32 {
    const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = CRC32.digest();
    digest.update(&data[..CHECKSUM_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&data[CHECKSUM_OFFSET + 4..]);
    digest.finalize()
}

/// Read-only view over a page buffer.
#[derive(Clone, Copy)]
pub struct Page<'a> {
    data: &'a [u8],
}

impl<'a> Page<'a> {
    pub fn new(data: &'a [u8]) -> Page<'a> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Page { data }
    }

    fn header(&self) -> PageHeader {
        PageHeader::load(self.data)
    }

    /// A slot that has never been written (or has been zeroed out for
    /// reclamation) has an all-zero header.
    pub fn is_zeroed(&self) -> bool {
        self.data[..PAGE_HEADER_SIZE].iter().all(|&b| b == 0)
    }

    pub fn record_count(&self) -> usize {
        self.header().record_count as usize
    }

    pub fn prefix_len(&self) -> usize {
        self.header().prefix_len as usize
    }

    pub fn lower_fence(&self) -> Key {
        key::decode(&self.data[LOWER_FENCE_OFFSET..LOWER_FENCE_OFFSET + KEY_SIZE])
    }

    /// Exclusive upper fence. `u64::MAX` stands for "unbounded".
    pub fn upper_fence(&self) -> Key {
        key::decode(&self.data[UPPER_FENCE_OFFSET..UPPER_FENCE_OFFSET + KEY_SIZE])
    }

    pub fn overflow(&self) -> Option<SegmentId> {
        SegmentId::from_repr(self.header().overflow)
    }

    pub fn has_overflow(&self) -> bool {
        self.header().overflow != 0
    }

    pub fn is_overflow_page(&self) -> bool {
        self.header().flags & PAGE_FLAG_OVERFLOW != 0
    }

    pub fn model(&self) -> Option<Line64> {
        let h = self.header();
        if h.flags & PAGE_FLAG_HAS_MODEL != 0 {
            Some(Line64::new(h.model_slope, h.model_intercept))
        } else {
            None
        }
    }

    pub fn sequence(&self) -> u32 {
        self.header().sequence
    }

    pub fn checksum_ok(&self) -> bool {
        self.header().checksum == compute_checksum(self.data)
    }

    pub fn free_space(&self) -> usize {
        let h = self.header();
        (h.free_end - h.free_start) as usize
    }

    /// Whether `key` falls inside this page's fences.
    pub fn contains_key(&self, key: Key) -> bool {
        let upper = self.upper_fence();
        key >= self.lower_fence() && (key < upper || upper == Key::MAX)
    }

    pub fn get(&self, key: Key) -> Option<&'a [u8]> {
        if !self.contains_key(key) {
            return None;
        }
        let enc = key::encode(key);
        let suffix = &enc[self.prefix_len()..];
        match self.find_slot(suffix) {
            Ok(idx) => Some(self.record_at(self.slot(idx)).1),
            Err(_) => None,
        }
    }

    /// The largest key stored in this page, if any.
    pub fn largest_key(&self) -> Option<Key> {
        let count = self.record_count();
        if count == 0 {
            return None;
        }
        let (suffix, _) = self.record_at(self.slot(count - 1));
        Some(self.full_key(suffix))
    }

    /// Records in ascending key order.
    pub fn iter(&self) -> PageRecords<'a> {
        let mut prefix = [0u8; KEY_SIZE];
        prefix.copy_from_slice(&self.data[LOWER_FENCE_OFFSET..LOWER_FENCE_OFFSET + KEY_SIZE]);
        PageRecords {
            page: *self,
            prefix,
            prefix_len: self.prefix_len(),
            next: 0,
            count: self.record_count(),
        }
    }

    fn slot(&self, idx: usize) -> usize {
        let at = PAGE_CONTENT_START + idx * 2;
        u16::from_le_bytes(self.data[at..at + 2].try_into().unwrap()) as usize
    }

    fn record_at(&self, offset: usize) -> (&'a [u8], &'a [u8]) {
        let suffix_len = u16::from_le_bytes(self.data[offset..offset + 2].try_into().unwrap());
        let value_len = u16::from_le_bytes(self.data[offset + 2..offset + 4].try_into().unwrap());
        let suffix_start = offset + 4;
        let value_start = suffix_start + suffix_len as usize;
        (
            &self.data[suffix_start..value_start],
            &self.data[value_start..value_start + value_len as usize],
        )
    }

    fn full_key(&self, suffix: &[u8]) -> Key {
        let mut enc = [0u8; KEY_SIZE];
        let prefix_len = self.prefix_len();
        enc[..prefix_len]
            .copy_from_slice(&self.data[LOWER_FENCE_OFFSET..LOWER_FENCE_OFFSET + prefix_len]);
        enc[prefix_len..].copy_from_slice(suffix);
        key::decode(&enc)
    }

    fn find_slot(&self, suffix: &[u8]) -> Result<usize, usize> {
        let count = self.record_count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (mid_suffix, _) = self.record_at(self.slot(mid));
            match mid_suffix.cmp(suffix) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }
}

/// Iterator over a page's records in key order.
pub struct PageRecords<'a> {
    page: Page<'a>,
    prefix: [u8; KEY_SIZE],
    prefix_len: usize,
    next: usize,
    count: usize,
}

impl<'a> Iterator for PageRecords<'a> {
    type Item = (Key, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let (suffix, value) = self.page.record_at(self.page.slot(self.next));
        self.next += 1;
        let mut enc = self.prefix;
        enc[self.prefix_len..].copy_from_slice(suffix);
        Some((key::decode(&enc), value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.next;
        (left, Some(left))
    }
}

/// Mutable view over a page buffer.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> PageMut<'a> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        PageMut { data }
    }

    pub fn as_page(&self) -> Page<'_> {
        Page::new(self.data)
    }

    fn header(&self) -> PageHeader {
        PageHeader::load(self.data)
    }

    fn store(&mut self, header: &PageHeader) {
        header.store(self.data);
    }

    /// Initializes an empty page spanning `[lower, upper)`. The buffer is
    /// zeroed first, so a reused slot carries nothing over.
    pub fn init(&mut self, lower: Key, upper: Key) {
        debug_assert!(lower < upper || upper == Key::MAX);
        self.data.fill(0);
        let lower_enc = key::encode(lower);
        // The prefix must cover the largest storable key, which is upper - 1
        // (the fence itself is exclusive).
        let last_enc = key::encode(if upper == Key::MAX { upper } else { upper - 1 });
        let prefix_len = key::shared_prefix_len(&lower_enc, &last_enc);
        let header = PageHeader {
            record_count: 0,
            prefix_len: prefix_len as u16,
            free_start: PAGE_CONTENT_START as u16,
            free_end: PAGE_SIZE as u16,
            lower_len: KEY_SIZE as u16,
            upper_len: KEY_SIZE as u16,
            flags: 0,
            reserved: 0,
            overflow: 0,
            model_slope: 0.0,
            model_intercept: 0.0,
            sequence: 0,
            checksum: 0,
        };
        self.store(&header);
        self.data[LOWER_FENCE_OFFSET..LOWER_FENCE_OFFSET + KEY_SIZE].copy_from_slice(&lower_enc);
        self.data[UPPER_FENCE_OFFSET..UPPER_FENCE_OFFSET + KEY_SIZE]
            .copy_from_slice(&key::encode(upper));
    }

    /// Initializes an overflow page inheriting its parent's fences (and
    /// therefore its prefix).
    pub fn init_overflow(&mut self, lower: Key, upper: Key) {
        self.init(lower, upper);
        let mut h = self.header();
        h.flags |= PAGE_FLAG_OVERFLOW;
        self.store(&h);
    }

    /// Inserts or updates a record. Returns `false` when the page has no
    /// room, leaving it unchanged.
    pub fn insert(&mut self, key: Key, value: &[u8]) -> bool {
        debug_assert!(self.as_page().contains_key(key), "key outside page fences");
        let mut h = self.header();
        let enc = key::encode(key);
        let suffix = &enc[h.prefix_len as usize..];
        let record_len = 4 + suffix.len() + value.len();
        debug_assert!(record_len <= u16::MAX as usize);

        match self.as_page().find_slot(suffix) {
            Ok(idx) => {
                let offset = self.as_page().slot(idx);
                let (_, old_value) = self.as_page().record_at(offset);
                if old_value.len() == value.len() {
                    let value_start = offset + 4 + suffix.len();
                    self.data[value_start..value_start + value.len()].copy_from_slice(value);
                    return true;
                }
                // The value length changed: write a fresh record and leak
                // the old heap space.
                if (h.free_end - h.free_start) as usize > record_len {
                    let offset = h.free_end as usize - record_len;
                    self.write_record(offset, suffix, value);
                    self.set_slot(idx, offset as u16);
                    h.free_end = offset as u16;
                    self.store(&h);
                    true
                } else {
                    false
                }
            }
            Err(idx) => {
                if ((h.free_end - h.free_start) as usize) < record_len + 2 {
                    return false;
                }
                let offset = h.free_end as usize - record_len;
                self.write_record(offset, suffix, value);
                // Shift the slot directory to keep it sorted.
                let count = h.record_count as usize;
                let slots_start = PAGE_CONTENT_START + idx * 2;
                let slots_end = PAGE_CONTENT_START + count * 2;
                self.data.copy_within(slots_start..slots_end, slots_start + 2);
                self.set_slot(idx, offset as u16);
                h.record_count += 1;
                h.free_start += 2;
                h.free_end = offset as u16;
                self.store(&h);
                true
            }
        }
    }

    /// Removes a record. The heap space is leaked until the page is
    /// rebuilt.
    pub fn remove(&mut self, key: Key) -> bool {
        if !self.as_page().contains_key(key) {
            return false;
        }
        let mut h = self.header();
        let enc = key::encode(key);
        let suffix = &enc[h.prefix_len as usize..];
        let Ok(idx) = self.as_page().find_slot(suffix) else {
            return false;
        };
        let count = h.record_count as usize;
        let slots_start = PAGE_CONTENT_START + (idx + 1) * 2;
        let slots_end = PAGE_CONTENT_START + count * 2;
        self.data.copy_within(slots_start..slots_end, slots_start - 2);
        h.record_count -= 1;
        h.free_start -= 2;
        self.store(&h);
        true
    }

    pub fn set_overflow(&mut self, id: Option<SegmentId>) {
        let mut h = self.header();
        h.overflow = id.map_or(0, |id| id.to_repr());
        self.store(&h);
    }

    pub fn set_model(&mut self, model: Line64) {
        let mut h = self.header();
        h.flags |= PAGE_FLAG_HAS_MODEL;
        h.model_slope = model.slope;
        h.model_intercept = model.intercept;
        self.store(&h);
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        let mut h = self.header();
        h.sequence = sequence;
        self.store(&h);
    }

    pub fn update_checksum(&mut self) {
        let checksum = compute_checksum(self.data);
        let mut h = self.header();
        h.checksum = checksum;
        self.store(&h);
    }

    fn write_record(&mut self, offset: usize, suffix: &[u8], value: &[u8]) {
        self.data[offset..offset + 2].copy_from_slice(&(suffix.len() as u16).to_le_bytes());
        self.data[offset + 2..offset + 4].copy_from_slice(&(value.len() as u16).to_le_bytes());
        let suffix_start = offset + 4;
        self.data[suffix_start..suffix_start + suffix.len()].copy_from_slice(suffix);
        let value_start = suffix_start + suffix.len();
        self.data[value_start..value_start + value.len()].copy_from_slice(value);
    }

    fn set_slot(&mut self, idx: usize, offset: u16) {
        let at = PAGE_CONTENT_START + idx * 2;
        self.data[at..at + 2].copy_from_slice(&offset.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page(buf: &mut [u8], lower: Key, upper: Key) -> PageMut<'_> {
        let mut page = PageMut::new(buf);
        page.init(lower, upper);
        page
    }

    #[test]
    fn header_is_48_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn init_sets_fences_and_prefix() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let page = fresh_page(&mut buf, 0x1000, 0x1100);
        let read = page.as_page();
        assert_eq!(read.lower_fence(), 0x1000);
        assert_eq!(read.upper_fence(), 0x1100);
        // 0x1000 and 0x10FF share 7 leading bytes (big-endian).
        assert_eq!(read.prefix_len(), 7);
        assert_eq!(read.record_count(), 0);
        assert!(!read.has_overflow());
    }

    #[test]
    fn insert_get_round_trip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, 1000);
        for key in [5u64, 1, 999, 42] {
            assert!(page.insert(key, format!("v{key}").as_bytes()));
        }
        let read = page.as_page();
        assert_eq!(read.record_count(), 4);
        assert_eq!(read.get(42), Some(&b"v42"[..]));
        assert_eq!(read.get(999), Some(&b"v999"[..]));
        assert_eq!(read.get(7), None);
        assert_eq!(read.get(1000), None);
    }

    #[test]
    fn iteration_is_sorted() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, Key::MAX);
        for key in [9u64, 3, 7, 1, 5] {
            assert!(page.insert(key, b"x"));
        }
        let keys: Vec<Key> = page.as_page().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        assert_eq!(page.as_page().largest_key(), Some(9));
    }

    #[test]
    fn duplicate_insert_overwrites() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, 100);
        assert!(page.insert(10, b"aaa"));
        assert!(page.insert(10, b"bbb"));
        assert_eq!(page.as_page().record_count(), 1);
        assert_eq!(page.as_page().get(10), Some(&b"bbb"[..]));
        // A different value length goes through the fresh-record path.
        assert!(page.insert(10, b"cc"));
        assert_eq!(page.as_page().get(10), Some(&b"cc"[..]));
        assert_eq!(page.as_page().record_count(), 1);
    }

    #[test]
    fn fills_up_and_rejects() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, Key::MAX);
        let value = [0u8; 100];
        let mut inserted = 0u64;
        while page.insert(inserted, &value) {
            inserted += 1;
        }
        assert!(inserted > 30);
        // The failed insert left the page intact.
        assert_eq!(page.as_page().record_count(), inserted as usize);
        assert_eq!(page.as_page().get(0), Some(&value[..]));
    }

    #[test]
    fn remove_keeps_order() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, 100);
        for key in 0..10u64 {
            assert!(page.insert(key, b"v"));
        }
        assert!(page.remove(4));
        assert!(!page.remove(4));
        let keys: Vec<Key> = page.as_page().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn overflow_pointer_round_trip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, 100);
        assert_eq!(page.as_page().overflow(), None);
        let id = SegmentId::new(0, 77);
        page.set_overflow(Some(id));
        assert_eq!(page.as_page().overflow(), Some(id));
        page.set_overflow(None);
        assert!(!page.as_page().has_overflow());
    }

    #[test]
    fn model_round_trip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, 100);
        assert_eq!(page.as_page().model(), None);
        page.set_model(Line64::new(0.25, 1.5));
        assert_eq!(page.as_page().model(), Some(Line64::new(0.25, 1.5)));
    }

    #[test]
    fn checksum_detects_flips() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 0, 100);
        assert!(page.insert(1, b"value"));
        page.set_sequence(7);
        page.update_checksum();
        assert!(page.as_page().checksum_ok());
        buf[2000] ^= 0xFF;
        assert!(!Page::new(&buf).checksum_ok());
    }

    #[test]
    fn zeroed_page_is_detected() {
        let buf = vec![0u8; PAGE_SIZE];
        assert!(Page::new(&buf).is_zeroed());
        let mut buf2 = vec![0u8; PAGE_SIZE];
        fresh_page(&mut buf2, 0, 100);
        assert!(!Page::new(&buf2).is_zeroed());
    }

    #[test]
    fn unbounded_upper_fence_accepts_max_key() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = fresh_page(&mut buf, 100, Key::MAX);
        assert!(page.insert(Key::MAX, b"last"));
        assert!(page.insert(100, b"first"));
        assert_eq!(page.as_page().get(Key::MAX), Some(&b"last"[..]));
        assert!(!page.as_page().contains_key(99));
    }
}
