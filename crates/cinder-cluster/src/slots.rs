//! Hash slots: key hashing, slot bitmaps and the per-node slot tables.
//!
//! The keyspace is split into 16384 slots. A key maps to a slot through
//! CRC16 (XMODEM) of its hash tag, or of the whole key when it has none.

use crate::{ClusterError, NodeId};

/// Total number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// Bytes needed to hold one bit per slot.
pub const SLOT_BITMAP_LEN: usize = SLOT_COUNT as usize / 8;

/// CRC16 lookup table (XMODEM polynomial 0x1021).
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ CRC16_TABLE[usize::from((crc >> 8) as u8 ^ b)]
    })
}

/// Returns the part of `key` that is hashed.
///
/// When the key holds a non-empty `{...}` section, only the bytes between
/// the first `{` and the next `}` are hashed, so `{user1}:a` and
/// `{user1}:b` land in the same slot.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

/// Computes the hash slot for a key, in `0..SLOT_COUNT`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) & (SLOT_COUNT - 1)
}

/// Validates a slot number coming from outside the crate.
pub fn check_slot(slot: u16) -> Result<u16, ClusterError> {
    if slot < SLOT_COUNT {
        Ok(slot)
    } else {
        Err(ClusterError::SlotOutOfRange(slot))
    }
}

/// A contiguous, inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a range, validating both bounds.
    pub fn try_new(start: u16, end: u16) -> Result<Self, ClusterError> {
        check_slot(start)?;
        check_slot(end)?;
        if start > end {
            return Err(ClusterError::SlotOutOfRange(start));
        }
        Ok(Self { start, end })
    }

    pub fn single(slot: u16) -> Self {
        Self {
            start: slot,
            end: slot,
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl std::str::FromStr for SlotRange {
    type Err = ClusterError;

    /// Parses `"100"` or `"0-5460"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ClusterError::Configuration(format!("invalid slot range '{s}'"));
        match s.split_once('-') {
            Some((a, b)) => {
                let start = a.parse().map_err(|_| bad())?;
                let end = b.parse().map_err(|_| bad())?;
                SlotRange::try_new(start, end)
            }
            None => {
                let slot = s.parse().map_err(|_| bad())?;
                check_slot(slot).map(SlotRange::single)
            }
        }
    }
}

/// Collapses an ascending sequence of slots into ranges.
pub fn ranges_of(slots: impl IntoIterator<Item = u16>) -> Vec<SlotRange> {
    let mut ranges: Vec<SlotRange> = Vec::new();
    for slot in slots {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(slot) => last.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }
    ranges
}

/// One bit per slot, as carried in bus headers and UPDATE messages.
///
/// Bit `n` lives in byte `n / 8` at position `n % 8`, least significant bit
/// first. The population count is cached so `count()` is O(1).
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: Box<[u8; SLOT_BITMAP_LEN]>,
    count: u16,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ranges: Vec<String> = self.ranges().iter().map(|r| r.to_string()).collect();
        write!(f, "SlotBitmap[{}]", ranges.join(" "))
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0; SLOT_BITMAP_LEN]),
            count: 0,
        }
    }

    /// Builds a bitmap from its wire form.
    pub fn from_bytes(bytes: &[u8; SLOT_BITMAP_LEN]) -> Self {
        let count = bytes.iter().map(|b| b.count_ones() as u16).sum();
        Self {
            bits: Box::new(*bytes),
            count,
        }
    }

    pub fn from_ranges(ranges: &[SlotRange]) -> Self {
        let mut bitmap = Self::new();
        for slot in ranges.iter().flat_map(|r| r.iter()) {
            bitmap.set(slot);
        }
        bitmap
    }

    pub fn as_bytes(&self) -> &[u8; SLOT_BITMAP_LEN] {
        &self.bits
    }

    pub fn test(&self, slot: u16) -> bool {
        let slot = usize::from(slot);
        self.bits
            .get(slot / 8)
            .is_some_and(|byte| byte & (1 << (slot & 7)) != 0)
    }

    /// Sets the bit, returning its previous value.
    pub fn set(&mut self, slot: u16) -> bool {
        let idx = usize::from(slot);
        let Some(byte) = self.bits.get_mut(idx / 8) else {
            return false;
        };
        let mask = 1 << (idx & 7);
        let old = *byte & mask != 0;
        if !old {
            *byte |= mask;
            self.count += 1;
        }
        old
    }

    /// Clears the bit, returning its previous value.
    pub fn clear(&mut self, slot: u16) -> bool {
        let idx = usize::from(slot);
        let Some(byte) = self.bits.get_mut(idx / 8) else {
            return false;
        };
        let mask = 1 << (idx & 7);
        let old = *byte & mask != 0;
        if old {
            *byte &= !mask;
            self.count -= 1;
        }
        old
    }

    pub fn count(&self) -> usize {
        usize::from(self.count)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterates the set slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0)
            .flat_map(|(i, byte)| {
                (0..8u16)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| i as u16 * 8 + bit)
            })
    }

    pub fn ranges(&self) -> Vec<SlotRange> {
        ranges_of(self.iter())
    }
}

/// The three slot tables of a view: settled owner plus the transient
/// migrating / importing overlays.
#[derive(Debug, Clone)]
pub struct SlotTable {
    owner: Box<[Option<NodeId>]>,
    migrating_to: Box<[Option<NodeId>]>,
    importing_from: Box<[Option<NodeId>]>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        let empty = || vec![None; usize::from(SLOT_COUNT)].into_boxed_slice();
        Self {
            owner: empty(),
            migrating_to: empty(),
            importing_from: empty(),
        }
    }

    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.owner.get(usize::from(slot)).copied().flatten()
    }

    pub fn migrating_to(&self, slot: u16) -> Option<NodeId> {
        self.migrating_to.get(usize::from(slot)).copied().flatten()
    }

    pub fn importing_from(&self, slot: u16) -> Option<NodeId> {
        self.importing_from.get(usize::from(slot)).copied().flatten()
    }

    pub(crate) fn set_owner(&mut self, slot: u16, node: Option<NodeId>) {
        if let Some(cell) = self.owner.get_mut(usize::from(slot)) {
            *cell = node;
        }
    }

    pub(crate) fn set_migrating(&mut self, slot: u16, node: Option<NodeId>) {
        if let Some(cell) = self.migrating_to.get_mut(usize::from(slot)) {
            *cell = node;
        }
    }

    pub(crate) fn set_importing(&mut self, slot: u16, node: Option<NodeId>) {
        if let Some(cell) = self.importing_from.get_mut(usize::from(slot)) {
            *cell = node;
        }
    }

    /// Number of slots with an owner.
    pub fn assigned(&self) -> usize {
        self.owner.iter().filter(|o| o.is_some()).count()
    }

    /// Drops every cell that points at `node` in the overlay tables.
    pub(crate) fn forget_overlays(&mut self, node: NodeId) {
        for cell in self
            .migrating_to
            .iter_mut()
            .chain(self.importing_from.iter_mut())
        {
            if *cell == Some(node) {
                *cell = None;
            }
        }
    }

    /// Slots currently migrating away, with their destination.
    pub fn migrating(&self) -> impl Iterator<Item = (u16, NodeId)> + '_ {
        overlay_entries(&self.migrating_to)
    }

    /// Slots currently importing, with their source.
    pub fn importing(&self) -> impl Iterator<Item = (u16, NodeId)> + '_ {
        overlay_entries(&self.importing_from)
    }
}

fn overlay_entries(cells: &[Option<NodeId>]) -> impl Iterator<Item = (u16, NodeId)> + '_ {
    cells
        .iter()
        .enumerate()
        .filter_map(|(slot, node)| node.map(|n| (slot as u16, n)))
}
