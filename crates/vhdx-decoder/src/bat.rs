//! Block allocation table
//!
//! Payload block entries and sector bitmap entries are interleaved: after
//! every `chunk_ratio` payload entries comes the bitmap entry for that chunk.

use crate::layout::MIB;
use crate::metadata::Metadata;
use crate::region::RegionTableEntry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use vhdx_core::{checked_multiply_u64, u64_to_usize, ByteSource, Error, Result, MAX_BAT_ENTRIES};

const BAT_ENTRY_SIZE: u64 = 8;

/// Sizes derived from the metadata that fix the shape of the BAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatGeometry {
    pub block_size: u32,
    pub logical_sector_size: u32,
    pub virtual_disk_size: u64,
    pub chunk_ratio: u64,
    pub payload_blocks: u64,
    pub sector_bitmap_blocks: u64,
    pub total_entries: u64,
    pub differencing: bool,
}

impl BatGeometry {
    /// Compute the geometry; sizes are assumed validated by the metadata parser
    pub fn new(
        block_size: u32,
        logical_sector_size: u32,
        virtual_disk_size: u64,
        differencing: bool,
    ) -> Result<Self> {
        if block_size == 0 || logical_sector_size == 0 {
            return Err(Error::invalid_structure("zero block or sector size"));
        }
        let block = block_size as u64;
        let chunk_ratio = checked_multiply_u64(1 << 23, logical_sector_size as u64, "chunk ratio")?
            / block;
        if chunk_ratio == 0 {
            return Err(Error::invalid_structure(format!(
                "block size {} leaves no room for a sector bitmap chunk",
                block_size
            )));
        }

        let payload_blocks = virtual_disk_size.div_ceil(block);
        let sector_bitmap_blocks = payload_blocks.div_ceil(chunk_ratio);
        let total_entries = if differencing {
            checked_multiply_u64(sector_bitmap_blocks, chunk_ratio + 1, "BAT entries")?
        } else if payload_blocks == 0 {
            0
        } else {
            payload_blocks + (payload_blocks - 1) / chunk_ratio
        };

        Ok(Self {
            block_size,
            logical_sector_size,
            virtual_disk_size,
            chunk_ratio,
            payload_blocks,
            sector_bitmap_blocks,
            total_entries,
            differencing,
        })
    }

    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        Self::new(
            metadata.file_parameters.block_size,
            metadata.logical_sector_size,
            metadata.virtual_disk_size,
            metadata.file_parameters.has_parent,
        )
    }

    /// BAT index of payload block `block`
    pub fn payload_index(&self, block: u64) -> u64 {
        block + block / self.chunk_ratio
    }

    /// BAT index of the sector bitmap for chunk `chunk`
    pub fn sector_bitmap_index(&self, chunk: u64) -> u64 {
        chunk * (self.chunk_ratio + 1) + self.chunk_ratio
    }

    /// What the entry at `index` describes
    pub fn classify(&self, index: u64) -> BatEntryKind {
        let stride = self.chunk_ratio + 1;
        if index % stride == self.chunk_ratio {
            BatEntryKind::SectorBitmap {
                chunk: index / stride,
            }
        } else {
            BatEntryKind::Payload {
                block: index - index / stride,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatEntryKind {
    Payload { block: u64 },
    SectorBitmap { chunk: u64 },
}

/// Entry state; payload and sector bitmap entries share the encoding space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BlockState {
    NotPresent,
    Undefined,
    Zero,
    Unmapped,
    FullyPresent,
    PartiallyPresent,
    /// Sector bitmap block present
    Present,
    /// A bit pattern not defined for this kind of entry
    Unknown(u8),
}

impl BlockState {
    fn decode(kind: &BatEntryKind, bits: u8) -> Self {
        match kind {
            BatEntryKind::Payload { .. } => match bits {
                0 => BlockState::NotPresent,
                1 => BlockState::Undefined,
                2 => BlockState::Zero,
                3 => BlockState::Unmapped,
                6 => BlockState::FullyPresent,
                7 => BlockState::PartiallyPresent,
                other => BlockState::Unknown(other),
            },
            BatEntryKind::SectorBitmap { .. } => match bits {
                0 => BlockState::NotPresent,
                6 => BlockState::Present,
                other => BlockState::Unknown(other),
            },
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockState::NotPresent => write!(f, "NOT_PRESENT"),
            BlockState::Undefined => write!(f, "UNDEFINED"),
            BlockState::Zero => write!(f, "ZERO"),
            BlockState::Unmapped => write!(f, "UNMAPPED"),
            BlockState::FullyPresent => write!(f, "FULLY_PRESENT"),
            BlockState::PartiallyPresent => write!(f, "PARTIALLY_PRESENT"),
            BlockState::Present => write!(f, "PRESENT"),
            BlockState::Unknown(bits) => write!(f, "UNKNOWN({})", bits),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatEntry {
    pub index: u64,
    pub kind: BatEntryKind,
    pub state: BlockState,
    pub file_offset_mb: u64,
    pub raw: u64,
}

impl BatEntry {
    pub fn decode(index: u64, kind: BatEntryKind, raw: u64) -> Self {
        Self {
            index,
            kind,
            state: BlockState::decode(&kind, (raw & 0x7) as u8),
            file_offset_mb: raw >> 20,
            raw,
        }
    }

    /// Absolute file offset of the block
    pub fn file_offset(&self) -> u64 {
        self.file_offset_mb.saturating_mul(MIB)
    }
}

/// Entry counts per state, keyed by state name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatSummary {
    pub payload: BTreeMap<String, u64>,
    pub sector_bitmap: BTreeMap<String, u64>,
}

/// The decoded BAT
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bat {
    pub geometry: BatGeometry,
    pub entries: Vec<BatEntry>,
}

impl Bat {
    pub fn payload(&self, block: u64) -> Option<&BatEntry> {
        if block >= self.geometry.payload_blocks {
            return None;
        }
        let index = usize::try_from(self.geometry.payload_index(block)).ok()?;
        self.entries.get(index)
    }

    pub fn sector_bitmap(&self, chunk: u64) -> Option<&BatEntry> {
        if chunk >= self.geometry.sector_bitmap_blocks {
            return None;
        }
        let index = usize::try_from(self.geometry.sector_bitmap_index(chunk)).ok()?;
        self.entries.get(index)
    }

    pub fn payload_entries(&self) -> impl Iterator<Item = &BatEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.kind, BatEntryKind::Payload { .. }))
    }

    pub fn summary(&self) -> BatSummary {
        let mut summary = BatSummary::default();
        for entry in &self.entries {
            let bucket = match entry.kind {
                BatEntryKind::Payload { .. } => &mut summary.payload,
                BatEntryKind::SectorBitmap { .. } => &mut summary.sector_bitmap,
            };
            *bucket.entry(entry.state.to_string()).or_insert(0) += 1;
        }
        summary
    }
}

/// Read and decode every BAT entry the geometry calls for.
pub fn decode_bat<S: ByteSource + ?Sized>(
    source: &mut S,
    region: &RegionTableEntry,
    geometry: BatGeometry,
) -> Result<Bat> {
    if geometry.total_entries > MAX_BAT_ENTRIES {
        return Err(Error::unsupported(format!(
            "BAT with {} entries exceeds limit {}",
            geometry.total_entries, MAX_BAT_ENTRIES
        )));
    }
    let needed = checked_multiply_u64(geometry.total_entries, BAT_ENTRY_SIZE, "BAT size")?;
    if needed > region.length as u64 {
        return Err(Error::out_of_bounds(
            "BAT entries",
            region.file_offset,
            needed,
            region.end(),
        ));
    }

    let size = u64_to_usize(needed, "BAT size")?;
    let bytes = source.read_bytes(region.file_offset, size)?;
    let entries = bytes
        .chunks_exact(BAT_ENTRY_SIZE as usize)
        .enumerate()
        .map(|(index, raw)| {
            let index = index as u64;
            let raw = u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]);
            BatEntry::decode(index, geometry.classify(index), raw)
        })
        .collect();

    tracing::debug!(
        "BAT: {} entries, chunk ratio {}, {} payload blocks, {} sector bitmap blocks",
        geometry.total_entries,
        geometry.chunk_ratio,
        geometry.payload_blocks,
        geometry.sector_bitmap_blocks
    );
    Ok(Bat { geometry, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;
    use crate::testing::{VhdxBuilder, BAT_OFFSET};
    use vhdx_pipeline::MemorySource;

    fn bat_region() -> RegionTableEntry {
        RegionTableEntry {
            guid: crate::layout::BAT_REGION_GUID,
            kind: RegionKind::Bat,
            file_offset: BAT_OFFSET,
            length: MIB as u32,
            required: true,
        }
    }

    #[test]
    fn test_dynamic_1g_32m_has_32_entries() {
        let geometry = BatGeometry::new(32 * MIB as u32, 512, 1024 * MIB, false).unwrap();
        assert_eq!(geometry.chunk_ratio, 128);
        assert_eq!(geometry.payload_blocks, 32);
        assert_eq!(geometry.sector_bitmap_blocks, 1);
        assert_eq!(geometry.total_entries, 32);
    }

    #[test]
    fn test_differencing_geometry() {
        let geometry = BatGeometry::new(32 * MIB as u32, 512, 1024 * MIB, true).unwrap();
        assert_eq!(geometry.total_entries, 129);
    }

    #[test]
    fn test_dynamic_geometry_spanning_chunks() {
        // 1 MB blocks, 4K sectors: chunk ratio 32768
        let geometry = BatGeometry::new(MIB as u32, 4096, 40_000 * MIB, false).unwrap();
        assert_eq!(geometry.chunk_ratio, 32768);
        assert_eq!(geometry.payload_blocks, 40_000);
        assert_eq!(geometry.sector_bitmap_blocks, 2);
        assert_eq!(geometry.total_entries, 40_001);
    }

    #[test]
    fn test_partial_last_block_rounds_up() {
        let geometry = BatGeometry::new(MIB as u32, 512, 3 * MIB + 512, false).unwrap();
        assert_eq!(geometry.payload_blocks, 4);
    }

    #[test]
    fn test_interleaving() {
        let geometry = BatGeometry::new(MIB as u32, 512, 8192 * MIB, true).unwrap();
        let ratio = geometry.chunk_ratio;
        assert_eq!(ratio, 4096);

        assert_eq!(geometry.classify(0), BatEntryKind::Payload { block: 0 });
        assert_eq!(
            geometry.classify(ratio),
            BatEntryKind::SectorBitmap { chunk: 0 }
        );
        assert_eq!(
            geometry.classify(ratio + 1),
            BatEntryKind::Payload { block: ratio }
        );
        assert_eq!(geometry.payload_index(ratio), ratio + 1);
        assert_eq!(geometry.sector_bitmap_index(1), 2 * ratio + 1);
        assert_eq!(
            geometry.classify(2 * ratio + 1),
            BatEntryKind::SectorBitmap { chunk: 1 }
        );
    }

    #[test]
    fn test_state_decoding() {
        let raw = (4u64 << 20) | 0b110;
        let entry = BatEntry::decode(0, BatEntryKind::Payload { block: 0 }, raw);
        assert_eq!(entry.state, BlockState::FullyPresent);
        assert_eq!(entry.file_offset_mb, 4);
        assert_eq!(entry.file_offset(), 4 * MIB);

        let bitmap = BatEntry::decode(1, BatEntryKind::SectorBitmap { chunk: 0 }, raw);
        assert_eq!(bitmap.state, BlockState::Present);
    }

    #[test]
    fn test_unknown_state_bits() {
        let payload = BatEntryKind::Payload { block: 0 };
        let bitmap = BatEntryKind::SectorBitmap { chunk: 0 };
        assert_eq!(BatEntry::decode(0, payload, 4).state, BlockState::Unknown(4));
        assert_eq!(BatEntry::decode(0, payload, 5).state, BlockState::Unknown(5));
        assert_eq!(BatEntry::decode(0, bitmap, 2).state, BlockState::Unknown(2));
        // Reserved bits 3..20 do not affect the state
        assert_eq!(
            BatEntry::decode(0, payload, 0xFFFF8 | 2).state,
            BlockState::Zero
        );
    }

    #[test]
    fn test_decode_bat_from_image() {
        let image = VhdxBuilder::new()
            .bat_entry(0, (4 << 20) | 6)
            .bat_entry(1, 2)
            .bat_entry(2, 5)
            .build();
        let mut source = MemorySource::from_bytes(image);
        let geometry = BatGeometry::new(MIB as u32, 512, 64 * MIB, false).unwrap();
        let bat = decode_bat(&mut source, &bat_region(), geometry).unwrap();

        assert_eq!(bat.entries.len(), 64);
        assert_eq!(bat.payload(0).unwrap().state, BlockState::FullyPresent);
        assert_eq!(bat.payload(1).unwrap().state, BlockState::Zero);
        assert_eq!(bat.payload(2).unwrap().state, BlockState::Unknown(5));
        assert!(bat.payload(64).is_none());
        assert!(bat.sector_bitmap(0).is_none());
        assert_eq!(bat.payload_entries().count(), 64);

        let summary = bat.summary();
        assert_eq!(summary.payload["NOT_PRESENT"], 61);
        assert_eq!(summary.payload["FULLY_PRESENT"], 1);
        assert_eq!(summary.payload["UNKNOWN(5)"], 1);
        assert!(summary.sector_bitmap.is_empty());
    }

    #[test]
    fn test_sector_bitmap_lookup_out_of_range() {
        let image = VhdxBuilder::new().build();
        let mut source = MemorySource::from_bytes(image);
        let geometry = BatGeometry::new(MIB as u32, 512, 64 * MIB, true).unwrap();
        let bat = decode_bat(&mut source, &bat_region(), geometry).unwrap();

        assert!(bat.sector_bitmap(0).is_some());
        assert!(bat.sector_bitmap(1).is_none());
        assert!(bat.sector_bitmap(u64::MAX / 2).is_none());
        assert!(bat.sector_bitmap(u64::MAX).is_none());
        assert!(bat.payload(u64::MAX).is_none());
    }

    #[test]
    fn test_bat_larger_than_region() {
        let mut source = MemorySource::from_bytes(VhdxBuilder::new().build());
        // 1 MB blocks over 1 TB: 1M entries, 8 MB of BAT in a 1 MB region
        let geometry = BatGeometry::new(MIB as u32, 512, 1024 * 1024 * MIB, false).unwrap();
        assert!(matches!(
            decode_bat(&mut source, &bat_region(), geometry),
            Err(Error::RegionOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_bat_beyond_entry_limit() {
        let mut source = MemorySource::from_bytes(VhdxBuilder::new().build());
        let geometry = BatGeometry::new(MIB as u32, 512, 64 * 1024 * 1024 * MIB, false).unwrap();
        assert!(matches!(
            decode_bat(&mut source, &bat_region(), geometry),
            Err(Error::Unsupported(_))
        ));
    }
}
