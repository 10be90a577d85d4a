//! Region table decoding

use crate::header::{CopySlot, RegionTableCopy};
use crate::layout::{
    is_aligned, read_guid, read_u32, read_u64, BAT_REGION_GUID, METADATA_REGION_GUID, MIB,
    REGION_ALIGNMENT, REGION_ENTRY_SIZE, REGION_TABLE_HEADER_SIZE,
};
use serde::Serialize;
use uuid::Uuid;
use vhdx_core::{Error, Result};

/// What a region entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegionKind {
    Bat,
    Metadata,
    Unknown,
}

impl RegionKind {
    pub fn from_guid(guid: &Uuid) -> Self {
        if *guid == BAT_REGION_GUID {
            RegionKind::Bat
        } else if *guid == METADATA_REGION_GUID {
            RegionKind::Metadata
        } else {
            RegionKind::Unknown
        }
    }
}

/// One region table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionTableEntry {
    pub guid: Uuid,
    pub kind: RegionKind,
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

impl RegionTableEntry {
    pub fn end(&self) -> u64 {
        self.file_offset.saturating_add(self.length as u64)
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.file_offset < end && start < self.end()
    }
}

/// The decoded region table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionTable {
    pub slot: CopySlot,
    pub checksum: u32,
    pub entry_count: u32,
    pub entries: Vec<RegionTableEntry>,
    pub copies_agree: bool,
    #[serde(skip)]
    bat_index: usize,
    #[serde(skip)]
    metadata_index: usize,
}

impl RegionTable {
    /// The BAT region
    pub fn bat(&self) -> &RegionTableEntry {
        &self.entries[self.bat_index]
    }

    /// The metadata region
    pub fn metadata(&self) -> &RegionTableEntry {
        &self.entries[self.metadata_index]
    }
}

/// Decode the selected region table copy.
///
/// `file_size` is the logical size after log replay. `log` is the log
/// region as `(offset, length)` when the header declares one; regions may
/// not overlap it.
pub fn parse_region_table(
    copy: &RegionTableCopy,
    file_size: u64,
    log: Option<(u64, u64)>,
) -> Result<RegionTable> {
    let bytes = &copy.bytes;
    let checksum = read_u32(bytes, 4);
    let entry_count = read_u32(bytes, 8);

    let mut entries: Vec<RegionTableEntry> = Vec::with_capacity(entry_count as usize);
    for i in 0..entry_count as usize {
        let at = REGION_TABLE_HEADER_SIZE + i * REGION_ENTRY_SIZE;
        let guid = read_guid(bytes, at);
        let entry = RegionTableEntry {
            guid,
            kind: RegionKind::from_guid(&guid),
            file_offset: read_u64(bytes, at + 16),
            length: read_u32(bytes, at + 24),
            required: read_u32(bytes, at + 28) & 1 != 0,
        };

        if entry.kind == RegionKind::Unknown && entry.required {
            return Err(Error::UnsupportedRequiredRegion { guid });
        }
        validate_entry(&entry, file_size)?;

        if let Some((log_offset, log_length)) = log {
            if entry.overlaps(log_offset, log_offset.saturating_add(log_length)) {
                return Err(Error::out_of_bounds(
                    format!("region {} (overlaps the log)", guid),
                    entry.file_offset,
                    entry.length as u64,
                    log_offset,
                ));
            }
        }
        if let Some(other) = entries
            .iter()
            .find(|other| entry.overlaps(other.file_offset, other.end()))
        {
            return Err(Error::out_of_bounds(
                format!("region {} (overlaps region {})", guid, other.guid),
                entry.file_offset,
                entry.length as u64,
                other.file_offset,
            ));
        }

        entries.push(entry);
    }

    let bat_index = single(&entries, RegionKind::Bat, "BAT")?;
    let metadata_index = single(&entries, RegionKind::Metadata, "metadata")?;

    tracing::debug!(
        "region table: {} entries, BAT at 0x{:X}, metadata at 0x{:X}",
        entries.len(),
        entries[bat_index].file_offset,
        entries[metadata_index].file_offset
    );

    Ok(RegionTable {
        slot: copy.slot,
        checksum,
        entry_count,
        entries,
        copies_agree: copy.copies_agree,
        bat_index,
        metadata_index,
    })
}

fn validate_entry(entry: &RegionTableEntry, file_size: u64) -> Result<()> {
    if entry.file_offset < MIB || !is_aligned(entry.file_offset, REGION_ALIGNMENT) {
        return Err(Error::invalid_structure(format!(
            "region {} offset 0x{:X} is not a 1 MB multiple past the header area",
            entry.guid, entry.file_offset
        )));
    }
    if entry.length == 0 || !is_aligned(entry.length as u64, REGION_ALIGNMENT) {
        return Err(Error::invalid_structure(format!(
            "region {} length 0x{:X} is not a nonzero 1 MB multiple",
            entry.guid, entry.length
        )));
    }
    if entry.end() > file_size {
        return Err(Error::out_of_bounds(
            format!("region {}", entry.guid),
            entry.file_offset,
            entry.length as u64,
            file_size,
        ));
    }
    Ok(())
}

fn single(entries: &[RegionTableEntry], kind: RegionKind, name: &str) -> Result<usize> {
    let mut found = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.kind == kind)
        .map(|(index, _)| index);
    match (found.next(), found.next()) {
        (Some(index), None) => Ok(index),
        (None, _) => Err(Error::invalid_structure(format!(
            "region table has no {} region",
            name
        ))),
        (Some(_), Some(_)) => Err(Error::invalid_structure(format!(
            "region table has more than one {} region",
            name
        ))),
    }
}
