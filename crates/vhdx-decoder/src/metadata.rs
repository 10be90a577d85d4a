//! Metadata region: the metadata table and its well-known items

use crate::layout::{
    decode_utf16, read_guid, read_signature, read_u16, read_u32, read_u64, FILE_PARAMETERS_GUID,
    LOGICAL_SECTOR_SIZE_GUID, MAX_TABLE_ENTRIES, METADATA_ENTRY_SIZE, METADATA_HEADER_SIZE,
    METADATA_SIGNATURE, METADATA_TABLE_SIZE, MIB, PARENT_LOCATOR_GUID,
    PHYSICAL_SECTOR_SIZE_GUID, VIRTUAL_DISK_ID_GUID, VIRTUAL_DISK_SIZE_GUID,
};
use crate::region::RegionTableEntry;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;
use vhdx_core::{ByteSource, Error, Result, MAX_METADATA_ITEM_BYTES};

pub const PARENT_LINKAGE_KEY: &str = "parent_linkage";
pub const PARENT_LINKAGE2_KEY: &str = "parent_linkage2";
pub const RELATIVE_PATH_KEY: &str = "relative_path";
pub const VOLUME_PATH_KEY: &str = "volume_path";
pub const ABSOLUTE_WIN32_PATH_KEY: &str = "absolute_win32_path";

const ITEM_AREA_START: u32 = 64 * 1024;
const MIN_BLOCK_SIZE: u32 = MIB as u32;
const MAX_BLOCK_SIZE: u32 = 256 * MIB as u32;

/// Known metadata items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetadataKind {
    FileParameters,
    VirtualDiskSize,
    VirtualDiskId,
    LogicalSectorSize,
    PhysicalSectorSize,
    ParentLocator,
    Unknown,
}

const KNOWN_ITEMS: [(Uuid, MetadataKind); 6] = [
    (FILE_PARAMETERS_GUID, MetadataKind::FileParameters),
    (VIRTUAL_DISK_SIZE_GUID, MetadataKind::VirtualDiskSize),
    (VIRTUAL_DISK_ID_GUID, MetadataKind::VirtualDiskId),
    (LOGICAL_SECTOR_SIZE_GUID, MetadataKind::LogicalSectorSize),
    (PHYSICAL_SECTOR_SIZE_GUID, MetadataKind::PhysicalSectorSize),
    (PARENT_LOCATOR_GUID, MetadataKind::ParentLocator),
];

impl MetadataKind {
    pub fn from_guid(guid: &Uuid) -> Self {
        KNOWN_ITEMS
            .iter()
            .find(|(known, _)| known == guid)
            .map(|(_, kind)| *kind)
            .unwrap_or(MetadataKind::Unknown)
    }

    /// Smallest payload the item can be decoded from
    fn min_length(self) -> u32 {
        match self {
            MetadataKind::FileParameters | MetadataKind::VirtualDiskSize => 8,
            MetadataKind::VirtualDiskId => 16,
            MetadataKind::LogicalSectorSize | MetadataKind::PhysicalSectorSize => 4,
            MetadataKind::ParentLocator => 20,
            MetadataKind::Unknown => 0,
        }
    }
}

/// One metadata table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataEntry {
    pub item_id: Uuid,
    pub kind: MetadataKind,
    /// Offset from the start of the metadata region
    pub offset: u32,
    pub length: u32,
    pub is_user: bool,
    pub is_virtual_disk: bool,
    pub is_required: bool,
}

impl MetadataEntry {
    fn parse(bytes: &[u8], at: usize) -> Self {
        let item_id = read_guid(bytes, at);
        let flags = read_u32(bytes, at + 24);
        Self {
            item_id,
            kind: MetadataKind::from_guid(&item_id),
            offset: read_u32(bytes, at + 16),
            length: read_u32(bytes, at + 20),
            is_user: flags & 0x1 != 0,
            is_virtual_disk: flags & 0x2 != 0,
            is_required: flags & 0x4 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileParameters {
    pub block_size: u32,
    pub leave_blocks_allocated: bool,
    pub has_parent: bool,
}

/// One key/value pair of a parent locator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatorEntry {
    pub key: String,
    pub value: String,
}

/// Parent locator item; pairs are kept in on-disk order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentLocator {
    pub locator_type: Uuid,
    pub entries: Vec<LocatorEntry>,
}

impl ParentLocator {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_str())
    }

    pub fn parent_linkage(&self) -> Option<Uuid> {
        self.get(PARENT_LINKAGE_KEY).and_then(|v| Uuid::parse_str(v).ok())
    }

    pub fn parent_linkage2(&self) -> Option<Uuid> {
        self.get(PARENT_LINKAGE2_KEY).and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Path values in the order a parent should be searched for
    pub fn path_hints(&self) -> Vec<&str> {
        [RELATIVE_PATH_KEY, VOLUME_PATH_KEY, ABSOLUTE_WIN32_PATH_KEY]
            .iter()
            .filter_map(|key| self.get(key))
            .collect()
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let locator_type = read_guid(bytes, 0);
        let count = read_u16(bytes, 18) as usize;
        let table_end = 20 + count * 12;
        if table_end > bytes.len() {
            return Err(Error::invalid_structure(format!(
                "parent locator with {} entries does not fit its {} byte item",
                count,
                bytes.len()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = 20 + i * 12;
            let key = locator_string(
                bytes,
                read_u32(bytes, at) as usize,
                read_u16(bytes, at + 8) as usize,
            )?;
            let value = locator_string(
                bytes,
                read_u32(bytes, at + 4) as usize,
                read_u16(bytes, at + 10) as usize,
            )?;
            if key.is_empty() {
                return Err(Error::invalid_structure(format!(
                    "parent locator entry {} has an empty key",
                    i
                )));
            }
            if (key == PARENT_LINKAGE_KEY || key == PARENT_LINKAGE2_KEY)
                && Uuid::parse_str(&value).is_err()
            {
                return Err(Error::invalid_structure(format!(
                    "parent locator {} value {:?} is not a GUID",
                    key, value
                )));
            }
            entries.push(LocatorEntry { key, value });
        }

        Ok(Self {
            locator_type,
            entries,
        })
    }
}

fn locator_string(item: &[u8], offset: usize, length: usize) -> Result<String> {
    let bytes = offset
        .checked_add(length)
        .and_then(|end| item.get(offset..end))
        .ok_or_else(|| {
            Error::invalid_structure(format!(
                "parent locator string at {} ({} bytes) lies outside the item",
                offset, length
            ))
        })?;
    let text = decode_utf16(bytes).ok_or_else(|| {
        Error::invalid_structure(format!("parent locator string at {} is not UTF-16", offset))
    })?;
    if text.contains('\0') {
        return Err(Error::invalid_structure(format!(
            "parent locator string at {} contains a NUL",
            offset
        )));
    }
    Ok(text)
}

/// An item this decoder does not interpret, kept as raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownItem {
    pub item_id: Uuid,
    pub offset: u32,
    pub length: u32,
    pub is_user: bool,
    pub is_virtual_disk: bool,
    pub bytes: Vec<u8>,
}

/// The decoded metadata region
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub entry_count: u16,
    pub entries: Vec<MetadataEntry>,
    pub file_parameters: FileParameters,
    pub virtual_disk_size: u64,
    pub virtual_disk_id: Option<Uuid>,
    pub logical_sector_size: u32,
    pub physical_sector_size: Option<u32>,
    pub parent_locator: Option<ParentLocator>,
    pub unknown_items: Vec<UnknownItem>,
}

#[derive(Default)]
struct Items {
    file_parameters: Option<FileParameters>,
    virtual_disk_size: Option<u64>,
    virtual_disk_id: Option<Uuid>,
    logical_sector_size: Option<u32>,
    physical_sector_size: Option<u32>,
    parent_locator: Option<ParentLocator>,
    unknown: Vec<UnknownItem>,
}

/// Decode the metadata table at the metadata region and every item it lists.
pub fn parse_metadata<S: ByteSource + ?Sized>(
    source: &mut S,
    region: &RegionTableEntry,
) -> Result<Metadata> {
    let table = source.read_bytes(region.file_offset, METADATA_TABLE_SIZE)?;

    let signature = read_signature::<8>(&table, 0);
    if &signature != METADATA_SIGNATURE {
        return Err(Error::invalid_structure(format!(
            "metadata table signature {:02X?} at 0x{:X}",
            signature, region.file_offset
        )));
    }
    let entry_count = read_u16(&table, 10);
    if entry_count as u32 > MAX_TABLE_ENTRIES {
        return Err(Error::invalid_structure(format!(
            "metadata table declares {} entries, maximum is {}",
            entry_count, MAX_TABLE_ENTRIES
        )));
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut seen = HashSet::new();
    let mut items = Items::default();

    for i in 0..entry_count as usize {
        let entry = MetadataEntry::parse(&table, METADATA_HEADER_SIZE + i * METADATA_ENTRY_SIZE);
        if !seen.insert(entry.item_id) {
            return Err(Error::invalid_structure(format!(
                "metadata item {} listed twice",
                entry.item_id
            )));
        }
        check_bounds(&entry, region)?;
        if entry.kind == MetadataKind::Unknown && entry.is_required {
            return Err(Error::UnsupportedRequiredMetadata {
                guid: entry.item_id,
            });
        }
        if entry.length < entry.kind.min_length() {
            return Err(Error::invalid_structure(format!(
                "metadata item {:?} is {} bytes, needs {}",
                entry.kind,
                entry.length,
                entry.kind.min_length()
            )));
        }

        let bytes = source.read_bytes(
            region.file_offset + entry.offset as u64,
            entry.length as usize,
        )?;
        decode_item(&entry, bytes, &mut items)?;
        entries.push(entry);
    }

    let metadata = Metadata {
        entry_count,
        entries,
        file_parameters: items
            .file_parameters
            .ok_or_else(|| missing("FileParameters"))?,
        virtual_disk_size: items
            .virtual_disk_size
            .ok_or_else(|| missing("VirtualDiskSize"))?,
        virtual_disk_id: items.virtual_disk_id,
        logical_sector_size: items
            .logical_sector_size
            .ok_or_else(|| missing("LogicalSectorSize"))?,
        physical_sector_size: items.physical_sector_size,
        parent_locator: items.parent_locator,
        unknown_items: items.unknown,
    };
    validate(&metadata)?;

    tracing::debug!(
        "metadata: block size {}, virtual size {}, logical sector {}, parent {}",
        metadata.file_parameters.block_size,
        metadata.virtual_disk_size,
        metadata.logical_sector_size,
        metadata.file_parameters.has_parent
    );
    Ok(metadata)
}

fn missing(name: &str) -> Error {
    Error::invalid_structure(format!("required metadata item {} is missing", name))
}

fn check_bounds(entry: &MetadataEntry, region: &RegionTableEntry) -> Result<()> {
    let end = entry.offset as u64 + entry.length as u64;
    let misplaced = entry.length > 0 && entry.offset < ITEM_AREA_START;
    if end > region.length as u64 || misplaced || entry.length > MAX_METADATA_ITEM_BYTES {
        return Err(Error::out_of_bounds(
            format!("metadata item {}", entry.item_id),
            region.file_offset + entry.offset as u64,
            entry.length as u64,
            region.end(),
        ));
    }
    Ok(())
}

fn decode_item(entry: &MetadataEntry, bytes: Vec<u8>, items: &mut Items) -> Result<()> {
    match entry.kind {
        MetadataKind::FileParameters => {
            let flags = read_u32(&bytes, 4);
            items.file_parameters = Some(FileParameters {
                block_size: read_u32(&bytes, 0),
                leave_blocks_allocated: flags & 0x1 != 0,
                has_parent: flags & 0x2 != 0,
            });
        }
        MetadataKind::VirtualDiskSize => items.virtual_disk_size = Some(read_u64(&bytes, 0)),
        MetadataKind::VirtualDiskId => items.virtual_disk_id = Some(read_guid(&bytes, 0)),
        MetadataKind::LogicalSectorSize => items.logical_sector_size = Some(read_u32(&bytes, 0)),
        MetadataKind::PhysicalSectorSize => items.physical_sector_size = Some(read_u32(&bytes, 0)),
        MetadataKind::ParentLocator => items.parent_locator = Some(ParentLocator::parse(&bytes)?),
        MetadataKind::Unknown => {
            tracing::debug!("keeping unknown metadata item {}", entry.item_id);
            items.unknown.push(UnknownItem {
                item_id: entry.item_id,
                offset: entry.offset,
                length: entry.length,
                is_user: entry.is_user,
                is_virtual_disk: entry.is_virtual_disk,
                bytes,
            });
        }
    }
    Ok(())
}

fn validate(metadata: &Metadata) -> Result<()> {
    let block_size = metadata.file_parameters.block_size;
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::invalid_structure(format!(
            "block size {} is not a power of two between 1 MB and 256 MB",
            block_size
        )));
    }

    let logical = metadata.logical_sector_size;
    if logical != 512 && logical != 4096 {
        return Err(Error::invalid_structure(format!(
            "logical sector size {} (must be 512 or 4096)",
            logical
        )));
    }
    if let Some(physical) = metadata.physical_sector_size {
        if physical != 512 && physical != 4096 {
            return Err(Error::invalid_structure(format!(
                "physical sector size {} (must be 512 or 4096)",
                physical
            )));
        }
    }

    let size = metadata.virtual_disk_size;
    if size == 0 || size % logical as u64 != 0 {
        return Err(Error::invalid_structure(format!(
            "virtual disk size {} is not a nonzero multiple of the {} byte logical sector",
            size, logical
        )));
    }

    if metadata.file_parameters.has_parent && metadata.parent_locator.is_none() {
        return Err(Error::invalid_structure(
            "HasParent is set but there is no parent locator",
        ));
    }
    Ok(())
}
