//! Synthetic VHDX images for tests
//!
//! Fixture layout: log at 1 MB, metadata region at 2 MB, BAT region at
//! 3 MB, 4 MB file. Every metadata item gets its own 4 KB slot.

use crate::checksum::seal;
use crate::layout::*;
use uuid::Uuid;

pub const LOG_OFFSET: u64 = MIB;
pub const METADATA_OFFSET: u64 = 2 * MIB;
pub const BAT_OFFSET: u64 = 3 * MIB;
pub const FIXTURE_SIZE: u64 = 4 * MIB;

const ITEM_AREA_START: u64 = 64 * KIB;
const ITEM_SLOT: u64 = 4096;

// Metadata entry flags
const IS_VIRTUAL_DISK: u32 = 0x2;
const IS_REQUIRED: u32 = 0x4;

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn put_guid(buf: &mut [u8], at: usize, guid: Uuid) {
    put(buf, at, &guid.to_bytes_le());
}

#[derive(Debug, Clone)]
pub struct HeaderSpec {
    pub sequence_number: u64,
    pub version: u16,
    pub log_version: u16,
    pub log_offset: u64,
    pub log_length: u32,
    pub log_guid: Uuid,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
}

impl Default for HeaderSpec {
    fn default() -> Self {
        Self {
            sequence_number: 1,
            version: 1,
            log_version: 0,
            log_offset: LOG_OFFSET,
            log_length: MIB as u32,
            log_guid: Uuid::nil(),
            file_write_guid: Uuid::from_u128(0xF11E_0000_0000_0001),
            data_write_guid: Uuid::from_u128(0xDA7A_0000_0000_0001),
        }
    }
}

/// A sealed 4 KB header copy
pub fn encode_header(spec: &HeaderSpec) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER_SIZE];
    put(&mut bytes, 0, HEADER_SIGNATURE);
    put(&mut bytes, 8, &spec.sequence_number.to_le_bytes());
    put_guid(&mut bytes, 16, spec.file_write_guid);
    put_guid(&mut bytes, 32, spec.data_write_guid);
    put_guid(&mut bytes, 48, spec.log_guid);
    put(&mut bytes, 64, &spec.log_version.to_le_bytes());
    put(&mut bytes, 66, &spec.version.to_le_bytes());
    put(&mut bytes, 68, &spec.log_length.to_le_bytes());
    put(&mut bytes, 72, &spec.log_offset.to_le_bytes());
    seal(&mut bytes, CHECKSUM_OFFSET);
    bytes
}

/// Parent locator item bytes; strings follow the entry table
pub fn encode_locator(locator_type: Uuid, pairs: &[(&str, &str)]) -> Vec<u8> {
    let utf16 = |s: &str| -> Vec<u8> { s.encode_utf16().flat_map(u16::to_le_bytes).collect() };

    let table_end = 20 + pairs.len() * 12;
    let mut bytes = vec![0u8; table_end];
    put_guid(&mut bytes, 0, locator_type);
    put(&mut bytes, 18, &(pairs.len() as u16).to_le_bytes());

    for (i, (key, value)) in pairs.iter().enumerate() {
        let key = utf16(key);
        let value = utf16(value);
        let key_offset = bytes.len();
        bytes.extend_from_slice(&key);
        let value_offset = bytes.len();
        bytes.extend_from_slice(&value);

        let at = 20 + i * 12;
        put(&mut bytes, at, &(key_offset as u32).to_le_bytes());
        put(&mut bytes, at + 4, &(value_offset as u32).to_le_bytes());
        put(&mut bytes, at + 8, &(key.len() as u16).to_le_bytes());
        put(&mut bytes, at + 10, &(value.len() as u16).to_le_bytes());
    }
    bytes
}

/// Region listed after the BAT and metadata regions
#[derive(Debug, Clone)]
pub struct ExtraRegion {
    pub guid: Uuid,
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

/// Metadata item listed after the standard ones
#[derive(Debug, Clone)]
pub struct ExtraItem {
    pub guid: Uuid,
    pub bytes: Vec<u8>,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub enum LogWrite {
    /// `bytes` must be a whole number of 4 KB sectors
    Data { file_offset: u64, bytes: Vec<u8> },
    Zero { file_offset: u64, length: u64 },
}

#[derive(Debug, Clone)]
pub struct LogEntrySpec {
    pub sequence_number: u64,
    pub log_offset: u64,
    pub tail: u32,
    pub writes: Vec<LogWrite>,
    /// Defaults to the image's log GUID
    pub log_guid: Option<Uuid>,
    /// Defaults to the image size
    pub last_file_offset: Option<u64>,
}

impl LogEntrySpec {
    pub fn new(sequence_number: u64, log_offset: u64, tail: u32) -> Self {
        Self {
            sequence_number,
            log_offset,
            tail,
            writes: Vec::new(),
            log_guid: None,
            last_file_offset: None,
        }
    }

    pub fn write(mut self, write: LogWrite) -> Self {
        self.writes.push(write);
        self
    }

    fn encode(&self, log_guid: Uuid, file_size: u64) -> Vec<u8> {
        let seq = self.sequence_number;
        let sectors: Vec<&[u8]> = self
            .writes
            .iter()
            .filter_map(|w| match w {
                LogWrite::Data { bytes, .. } => Some(bytes.as_slice()),
                LogWrite::Zero { .. } => None,
            })
            .flat_map(|bytes| bytes.chunks(LOG_SECTOR_SIZE))
            .collect();
        let zero_count = self
            .writes
            .iter()
            .filter(|w| matches!(w, LogWrite::Zero { .. }))
            .count();
        let descriptor_count = sectors.len() + zero_count;

        let area = (LOG_ENTRY_HEADER_SIZE + descriptor_count * LOG_DESCRIPTOR_SIZE)
            .div_ceil(LOG_SECTOR_SIZE)
            * LOG_SECTOR_SIZE;
        let entry_length = area + sectors.len() * LOG_SECTOR_SIZE;
        let mut entry = vec![0u8; entry_length];

        let last = self.last_file_offset.unwrap_or(file_size);
        put(&mut entry, 0, LOG_ENTRY_SIGNATURE);
        put(&mut entry, 8, &(entry_length as u32).to_le_bytes());
        put(&mut entry, 12, &self.tail.to_le_bytes());
        put(&mut entry, 16, &seq.to_le_bytes());
        put(&mut entry, 24, &(descriptor_count as u32).to_le_bytes());
        put_guid(&mut entry, 32, self.log_guid.unwrap_or(log_guid));
        put(&mut entry, 48, &last.to_le_bytes());
        put(&mut entry, 56, &last.to_le_bytes());

        let mut descriptor = LOG_ENTRY_HEADER_SIZE;
        let mut sector_at = area;
        for write in &self.writes {
            match write {
                LogWrite::Zero {
                    file_offset,
                    length,
                } => {
                    put(&mut entry, descriptor, ZERO_DESCRIPTOR_SIGNATURE);
                    put(&mut entry, descriptor + 8, &length.to_le_bytes());
                    put(&mut entry, descriptor + 16, &file_offset.to_le_bytes());
                    put(&mut entry, descriptor + 24, &seq.to_le_bytes());
                    descriptor += LOG_DESCRIPTOR_SIZE;
                }
                LogWrite::Data { file_offset, bytes } => {
                    for (i, chunk) in bytes.chunks(LOG_SECTOR_SIZE).enumerate() {
                        let offset = file_offset + (i * LOG_SECTOR_SIZE) as u64;
                        put(&mut entry, descriptor, DATA_DESCRIPTOR_SIGNATURE);
                        put(&mut entry, descriptor + 4, &chunk[4092..4096]);
                        put(&mut entry, descriptor + 8, &chunk[..8]);
                        put(&mut entry, descriptor + 16, &offset.to_le_bytes());
                        put(&mut entry, descriptor + 24, &seq.to_le_bytes());
                        descriptor += LOG_DESCRIPTOR_SIZE;

                        put(&mut entry, sector_at, DATA_SECTOR_SIGNATURE);
                        put(&mut entry, sector_at + 4, &((seq >> 32) as u32).to_le_bytes());
                        put(&mut entry, sector_at + 8, &chunk[8..4092]);
                        put(&mut entry, sector_at + 4092, &(seq as u32).to_le_bytes());
                        sector_at += LOG_SECTOR_SIZE;
                    }
                }
            }
        }

        seal(&mut entry, CHECKSUM_OFFSET);
        entry
    }
}

struct Item {
    guid: Uuid,
    bytes: Vec<u8>,
    flags: u32,
}

/// Builds a dynamic 64 MB image with 1 MB blocks and 512 byte sectors
#[derive(Debug, Clone)]
pub struct VhdxBuilder {
    header: HeaderSpec,
    creator: String,
    file_size: Option<u64>,
    regions: Vec<ExtraRegion>,
    block_size: u32,
    leave_blocks_allocated: bool,
    has_parent: bool,
    virtual_disk_size: u64,
    logical_sector_size: u32,
    physical_sector_size: u32,
    locator_type: Uuid,
    locator: Option<Vec<(String, String)>>,
    items: Vec<ExtraItem>,
    omitted: Vec<Uuid>,
    bat: Vec<(u64, u64)>,
    log_entries: Vec<LogEntrySpec>,
}

impl Default for VhdxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VhdxBuilder {
    pub fn new() -> Self {
        Self {
            header: HeaderSpec::default(),
            creator: "vhdx-decoder tests".to_string(),
            file_size: None,
            regions: Vec::new(),
            block_size: MIB as u32,
            leave_blocks_allocated: false,
            has_parent: false,
            virtual_disk_size: 64 * MIB,
            logical_sector_size: 512,
            physical_sector_size: 4096,
            locator_type: VHDX_PARENT_LOCATOR_TYPE,
            locator: None,
            items: Vec::new(),
            omitted: Vec::new(),
            bat: Vec::new(),
            log_entries: Vec::new(),
        }
    }

    pub fn data_write_guid(mut self, guid: Uuid) -> Self {
        self.header.data_write_guid = guid;
        self
    }

    pub fn log_guid(mut self, guid: Uuid) -> Self {
        self.header.log_guid = guid;
        self
    }

    pub fn log_version(mut self, version: u16) -> Self {
        self.header.log_version = version;
        self
    }

    pub fn log_placement(mut self, offset: u64, length: u32) -> Self {
        self.header.log_offset = offset;
        self.header.log_length = length;
        self
    }

    pub fn log_entry(mut self, entry: LogEntrySpec) -> Self {
        self.log_entries.push(entry);
        self
    }

    /// Fix the file size instead of growing it to cover extra regions
    pub fn file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn region(mut self, region: ExtraRegion) -> Self {
        self.regions.push(region);
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn logical_sector_size(mut self, size: u32) -> Self {
        self.logical_sector_size = size;
        self
    }

    pub fn physical_sector_size(mut self, size: u32) -> Self {
        self.physical_sector_size = size;
        self
    }

    pub fn leave_blocks_allocated(mut self) -> Self {
        self.leave_blocks_allocated = true;
        self
    }

    /// Make this a differencing disk with the given locator pairs
    pub fn parent(mut self, pairs: Vec<(&str, String)>) -> Self {
        self.has_parent = true;
        self.locator = Some(
            pairs
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        );
        self
    }

    pub fn locator_type(mut self, locator_type: Uuid) -> Self {
        self.locator_type = locator_type;
        self
    }

    /// Set HasParent without writing a parent locator
    pub fn has_parent_flag_only(mut self) -> Self {
        self.has_parent = true;
        self.locator = None;
        self
    }

    pub fn item(mut self, item: ExtraItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn without_item(mut self, guid: Uuid) -> Self {
        self.omitted.push(guid);
        self
    }

    pub fn bat_entry(mut self, index: u64, raw: u64) -> Self {
        self.bat.push((index, raw));
        self
    }

    fn metadata_items(&self) -> Vec<Item> {
        let mut flags = 0u32;
        if self.leave_blocks_allocated {
            flags |= 0x1;
        }
        if self.has_parent {
            flags |= 0x2;
        }
        let mut file_parameters = self.block_size.to_le_bytes().to_vec();
        file_parameters.extend_from_slice(&flags.to_le_bytes());

        let disk = IS_VIRTUAL_DISK | IS_REQUIRED;
        let mut items = vec![
            Item {
                guid: FILE_PARAMETERS_GUID,
                bytes: file_parameters,
                flags: IS_REQUIRED,
            },
            Item {
                guid: VIRTUAL_DISK_SIZE_GUID,
                bytes: self.virtual_disk_size.to_le_bytes().to_vec(),
                flags: disk,
            },
            Item {
                guid: VIRTUAL_DISK_ID_GUID,
                bytes: Uuid::from_u128(0xD15C_0000_0000_0001).to_bytes_le().to_vec(),
                flags: disk,
            },
            Item {
                guid: LOGICAL_SECTOR_SIZE_GUID,
                bytes: self.logical_sector_size.to_le_bytes().to_vec(),
                flags: disk,
            },
            Item {
                guid: PHYSICAL_SECTOR_SIZE_GUID,
                bytes: self.physical_sector_size.to_le_bytes().to_vec(),
                flags: disk,
            },
        ];
        if let Some(locator) = &self.locator {
            let pairs: Vec<(&str, &str)> = locator
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .collect();
            items.push(Item {
                guid: PARENT_LOCATOR_GUID,
                bytes: encode_locator(self.locator_type, &pairs),
                flags: disk,
            });
        }
        items.extend(self.items.iter().map(|extra| Item {
            guid: extra.guid,
            bytes: extra.bytes.clone(),
            flags: extra.flags,
        }));
        items.retain(|item| !self.omitted.contains(&item.guid));
        items
    }

    /// File offset of a metadata item in the built image
    pub fn item_file_offset(&self, guid: Uuid) -> Option<u64> {
        self.metadata_items()
            .iter()
            .position(|item| item.guid == guid)
            .map(|slot| METADATA_OFFSET + ITEM_AREA_START + slot as u64 * ITEM_SLOT)
    }

    fn size(&self) -> u64 {
        self.file_size.unwrap_or_else(|| {
            self.regions
                .iter()
                .map(|region| region.file_offset + region.length as u64)
                .fold(FIXTURE_SIZE, u64::max)
        })
    }

    fn region_table(&self) -> Vec<u8> {
        let mut table = vec![0u8; REGION_TABLE_SIZE];
        let standard = [
            ExtraRegion {
                guid: BAT_REGION_GUID,
                file_offset: BAT_OFFSET,
                length: MIB as u32,
                required: true,
            },
            ExtraRegion {
                guid: METADATA_REGION_GUID,
                file_offset: METADATA_OFFSET,
                length: MIB as u32,
                required: true,
            },
        ];
        let regions: Vec<&ExtraRegion> = standard.iter().chain(&self.regions).collect();

        put(&mut table, 0, REGION_TABLE_SIGNATURE);
        put(&mut table, 8, &(regions.len() as u32).to_le_bytes());
        for (i, region) in regions.iter().enumerate() {
            let at = REGION_TABLE_HEADER_SIZE + i * REGION_ENTRY_SIZE;
            put_guid(&mut table, at, region.guid);
            put(&mut table, at + 16, &region.file_offset.to_le_bytes());
            put(&mut table, at + 24, &region.length.to_le_bytes());
            put(&mut table, at + 28, &(region.required as u32).to_le_bytes());
        }
        seal(&mut table, CHECKSUM_OFFSET);
        table
    }

    fn write_metadata(&self, image: &mut [u8]) {
        let base = METADATA_OFFSET as usize;
        let items = self.metadata_items();

        put(image, base, METADATA_SIGNATURE);
        put(image, base + 10, &(items.len() as u16).to_le_bytes());
        for (i, item) in items.iter().enumerate() {
            let offset = ITEM_AREA_START + i as u64 * ITEM_SLOT;
            let at = base + METADATA_HEADER_SIZE + i * METADATA_ENTRY_SIZE;
            put_guid(image, at, item.guid);
            put(image, at + 16, &(offset as u32).to_le_bytes());
            put(image, at + 20, &(item.bytes.len() as u32).to_le_bytes());
            put(image, at + 24, &item.flags.to_le_bytes());
            put(image, base + offset as usize, &item.bytes);
        }
    }

    fn write_log(&self, image: &mut Vec<u8>) {
        let log_offset = self.header.log_offset as usize;
        let log_length = self.header.log_length as usize;
        if log_length == 0 {
            return;
        }
        let file_size = image.len() as u64;
        for spec in &self.log_entries {
            let entry = spec.encode(self.header.log_guid, file_size);
            for (i, byte) in entry.into_iter().enumerate() {
                let at = log_offset + (spec.log_offset as usize + i) % log_length;
                if at >= image.len() {
                    image.resize(at + 1, 0);
                }
                image[at] = byte;
            }
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.size() as usize];

        put(&mut image, 0, FILE_IDENTIFIER_SIGNATURE);
        let creator: Vec<u8> = self.creator.encode_utf16().flat_map(u16::to_le_bytes).collect();
        put(&mut image, CREATOR_OFFSET, &creator);

        let header = encode_header(&self.header);
        for offset in HEADER_OFFSETS {
            put(&mut image, offset as usize, &header);
        }
        let table = self.region_table();
        for offset in REGION_TABLE_OFFSETS {
            put(&mut image, offset as usize, &table);
        }

        self.write_metadata(&mut image);
        for &(index, raw) in &self.bat {
            put(&mut image, (BAT_OFFSET + index * 8) as usize, &raw.to_le_bytes());
        }
        self.write_log(&mut image);
        image
    }
}
