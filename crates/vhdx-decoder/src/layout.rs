//! On-disk layout constants and little-endian field readers

use uuid::Uuid;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// File identifier at offset 0
pub const FILE_IDENTIFIER_SIGNATURE: &[u8; 8] = b"vhdxfile";
pub const CREATOR_OFFSET: usize = 8;
pub const CREATOR_LENGTH: usize = 512;

/// Header copies
pub const HEADER_OFFSETS: [u64; 2] = [64 * KIB, 128 * KIB];
pub const HEADER_SIZE: usize = 4096;
pub const HEADER_SIGNATURE: &[u8; 4] = b"head";

/// Region table copies
pub const REGION_TABLE_OFFSETS: [u64; 2] = [192 * KIB, 256 * KIB];
pub const REGION_TABLE_SIZE: usize = 64 * 1024;
pub const REGION_TABLE_SIGNATURE: &[u8; 4] = b"regi";
pub const REGION_TABLE_HEADER_SIZE: usize = 16;
pub const REGION_ENTRY_SIZE: usize = 32;

/// Upper bound on entries in both the region table and the metadata table
pub const MAX_TABLE_ENTRIES: u32 = 2047;

/// Checksum field position shared by headers, region tables and log entries
pub const CHECKSUM_OFFSET: usize = 4;

/// Regions, the log and BAT file offsets are aligned to this
pub const REGION_ALIGNMENT: u64 = MIB;

/// Metadata table at the start of the metadata region
pub const METADATA_TABLE_SIZE: usize = 64 * 1024;
pub const METADATA_SIGNATURE: &[u8; 8] = b"metadata";
pub const METADATA_HEADER_SIZE: usize = 32;
pub const METADATA_ENTRY_SIZE: usize = 32;

/// Log structures
pub const LOG_SECTOR_SIZE: usize = 4096;
pub const LOG_ENTRY_SIGNATURE: &[u8; 4] = b"loge";
pub const LOG_ENTRY_HEADER_SIZE: usize = 64;
pub const LOG_DESCRIPTOR_SIZE: usize = 32;
pub const ZERO_DESCRIPTOR_SIGNATURE: &[u8; 4] = b"zero";
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8; 4] = b"desc";
pub const DATA_SECTOR_SIGNATURE: &[u8; 4] = b"data";
pub const DATA_SECTOR_PAYLOAD: usize = 4084;

/// Region GUIDs
pub const BAT_REGION_GUID: Uuid = Uuid::from_u128(0x2DC27766_F623_4200_9D64_115E9BFD4A08);
pub const METADATA_REGION_GUID: Uuid = Uuid::from_u128(0x8B7CA206_4790_4B9A_B8FE_575F050F886E);

/// Metadata item GUIDs
pub const FILE_PARAMETERS_GUID: Uuid = Uuid::from_u128(0xCAA16737_FA36_4D43_B3B6_33F0AA44E76B);
pub const VIRTUAL_DISK_SIZE_GUID: Uuid = Uuid::from_u128(0x2FA54224_CD1B_4876_B211_5DBED83BF4B8);
pub const VIRTUAL_DISK_ID_GUID: Uuid = Uuid::from_u128(0xBECA12AB_B2E6_4523_93EF_C309E000C746);
pub const LOGICAL_SECTOR_SIZE_GUID: Uuid = Uuid::from_u128(0x8141BF1D_A96F_4709_BA47_F233A8FAAB5F);
pub const PHYSICAL_SECTOR_SIZE_GUID: Uuid = Uuid::from_u128(0xCDA348C7_445D_4471_9CC9_E9885251C556);
pub const PARENT_LOCATOR_GUID: Uuid = Uuid::from_u128(0xA8D35F2D_B30B_454D_ABF7_D3D84834AB0C);

/// Locator type of a VHDX parent
pub const VHDX_PARENT_LOCATOR_TYPE: Uuid = Uuid::from_u128(0xB04AEFB7_D19E_4A81_B789_25B8E9445913);

pub fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes([
        bytes[at],
        bytes[at + 1],
        bytes[at + 2],
        bytes[at + 3],
        bytes[at + 4],
        bytes[at + 5],
        bytes[at + 6],
        bytes[at + 7],
    ])
}

/// GUIDs are stored in Windows mixed-endian order
pub fn read_guid(bytes: &[u8], at: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    Uuid::from_bytes_le(raw)
}

pub fn read_signature<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut sig = [0u8; N];
    sig.copy_from_slice(&bytes[at..at + N]);
    sig
}

/// Decode UTF-16LE, returning `None` for odd lengths or unpaired surrogates
pub fn decode_utf16(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

pub fn is_aligned(value: u64, alignment: u64) -> bool {
    value % alignment == 0
}
