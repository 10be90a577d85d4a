//! Header region: the two header copies and the two region table copies
//!
//! Both structures are stored twice. Each copy is validated on its own and
//! the current one is picked by [`select_current`].

use crate::checksum;
use crate::layout::{
    read_guid, read_signature, read_u16, read_u32, read_u64, CHECKSUM_OFFSET, HEADER_OFFSETS,
    HEADER_SIGNATURE, HEADER_SIZE, MAX_TABLE_ENTRIES, REGION_TABLE_OFFSETS,
    REGION_TABLE_SIGNATURE, REGION_TABLE_SIZE,
};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;
use vhdx_core::{ByteSource, CopyDefect, Error, Result, Structure};

/// Which of the two redundant copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopySlot {
    First,
    Second,
}

impl CopySlot {
    pub const ALL: [CopySlot; 2] = [CopySlot::First, CopySlot::Second];

    pub fn index(self) -> usize {
        match self {
            CopySlot::First => 0,
            CopySlot::Second => 1,
        }
    }
}

impl fmt::Display for CopySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopySlot::First => write!(f, "first"),
            CopySlot::Second => write!(f, "second"),
        }
    }
}

/// Validation outcome for one copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CopyStatus {
    pub slot: CopySlot,
    pub offset: u64,
    pub defect: Option<CopyDefect>,
}

impl CopyStatus {
    pub fn is_valid(&self) -> bool {
        self.defect.is_none()
    }
}

/// One copy offered to [`select_current`]
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub slot: CopySlot,
    /// `None` when the copy failed validation
    pub value: Option<T>,
    pub priority: u64,
}

/// Pick the valid candidate with the largest priority.
///
/// Ties go to the candidate that comes first, so equal priorities select
/// copies in format order.
pub fn select_current<T>(candidates: &[Candidate<T>]) -> Option<&Candidate<T>> {
    let mut best: Option<&Candidate<T>> = None;
    for candidate in candidates.iter().filter(|c| c.value.is_some()) {
        match best {
            Some(current) if current.priority >= candidate.priority => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// One 4 KB header copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderCopy {
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl HeaderCopy {
    /// Validate and decode a header copy read from `offset`
    pub fn parse(bytes: &[u8], offset: u64) -> std::result::Result<Self, CopyDefect> {
        let signature = read_signature::<4>(bytes, 0);
        if &signature != HEADER_SIGNATURE {
            return Err(CopyDefect::BadSignature {
                offset,
                found: signature,
                expected: *HEADER_SIGNATURE,
            });
        }

        checksum::verify(&bytes[..HEADER_SIZE], CHECKSUM_OFFSET).map_err(|m| {
            CopyDefect::ChecksumMismatch {
                offset,
                stored: m.stored,
                computed: m.computed,
            }
        })?;

        Ok(Self {
            checksum: read_u32(bytes, 4),
            sequence_number: read_u64(bytes, 8),
            file_write_guid: read_guid(bytes, 16),
            data_write_guid: read_guid(bytes, 32),
            log_guid: read_guid(bytes, 48),
            log_version: read_u16(bytes, 64),
            version: read_u16(bytes, 66),
            log_length: read_u32(bytes, 68),
            log_offset: read_u64(bytes, 72),
        })
    }
}

/// The header copy in effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveHeader {
    pub slot: CopySlot,
    pub offset: u64,
    pub header: HeaderCopy,
}

/// Both header copies and the one selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderSet {
    pub active: ActiveHeader,
    pub copies: [CopyStatus; 2],
}

/// Read both header copies and select the current one.
///
/// # Errors
///
/// `CorruptHeader` when neither copy validates, `Unsupported` when the
/// current copy is not version 1.
pub fn resolve_headers<S: ByteSource + ?Sized>(source: &mut S) -> Result<HeaderSet> {
    let mut candidates = Vec::with_capacity(2);
    let mut copies = Vec::with_capacity(2);

    for slot in CopySlot::ALL {
        let offset = HEADER_OFFSETS[slot.index()];
        let bytes = source.read_bytes(offset, HEADER_SIZE)?;
        let parsed = HeaderCopy::parse(&bytes, offset);
        if let Err(defect) = &parsed {
            tracing::warn!("{} header copy discarded: {}", slot, defect);
        }

        copies.push(CopyStatus {
            slot,
            offset,
            defect: parsed.as_ref().err().copied(),
        });
        let priority = parsed.as_ref().map(|h| h.sequence_number).unwrap_or(0);
        candidates.push(Candidate {
            slot,
            value: parsed.ok(),
            priority,
        });
    }

    let copies = [copies[0], copies[1]];
    let (slot, header) = match select_current(&candidates) {
        Some(Candidate {
            slot,
            value: Some(header),
            ..
        }) => (*slot, header.clone()),
        _ => return Err(corrupt(Structure::Header, &copies)),
    };

    if header.version != 1 {
        return Err(Error::unsupported(format!(
            "header version {} (only version 1 is defined)",
            header.version
        )));
    }

    tracing::debug!(
        "using {} header copy, sequence number {}",
        slot,
        header.sequence_number
    );

    Ok(HeaderSet {
        active: ActiveHeader {
            slot,
            offset: HEADER_OFFSETS[slot.index()],
            header,
        },
        copies,
    })
}

/// The region table copy in effect, still undecoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTableCopy {
    pub slot: CopySlot,
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub copies: [CopyStatus; 2],
    /// Both copies valid and byte-for-byte identical
    pub copies_agree: bool,
}

fn check_region_table(bytes: &[u8], offset: u64) -> std::result::Result<(), CopyDefect> {
    let signature = read_signature::<4>(bytes, 0);
    if &signature != REGION_TABLE_SIGNATURE {
        return Err(CopyDefect::BadSignature {
            offset,
            found: signature,
            expected: *REGION_TABLE_SIGNATURE,
        });
    }

    checksum::verify(bytes, CHECKSUM_OFFSET).map_err(|m| CopyDefect::ChecksumMismatch {
        offset,
        stored: m.stored,
        computed: m.computed,
    })?;

    let count = read_u32(bytes, 8);
    if count > MAX_TABLE_ENTRIES {
        return Err(CopyDefect::TooManyEntries {
            offset,
            count,
            max: MAX_TABLE_ENTRIES,
        });
    }
    Ok(())
}

/// Read both region table copies and select the current one.
///
/// Call this on the log-replayed view: the log may rewrite the region table.
pub fn resolve_region_table<S: ByteSource + ?Sized>(source: &mut S) -> Result<RegionTableCopy> {
    let mut candidates = Vec::with_capacity(2);
    let mut copies = Vec::with_capacity(2);

    for slot in CopySlot::ALL {
        let offset = REGION_TABLE_OFFSETS[slot.index()];
        let bytes = source.read_bytes(offset, REGION_TABLE_SIZE)?;
        let defect = check_region_table(&bytes, offset).err();
        if let Some(defect) = &defect {
            tracing::warn!("{} region table copy discarded: {}", slot, defect);
        }

        copies.push(CopyStatus {
            slot,
            offset,
            defect,
        });
        candidates.push(Candidate {
            slot,
            value: defect.is_none().then_some(bytes),
            priority: 0,
        });
    }

    let copies = [copies[0], copies[1]];
    let copies_agree = match (&candidates[0].value, &candidates[1].value) {
        (Some(first), Some(second)) => first == second,
        _ => false,
    };

    let (slot, bytes) = match select_current(&candidates) {
        Some(Candidate {
            slot,
            value: Some(bytes),
            ..
        }) => (*slot, bytes.clone()),
        _ => return Err(corrupt(Structure::RegionTable, &copies)),
    };

    if copies[0].is_valid() && copies[1].is_valid() && !copies_agree {
        tracing::warn!("region table copies are both valid but differ; using the first");
    }
    tracing::debug!("using {} region table copy", slot);

    Ok(RegionTableCopy {
        slot,
        offset: REGION_TABLE_OFFSETS[slot.index()],
        bytes,
        copies,
        copies_agree,
    })
}

fn corrupt(structure: Structure, copies: &[CopyStatus; 2]) -> Error {
    match (copies[0].defect, copies[1].defect) {
        (Some(first), Some(second)) => Error::CorruptHeader {
            structure,
            first,
            second,
        },
        _ => Error::invalid_structure(format!("no usable {} copy", structure)),
    }
}
