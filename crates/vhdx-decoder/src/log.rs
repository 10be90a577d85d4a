//! Log replay
//!
//! The log is a circular buffer of 4 KB aligned entries. Replay finds the
//! most recent run of sequence-contiguous valid entries and applies their
//! writes to an [`OverlaySource`], so every later stage reads the file as it
//! was at the last completed flush. The file itself is never written.
//!
//! Validation failures inside the log never fail the decode: they end the
//! run and are reported as a [`ScanStop`].

use crate::checksum;
use crate::header::HeaderCopy;
use crate::layout::{
    is_aligned, read_guid, read_signature, read_u32, read_u64, CHECKSUM_OFFSET,
    DATA_DESCRIPTOR_SIGNATURE, DATA_SECTOR_PAYLOAD, DATA_SECTOR_SIGNATURE, LOG_DESCRIPTOR_SIZE,
    LOG_ENTRY_HEADER_SIZE, LOG_ENTRY_SIGNATURE, LOG_SECTOR_SIZE, MIB, REGION_ALIGNMENT,
    ZERO_DESCRIPTOR_SIGNATURE,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;
use vhdx_core::{
    checked_add_u64, validate_allocation_size, ByteSource, Error, Result, MAX_LOG_BYTES,
};
use vhdx_pipeline::{OverlaySource, Patch};

/// Outcome of the replay stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogState {
    /// No log to replay
    Empty,
    /// The log uses a version this decoder cannot interpret
    Skipped,
    /// The log was scanned; `applied` lists what was replayed
    Replayed,
}

/// Why a log scan stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    BadSignature { found: [u8; 4] },
    ChecksumMismatch { stored: u32, computed: u32 },
    GuidMismatch { found: Uuid },
    SequenceBreak { expected: u64, found: u64 },
    TailOutsideRun { tail: u32 },
    Malformed(String),
    LogExhausted,
    NoValidEntry,
    UnsupportedVersion { version: u16 },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::BadSignature { found } => write!(f, "bad signature {:02X?}", found),
            StopReason::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum 0x{:08X} does not match computed 0x{:08X}",
                stored, computed
            ),
            StopReason::GuidMismatch { found } => write!(f, "log GUID {} does not match header", found),
            StopReason::SequenceBreak { expected, found } => {
                write!(f, "sequence number {} where {} was expected", found, expected)
            }
            StopReason::TailOutsideRun { tail } => {
                write!(f, "tail 0x{:X} is not an entry of the run", tail)
            }
            StopReason::Malformed(msg) => write!(f, "malformed entry: {}", msg),
            StopReason::LogExhausted => write!(f, "run covers the whole log"),
            StopReason::NoValidEntry => write!(f, "no valid starting entry"),
            StopReason::UnsupportedVersion { version } => {
                write!(f, "log version {} is not supported", version)
            }
        }
    }
}

/// Where and why the scan stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStop {
    /// Offset within the log of the entry that ended the run (0 when no run
    /// was found)
    pub log_offset: u64,
    pub reason: StopReason,
}

/// One replayed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedEntry {
    pub sequence_number: u64,
    pub log_offset: u64,
    pub zero_descriptors: u32,
    pub data_descriptors: u32,
}

/// Replay report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogReplay {
    pub state: LogState,
    pub log_offset: u64,
    pub log_length: u64,
    pub applied: Vec<AppliedEntry>,
    pub stop: Option<ScanStop>,
}

impl LogReplay {
    fn empty(header: &HeaderCopy) -> Self {
        Self {
            state: LogState::Empty,
            log_offset: header.log_offset,
            log_length: header.log_length as u64,
            applied: Vec::new(),
            stop: None,
        }
    }
}

/// A fully validated log entry
#[derive(Debug, Clone)]
struct LogEntry {
    log_offset: u64,
    length: u64,
    tail: u32,
    sequence_number: u64,
    last_file_offset: u64,
    writes: Vec<Patch>,
    zero_descriptors: u32,
    data_descriptors: u32,
}

/// The log region `(offset, length)` a header declares, if any
pub fn log_region(header: &HeaderCopy) -> Option<(u64, u64)> {
    (header.log_length != 0).then_some((header.log_offset, header.log_length as u64))
}

/// Replay the log onto an overlay of `source`.
///
/// # Errors
///
/// Only for a log region that is misplaced or too large; anything wrong
/// inside the log is reported in the returned [`LogReplay`].
pub fn replay_log<S: ByteSource>(
    mut source: S,
    header: &HeaderCopy,
) -> Result<(OverlaySource<S>, LogReplay)> {
    let Some((log_offset, log_length)) = log_region(header) else {
        return Ok((OverlaySource::new(source), LogReplay::empty(header)));
    };

    if log_offset < MIB
        || !is_aligned(log_offset, REGION_ALIGNMENT)
        || !is_aligned(log_length, REGION_ALIGNMENT)
    {
        return Err(Error::invalid_structure(format!(
            "log at 0x{:X} (0x{:X} bytes) is not 1 MB aligned past the header area",
            log_offset, log_length
        )));
    }
    let log_end = checked_add_u64(log_offset, log_length, "log region end")?;
    if log_end > source.len() {
        return Err(Error::out_of_bounds("log", log_offset, log_length, source.len()));
    }

    if header.log_guid.is_nil() {
        return Ok((OverlaySource::new(source), LogReplay::empty(header)));
    }

    let mut report = LogReplay::empty(header);
    if header.log_version != 0 {
        tracing::warn!(
            "log version {} is not supported; replay skipped",
            header.log_version
        );
        report.state = LogState::Skipped;
        report.stop = Some(ScanStop {
            log_offset: 0,
            reason: StopReason::UnsupportedVersion {
                version: header.log_version,
            },
        });
        return Ok((OverlaySource::new(source), report));
    }

    let size = validate_allocation_size(log_length, MAX_LOG_BYTES, "log")?;
    let log = source.read_bytes(log_offset, size)?;
    let (run, stop) = scan(&log, header.log_guid);

    let mut overlay = OverlaySource::new(source);
    report.state = LogState::Replayed;
    report.stop = stop;

    for entry in &run {
        for patch in &entry.writes {
            overlay.push(patch.clone());
        }
        report.applied.push(AppliedEntry {
            sequence_number: entry.sequence_number,
            log_offset: entry.log_offset,
            zero_descriptors: entry.zero_descriptors,
            data_descriptors: entry.data_descriptors,
        });
    }
    if let Some(last) = run.last() {
        overlay.extend_to(last.last_file_offset);
        tracing::info!(
            "replayed {} log entries, sequence numbers {}..={}",
            run.len(),
            run[0].sequence_number,
            last.sequence_number
        );
    }
    if let Some(stop) = &report.stop {
        tracing::debug!("log scan stopped at 0x{:X}: {}", stop.log_offset, stop.reason);
    }

    Ok((overlay, report))
}

type SlotScan = std::result::Result<LogEntry, StopReason>;

/// Find the run to replay, entries in sequence order.
fn scan(log: &[u8], log_guid: Uuid) -> (Vec<LogEntry>, Option<ScanStop>) {
    let slots = log.len() / LOG_SECTOR_SIZE;
    let scans: Vec<SlotScan> = (0..slots)
        .map(|slot| parse_entry(log, slot * LOG_SECTOR_SIZE, log_guid))
        .collect();

    // (last sequence number, run length) ranks runs: the newest run wins even
    // over a longer stale one. The first best is kept
    let mut best: Option<((u64, usize), Vec<usize>, ScanStop)> = None;
    for (start, slot) in scans.iter().enumerate() {
        let Ok(entry) = slot else { continue };
        if entry.tail as u64 != entry.log_offset {
            continue;
        }

        let (run, last, stop) = walk(&scans, start, entry, log.len() as u64);
        let key = (last, run.len());
        if best.as_ref().map_or(true, |(current, _, _)| key > *current) {
            best = Some((key, run, stop));
        }
    }

    match best {
        Some((_, run, stop)) => {
            let entries = run
                .into_iter()
                .filter_map(|slot| scans[slot].as_ref().ok().cloned())
                .collect();
            (entries, Some(stop))
        }
        None => (
            Vec::new(),
            Some(ScanStop {
                log_offset: 0,
                reason: StopReason::NoValidEntry,
            }),
        ),
    }
}

/// Follow entries forward from `first` while they continue the sequence.
///
/// Returns the slots of the run, the sequence number of its last entry and
/// why it ended.
fn walk(
    scans: &[SlotScan],
    start: usize,
    first: &LogEntry,
    log_length: u64,
) -> (Vec<usize>, u64, ScanStop) {
    let mut run = vec![start];
    let mut offsets = HashSet::from([first.log_offset]);
    let mut consumed = first.length;
    let mut entry = first;

    loop {
        let next_offset = (entry.log_offset + entry.length) % log_length;
        let last = entry.sequence_number;
        let stop = |reason| ScanStop {
            log_offset: next_offset,
            reason,
        };
        if consumed >= log_length {
            return (run, last, stop(StopReason::LogExhausted));
        }

        let next_slot = (next_offset / LOG_SECTOR_SIZE as u64) as usize;
        let next = match &scans[next_slot] {
            Ok(next) => next,
            Err(reason) => return (run, last, stop(reason.clone())),
        };
        let expected = last.wrapping_add(1);
        if next.sequence_number != expected {
            return (
                run,
                last,
                stop(StopReason::SequenceBreak {
                    expected,
                    found: next.sequence_number,
                }),
            );
        }
        if !offsets.contains(&(next.tail as u64)) {
            return (run, last, stop(StopReason::TailOutsideRun { tail: next.tail }));
        }

        run.push(next_slot);
        offsets.insert(next.log_offset);
        consumed += next.length;
        entry = next;
    }
}

/// A descriptor may not write past the file size its entry declares
fn check_write_end(
    descriptor: usize,
    file_offset: u64,
    length: u64,
    last_file_offset: u64,
) -> std::result::Result<(), StopReason> {
    match file_offset.checked_add(length) {
        Some(end) if end <= last_file_offset => Ok(()),
        _ => Err(StopReason::Malformed(format!(
            "descriptor {} writes 0x{:X} bytes at 0x{:X}, past last file offset 0x{:X}",
            descriptor, length, file_offset, last_file_offset
        ))),
    }
}

/// `len` bytes of the circular log starting at `start`
fn window(log: &[u8], start: usize, len: usize) -> Vec<u8> {
    if start + len <= log.len() {
        log[start..start + len].to_vec()
    } else {
        let first = log.len() - start;
        let mut bytes = Vec::with_capacity(len);
        bytes.extend_from_slice(&log[start..]);
        bytes.extend_from_slice(&log[..len - first]);
        bytes
    }
}

fn parse_entry(
    log: &[u8],
    at: usize,
    log_guid: Uuid,
) -> std::result::Result<LogEntry, StopReason> {
    let header = window(log, at, LOG_ENTRY_HEADER_SIZE);
    let signature = read_signature::<4>(&header, 0);
    if &signature != LOG_ENTRY_SIGNATURE {
        return Err(StopReason::BadSignature { found: signature });
    }

    let entry_length = read_u32(&header, 8) as usize;
    let tail = read_u32(&header, 12);
    if entry_length == 0 || entry_length % LOG_SECTOR_SIZE != 0 || entry_length > log.len() {
        return Err(StopReason::Malformed(format!("entry length 0x{:X}", entry_length)));
    }
    if tail as usize % LOG_SECTOR_SIZE != 0 || tail as usize >= log.len() {
        return Err(StopReason::Malformed(format!("tail 0x{:X}", tail)));
    }

    let entry = window(log, at, entry_length);
    checksum::verify(&entry, CHECKSUM_OFFSET).map_err(|m| StopReason::ChecksumMismatch {
        stored: m.stored,
        computed: m.computed,
    })?;

    let found_guid = read_guid(&entry, 32);
    if found_guid != log_guid {
        return Err(StopReason::GuidMismatch { found: found_guid });
    }

    let sequence_number = read_u64(&entry, 16);
    let descriptor_count = read_u32(&entry, 24) as usize;
    let flushed_file_offset = read_u64(&entry, 48);
    let last_file_offset = read_u64(&entry, 56);
    if flushed_file_offset > last_file_offset {
        return Err(StopReason::Malformed(format!(
            "flushed offset 0x{:X} past last offset 0x{:X}",
            flushed_file_offset, last_file_offset
        )));
    }

    let descriptor_area = descriptor_count
        .checked_mul(LOG_DESCRIPTOR_SIZE)
        .and_then(|n| n.checked_add(LOG_ENTRY_HEADER_SIZE))
        .map(|n| n.div_ceil(LOG_SECTOR_SIZE) * LOG_SECTOR_SIZE)
        .filter(|&n| n <= entry_length)
        .ok_or_else(|| {
            StopReason::Malformed(format!("{} descriptors do not fit the entry", descriptor_count))
        })?;

    let mut writes = Vec::with_capacity(descriptor_count);
    let mut zero_descriptors = 0u32;
    let mut data_descriptors = 0u32;
    let mut data_sector = descriptor_area;

    for i in 0..descriptor_count {
        let d = LOG_ENTRY_HEADER_SIZE + i * LOG_DESCRIPTOR_SIZE;
        let signature = read_signature::<4>(&entry, d);
        let file_offset = read_u64(&entry, d + 16);
        let descriptor_sequence = read_u64(&entry, d + 24);
        if descriptor_sequence != sequence_number {
            return Err(StopReason::Malformed(format!(
                "descriptor {} has sequence number {}",
                i, descriptor_sequence
            )));
        }
        if !is_aligned(file_offset, LOG_SECTOR_SIZE as u64) {
            return Err(StopReason::Malformed(format!(
                "descriptor {} file offset 0x{:X} is not 4 KB aligned",
                i, file_offset
            )));
        }

        if &signature == ZERO_DESCRIPTOR_SIGNATURE {
            let length = read_u64(&entry, d + 8);
            if !is_aligned(length, LOG_SECTOR_SIZE as u64) {
                return Err(StopReason::Malformed(format!(
                    "zero descriptor {} length 0x{:X}",
                    i, length
                )));
            }
            check_write_end(i, file_offset, length, last_file_offset)?;
            writes.push(Patch::Zero {
                offset: file_offset,
                length,
            });
            zero_descriptors += 1;
        } else if &signature == DATA_DESCRIPTOR_SIGNATURE {
            check_write_end(i, file_offset, LOG_SECTOR_SIZE as u64, last_file_offset)?;
            if data_sector + LOG_SECTOR_SIZE > entry_length {
                return Err(StopReason::Malformed(format!(
                    "data descriptor {} has no data sector",
                    i
                )));
            }
            let sector = &entry[data_sector..data_sector + LOG_SECTOR_SIZE];
            if &read_signature::<4>(sector, 0) != DATA_SECTOR_SIGNATURE {
                return Err(StopReason::Malformed(format!("data sector {} signature", i)));
            }
            let high = read_u32(sector, 4) as u64;
            let low = read_u32(sector, 4092) as u64;
            if (high << 32 | low) != sequence_number {
                return Err(StopReason::Malformed(format!(
                    "data sector {} sequence number",
                    i
                )));
            }

            let mut bytes = Vec::with_capacity(LOG_SECTOR_SIZE);
            bytes.extend_from_slice(&entry[d + 8..d + 16]);
            bytes.extend_from_slice(&sector[8..8 + DATA_SECTOR_PAYLOAD]);
            bytes.extend_from_slice(&entry[d + 4..d + 8]);
            writes.push(Patch::Data {
                offset: file_offset,
                bytes,
            });
            data_sector += LOG_SECTOR_SIZE;
            data_descriptors += 1;
        } else {
            return Err(StopReason::Malformed(format!(
                "descriptor {} signature {:02X?}",
                i, signature
            )));
        }
    }

    if data_sector != entry_length {
        return Err(StopReason::Malformed(format!(
            "entry length 0x{:X} does not match its descriptors",
            entry_length
        )));
    }

    Ok(LogEntry {
        log_offset: at as u64,
        length: entry_length as u64,
        tail,
        sequence_number,
        last_file_offset,
        writes,
        zero_descriptors,
        data_descriptors,
    })
}
