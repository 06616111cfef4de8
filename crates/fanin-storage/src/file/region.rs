use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};

use fanin_common::error::{FaninError, Result};
use fanin_common::types::ProcessRecord;
use memmap2::{MmapMut, MmapOptions};

const MAGIC: &[u8; 4] = b"FNIN";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 16;
const USED_OFFSET: usize = 8;
const INITIAL_LEN: usize = 64 * 1024;
const SLOT_PREFIX_LEN: usize = 8;
const CELL_LEN: usize = 8;

const REGION_PREFIX: &str = "region_";
const REGION_SUFFIX: &str = ".db";

pub fn region_file_name(process: &ProcessRecord) -> String {
    format!("{REGION_PREFIX}{}{REGION_SUFFIX}", process.token())
}

pub fn parse_region_file_name(name: &str) -> Option<ProcessRecord> {
    let token = name.strip_prefix(REGION_PREFIX)?.strip_suffix(REGION_SUFFIX)?;
    ProcessRecord::parse_token(token)
}

/// A slot as laid out on disk; `key` is the JSON-encoded series metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSlot {
    pub key: String,
    pub cells: Vec<f64>,
    pub timestamp: f64,
    cells_offset: usize,
}

/// Walks every slot below the header's `used` mark.
///
/// Structural damage (bad magic, lengths running past `used`) fails the whole
/// region since slot boundaries can no longer be trusted.
pub fn decode_region(bytes: &[u8], location: &str) -> Result<Vec<RawSlot>> {
    if bytes.len() < HEADER_LEN {
        return Err(FaninError::corrupt(location, "truncated header"));
    }
    if &bytes[..4] != MAGIC {
        return Err(FaninError::corrupt(location, "bad magic"));
    }
    let version = read_u32(bytes, 4).unwrap_or_default();
    if version != VERSION {
        return Err(FaninError::corrupt(
            location,
            format!("unsupported region version {version}"),
        ));
    }

    let used = read_u64(bytes, USED_OFFSET)
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| FaninError::corrupt(location, "unreadable used mark"))?;
    if used < HEADER_LEN || used > bytes.len() {
        return Err(FaninError::corrupt(
            location,
            format!("used mark {used} outside region of {} bytes", bytes.len()),
        ));
    }

    let mut slots = Vec::new();
    let mut pos = HEADER_LEN;
    while pos < used {
        let (key_len, value_count) = match (read_u32(bytes, pos), read_u32(bytes, pos + 4)) {
            (Some(key_len), Some(value_count)) => (key_len as usize, value_count as usize),
            _ => return Err(FaninError::corrupt(location, "truncated slot prefix")),
        };

        let slot_len = slot_len(key_len, value_count)
            .ok_or_else(|| FaninError::corrupt(location, "slot length overflow"))?;
        if pos + slot_len > used {
            return Err(FaninError::corrupt(
                location,
                format!("slot at {pos} runs past used mark"),
            ));
        }

        let key_start = pos + SLOT_PREFIX_LEN;
        let key = std::str::from_utf8(&bytes[key_start..key_start + key_len])
            .map_err(|_| FaninError::corrupt(location, format!("slot at {pos} has non-utf8 key")))?
            .to_string();

        let cells_offset = key_start + padded(key_len);
        let cells = (0..value_count)
            .map(|index| read_f64(bytes, cells_offset + index * CELL_LEN).unwrap_or_default())
            .collect();
        let timestamp =
            read_f64(bytes, cells_offset + value_count * CELL_LEN).unwrap_or_default();

        slots.push(RawSlot {
            key,
            cells,
            timestamp,
            cells_offset,
        });
        pos += slot_len;
    }

    Ok(slots)
}

/// Memory-mapped region owned by the current process.
///
/// Only the owning process ever writes to the file, so slots are updated in
/// place without any cross-process locking. Callers serialize access through
/// the store's mutex.
pub struct RegionWriter {
    path: PathBuf,
    file: File,
    map: MmapMut,
    used: usize,
    positions: HashMap<String, (usize, usize)>,
}

impl RegionWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(INITIAL_LEN as u64)?;
        }

        // SAFETY: the file is open read/write, has a non-zero length, and is
        // owned by this writer for the lifetime of the map. Other processes
        // only read it through regular file I/O.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let location = path.display().to_string();

        let mut positions = HashMap::new();
        let used = if fresh {
            map[..4].copy_from_slice(MAGIC);
            map[4..8].copy_from_slice(&VERSION.to_le_bytes());
            map[USED_OFFSET..HEADER_LEN].copy_from_slice(&(HEADER_LEN as u64).to_le_bytes());
            HEADER_LEN
        } else {
            let slots = decode_region(&map, &location)?;
            let mut end = HEADER_LEN;
            for slot in slots {
                let value_count = slot.cells.len();
                end = slot.cells_offset + (value_count + 1) * CELL_LEN;
                positions.insert(slot.key, (slot.cells_offset, value_count));
            }
            end
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            used,
            positions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_count(&self) -> usize {
        self.positions.len()
    }

    /// Applies `update` to the cells of `key`, appending a zeroed slot the
    /// first time the key is seen, then stamps the slot with `timestamp`.
    pub fn update<F>(&mut self, key: &str, value_count: usize, timestamp: f64, update: F) -> Result<()>
    where
        F: FnOnce(&mut [f64]),
    {
        let (cells_offset, stored_count) = match self.positions.get(key) {
            Some(position) => *position,
            None => self.append_slot(key, value_count)?,
        };

        if stored_count != value_count {
            return Err(FaninError::corrupt(
                self.path.display().to_string(),
                format!("slot holds {stored_count} cells, writer expects {value_count}"),
            ));
        }

        let current = (0..value_count)
            .map(|index| read_f64(&self.map, cells_offset + index * CELL_LEN).unwrap_or_default())
            .collect::<Vec<_>>();
        let mut cells = current.clone();
        update(&mut cells);

        // Readers copy the file front to back. Storing from the last cell down
        // means a reader that sees bucket k updated also sees every bucket
        // above it updated, so cumulative counts never appear to decrease.
        for (index, cell) in cells.iter().enumerate().rev() {
            if cell.to_bits() == current[index].to_bits() {
                continue;
            }
            let offset = cells_offset + index * CELL_LEN;
            self.map[offset..offset + CELL_LEN].copy_from_slice(&cell.to_le_bytes());
            fence(Ordering::Release);
        }
        let ts_offset = cells_offset + value_count * CELL_LEN;
        self.map[ts_offset..ts_offset + CELL_LEN].copy_from_slice(&timestamp.to_le_bytes());
        Ok(())
    }

    fn append_slot(&mut self, key: &str, value_count: usize) -> Result<(usize, usize)> {
        let key_bytes = key.as_bytes();
        let key_len = u32::try_from(key_bytes.len())
            .map_err(|_| FaninError::InvalidArgument("series key too large".to_string()))?;
        let count = u32::try_from(value_count)
            .map_err(|_| FaninError::InvalidArgument("too many histogram buckets".to_string()))?;
        let slot_len = slot_len(key_bytes.len(), value_count)
            .ok_or_else(|| FaninError::InvalidArgument("series slot too large".to_string()))?;

        let start = self.used;
        self.ensure_capacity(start + slot_len)?;

        self.map[start..start + 4].copy_from_slice(&key_len.to_le_bytes());
        self.map[start + 4..start + 8].copy_from_slice(&count.to_le_bytes());
        let key_start = start + SLOT_PREFIX_LEN;
        let cells_offset = key_start + padded(key_bytes.len());
        self.map[key_start..key_start + key_bytes.len()].copy_from_slice(key_bytes);
        self.map[key_start + key_bytes.len()..cells_offset].fill(b' ');
        self.map[cells_offset..start + slot_len].fill(0);

        // publish the slot only once its bytes are in place
        self.used = start + slot_len;
        self.map[USED_OFFSET..HEADER_LEN].copy_from_slice(&(self.used as u64).to_le_bytes());

        self.positions
            .insert(key.to_string(), (cells_offset, value_count));
        Ok((cells_offset, value_count))
    }

    fn ensure_capacity(&mut self, needed: usize) -> Result<()> {
        if needed <= self.map.len() {
            return Ok(());
        }

        let mut new_len = self.map.len().max(INITIAL_LEN);
        while new_len < needed {
            new_len = new_len.saturating_mul(2);
        }

        self.map.flush()?;
        self.file.set_len(new_len as u64)?;
        // SAFETY: the file was just grown to `new_len`; the previous map is
        // replaced (and unmapped) by this assignment and no slice into it
        // outlives this call.
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }
}

fn padded(len: usize) -> usize {
    len.div_ceil(8) * 8
}

fn slot_len(key_len: usize, value_count: usize) -> Option<usize> {
    let cells = value_count.checked_add(1)?.checked_mul(CELL_LEN)?;
    SLOT_PREFIX_LEN
        .checked_add(padded(key_len))?
        .checked_add(cells)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(offset..offset + 8)?.try_into().ok()?))
}

fn read_f64(bytes: &[u8], offset: usize) -> Option<f64> {
    Some(f64::from_le_bytes(bytes.get(offset..offset + 8)?.try_into().ok()?))
}
