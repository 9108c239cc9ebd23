//! Extension tables embedded in the index header.
//!
//! Extension entries start at the first 8-byte boundary after the base
//! header. Each entry is a 12-byte header (`header_size u32`,
//! `record_offset u16`, `record_size u16`, `record_align u16`,
//! `name_size u16`) followed by the name, padding to 8, the extension's
//! header data and padding to 8 again.

use crate::cursor::{put_u16, put_u32, ByteCursor};
use crate::error::{CoreError, CoreResult};
use crate::index::header::{IndexHeader, BASE_RECORD_SIZE};
use crate::types::align_up;
use std::collections::HashSet;
use std::path::Path;

/// Size of the fixed part of an extension entry.
pub const EXT_HEADER_SIZE: usize = 12;

/// An extension as laid out in one map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapExt {
    /// Unique extension name.
    pub name: String,
    /// Offset of the extension's header data within the index header.
    pub hdr_offset: usize,
    /// Size of the extension's header data.
    pub hdr_size: u32,
    /// Offset of the extension's area inside each message record.
    pub record_offset: u16,
    /// Size of the extension's area inside each message record.
    pub record_size: u16,
    /// Alignment of the record area.
    pub record_align: u16,
}

/// Offset of the header data from the start of an entry with a
/// `name_len`-byte name.
#[must_use]
pub const fn ext_data_offset(name_len: usize) -> usize {
    align_up(EXT_HEADER_SIZE + name_len, 8)
}

/// Walks the extension area of `header` and validates every entry.
///
/// # Errors
///
/// Returns `IndexCorrupted` for entries that run past `header_size`,
/// empty or duplicate names, and record areas that fall outside the record
/// or violate their alignment.
pub fn parse_extensions(path: &Path, header: &[u8], hdr: &IndexHeader) -> CoreResult<Vec<MapExt>> {
    let header_size = hdr.header_size as usize;
    let record_size = hdr.record_size as usize;
    let header = header.get(..header_size).ok_or_else(|| {
        CoreError::index_corrupted(path, format!("header_size {header_size} exceeds mapped header"))
    })?;
    let cur = ByteCursor::new(header);

    let mut exts: Vec<MapExt> = Vec::new();
    let mut names = HashSet::new();
    let mut offset = align_up(usize::from(hdr.base_header_size), 8);

    while offset < header_size {
        if offset + EXT_HEADER_SIZE > header_size {
            return Err(CoreError::index_corrupted(
                path,
                format!("extension header at offset {offset} runs past header_size {header_size}"),
            ));
        }
        let ext_hdr_size = cur.read_u32_at(offset)?;
        let ext_record_offset = cur.read_u16_at(offset + 4)?;
        let ext_record_size = cur.read_u16_at(offset + 6)?;
        let ext_record_align = cur.read_u16_at(offset + 8)?;
        let name_size = usize::from(cur.read_u16_at(offset + 10)?);

        let name_start = offset + EXT_HEADER_SIZE;
        if name_size == 0 {
            return Err(CoreError::index_corrupted(
                path,
                format!("extension at offset {offset} has an empty name"),
            ));
        }
        if name_start + name_size > header_size {
            return Err(CoreError::index_corrupted(
                path,
                format!(
                    "extension at offset {offset}: name_size {name_size} but only {} bytes left in header",
                    header_size - name_start
                ),
            ));
        }
        let name = std::str::from_utf8(&header[name_start..name_start + name_size])
            .map_err(|_| {
                CoreError::index_corrupted(path, format!("extension at offset {offset}: name is not UTF-8"))
            })?
            .to_string();
        if !names.insert(name.clone()) {
            return Err(CoreError::index_corrupted(
                path,
                format!("duplicate extension {name:?}"),
            ));
        }

        let hdr_offset = offset + ext_data_offset(name_size);
        if hdr_offset + ext_hdr_size as usize > header_size {
            return Err(CoreError::index_corrupted(
                path,
                format!(
                    "extension {name:?}: header data {hdr_offset}+{ext_hdr_size} runs past header_size {header_size}"
                ),
            ));
        }

        if ext_record_size > 0 {
            let align = usize::from(ext_record_align);
            let rec_offset = usize::from(ext_record_offset);
            if !matches!(align, 1 | 2 | 4 | 8) || rec_offset % align != 0 || record_size % align != 0 {
                return Err(CoreError::index_corrupted(
                    path,
                    format!("extension {name:?}: bad record alignment {align} at offset {rec_offset}"),
                ));
            }
            if rec_offset < BASE_RECORD_SIZE {
                return Err(CoreError::index_corrupted(
                    path,
                    format!("extension {name:?}: record offset {rec_offset} inside the base record"),
                ));
            }
            if rec_offset + usize::from(ext_record_size) > record_size {
                return Err(CoreError::index_corrupted(
                    path,
                    format!(
                        "extension {name:?}: record area {rec_offset}+{ext_record_size} exceeds record_size {record_size}"
                    ),
                ));
            }
        }

        exts.push(MapExt {
            name,
            hdr_offset,
            hdr_size: ext_hdr_size,
            record_offset: ext_record_offset,
            record_size: ext_record_size,
            record_align: ext_record_align.max(1),
        });
        offset = hdr_offset + align_up(ext_hdr_size as usize, 8);
    }

    Ok(exts)
}

/// Appends one extension entry to `area`, the extension region of a header
/// whose first byte sits at header offset `area_start` (8-byte aligned).
/// Returns the header offset of the entry's data.
pub fn encode_ext_entry(area: &mut Vec<u8>, area_start: usize, ext: &MapExt, data: &[u8]) -> usize {
    debug_assert_eq!(data.len(), ext.hdr_size as usize);
    let entry = area.len();
    area.resize(entry + EXT_HEADER_SIZE, 0);
    put_u32(area, entry, ext.hdr_size);
    put_u16(area, entry + 4, ext.record_offset);
    put_u16(area, entry + 6, ext.record_size);
    put_u16(area, entry + 8, ext.record_align);
    put_u16(area, entry + 10, ext.name.len() as u16);
    area.extend_from_slice(ext.name.as_bytes());
    area.resize(entry + ext_data_offset(ext.name.len()), 0);
    let hdr_offset = area_start + area.len();
    area.extend_from_slice(data);
    area.resize(align_up(area.len(), 8), 0);
    hdr_offset
}
