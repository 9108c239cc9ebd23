//! The keyword table and per-message keyword bitmaps.
//!
//! Keyword names live in the header of the `keywords` extension:
//! `keywords_count u32`, one `name_offset u32` per keyword (relative to the
//! start of the name area) and the NUL-terminated names. Each message
//! record carries a bitmap with one bit per keyword, sized in whole 32-bit
//! words.

use crate::cursor::ByteCursor;
use crate::error::{CoreError, CoreResult};
use crate::index::ext::MapExt;
use crate::registry::{KeywordId, Registry};
use std::collections::HashSet;
use std::path::Path;

/// Name of the extension carrying keywords.
pub const KEYWORDS_EXT_NAME: &str = "keywords";

/// Bytes of per-record bitmap needed for `count` keywords.
#[must_use]
pub const fn keyword_bitmap_size(count: usize) -> usize {
    count.div_ceil(32) * 4
}

/// Returns bit `idx` of a keyword bitmap. Bits past the end are unset.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
}

/// Sets or clears bit `idx` of a keyword bitmap.
pub fn bitmap_set(bitmap: &mut [u8], idx: usize, value: bool) {
    let mask = 1u8 << (idx % 8);
    if value {
        bitmap[idx / 8] |= mask;
    } else {
        bitmap[idx / 8] &= !mask;
    }
}

/// Decodes the keyword names from the extension header data.
///
/// # Errors
///
/// Returns `IndexCorrupted` for a truncated offset table, offsets outside
/// the data, unterminated or empty names and duplicates.
pub fn decode_keywords_header(path: &Path, data: &[u8]) -> CoreResult<Vec<String>> {
    let cur = ByteCursor::new(data);
    let count = cur
        .read_u32_at(0)
        .map_err(|_| CoreError::index_corrupted(path, "keyword header too small"))?
        as usize;
    let names_start = count
        .checked_mul(4)
        .and_then(|table| table.checked_add(4))
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            CoreError::index_corrupted(
                path,
                format!("keyword count {count} exceeds header size {}", data.len()),
            )
        })?;

    let mut names = Vec::with_capacity(count);
    let mut seen = HashSet::new();
    for i in 0..count {
        let name_offset = cur.read_u32_at(4 + i * 4)? as usize;
        let start = names_start.saturating_add(name_offset);
        let rest = data.get(start..).ok_or_else(|| {
            CoreError::index_corrupted(path, format!("keyword #{i} offset {name_offset} outside header"))
        })?;
        let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            CoreError::index_corrupted(path, format!("keyword #{i} is not NUL-terminated"))
        })?;
        let name = std::str::from_utf8(&rest[..len])
            .map_err(|_| CoreError::index_corrupted(path, format!("keyword #{i} is not UTF-8")))?;
        if name.is_empty() {
            return Err(CoreError::index_corrupted(path, format!("keyword #{i} is empty")));
        }
        if !seen.insert(name) {
            return Err(CoreError::index_corrupted(path, format!("duplicate keyword {name:?}")));
        }
        names.push(name.to_string());
    }
    Ok(names)
}

/// Encodes keyword names as extension header data.
#[must_use]
pub fn encode_keywords_header<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
    let mut table = Vec::with_capacity(4 + names.len() * 4);
    let mut area = Vec::new();
    table.extend_from_slice(&(names.len() as u32).to_le_bytes());
    for name in names {
        table.extend_from_slice(&(area.len() as u32).to_le_bytes());
        area.extend_from_slice(name.as_ref().as_bytes());
        area.push(0);
    }
    table.extend_from_slice(&area);
    table
}

/// Resolves the map's keyword table against the process registry.
///
/// `ext` is the `keywords` extension with its header data, if the map has
/// one. `known` is what an earlier map of the same index already listed:
/// keywords are append-only within an index, so a shorter or reordered
/// list is corruption. Keywords new to the process are registered.
///
/// # Errors
///
/// Returns `IndexCorrupted` if the table shrank, changed, cannot be
/// decoded, or does not fit the record bitmap.
pub fn parse_keywords(
    path: &Path,
    ext: Option<(&MapExt, &[u8])>,
    registry: &Registry,
    known: &[KeywordId],
) -> CoreResult<Vec<KeywordId>> {
    let Some((ext, data)) = ext else {
        if !known.is_empty() {
            return Err(CoreError::index_corrupted(path, "keywords removed unexpectedly"));
        }
        return Ok(Vec::new());
    };

    let names = decode_keywords_header(path, data)?;
    if names.len() < known.len() {
        return Err(CoreError::index_corrupted(
            path,
            format!("keywords count decreased from {} to {}", known.len(), names.len()),
        ));
    }
    if usize::from(ext.record_size) < keyword_bitmap_size(names.len()) {
        return Err(CoreError::index_corrupted(
            path,
            format!(
                "keyword bitmap of {} bytes cannot hold {} keywords",
                ext.record_size,
                names.len()
            ),
        ));
    }

    let mut ids = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let id = registry.keyword_lookup_or_create(name)?;
        if known.get(i).is_some_and(|&old| old != id) {
            return Err(CoreError::index_corrupted(
                path,
                format!("keyword #{i} changed unexpectedly to {name:?}"),
            ));
        }
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> &'static Path {
        Path::new("test.index")
    }

    fn keywords_ext(count: usize) -> MapExt {
        MapExt {
            name: KEYWORDS_EXT_NAME.to_string(),
            hdr_offset: 0,
            hdr_size: 0,
            record_offset: 8,
            record_size: keyword_bitmap_size(count) as u16,
            record_align: 1,
        }
    }

    #[test]
    fn header_layout() {
        let data = encode_keywords_header(&["$Junk", "a"]);
        assert_eq!(&data[..4], &2u32.to_le_bytes());
        assert_eq!(&data[4..8], &0u32.to_le_bytes());
        assert_eq!(&data[8..12], &6u32.to_le_bytes());
        assert_eq!(&data[12..], b"$Junk\0a\0");
        assert_eq!(decode_keywords_header(path(), &data).unwrap(), vec!["$Junk", "a"]);
    }

    #[test]
    fn unterminated_name_is_corruption() {
        let mut data = encode_keywords_header(&["abc"]);
        data.pop();
        assert!(decode_keywords_header(path(), &data).unwrap_err().is_corruption());
    }

    #[test]
    fn count_past_data_is_corruption() {
        let mut data = encode_keywords_header(&["abc"]);
        data[..4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(decode_keywords_header(path(), &data).is_err());
    }

    #[test]
    fn bitmap_sizes_round_to_words() {
        assert_eq!(keyword_bitmap_size(0), 0);
        assert_eq!(keyword_bitmap_size(1), 4);
        assert_eq!(keyword_bitmap_size(32), 4);
        assert_eq!(keyword_bitmap_size(33), 8);
    }

    #[test]
    fn bitmap_bits() {
        let mut bitmap = vec![0u8; 4];
        bitmap_set(&mut bitmap, 9, true);
        assert!(bitmap_get(&bitmap, 9));
        assert!(!bitmap_get(&bitmap, 8));
        assert!(!bitmap_get(&bitmap, 100));
        bitmap_set(&mut bitmap, 9, false);
        assert_eq!(bitmap, vec![0; 4]);
    }

    #[test]
    fn keywords_are_append_only() {
        let registry = Registry::new();
        let two = encode_keywords_header(&["a", "b"]);
        let ext = keywords_ext(2);
        let known = parse_keywords(path(), Some((&ext, &two)), &registry, &[]).unwrap();
        assert_eq!(known.len(), 2);

        let three = encode_keywords_header(&["a", "b", "c"]);
        let grown = parse_keywords(path(), Some((&ext, &three)), &registry, &known).unwrap();
        assert_eq!(&grown[..2], &known[..]);
        assert_eq!(registry.keywords_count(), 3);

        let one = encode_keywords_header(&["a"]);
        let err = parse_keywords(path(), Some((&ext, &one)), &registry, &known).unwrap_err();
        assert!(err.to_string().contains("decreased"));

        let swapped = encode_keywords_header(&["b", "a"]);
        assert!(parse_keywords(path(), Some((&ext, &swapped)), &registry, &known).is_err());

        assert!(parse_keywords(path(), None, &registry, &known).is_err());
    }
}
