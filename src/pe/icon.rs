// src/pe/icon.rs

//! Icon extraction from PE resources
//!
//! An RT_GROUP_ICON resource is an ICONDIR whose entries reference
//! RT_ICON payloads by id instead of file offset. Each payload is
//! either a PNG stream (Vista-style icons) or a headerless BMP (DIB).
//! PNG payloads are taken as-is; DIBs are wrapped into a one-image
//! `.ico` in memory and transcoded with the image crate. Among all
//! converted outputs the largest-by-size PNG wins.

use super::resource::{ResourceTable, RT_GROUP_ICON, RT_ICON};
use crate::error::{Error, Result};
use std::io::Cursor;

/// GRPICONDIR header size
const GRP_HEADER: usize = 6;
/// GRPICONDIRENTRY size (14 bytes; the file-format entry is 16)
const GRP_ENTRY: usize = 14;

const PNG_MAGIC: [u8; 4] = [0x89, b'P', b'N', b'G'];

/// One entry of an icon group: image metadata plus the RT_ICON id
#[derive(Debug, Clone, Copy)]
struct GroupEntry {
    width: u8,
    height: u8,
    color_count: u8,
    planes: u16,
    bit_count: u16,
    bytes_in_res: u32,
    icon_id: u16,
}

/// Extract the largest icon of the first icon group, PNG-encoded.
/// Returns `Ok(None)` when the file simply has no icon resources.
pub fn extract_largest_png(table: &ResourceTable<'_>) -> Result<Option<Vec<u8>>> {
    let groups = table.resources_of_type(RT_GROUP_ICON);
    let Some((_, group)) = groups.first() else {
        return Ok(None);
    };

    let mut best: Option<Vec<u8>> = None;
    for entry in parse_group(group)? {
        let Some(payload) = table.find_resource(RT_ICON, entry.icon_id as u32) else {
            continue;
        };
        let png = if payload.starts_with(&PNG_MAGIC) {
            payload.to_vec()
        } else {
            match dib_to_png(&entry, payload) {
                Ok(png) => png,
                Err(_) => continue, // one broken frame must not sink the rest
            }
        };
        if best.as_ref().map(|b| png.len() > b.len()).unwrap_or(true) {
            best = Some(png);
        }
    }
    Ok(best)
}

/// Parse GRPICONDIR entries
fn parse_group(data: &[u8]) -> Result<Vec<GroupEntry>> {
    if data.len() < GRP_HEADER {
        return Err(Error::invalid("icon group", "truncated header"));
    }
    let id_type = u16::from_le_bytes([data[2], data[3]]);
    if id_type != 1 {
        return Err(Error::invalid("icon group", format!("type {id_type} is not an icon")));
    }
    let count = u16::from_le_bytes([data[4], data[5]]) as usize;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = GRP_HEADER + i * GRP_ENTRY;
        let Some(e) = data.get(at..at + GRP_ENTRY) else {
            break; // count overstates what the payload holds
        };
        entries.push(GroupEntry {
            width: e[0],
            height: e[1],
            color_count: e[2],
            planes: u16::from_le_bytes([e[4], e[5]]),
            bit_count: u16::from_le_bytes([e[6], e[7]]),
            bytes_in_res: u32::from_le_bytes([e[8], e[9], e[10], e[11]]),
            icon_id: u16::from_le_bytes([e[12], e[13]]),
        });
    }
    Ok(entries)
}

/// Wrap a headerless DIB payload into a single-image ICO and
/// transcode it to PNG.
fn dib_to_png(entry: &GroupEntry, payload: &[u8]) -> Result<Vec<u8>> {
    if (payload.len() as u32) < entry.bytes_in_res {
        return Err(Error::invalid("icon", "truncated icon frame"));
    }
    let size = payload.len() as u32;

    // ICONDIR + one ICONDIRENTRY, image data at offset 22
    let mut ico = Vec::with_capacity(22 + payload.len());
    ico.extend([0u8, 0, 1, 0, 1, 0]);
    ico.push(entry.width);
    ico.push(entry.height);
    ico.push(entry.color_count);
    ico.push(0);
    ico.extend(entry.planes.to_le_bytes());
    ico.extend(entry.bit_count.to_le_bytes());
    ico.extend(size.to_le_bytes());
    ico.extend(22u32.to_le_bytes());
    ico.extend_from_slice(payload);

    let img = image::load_from_memory_with_format(&ico, image::ImageFormat::Ico)
        .map_err(|e| Error::invalid("icon", format!("ico decode: {e}")))?;
    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, image::ImageFormat::Png)
        .map_err(|e| Error::invalid("icon", format!("png encode: {e}")))?;
    Ok(png.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_bytes(entries: &[(u8, u16)]) -> Vec<u8> {
        let mut data = vec![0u8, 0, 1, 0];
        data.extend((entries.len() as u16).to_le_bytes());
        for &(size, id) in entries {
            let mut e = [0u8; GRP_ENTRY];
            e[0] = size;
            e[1] = size;
            e[6..8].copy_from_slice(&32u16.to_le_bytes());
            e[12..14].copy_from_slice(&id.to_le_bytes());
            data.extend(e);
        }
        data
    }

    #[test]
    fn parses_group_entries() {
        let data = group_bytes(&[(16, 1), (32, 2), (48, 3)]);
        let entries = parse_group(&data).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].icon_id, 2);
        assert_eq!(entries[2].width, 48);
        assert_eq!(entries[0].bit_count, 32);
    }

    #[test]
    fn rejects_non_icon_group() {
        // idType 2 is a cursor group
        let data = vec![0u8, 0, 2, 0, 1, 0];
        assert!(parse_group(&data).is_err());
        assert!(parse_group(&[0u8; 3]).is_err());
    }

    #[test]
    fn overstated_count_is_clamped() {
        let mut data = group_bytes(&[(16, 1)]);
        data[4] = 9; // claims 9 entries, payload has 1
        let entries = parse_group(&data).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn png_payload_detection() {
        assert!(b"\x89PNG\r\n\x1a\n".starts_with(&PNG_MAGIC));
        assert!(!b"BM".starts_with(&PNG_MAGIC));
    }
}
