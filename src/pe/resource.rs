// src/pe/resource.rs

//! PE `.rsrc` section walking
//!
//! The resource section is a three-level tree of fixed-layout
//! directories (type / name / language). goblin locates the section;
//! the walk itself is done here with bounds-checked little-endian
//! reads. Only the handful of resource types the inspector needs are
//! exposed:
//!
//! - `RT_ICON` (3) — individual icon images
//! - `RT_GROUP_ICON` (14) — icon directories referencing RT_ICON ids
//! - `RT_VERSION` (16) — VS_VERSIONINFO with the product name

use crate::error::{Error, Result};
use goblin::pe::PE;

pub const RT_ICON: u32 = 3;
pub const RT_GROUP_ICON: u32 = 14;
pub const RT_VERSION: u32 = 16;

/// Size of an IMAGE_RESOURCE_DIRECTORY header
const DIR_HEADER: usize = 16;
/// Size of one directory entry
const DIR_ENTRY: usize = 8;
/// Size of an IMAGE_RESOURCE_DATA_ENTRY
const DATA_ENTRY: usize = 16;
/// High bit marks a subdirectory offset
const SUBDIR_FLAG: u32 = 0x8000_0000;

/// A parsed view of one PE file's resource section
pub struct ResourceTable<'a> {
    /// Raw `.rsrc` section contents
    data: &'a [u8],
    /// RVA the section is mapped at; data-entry RVAs are relative to
    /// the image, not the section
    section_rva: u32,
}

impl<'a> ResourceTable<'a> {
    /// Locate and wrap the `.rsrc` section of a PE image
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let pe = PE::parse(bytes)
            .map_err(|e| Error::invalid("pe", format!("header parse failed: {e}")))?;
        let section = pe
            .sections
            .iter()
            .find(|s| s.name().map(|n| n == ".rsrc").unwrap_or(false))
            .ok_or_else(|| Error::invalid("pe", "no .rsrc section"))?;

        let start = section.pointer_to_raw_data as usize;
        let mut len = section.size_of_raw_data as usize;
        if section.virtual_size != 0 {
            len = len.min(section.virtual_size as usize);
        }
        let end = start
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| Error::invalid("pe", ".rsrc section out of bounds"))?;

        Ok(Self {
            data: &bytes[start..end],
            section_rva: section.virtual_address,
        })
    }

    /// Test/internal constructor over a raw section image
    #[cfg(test)]
    pub(crate) fn from_raw(data: &'a [u8], section_rva: u32) -> Self {
        Self { data, section_rva }
    }

    /// All resources of one type, as `(resource id, payload)` pairs.
    /// Only the first language of each resource is taken.
    pub fn resources_of_type(&self, type_id: u32) -> Vec<(u32, &'a [u8])> {
        let mut out = Vec::new();
        let Some(type_entries) = self.dir_entries(0) else {
            return out;
        };
        for (id, offset) in type_entries {
            if id != type_id || offset & SUBDIR_FLAG == 0 {
                continue;
            }
            let Some(name_entries) = self.dir_entries((offset & !SUBDIR_FLAG) as usize) else {
                continue;
            };
            for (res_id, name_offset) in name_entries {
                if let Some(payload) = self.first_language_payload(name_offset) {
                    out.push((res_id, payload));
                }
            }
        }
        out
    }

    /// One specific resource by type and id
    pub fn find_resource(&self, type_id: u32, res_id: u32) -> Option<&'a [u8]> {
        self.resources_of_type(type_id)
            .into_iter()
            .find(|(id, _)| *id == res_id)
            .map(|(_, payload)| payload)
    }

    /// Product name from the first VS_VERSIONINFO resource
    pub fn product_name(&self) -> Option<String> {
        let (_, version) = self.resources_of_type(RT_VERSION).into_iter().next()?;
        product_name_from_version(version)
    }

    /// Follow a name-level entry down to its first language payload
    fn first_language_payload(&self, offset: u32) -> Option<&'a [u8]> {
        let data_offset = if offset & SUBDIR_FLAG != 0 {
            // Language directory: take the first entry
            let (_, lang_offset) = self
                .dir_entries((offset & !SUBDIR_FLAG) as usize)?
                .into_iter()
                .next()?;
            if lang_offset & SUBDIR_FLAG != 0 {
                return None; // deeper nesting than the format allows
            }
            lang_offset as usize
        } else {
            offset as usize
        };

        let rva = self.read_u32(data_offset)?;
        let size = self.read_u32(data_offset + 4)? as usize;
        let start = rva.checked_sub(self.section_rva)? as usize;
        let end = start.checked_add(size)?;
        self.data.get(start..end)
    }

    /// Entries of the directory at `offset`, as `(id, offset_field)`.
    /// Named entries are skipped; the inspector only looks up by id.
    fn dir_entries(&self, offset: usize) -> Option<Vec<(u32, u32)>> {
        let named = self.read_u16(offset + 12)? as usize;
        let by_id = self.read_u16(offset + 14)? as usize;
        let first = offset + DIR_HEADER + named * DIR_ENTRY;

        let mut entries = Vec::with_capacity(by_id);
        for i in 0..by_id {
            let at = first + i * DIR_ENTRY;
            let id = self.read_u32(at)?;
            let entry_offset = self.read_u32(at + 4)?;
            entries.push((id, entry_offset));
        }
        Some(entries)
    }

    fn read_u16(&self, at: usize) -> Option<u16> {
        let b = self.data.get(at..at + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&self, at: usize) -> Option<u32> {
        let b = self.data.get(at..at + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Extract `ProductName` from a VS_VERSIONINFO blob.
///
/// The blob is a tree of length-prefixed UTF-16 structures; instead of
/// replaying the full walk we locate the `ProductName` key directly
/// and read the value string that follows its NUL terminator and
/// 32-bit alignment padding.
pub(crate) fn product_name_from_version(data: &[u8]) -> Option<String> {
    let needle: Vec<u8> = "ProductName"
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    let pos = data
        .windows(needle.len())
        .position(|w| w == needle.as_slice())?;

    // Skip the key's NUL terminator, then pad to the next 32-bit
    // boundary where the value string starts.
    let mut at = (pos + needle.len() + 2 + 3) & !3;

    let mut units = Vec::new();
    while at + 1 < data.len() {
        let u = u16::from_le_bytes([data[at], data[at + 1]]);
        if u == 0 {
            break;
        }
        units.push(u);
        at += 2;
    }
    if units.is_empty() {
        return None;
    }
    Some(String::from_utf16_lossy(&units).trim().to_string())
}
