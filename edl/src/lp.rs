// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Android LP ("super") metadata parser: geometry, header, partition and
//! extent tables, flattened into logical sub-partitions addressable inside
//! the super partition.

use log::warn;

use crate::error::{EdlError, Result};

pub const LP_GEOMETRY_MAGIC: u32 = 0x616C4467;
pub const LP_METADATA_HEADER_MAGIC: u32 = 0x414C5030;

/// liblp addresses extents in 512-byte sectors...
const LP_SECTOR_SIZE: u64 = 512;

const LP_TARGET_TYPE_LINEAR: u32 = 0;
const LP_TARGET_TYPE_ZERO: u32 = 1;

#[derive(Debug, Clone)]
pub struct LpGeometry {
    pub metadata_max_size: u32,
    pub metadata_slot_count: u32,
    pub logical_block_size: u32,
}

#[derive(Debug, Clone)]
pub struct LpHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub tables_size: u32,
    pub partitions_offset: u32,
    pub num_partitions: u32,
    pub partition_entry_size: u32,
    pub extents_offset: u32,
    pub num_extents: u32,
    pub extent_entry_size: u32,
}

#[derive(Debug, Clone)]
pub struct LpExtent {
    pub num_sectors: u64,
    pub target_type: u32,
    pub target_data: u64,
    pub target_source: u32,
}

/// One logical sub-partition, located by absolute byte offset inside the
/// super partition.
#[derive(Debug, Clone)]
pub struct LogicalPartition {
    pub name: String,
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

pub fn parse_geometry(buf: &[u8]) -> Result<LpGeometry> {
    // Geometry sits at the head of the super partition; some dumps start at
    // the reserved 4 KiB instead
    let base = [0usize, 4096]
        .into_iter()
        .find(|&off| buf.len() >= off + 52 && le32(buf, off) == LP_GEOMETRY_MAGIC)
        .ok_or_else(|| EdlError::BadMagic {
            what: "LP geometry",
            value: if buf.len() >= 4 { le32(buf, 0) as u64 } else { 0 },
        })?;

    Ok(LpGeometry {
        metadata_max_size: le32(buf, base + 40),
        metadata_slot_count: le32(buf, base + 44),
        logical_block_size: le32(buf, base + 48),
    })
}

/// Parse the super metadata and flatten every partition to its byte range.
///
/// `super_size` bounds the plausibility check: extents are first computed in
/// 512-byte units, and if any lands outside the super partition the table is
/// re-derived with the geometry's logical block size as the unit (a handful
/// of devices report extents that way). Both passes failing means the
/// metadata is corrupt.
pub fn parse_super(buf: &[u8], super_size: u64) -> Result<Vec<LogicalPartition>> {
    let geometry = parse_geometry(buf).ok();

    let header_offset = [4096usize, 8192]
        .into_iter()
        .find(|&off| buf.len() >= off + 128 && le32(buf, off) == LP_METADATA_HEADER_MAGIC)
        .ok_or(EdlError::BadMagic {
            what: "LP metadata header",
            value: 0,
        })?;

    let h = header_offset;
    let header = LpHeader {
        major_version: le16(buf, h + 4),
        minor_version: le16(buf, h + 6),
        header_size: le32(buf, h + 8),
        tables_size: le32(buf, h + 44),
        // Table descriptors: partitions, extents, groups; 12 bytes each
        partitions_offset: le32(buf, h + 80),
        num_partitions: le32(buf, h + 84),
        partition_entry_size: le32(buf, h + 88),
        extents_offset: le32(buf, h + 92),
        num_extents: le32(buf, h + 96),
        extent_entry_size: le32(buf, h + 100),
    };
    if header.partition_entry_size < 52 || header.extent_entry_size < 24 {
        return Err(EdlError::CorruptMetadata(format!(
            "LP entry sizes {}/{}",
            header.partition_entry_size, header.extent_entry_size
        )));
    }

    let tables = h + header.header_size as usize;
    let extents = parse_extents(buf, tables, &header)?;

    let unit_candidates = [
        LP_SECTOR_SIZE,
        geometry
            .as_ref()
            .map_or(LP_SECTOR_SIZE, |g| g.logical_block_size as u64),
    ];

    for (pass, unit) in unit_candidates.into_iter().enumerate() {
        match flatten(buf, tables, &header, &extents, unit, super_size) {
            Ok(parts) => {
                if pass > 0 {
                    warn!("LP extents addressed in {unit}-byte units, not 512");
                }
                return Ok(parts);
            }
            Err(_) if pass == 0 && unit_candidates[0] != unit_candidates[1] => continue,
            Err(e) => return Err(e),
        }
    }
    unreachable!()
}

fn parse_extents(buf: &[u8], tables: usize, header: &LpHeader) -> Result<Vec<LpExtent>> {
    let base = tables + header.extents_offset as usize;
    let esz = header.extent_entry_size as usize;
    let mut extents = Vec::with_capacity(header.num_extents as usize);
    for i in 0..header.num_extents as usize {
        let off = base + i * esz;
        if off + 24 > buf.len() {
            return Err(EdlError::CorruptMetadata("LP extent table truncated".into()));
        }
        extents.push(LpExtent {
            num_sectors: le64(buf, off),
            target_type: le32(buf, off + 8),
            target_data: le64(buf, off + 12),
            target_source: le32(buf, off + 20),
        });
    }
    Ok(extents)
}

fn flatten(
    buf: &[u8],
    tables: usize,
    header: &LpHeader,
    extents: &[LpExtent],
    unit: u64,
    super_size: u64,
) -> Result<Vec<LogicalPartition>> {
    let base = tables + header.partitions_offset as usize;
    let psz = header.partition_entry_size as usize;
    let mut out = Vec::new();

    for i in 0..header.num_partitions as usize {
        let off = base + i * psz;
        if off + 52 > buf.len() {
            return Err(EdlError::CorruptMetadata("LP partition table truncated".into()));
        }
        let name_raw = &buf[off..off + 36];
        let name: String = name_raw
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        let first_extent = le32(buf, off + 40) as usize;
        let num_extents = le32(buf, off + 44) as usize;

        if num_extents == 0 {
            out.push(LogicalPartition {
                name,
                offset_bytes: 0,
                size_bytes: 0,
            });
            continue;
        }
        if first_extent + num_extents > extents.len() {
            return Err(EdlError::CorruptMetadata(format!(
                "LP partition {name} references extents past the table"
            )));
        }

        let run = &extents[first_extent..first_extent + num_extents];
        let size_bytes: u64 = run.iter().map(|e| e.num_sectors * LP_SECTOR_SIZE).sum();
        // Locate by the first mapped extent; ZERO extents have no backing
        let offset_bytes = run
            .iter()
            .find(|e| e.target_type == LP_TARGET_TYPE_LINEAR)
            .map(|e| e.target_data * unit)
            .unwrap_or(0);

        let mapped = run.iter().any(|e| e.target_type == LP_TARGET_TYPE_LINEAR);
        let zero_only = run.iter().all(|e| e.target_type == LP_TARGET_TYPE_ZERO);
        if !mapped && !zero_only {
            return Err(EdlError::CorruptMetadata(format!(
                "LP partition {name} has unsupported extent target types"
            )));
        }
        if mapped && super_size > 0 && offset_bytes + size_bytes > super_size {
            return Err(EdlError::CorruptMetadata(format!(
                "LP partition {name} maps past the super partition \
                 ({offset_bytes}+{size_bytes} > {super_size})"
            )));
        }

        out.push(LogicalPartition {
            name,
            offset_bytes,
            size_bytes,
        });
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Craft a minimal super metadata blob: geometry at 0, header at 4096,
    /// tables right after the header.
    pub(crate) fn sample_super(parts: &[(&str, u64, u64)]) -> Vec<u8> {
        let header_size = 128u32;
        let mut buf = vec![0u8; 16384];

        buf[0..4].copy_from_slice(&LP_GEOMETRY_MAGIC.to_le_bytes());
        buf[40..44].copy_from_slice(&65536u32.to_le_bytes()); // metadata_max_size
        buf[44..48].copy_from_slice(&2u32.to_le_bytes()); // slots
        buf[48..52].copy_from_slice(&4096u32.to_le_bytes()); // logical block

        let h = 4096usize;
        buf[h..h + 4].copy_from_slice(&LP_METADATA_HEADER_MAGIC.to_le_bytes());
        buf[h + 4..h + 6].copy_from_slice(&10u16.to_le_bytes()); // major
        buf[h + 8..h + 12].copy_from_slice(&header_size.to_le_bytes());

        let num = parts.len() as u32;
        // partitions at tables+0, extents right after
        buf[h + 80..h + 84].copy_from_slice(&0u32.to_le_bytes());
        buf[h + 84..h + 88].copy_from_slice(&num.to_le_bytes());
        buf[h + 88..h + 92].copy_from_slice(&52u32.to_le_bytes());
        let extents_off = num * 52;
        buf[h + 92..h + 96].copy_from_slice(&extents_off.to_le_bytes());
        buf[h + 96..h + 100].copy_from_slice(&num.to_le_bytes());
        buf[h + 100..h + 104].copy_from_slice(&24u32.to_le_bytes());

        let tables = h + header_size as usize;
        for (i, (name, offset_bytes, size_bytes)) in parts.iter().enumerate() {
            let p = tables + i * 52;
            buf[p..p + name.len()].copy_from_slice(name.as_bytes());
            buf[p + 40..p + 44].copy_from_slice(&(i as u32).to_le_bytes()); // first extent
            buf[p + 44..p + 48].copy_from_slice(&1u32.to_le_bytes()); // one extent

            let e = tables + extents_off as usize + i * 24;
            buf[e..e + 8].copy_from_slice(&(size_bytes / 512).to_le_bytes());
            buf[e + 8..e + 12].copy_from_slice(&LP_TARGET_TYPE_LINEAR.to_le_bytes());
            buf[e + 12..e + 20].copy_from_slice(&(offset_bytes / 512).to_le_bytes());
        }
        buf
    }

    #[test]
    fn geometry_parses() {
        let buf = sample_super(&[]);
        let g = parse_geometry(&buf).unwrap();
        assert_eq!(g.logical_block_size, 4096);
        assert_eq!(g.metadata_slot_count, 2);
    }

    #[test]
    fn flattens_logical_partitions() {
        let buf = sample_super(&[
            ("system_a", 1048576, 4194304),
            ("vendor_a", 8388608, 2097152),
        ]);
        let parts = parse_super(&buf, 64 * 1024 * 1024).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "system_a");
        assert_eq!(parts[0].offset_bytes, 1048576);
        assert_eq!(parts[0].size_bytes, 4194304);
        assert_eq!(parts[1].name, "vendor_a");
        assert_eq!(parts[1].offset_bytes, 8388608);
    }

    #[test]
    fn extent_unit_probe_prefers_512_and_rejects_double_misses() {
        let mut buf = sample_super(&[("system_a", 0, 1048576)]);
        let tables = 4096 + 128;
        let e = tables + 52;
        buf[e + 12..e + 20].copy_from_slice(&2048u64.to_le_bytes());

        // In range under the x512 reading: that pass wins
        let parts = parse_super(&buf, 16 * 1024 * 1024).unwrap();
        assert_eq!(parts[0].offset_bytes, 2048 * 512);

        // Out of range under both units: corrupt
        assert!(parse_super(&buf, 1024).is_err());
    }

    #[test]
    fn zero_extent_partitions_have_no_offset() {
        let mut buf = sample_super(&[("cache", 4096, 8192)]);
        let tables = 4096 + 128;
        let e = tables + 52;
        buf[e + 8..e + 12].copy_from_slice(&LP_TARGET_TYPE_ZERO.to_le_bytes());
        let parts = parse_super(&buf, 16 * 1024 * 1024).unwrap();
        assert_eq!(parts[0].offset_bytes, 0);
        assert_eq!(parts[0].size_bytes, 8192);
    }
}
