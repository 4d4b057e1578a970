// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! GPT parsing over raw buffers, with 512/4096 sector autodetection.
//!
//! The device side never hands us a block device, only byte blobs pulled
//! over Firehose, so this parser works on `&[u8]` and remembers enough
//! layout to re-emit itself into the same buffer (original CRC fields
//! included; nothing is recomputed on the way out).

use crate::error::{EdlError, Result};
use crate::types::{FsKind, ImageFormat, PartitionInfo, PartitionSource};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// CRC32, reversed polynomial 0xEDB88320. Needed once header rewriting
/// grows beyond patch-in-place.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize];
    }
    !crc
}

static CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB88320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    /// As found on disk; not verified, not recomputed.
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub size_of_partition_entry: u32,
    /// As found on disk; not verified.
    pub entry_array_crc32: u32,
}

#[derive(Debug, Clone)]
pub struct GptEntry {
    /// Slot in the on-disk entry array.
    pub index: u32,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn sectors(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }
}

#[derive(Debug, Clone)]
pub struct Gpt {
    pub sector_size: u64,
    pub header_offset: u64,
    pub header: GptHeader,
    /// Real entries only; all-zero-GUID slots are skipped.
    pub entries: Vec<GptEntry>,
    entry_array_offset: u64,
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

impl Gpt {
    /// Probe for "EFI PART" at offsets 512 and 4096; whichever hits fixes
    /// the sector size for the rest of the parse.
    pub fn parse(buf: &[u8]) -> Result<Gpt> {
        let header_offset = [512u64, 4096]
            .into_iter()
            .find(|&off| {
                buf.len() as u64 >= off + 92 && &buf[off as usize..off as usize + 8] == GPT_SIGNATURE
            })
            .ok_or(EdlError::BadMagic {
                what: "GPT",
                value: 0,
            })?;
        let sector_size = header_offset;
        Self::parse_at(buf, header_offset, sector_size)
    }

    fn parse_at(buf: &[u8], header_offset: u64, sector_size: u64) -> Result<Gpt> {
        let h = header_offset as usize;
        let header = GptHeader {
            revision: le32(buf, h + 8),
            header_size: le32(buf, h + 12),
            header_crc32: le32(buf, h + 16),
            my_lba: le64(buf, h + 24),
            alternate_lba: le64(buf, h + 32),
            first_usable_lba: le64(buf, h + 40),
            last_usable_lba: le64(buf, h + 48),
            disk_guid: buf[h + 56..h + 72].try_into().unwrap(),
            partition_entry_lba: le64(buf, h + 72),
            num_partition_entries: le32(buf, h + 80),
            size_of_partition_entry: le32(buf, h + 84),
            entry_array_crc32: le32(buf, h + 88),
        };

        let entry_size = header.size_of_partition_entry as u64;
        if entry_size < 128 || entry_size > 4096 {
            return Err(EdlError::CorruptMetadata(format!(
                "GPT entry size {entry_size}"
            )));
        }

        // Entry array position per the header; buffers that only carry the
        // header plus array (our Firehose backups) keep it right after the
        // header sector
        let mut entry_array_offset = header.partition_entry_lba * sector_size;
        if entry_array_offset >= buf.len() as u64 {
            entry_array_offset = header_offset + sector_size;
        }

        let mut entries = Vec::new();
        for i in 0..header.num_partition_entries as u64 {
            let off = entry_array_offset + i * entry_size;
            let end = off + 128;
            if end > buf.len() as u64 {
                break;
            }
            let e = &buf[off as usize..end as usize];
            if e[..32].iter().all(|&b| b == 0) {
                continue;
            }

            let mut name = String::new();
            for pair in e[56..128].chunks_exact(2) {
                let c = u16::from_le_bytes(pair.try_into().unwrap());
                if c == 0 {
                    break;
                }
                name.push(char::from_u32(c as u32).unwrap_or('\u{FFFD}'));
            }

            entries.push(GptEntry {
                index: i as u32,
                type_guid: e[0..16].try_into().unwrap(),
                unique_guid: e[16..32].try_into().unwrap(),
                first_lba: le64(e, 32),
                last_lba: le64(e, 40),
                attributes: le64(e, 48),
                name,
            });
        }

        Ok(Gpt {
            sector_size,
            header_offset,
            header,
            entries,
            entry_array_offset,
        })
    }

    /// Patch this table back into `buf` at the offsets it was parsed from,
    /// keeping the original CRC fields. A parse → emit round trip over an
    /// untouched buffer is byte-identical.
    pub fn emit_into(&self, buf: &mut [u8]) -> Result<()> {
        let h = self.header_offset as usize;
        if buf.len() < h + 92 {
            return Err(EdlError::CorruptMetadata("buffer too small for GPT header".into()));
        }

        buf[h..h + 8].copy_from_slice(GPT_SIGNATURE);
        buf[h + 8..h + 12].copy_from_slice(&self.header.revision.to_le_bytes());
        buf[h + 12..h + 16].copy_from_slice(&self.header.header_size.to_le_bytes());
        buf[h + 16..h + 20].copy_from_slice(&self.header.header_crc32.to_le_bytes());
        buf[h + 20..h + 24].copy_from_slice(&0u32.to_le_bytes());
        buf[h + 24..h + 32].copy_from_slice(&self.header.my_lba.to_le_bytes());
        buf[h + 32..h + 40].copy_from_slice(&self.header.alternate_lba.to_le_bytes());
        buf[h + 40..h + 48].copy_from_slice(&self.header.first_usable_lba.to_le_bytes());
        buf[h + 48..h + 56].copy_from_slice(&self.header.last_usable_lba.to_le_bytes());
        buf[h + 56..h + 72].copy_from_slice(&self.header.disk_guid);
        buf[h + 72..h + 80].copy_from_slice(&self.header.partition_entry_lba.to_le_bytes());
        buf[h + 80..h + 84].copy_from_slice(&self.header.num_partition_entries.to_le_bytes());
        buf[h + 84..h + 88].copy_from_slice(&self.header.size_of_partition_entry.to_le_bytes());
        buf[h + 88..h + 92].copy_from_slice(&self.header.entry_array_crc32.to_le_bytes());

        let entry_size = self.header.size_of_partition_entry as u64;
        for e in &self.entries {
            let off = (self.entry_array_offset + e.index as u64 * entry_size) as usize;
            if off + 128 > buf.len() {
                return Err(EdlError::CorruptMetadata("buffer too small for GPT entries".into()));
            }
            let slot = &mut buf[off..off + 128];
            slot[0..16].copy_from_slice(&e.type_guid);
            slot[16..32].copy_from_slice(&e.unique_guid);
            slot[32..40].copy_from_slice(&e.first_lba.to_le_bytes());
            slot[40..48].copy_from_slice(&e.last_lba.to_le_bytes());
            slot[48..56].copy_from_slice(&e.attributes.to_le_bytes());
            slot[56..128].fill(0);
            for (i, c) in e.name.encode_utf16().take(36).enumerate() {
                slot[56 + i * 2..56 + i * 2 + 2].copy_from_slice(&c.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&GptEntry> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Flatten into the shared partition model.
    pub fn to_partitions(&self, lun: u8, source: PartitionSource) -> Vec<PartitionInfo> {
        self.entries
            .iter()
            .map(|e| PartitionInfo {
                lun,
                name: e.name.clone(),
                start_lba: e.first_lba,
                sectors: e.sectors(),
                sector_size: self.sector_size,
                filename: None,
                image_format: ImageFormat::Unknown,
                fs: FsKind::Unknown,
                source,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal valid GPT blob: protective-MBR-sized gap, header at
    /// one sector, entries right after.
    pub(crate) fn sample_gpt(sector_size: usize, parts: &[(&str, u64, u64)]) -> Vec<u8> {
        let mut buf = vec![0u8; sector_size * 2 + 128 * 128];
        let h = sector_size;
        buf[h..h + 8].copy_from_slice(GPT_SIGNATURE);
        buf[h + 8..h + 12].copy_from_slice(&0x0001_0000u32.to_le_bytes()); // rev 1.0
        buf[h + 12..h + 16].copy_from_slice(&92u32.to_le_bytes());
        buf[h + 16..h + 20].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        buf[h + 24..h + 32].copy_from_slice(&1u64.to_le_bytes()); // MyLBA
        buf[h + 32..h + 40].copy_from_slice(&999u64.to_le_bytes());
        buf[h + 40..h + 48].copy_from_slice(&6u64.to_le_bytes());
        buf[h + 48..h + 56].copy_from_slice(&990u64.to_le_bytes());
        buf[h + 56] = 0x42; // disk guid, first byte
        buf[h + 72..h + 80].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
        buf[h + 80..h + 84].copy_from_slice(&128u32.to_le_bytes());
        buf[h + 84..h + 88].copy_from_slice(&128u32.to_le_bytes());
        buf[h + 88..h + 92].copy_from_slice(&0xFEED_F00Du32.to_le_bytes());

        let base = sector_size * 2;
        for (i, (name, first, last)) in parts.iter().enumerate() {
            let off = base + i * 128;
            buf[off] = 0xA5; // nonzero type guid
            buf[off + 16] = 0x5A; // nonzero unique guid
            buf[off + 32..off + 40].copy_from_slice(&first.to_le_bytes());
            buf[off + 40..off + 48].copy_from_slice(&last.to_le_bytes());
            for (j, c) in name.encode_utf16().enumerate() {
                buf[off + 56 + j * 2..off + 58 + j * 2].copy_from_slice(&c.to_le_bytes());
            }
        }
        buf
    }

    #[test]
    fn parses_512_byte_layout() {
        let buf = sample_gpt(512, &[("modem", 6, 69)]);
        let gpt = Gpt::parse(&buf).unwrap();
        assert_eq!(gpt.sector_size, 512);
        assert_eq!(gpt.entries.len(), 1);
        let parts = gpt.to_partitions(0, PartitionSource::GptFile);
        assert_eq!(parts[0].name, "modem");
        assert_eq!(parts[0].start_lba, 6);
        assert_eq!(parts[0].sectors, 64);
        assert_eq!(parts[0].sector_size, 512);
    }

    #[test]
    fn parses_4096_byte_layout() {
        let buf = sample_gpt(4096, &[("modem", 6, 69)]);
        let gpt = Gpt::parse(&buf).unwrap();
        assert_eq!(gpt.sector_size, 4096);
        let parts = gpt.to_partitions(0, PartitionSource::GptFile);
        assert_eq!(parts[0].sector_size, 4096);
        assert_eq!(parts[0].end_lba(), parts[0].start_lba + parts[0].sectors - 1);
        assert_eq!(parts[0].end_lba(), 69);
    }

    #[test]
    fn reemit_with_original_crcs_is_byte_identical() {
        let buf = sample_gpt(512, &[("modem", 6, 69), ("fsg", 70, 133)]);
        let gpt = Gpt::parse(&buf).unwrap();
        assert_eq!(gpt.header.header_crc32, 0xDEAD_BEEF);
        assert_eq!(gpt.header.entry_array_crc32, 0xFEED_F00D);

        let mut copy = buf.clone();
        gpt.emit_into(&mut copy).unwrap();
        assert_eq!(copy, buf);
    }

    #[test]
    fn zero_guid_slots_are_skipped() {
        let buf = sample_gpt(512, &[("a", 6, 7)]);
        let gpt = Gpt::parse(&buf).unwrap();
        // 128 slots exist, 1 is real
        assert_eq!(gpt.entries.len(), 1);
        assert_eq!(gpt.entries[0].index, 0);
    }

    #[test]
    fn crc32_matches_the_reference_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn find_is_case_insensitive() {
        let buf = sample_gpt(512, &[("Modem", 6, 69)]);
        let gpt = Gpt::parse(&buf).unwrap();
        assert!(gpt.find("MODEM").is_some());
        assert!(gpt.find("boot").is_none());
    }
}
