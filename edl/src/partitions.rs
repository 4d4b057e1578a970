// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Partition manager: one shared partition model fed from three loaders
//! (rawprogram XML, GPT blobs, the live device) and refined with image
//! format / filesystem detection.

use std::io::Read;
use std::path::Path;

use log::{debug, warn};
use xmltree::{Element, XMLNode};

use crate::error::{EdlError, Result};
use crate::firehose::FirehoseClient;
use crate::fsdetect;
use crate::gpt::Gpt;
use crate::sparse;
use crate::types::{FsKind, ImageFormat, PartitionInfo, PartitionSource};

/// Infer the LUN from a rawprogram file name's digit suffix
/// (`rawprogram0.xml` → 0). Works for `rawprogram_unsparse3.xml` too.
pub fn lun_from_filename(path: &Path) -> Option<u8> {
    let stem = path.file_stem()?.to_string_lossy();
    let digits: String = stem
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

/// Load `<program>` rows from a rawprogram XML. Entries without a numeric
/// start sector (backup-GPT forms) or with zero length are skipped; they
/// carry no flashable range.
pub fn from_rawprogram_xml(path: &Path) -> Result<Vec<PartitionInfo>> {
    let bytes = std::fs::read(path)?;
    let root = Element::parse(&bytes[..]).map_err(|e| EdlError::XmlParse(e.to_string()))?;
    let file_lun = lun_from_filename(path);

    let mut parts = Vec::new();
    for node in &root.children {
        let XMLNode::Element(e) = node else { continue };
        if e.name.to_ascii_lowercase() != "program" {
            continue;
        }
        let get = |k: &str| e.attributes.get(k).map(String::as_str).unwrap_or_default();

        let name = get("label").to_owned();
        let Ok(start_lba) = get("start_sector").parse::<u64>() else {
            debug!("skipping {name}: non-numeric start sector");
            continue;
        };
        let sectors: u64 = get("num_partition_sectors").parse().unwrap_or(0);
        if sectors == 0 {
            continue;
        }
        let sector_size: u64 = get("SECTOR_SIZE_IN_BYTES").parse().unwrap_or(512);
        if sector_size != 512 && sector_size != 4096 {
            return Err(EdlError::CorruptMetadata(format!(
                "rawprogram sector size {sector_size}"
            )));
        }
        let lun = e
            .attributes
            .get("physical_partition_number")
            .and_then(|v| v.parse::<u8>().ok())
            .or(file_lun)
            .unwrap_or(0);

        let filename = match get("filename") {
            "" => None,
            f => Some(f.to_owned()),
        };
        let image_format = if get("sparse") == "true" {
            ImageFormat::Sparse
        } else {
            ImageFormat::Unknown
        };

        parts.push(PartitionInfo {
            lun,
            name,
            start_lba,
            sectors,
            sector_size,
            filename,
            image_format,
            fs: FsKind::Unknown,
            source: PartitionSource::XmlFile,
        });
    }
    Ok(parts)
}

/// Load partitions from a GPT blob (a Firehose GPT backup or a plain dump).
pub fn from_gpt_blob(buf: &[u8], lun: u8) -> Result<Vec<PartitionInfo>> {
    Ok(Gpt::parse(buf)?.to_partitions(lun, PartitionSource::GptFile))
}

/// Read the live GPT of one LUN off the device and load it.
pub fn from_device(fh: &mut FirehoseClient<'_>, lun: u8) -> Result<Vec<PartitionInfo>> {
    let mut blob = Vec::new();
    fh.backup_gpt(lun, &mut blob, false, None)?;
    let mut parts = Gpt::parse(&blob)?.to_partitions(lun, PartitionSource::Device);
    // The wire already told us the real sector size; trust it over the probe
    for p in &mut parts {
        p.sector_size = fh.cfg.sector_size;
    }
    Ok(parts)
}

/// Join partition rows with what their source images actually contain.
/// Opens each named image under `image_dir` and fills in the detected
/// format and filesystem; sparse images are probed through a streaming
/// expansion of their head.
pub fn refine_with_images(parts: &mut [PartitionInfo], image_dir: &Path) {
    for p in parts.iter_mut() {
        let Some(name) = &p.filename else { continue };
        let path = image_dir.join(name);
        let Ok(mut file) = std::fs::File::open(&path) else {
            continue;
        };

        let mut head = vec![0u8; 8192];
        let n = read_some(&mut file, &mut head);
        head.truncate(n);

        p.image_format = match fsdetect::detect_image_format(&head) {
            ImageFormat::Sparse => ImageFormat::Sparse,
            other if p.image_format == ImageFormat::Unknown => other,
            _ => p.image_format,
        };

        if p.image_format == ImageFormat::Sparse {
            // Identify the filesystem from the expanded head, not the
            // container
            let Ok(file) = std::fs::File::open(&path) else {
                continue;
            };
            match sparse::ExpandReader::new(file) {
                Ok(mut rdr) => {
                    let mut raw_head = vec![0u8; 8192];
                    let n = read_some(&mut rdr, &mut raw_head);
                    raw_head.truncate(n);
                    p.fs = fsdetect::detect_fs(&raw_head);
                }
                Err(e) => warn!("{}: sparse probe failed: {e}", path.display()),
            }
        } else {
            p.fs = fsdetect::detect_fs(&head);
        }
    }
}

fn read_some(src: &mut dyn Read, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}

/// The joined view over every loader.
#[derive(Debug, Default)]
pub struct PartitionTable {
    parts: Vec<PartitionInfo>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add rows, dropping duplicates of (lun, name) already present.
    pub fn ingest(&mut self, rows: Vec<PartitionInfo>) {
        for row in rows {
            let dup = self
                .parts
                .iter()
                .any(|p| p.lun == row.lun && p.is_named(&row.name));
            if !dup {
                self.parts.push(row);
            }
        }
    }

    pub fn parts(&self) -> &[PartitionInfo] {
        &self.parts
    }

    pub fn find(&self, name: &str) -> Option<&PartitionInfo> {
        self.parts.iter().find(|p| p.is_named(name))
    }

    pub fn find_on_lun(&self, name: &str, lun: u8) -> Option<&PartitionInfo> {
        self.parts.iter().find(|p| p.lun == lun && p.is_named(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::tests::sample_gpt;

    #[test]
    fn lun_suffix_parses() {
        assert_eq!(lun_from_filename(Path::new("rawprogram0.xml")), Some(0));
        assert_eq!(lun_from_filename(Path::new("rawprogram5.xml")), Some(5));
        assert_eq!(
            lun_from_filename(Path::new("rawprogram_unsparse4.xml")),
            Some(4)
        );
        assert_eq!(lun_from_filename(Path::new("rawprogram.xml")), None);
    }

    #[test]
    fn rawprogram_rows_load_with_inferred_lun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rawprogram2.xml");
        std::fs::write(
            &path,
            br#"<?xml version="1.0"?>
<data>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="modem.img" label="modem"
           num_partition_sectors="64" start_sector="6" sparse="false"/>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="" label="backupgpt"
           num_partition_sectors="5" start_sector="NUM_DISK_SECTORS-5."/>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="super.img" label="super"
           num_partition_sectors="1024" start_sector="100"
           physical_partition_number="0" sparse="true"/>
</data>"#,
        )
        .unwrap();

        let parts = from_rawprogram_xml(&path).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "modem");
        assert_eq!(parts[0].lun, 2, "LUN comes from the filename suffix");
        assert_eq!(parts[0].start_lba, 6);
        assert_eq!(parts[0].sectors, 64);
        assert_eq!(parts[1].lun, 0, "explicit attribute beats the suffix");
        assert_eq!(parts[1].image_format, ImageFormat::Sparse);
    }

    #[test]
    fn xml_and_gpt_loaders_agree_on_tuples() {
        // Same partition described by both loaders
        let gpt_buf = sample_gpt(512, &[("modem", 6, 69)]);
        let from_gpt = from_gpt_blob(&gpt_buf, 0).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rawprogram0.xml");
        std::fs::write(
            &path,
            br#"<data><program SECTOR_SIZE_IN_BYTES="512" filename="modem.img" label="modem"
                num_partition_sectors="64" start_sector="6"/></data>"#,
        )
        .unwrap();
        let from_xml = from_rawprogram_xml(&path).unwrap();

        assert_eq!(from_gpt[0].lun, from_xml[0].lun);
        assert!(from_gpt[0].is_named(&from_xml[0].name));
        assert_eq!(from_gpt[0].start_lba, from_xml[0].start_lba);
        assert_eq!(from_gpt[0].sectors, from_xml[0].sectors);
        assert_eq!(from_gpt[0].sector_size, from_xml[0].sector_size);
    }

    #[test]
    fn table_dedups_case_insensitively_per_lun() {
        let gpt_buf = sample_gpt(512, &[("modem", 6, 69)]);
        let mut table = PartitionTable::new();
        table.ingest(from_gpt_blob(&gpt_buf, 0).unwrap());

        let gpt_buf2 = sample_gpt(512, &[("MODEM", 6, 69), ("fsg", 70, 99)]);
        table.ingest(from_gpt_blob(&gpt_buf2, 0).unwrap());
        assert_eq!(table.parts().len(), 2);
        assert!(table.find("FSG").is_some());
        assert!(table.find_on_lun("modem", 1).is_none());
    }
}
