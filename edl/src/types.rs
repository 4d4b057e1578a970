// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Shared data model: partitions, device identity, Firehose configuration.

use std::fmt;
use std::str::FromStr;

use crate::error::EdlError;

/// Where a partition row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSource {
    Device,
    XmlFile,
    GptFile,
    Manual,
}

/// Image format detected for a partition's source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    Raw,
    Sparse,
    #[default]
    Unknown,
}

/// Filesystem detected inside a partition (or its source image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsKind {
    Ext4,
    Erofs,
    F2fs,
    Fat32,
    Ntfs,
    SquashFs,
    None,
    #[default]
    Unknown,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsKind::Ext4 => "ext4",
            FsKind::Erofs => "erofs",
            FsKind::F2fs => "f2fs",
            FsKind::Fat32 => "fat32",
            FsKind::Ntfs => "ntfs",
            FsKind::SquashFs => "squashfs",
            FsKind::None => "none",
            FsKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A contiguous LBA range within a LUN. Never mutated after a loader
/// publishes it.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub lun: u8,
    pub name: String,
    pub start_lba: u64,
    pub sectors: u64,
    pub sector_size: u64,
    pub filename: Option<String>,
    pub image_format: ImageFormat,
    pub fs: FsKind,
    pub source: PartitionSource,
}

impl PartitionInfo {
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sectors - 1
    }

    pub fn byte_len(&self) -> u64 {
        self.sectors * self.sector_size
    }

    /// Partition names compare case-insensitively across all loaders.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// What the PBL told us about itself during the Sahara command phase.
#[derive(Debug, Clone, Default)]
pub struct SaharaPblInfo {
    /// Chip serial, decimal string.
    pub serial: String,
    pub msm_id: u32,
    pub oem_id: u16,
    pub model_id: u16,
    /// Lowercase hex, first 32 bytes of the OEM root-of-trust hash.
    pub pk_hash: String,
    pub chip_name: String,
    pub sahara_version: u32,
    pub is_64bit: bool,
}

/// Storage backend the Firehose programmer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryName {
    #[default]
    Ufs,
    Emmc,
    Nand,
}

impl MemoryName {
    /// The spelling the programmer expects in `<configure MemoryName=…/>`.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryName::Ufs => "UFS",
            MemoryName::Emmc => "eMMC",
            MemoryName::Nand => "nand",
        }
    }

    pub fn default_sector_size(&self) -> u64 {
        match self {
            MemoryName::Ufs => 4096,
            MemoryName::Emmc => 512,
            MemoryName::Nand => 4096,
        }
    }
}

impl fmt::Display for MemoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryName {
    type Err = EdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ufs" => Ok(MemoryName::Ufs),
            "emmc" => Ok(MemoryName::Emmc),
            "nand" => Ok(MemoryName::Nand),
            _ => Err(EdlError::MemoryNotSupported(s.to_owned())),
        }
    }
}

/// Negotiated `<configure>` state. Starts out with host defaults, gets
/// overwritten by whatever the device acks.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    pub target_name: String,
    pub version: String,
    pub memory_name: MemoryName,
    pub sector_size: u64,
    pub max_payload_to_target: usize,
    pub max_payload_from_target: usize,
    pub max_xml_size: usize,
    pub max_lun: u8,
    pub num_physical: u8,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        FirehoseConfig {
            target_name: String::new(),
            version: String::new(),
            memory_name: MemoryName::Ufs,
            sector_size: 4096,
            max_payload_to_target: 1048576,
            max_payload_from_target: 1048576,
            max_xml_size: 4096,
            max_lun: 6,
            num_physical: 1,
        }
    }
}

/// How a device expects to be authenticated before storage access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    Standard,
    OppoVip,
    Xiaomi,
    Nothing,
}

impl FromStr for AuthKind {
    type Err = EdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "none" => Ok(AuthKind::Standard),
            "vip" | "oppo" | "oppovip" => Ok(AuthKind::OppoVip),
            "xiaomi" | "mi" => Ok(AuthKind::Xiaomi),
            "nothing" | "nt" => Ok(AuthKind::Nothing),
            _ => Err(EdlError::UnsupportedStrategy(s.to_owned())),
        }
    }
}

/// Everything the identifier could figure out about a device before the
/// programmer is up.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentifyResult {
    pub chip: String,
    pub vendor: String,
    pub model: String,
    pub loader_hint: String,
    pub storage: MemoryName,
    pub sahara_version: u32,
    pub strategy: AuthKind,
    pub requires_auth: bool,
}

/// Progress callback: `(bytes_done, bytes_total)`. Must be cheap and must not
/// reenter the session that invokes it.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// Reports at most once per `granularity` bytes, plus the final byte.
pub(crate) struct ProgressGate {
    granularity: u64,
    last: u64,
}

impl ProgressGate {
    pub(crate) fn new(granularity: u64) -> Self {
        ProgressGate { granularity, last: 0 }
    }

    pub(crate) fn report(&mut self, cb: &mut Option<ProgressFn<'_>>, done: u64, total: u64) {
        if done == total || done >= self.last + self.granularity {
            self.last = done;
            if let Some(cb) = cb {
                cb(done, total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_compare_ignores_case() {
        let p = PartitionInfo {
            lun: 0,
            name: "Modem".into(),
            start_lba: 6,
            sectors: 64,
            sector_size: 512,
            filename: None,
            image_format: ImageFormat::Unknown,
            fs: FsKind::Unknown,
            source: PartitionSource::Manual,
        };
        assert!(p.is_named("MODEM"));
        assert!(p.is_named("modem"));
        assert!(!p.is_named("modemst1"));
        assert_eq!(p.end_lba(), 69);
    }

    #[test]
    fn progress_gate_holds_back_small_steps() {
        let mut gate = ProgressGate::new(100);
        let mut seen: Vec<(u64, u64)> = vec![];
        let mut cb = |d: u64, t: u64| seen.push((d, t));
        let mut cb: Option<ProgressFn<'_>> = Some(&mut cb);
        for done in (10..=1000).step_by(10) {
            gate.report(&mut cb, done, 1000);
        }
        assert!(seen.len() <= 11);
        assert_eq!(*seen.last().unwrap(), (1000, 1000));
    }
}
