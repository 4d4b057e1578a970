// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! The named-task facade a session hands to its caller: partition-level
//! read/write/erase, GPT save/restore, memory dumps and reboot, each
//! reporting progress as `(bytes_done, bytes_total)`.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{EdlError, Result};
use crate::firehose::{FirehoseClient, FirehoseResetMode};
use crate::partitions;
use crate::sparse;
use crate::types::{MemoryName, PartitionInfo, ProgressFn};

pub struct FlashTaskExecutor<'c, 't> {
    fh: &'c mut FirehoseClient<'t>,
    temp_dir: PathBuf,
}

impl<'c, 't> FlashTaskExecutor<'c, 't> {
    pub fn new(fh: &'c mut FirehoseClient<'t>, temp_dir: &Path) -> Self {
        FlashTaskExecutor {
            fh,
            temp_dir: temp_dir.to_owned(),
        }
    }

    pub fn firehose(&mut self) -> &mut FirehoseClient<'t> {
        self.fh
    }

    pub fn sector_size(&self) -> u64 {
        self.fh.cfg.sector_size
    }

    /// LUNs worth scanning for partitions on this storage type.
    fn luns(&self) -> Vec<u8> {
        match self.fh.cfg.memory_name {
            MemoryName::Emmc | MemoryName::Nand => vec![0],
            MemoryName::Ufs => {
                let n = if self.fh.cfg.num_physical > 1 {
                    self.fh.cfg.num_physical
                } else {
                    self.fh.cfg.max_lun
                };
                (0..n.max(1)).collect()
            }
        }
    }

    /// Every partition visible across the scannable LUNs.
    pub fn partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        let mut all = Vec::new();
        for lun in self.luns() {
            match self.load_lun_gpt(lun) {
                Ok(mut parts) => all.append(&mut parts),
                Err(e) => {
                    // LUNs past the populated ones NAK; that's the end of
                    // the scan, not a failure
                    debug!("LUN {lun}: {e}");
                    break;
                }
            }
        }
        Ok(all)
    }

    /// Pull one LUN's GPT through a per-session scratch file and parse it.
    fn load_lun_gpt(&mut self, lun: u8) -> Result<Vec<PartitionInfo>> {
        let scratch = self.temp_dir.join(format!("gpt_lun{lun}.bin"));
        let mut out = File::create(&scratch)?;
        self.fh.backup_gpt(lun, &mut out, false, None)?;
        out.flush()?;
        drop(out);

        let blob = std::fs::read(&scratch)?;
        partitions::from_gpt_blob(&blob, lun)
    }

    fn find_partition(&mut self, name: &str) -> Result<PartitionInfo> {
        for lun in self.luns() {
            let parts = match self.load_lun_gpt(lun) {
                Ok(p) => p,
                Err(e) => {
                    debug!("LUN {lun}: {e}");
                    break;
                }
            };
            if let Some(p) = parts.into_iter().find(|p| p.is_named(name)) {
                return Ok(p);
            }
        }
        Err(EdlError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no partition named {name}"),
        )))
    }

    pub fn read_partition(
        &mut self,
        name: &str,
        out_path: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let part = self.find_partition(name)?;
        debug!(
            "reading {name}: LUN {} LBA {} x{}",
            part.lun, part.start_lba, part.sectors
        );
        let mut out = File::create(out_path)?;
        self.fh.read_storage(
            &mut out,
            &part.start_lba.to_string(),
            part.sectors,
            part.lun,
            progress,
        )
    }

    pub fn write_partition(
        &mut self,
        name: &str,
        image_path: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let part = self.find_partition(name)?;

        // Size check up front; the device-side error for an overrun comes
        // too late to be useful
        let mut file = File::open(image_path)?;
        let payload_len = if sparse::is_sparse_file(&mut file)? {
            sparse::ExpandReader::new(&mut file)?.expanded_len()
        } else {
            file.metadata()?.len()
        };
        if payload_len > part.byte_len() {
            return Err(EdlError::CorruptMetadata(format!(
                "{} is {payload_len} bytes, partition {name} holds {}",
                image_path.display(),
                part.byte_len()
            )));
        }

        self.fh.program_file(
            image_path,
            &part.name,
            &part.start_lba.to_string(),
            part.lun,
            progress,
        )
    }

    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        let part = self.find_partition(name)?;
        self.fh
            .erase(&part.start_lba.to_string(), part.sectors, part.lun)
    }

    pub fn backup_gpt(&mut self, lun: u8, out_path: &Path) -> Result<()> {
        let mut out = File::create(out_path)?;
        self.fh.backup_gpt(lun, &mut out, false, None)
    }

    pub fn restore_gpt(&mut self, lun: u8, in_path: &Path) -> Result<()> {
        let mut src = File::open(in_path)?;
        let len = src.metadata()?.len();
        let expected = self.fh.gpt_sector_count() * self.fh.cfg.sector_size;
        if len != expected {
            warn!("GPT image is {len} bytes, expected {expected}; restoring anyway");
        }
        src.rewind()?;
        self.fh.restore_gpt(lun, &mut src, len, None)
    }

    pub fn dump_memory(
        &mut self,
        base: u64,
        size: u64,
        out_path: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let mut out = File::create(out_path)?;
        self.fh.dump_memory(&mut out, base, size, progress)
    }

    pub fn reboot(&mut self, mode: FirehoseResetMode) -> Result<()> {
        self.fh.power(mode, 0)
    }

    /// Convenience passthrough for callers that stream to their own writer.
    pub fn read_range(
        &mut self,
        out: &mut dyn Write,
        lun: u8,
        start_sector: u64,
        num_sectors: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        self.fh
            .read_storage(out, &start_sector.to_string(), num_sectors, lun, progress)
    }

    /// Stream a raw image to an explicit sector range.
    pub fn write_range(
        &mut self,
        src: &mut dyn Read,
        src_len: u64,
        lun: u8,
        start_sector: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let sectors = src_len.div_ceil(self.fh.cfg.sector_size);
        self.fh.program_storage(
            src,
            src_len,
            "",
            &start_sector.to_string(),
            sectors,
            lun,
            progress,
        )
    }
}
