// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use owo_colors::OwoColorize;

use edl::FlashTaskExecutor;
use edl::partitions::{self, from_rawprogram_xml};

use crate::util::progress_bar;

/// Physical partitions holding these labels get marked bootable after a
/// full flash.
const BOOTABLE_PART_NAMES: [&str; 3] = ["xbl", "xbl_a", "sbl1"];

/// Iterates through program/patch files and executes the instructions
/// therein.
pub(crate) fn run_flash(
    exec: &mut FlashTaskExecutor<'_, '_>,
    program_file_paths: &[PathBuf],
    patch_file_paths: &[PathBuf],
    verbose: bool,
) -> Result<()> {
    // Check if the required files are present
    if let Some(missing) = program_file_paths
        .iter()
        .chain(patch_file_paths)
        .find(|f| !f.is_file())
    {
        bail!("{} doesn't exist", missing.display());
    }

    let mut bootable_part_idx: Option<u8> = None;

    for program_file_path in program_file_paths {
        let image_dir = program_file_path
            .parent()
            .map(Path::to_owned)
            .unwrap_or_default();

        let mut parts = from_rawprogram_xml(program_file_path)?;
        partitions::refine_with_images(&mut parts, &image_dir);

        for part in &parts {
            let Some(filename) = &part.filename else {
                if verbose {
                    println!("Skipping bogus entry for {}", part.name);
                }
                continue;
            };
            let image = image_dir.join(filename);
            if !image.exists() {
                if verbose {
                    println!("Skipping non-existent file {}", image.display());
                }
                continue;
            }

            if BOOTABLE_PART_NAMES.contains(&&part.name.to_ascii_lowercase()[..]) {
                bootable_part_idx = Some(part.lun);
            }

            println!(
                "{} {} ({} -> LUN {} @ {})",
                "Flashing".green(),
                part.name.bright_blue(),
                filename,
                part.lun,
                part.start_lba
            );
            let mut bar = progress_bar();
            exec.firehose().program_file(
                &image,
                &part.name,
                &part.start_lba.to_string(),
                part.lun,
                Some(&mut bar),
            )?;
        }
    }

    for patch_file_path in patch_file_paths {
        println!("{} {}", "Patching from".green(), patch_file_path.display());
        let xml = std::fs::read(patch_file_path)?;
        let outcomes = exec.firehose().apply_patch_xml(&xml)?;
        for o in outcomes.iter().filter(|o| !o.ok) {
            println!(
                "{} patch #{} @ {}: {}",
                "failed".bright_red(),
                o.index,
                o.start_sector,
                o.reason.as_deref().unwrap_or("?")
            );
        }
    }

    // Mark the correct LUN (or any other kind of physical partition) as
    // bootable
    if let Some(idx) = bootable_part_idx {
        println!("Setting partition {idx} as bootable!");
        exec.firehose().set_bootable(idx)?;
    }

    Ok(())
}
