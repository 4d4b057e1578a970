// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use anyhow::Result;
use owo_colors::OwoColorize;

use edl::FlashTaskExecutor;
use edl::types::PartitionInfo;

/// A lazily-created byte progress bar, reusable as the `(done, total)`
/// callback every task takes.
pub fn progress_bar() -> impl FnMut(u64, u64) {
    let mut bar: Option<pbr::ProgressBar<std::io::Stdout>> = None;
    move |done, total| {
        let bar = bar.get_or_insert_with(|| {
            let mut b = pbr::ProgressBar::new(total);
            b.set_units(pbr::Units::Bytes);
            b
        });
        bar.set(done);
        if done >= total {
            bar.finish();
        }
    }
}

pub fn print_partition_table(exec: &mut FlashTaskExecutor<'_, '_>) -> Result<()> {
    let parts = exec.partitions()?;
    print_partitions(&parts);
    Ok(())
}

pub fn print_partitions(parts: &[PartitionInfo]) {
    let mut last_lun = None;
    for p in parts {
        if last_lun != Some(p.lun) {
            println!("{} {}", "LUN".bright_yellow(), p.lun.bright_yellow());
            last_lun = Some(p.lun);
        }
        println!(
            "  {:<36} start_sector = {:>10}, {:>12} bytes ({} kiB)",
            p.name.bright_blue(),
            p.start_lba,
            p.byte_len(),
            p.byte_len() / 1024,
        );
    }
}
