// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use itertools::Itertools;
use owo_colors::OwoColorize;

use edl::keybrute::{BruteForceOpts, BrutePhase, brute_force};
use edl::ofp::{self, FirmwareKind, OfpArchive, ProfileProbe};
use edl::session::{CancelToken, FlashSession, SessionOptions};
use edl::types::{AuthKind, MemoryName};
use edl::{FirehoseResetMode, FlashTaskExecutor, devicedb, fsdetect, gpt, lp, sparse};

use util::{print_partitions, print_partition_table, progress_bar};

mod flasher;
mod util;

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Dump a single partition by name
    ReadPart {
        #[arg()]
        name: String,

        #[arg(short, default_value = "out.img")]
        out: PathBuf,
    },

    /// Write an image (raw or sparse) to a named partition
    WritePart {
        #[arg()]
        name: String,

        #[arg()]
        image: PathBuf,
    },

    /// Erase a partition
    Erase {
        #[arg()]
        name: String,
    },

    /// Save the primary GPT of a LUN
    BackupGpt {
        #[arg()]
        lun: u8,

        #[arg(short, default_value = "gpt.bin")]
        out: PathBuf,
    },

    /// Write a saved GPT image back to a LUN
    RestoreGpt {
        #[arg()]
        lun: u8,

        #[arg()]
        input: PathBuf,
    },

    /// Dump device memory over peek
    DumpMem {
        #[arg(value_parser=maybe_hex::<u64>)]
        base: u64,

        #[arg(value_parser=maybe_hex::<u64>)]
        size: u64,

        #[arg(short, default_value = "mem.bin")]
        out: PathBuf,
    },

    /// Invoke the flasher on rawprogram/patch XMLs
    Flash {
        #[arg(short, long, num_args = 1..=128, value_name = "FILE")]
        program_file_paths: Vec<PathBuf>,

        #[arg(short = 'x', long, num_args = 0..=128, value_name = "FILE")]
        patch_file_paths: Vec<PathBuf>,

        #[arg(long, default_value = "false")]
        verbose_flasher: bool,
    },

    /// Print the GPT of every scannable LUN
    PrintGpt,

    /// Ask the device to do nothing, hopefully successfully
    Nop,

    /// Restart the device
    Reboot {
        #[arg(default_value = "system", value_name = "edl/off/system")]
        mode: String,
    },

    /// Decrypt/extract an OFP, OZIP, OPS or realme-zip firmware package
    ExtractOfp {
        #[arg()]
        input: PathBuf,

        #[arg(short, default_value = "extracted/")]
        outdir: PathBuf,

        /// Search beyond the key templates when none of them fits
        #[arg(long, default_value = "false")]
        brute_force: bool,

        /// Wall-clock budget for the key search, in seconds
        #[arg(long, default_value = "600")]
        time_limit: u64,
    },

    /// Parse a GPT dump and print the partitions
    ParseGpt {
        #[arg()]
        input: PathBuf,
    },

    /// Parse LP (super) metadata and print the logical partitions
    ParseSuper {
        #[arg()]
        input: PathBuf,
    },

    /// Expand an Android Sparse image to raw
    Unsparse {
        #[arg()]
        input: PathBuf,

        #[arg()]
        output: PathBuf,
    },

    /// Compose an Android Sparse image from a raw one
    SparseMake {
        #[arg()]
        input: PathBuf,

        #[arg()]
        output: PathBuf,

        #[arg(long, default_value = "4096")]
        block_size: u32,
    },

    /// Split a sparse image into flashable parts
    SparseSplit {
        #[arg()]
        input: PathBuf,

        #[arg(short, default_value = ".")]
        outdir: PathBuf,

        #[arg(long, default_value = "4294967296")]
        max_bytes: u64,
    },

    /// Scan an image for build.prop contents
    ScanProps {
        #[arg()]
        input: PathBuf,
    },

    /// Pick the best loader in a directory for a given device identity
    FindLoader {
        #[arg()]
        dir: PathBuf,

        #[arg(value_parser=maybe_hex::<u32>)]
        msm_id: u32,

        #[arg(default_value = "")]
        pk_hash: String,
    },
}

impl Command {
    /// Whether this command talks to a device at all.
    fn needs_port(&self) -> bool {
        !matches!(
            self,
            Command::ExtractOfp { .. }
                | Command::ParseGpt { .. }
                | Command::ParseSuper { .. }
                | Command::Unsparse { .. }
                | Command::SparseMake { .. }
                | Command::SparseSplit { .. }
                | Command::ScanProps { .. }
                | Command::FindLoader { .. }
        )
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, help = "E.g. COM4 on Windows, /dev/ttyUSB0 elsewhere")]
    port: Option<String>,

    #[arg(short, long, value_name = "FILE")]
    loader: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Auto-match a loader in this directory")]
    loader_dir: Option<PathBuf>,

    #[arg(short, long, value_name = "ufs/emmc/nand")]
    storage: Option<String>,

    #[arg(long, default_value = "standard", value_name = "standard/vip/xiaomi/nothing")]
    auth: String,

    #[arg(
        short = 'A',
        long,
        default_value = "false",
        help = "Programmer already running; skip Sahara and auth"
    )]
    skip_loader: bool,

    #[arg(long, value_name = "FILE")]
    digest: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    signature: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Firmware folder holding VIP material")]
    firmware_dir: Option<PathBuf>,

    #[arg(long, default_value = "", help = "Model/project string for vendor auth")]
    model: String,

    #[arg(long, default_value = "", help = "Project id for Nothing devices")]
    project_id: String,

    #[arg(long, default_value = "false", help = "Wait for an ACK between VIP phases")]
    vip_step_acks: bool,

    #[arg(long, default_value = "false", help = "Required for unprovisioned storage media.")]
    skip_storage_init: bool,

    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "warn" }),
    )
    .init();

    println!(
        "{} {}",
        env!("CARGO_PKG_NAME").green(),
        env!("CARGO_PKG_VERSION").yellow()
    );

    if !args.command.needs_port() {
        return run_offline(&args.command);
    }
    run_online(args)
}

fn run_offline(command: &Command) -> Result<()> {
    match command {
        Command::ExtractOfp {
            input,
            outdir,
            brute_force: brute,
            time_limit,
        } => {
            match ofp::identify(input)? {
                FirmwareKind::Ofp { page_size } => {
                    println!("OFP container, page size {page_size}");
                    if ofp::is_mtk_ofp(input)? {
                        println!("{}", "MTK flavor detected".yellow());
                    }
                    let mut archive = match OfpArchive::open(input) {
                        Ok(a) => a,
                        Err(edl::EdlError::UnknownKey) if *brute => {
                            println!("No template fits, searching for a key...");
                            search_ofp_key(input, page_size, *time_limit)?
                        }
                        Err(e) => return Err(e.into()),
                    };
                    println!(
                        "{} entries: {}",
                        archive.entries.len(),
                        archive.entries.iter().map(|e| e.filename.as_str()).format(", ")
                    );
                    let mut bar = progress_bar();
                    let files = archive.extract_all(outdir, Some(&mut bar))?;
                    println!("{} files written to {}", files.len(), outdir.display());
                }
                FirmwareKind::Ozip => {
                    let files = ofp::decrypt_ozip(input, outdir)?;
                    println!("{} files written to {}", files.len(), outdir.display());
                }
                FirmwareKind::PkZip => {
                    let files = ofp::extract_pk_firmware(input, outdir)?;
                    println!("{} files written to {}", files.len(), outdir.display());
                }
                FirmwareKind::Ops => {
                    let files = ofp::decrypt_ops(input, outdir)?;
                    println!("{} files written to {}", files.len(), outdir.display());
                }
            }
            Ok(())
        }
        Command::ParseGpt { input } => {
            let blob = std::fs::read(input)?;
            let table = gpt::Gpt::parse(&blob)?;
            println!(
                "GPT with {}-byte sectors, {} entries:",
                table.sector_size,
                table.entries.len()
            );
            print_partitions(&table.to_partitions(0, edl::PartitionSource::GptFile));
            Ok(())
        }
        Command::ParseSuper { input } => {
            let blob = std::fs::read(input)?;
            let size = blob.len() as u64;
            for part in lp::parse_super(&blob, size)? {
                println!(
                    "{:<36} offset = {:>12}, {:>12} bytes",
                    part.name.bright_blue(),
                    part.offset_bytes,
                    part.size_bytes
                );
            }
            Ok(())
        }
        Command::Unsparse { input, output } => {
            let src = File::open(input)?;
            let mut out = File::create(output)?;
            let n = sparse::expand(src, &mut out)?;
            println!("{n} bytes expanded to {}", output.display());
            Ok(())
        }
        Command::SparseMake {
            input,
            output,
            block_size,
        } => {
            let src = File::open(input)?;
            let mut out = File::create(output)?;
            let hdr = sparse::compose(src, &mut out, *block_size)?;
            println!(
                "{} blocks in {} chunks written to {}",
                hdr.total_blks,
                hdr.total_chunks,
                output.display()
            );
            Ok(())
        }
        Command::SparseSplit {
            input,
            outdir,
            max_bytes,
        } => {
            let parts = sparse::split(input, outdir, *max_bytes)?;
            for p in &parts {
                println!("{}", p.display());
            }
            Ok(())
        }
        Command::ScanProps { input } => {
            let mut file = File::open(input)?;
            let props = if sparse::is_sparse_file(&mut file)? {
                let mut rdr = sparse::ExpandReader::new(file)?;
                fsdetect::scan_build_props(&mut rdr)?
            } else {
                fsdetect::scan_build_props(&mut file)?
            };
            if props.is_empty() {
                println!("No build properties found");
            }
            for (k, v) in props {
                println!("{}={}", k.bright_blue(), v);
            }
            Ok(())
        }
        Command::FindLoader {
            dir,
            msm_id,
            pk_hash,
        } => {
            let chip = devicedb::chip_name(*msm_id).unwrap_or("unknown");
            println!("Chip: {}", chip.bright_blue());
            match devicedb::find_matching_loader(dir, *msm_id, pk_hash) {
                Some(p) => println!("Best match: {}", p.display().green()),
                None => println!("{}", "No plausible loader found".bright_red()),
            }
            Ok(())
        }
        _ => unreachable!("online command routed offline"),
    }
}

fn search_ofp_key(input: &PathBuf, page_size: u64, time_limit: u64) -> Result<OfpArchive> {
    let mut file = File::open(input)?;
    let file_len = file.metadata()?.len();
    let probe = ProfileProbe::read(&mut file, file_len, page_size)?;

    let opts = BruteForceOpts {
        time_limit: Duration::from_secs(time_limit),
        ..Default::default()
    };
    let mut progress = |tries: u64, phase: BrutePhase| {
        println!("  {tries} candidates tried ({phase:?} phase)");
    };
    let mut oracle = |pair: &ofp::AesPair| probe.try_pair(pair).is_some();
    let outcome = brute_force(&mut oracle, &opts, Some(&mut progress));

    println!(
        "Search finished: {} tries in {:?}",
        outcome.tried, outcome.elapsed
    );
    match outcome.found {
        Some(pair) => Ok(OfpArchive::open_with_pair(input, pair)?),
        None => bail!(
            "no key found after {} candidates in {:?}",
            outcome.tried,
            outcome.elapsed
        ),
    }
}

fn run_online(args: Args) -> Result<()> {
    let Some(port) = args.port.clone() else {
        bail!("this command needs a device; specify the port with --port");
    };

    let opts = SessionOptions {
        port,
        loader_path: args.loader.clone(),
        loader_dir: args.loader_dir.clone(),
        auth: AuthKind::from_str(&args.auth)?,
        skip_loader: args.skip_loader,
        digest_path: args.digest.clone(),
        signature_path: args.signature.clone(),
        firmware_dir: args.firmware_dir.clone(),
        preferred_storage: match &args.storage {
            Some(s) => Some(MemoryName::from_str(s)?),
            None => None,
        },
        skip_storage_init: args.skip_storage_init,
        auth_model: args.model.clone(),
        project_id: args.project_id.clone(),
        vip_quirks: edl::VipQuirks {
            ack_between_steps: args.vip_step_acks,
        },
        ..Default::default()
    };

    let cancel = CancelToken::new();
    let session = FlashSession::new(opts);
    let outcome = session.run(&cancel, |exec| run_task(&args.command, exec));

    if let Some(pbl) = &outcome.pbl {
        println!(
            "Chip: {} (msm 0x{:08x}), serial {}, Sahara V{}, {}",
            pbl.chip_name.bright_blue(),
            pbl.msm_id,
            pbl.serial,
            pbl.sahara_version,
            if pbl.is_64bit { "64-bit" } else { "32-bit" }
        );
        if !pbl.pk_hash.is_empty() {
            let head = &pbl.pk_hash[..pbl.pk_hash.len().min(32)];
            println!("OEM PK hash: 0x{head}..");
        }
    }

    match outcome.ok {
        true => {
            println!("{}", "All went well!".green());
            Ok(())
        }
        false => bail!(outcome.reason.unwrap_or_else(|| "unknown failure".into())),
    }
}

fn run_task(command: &Command, exec: &mut FlashTaskExecutor<'_, '_>) -> edl::Result<()> {
    match command {
        Command::ReadPart { name, out } => {
            let mut bar = progress_bar();
            exec.read_partition(name, out, Some(&mut bar))
        }
        Command::WritePart { name, image } => {
            let mut bar = progress_bar();
            exec.write_partition(name, image, Some(&mut bar))
        }
        Command::Erase { name } => exec.erase_partition(name),
        Command::BackupGpt { lun, out } => exec.backup_gpt(*lun, out),
        Command::RestoreGpt { lun, input } => exec.restore_gpt(*lun, input),
        Command::DumpMem { base, size, out } => {
            let mut bar = progress_bar();
            exec.dump_memory(*base, *size, out, Some(&mut bar))
        }
        Command::Flash {
            program_file_paths,
            patch_file_paths,
            verbose_flasher,
        } => flasher::run_flash(exec, program_file_paths, patch_file_paths, *verbose_flasher)
            .map_err(|e| {
                edl::EdlError::Io(std::io::Error::other(e.to_string()))
            }),
        Command::PrintGpt => print_partition_table(exec)
            .map_err(|e| edl::EdlError::Io(std::io::Error::other(e.to_string()))),
        Command::Nop => {
            exec.firehose().nop()?;
            println!("Your nop was {}", "successful".bright_green());
            Ok(())
        }
        Command::Reboot { mode } => {
            let mode = FirehoseResetMode::from_str(mode)?;
            println!("Resetting to {}", mode.to_string().bright_yellow());
            exec.reboot(mode)
        }
        offline => unreachable!("offline command {offline:?} routed online"),
    }
}
