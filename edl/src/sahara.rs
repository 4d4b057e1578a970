// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Sahara client: the PBL-level protocol that identifies the chip and
//! uploads the Firehose programmer.
//!
//! Every packet is a little-endian `{command: u32, length: u32}` header plus
//! a fixed payload, shipped through [`bincode`]. The state machine here is
//! deliberately small and synchronous; the device drives the transfer by
//! telling us which loader byte range it wants next.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_repr::Serialize_repr;

use crate::devicedb;
use crate::error::{EdlError, Result, SaharaError};
use crate::transport::Transport;
use crate::types::SaharaPblInfo;

pub const SAHARA_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCommand {
    Hello = 0x01,
    HelloResp = 0x02,
    ReadData = 0x03,
    EndImageTx = 0x04,
    Done = 0x05,
    DoneResp = 0x06,
    Reset = 0x07,
    ResetResp = 0x08,
    MemDebug = 0x09,
    MemRead = 0x0A,
    CmdReady = 0x0B,
    CmdSwitchMode = 0x0C,
    CmdExec = 0x0D,
    CmdExecResp = 0x0E,
    CmdExecData = 0x0F,
    MemDebug64 = 0x10,
    MemRead64 = 0x11,
    ReadData64 = 0x12,
}

impl SaharaCommand {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x01 => Self::Hello,
            0x02 => Self::HelloResp,
            0x03 => Self::ReadData,
            0x04 => Self::EndImageTx,
            0x05 => Self::Done,
            0x06 => Self::DoneResp,
            0x07 => Self::Reset,
            0x08 => Self::ResetResp,
            0x09 => Self::MemDebug,
            0x0A => Self::MemRead,
            0x0B => Self::CmdReady,
            0x0C => Self::CmdSwitchMode,
            0x0D => Self::CmdExec,
            0x0E => Self::CmdExecResp,
            0x0F => Self::CmdExecData,
            0x10 => Self::MemDebug64,
            0x11 => Self::MemRead64,
            0x12 => Self::ReadData64,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr)]
#[repr(u32)]
pub enum SaharaMode {
    ImageTxPending = 0,
    ImageTxComplete = 1,
    MemoryDebug = 2,
    Command = 3,
}

/// Client commands available once the PBL acks command mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    ReadMsmHwId = 0x02,
    ReadOemKeyHash = 0x03,
}

const SAHARA_MAX_PKT: u32 = 0x100000;

#[derive(Serialize)]
struct HelloRespPacket {
    cmd: u32,
    len: u32,
    version: u32,
    version_supported: u32,
    status: u32,
    mode: SaharaMode,
    reserved: [u32; 6],
}

#[derive(Serialize)]
struct BareCmdPacket {
    cmd: u32,
    len: u32,
}

#[derive(Serialize)]
struct OneWordPacket {
    cmd: u32,
    len: u32,
    word: u32,
}

#[derive(Deserialize)]
struct HelloFields {
    version: u32,
    version_supported: u32,
    cmd_packet_length: u32,
    mode: u32,
    _reserved: [u32; 6],
}

#[derive(Deserialize)]
struct ReadDataFields {
    image_id: u32,
    offset: u32,
    length: u32,
}

#[derive(Deserialize)]
struct ReadData64Fields {
    image_id: u64,
    offset: u64,
    length: u64,
}

#[derive(Deserialize)]
struct EndImageTxFields {
    _image_id: u32,
    status: u32,
}

#[derive(Deserialize)]
struct CmdExecRespFields {
    _client_command: u32,
    data_length: u32,
}

fn send<T: Serialize>(chan: &mut dyn Transport, pkt: &T) -> Result<()> {
    let bytes = bincode::serialize(pkt).map_err(|_| SaharaError::BadHeader)?;
    chan.write_all(&bytes)?;
    Ok(())
}

/// Read exactly `buf.len()` bytes, or report a clean timeout (`Ok(false)`)
/// if the deadline passed before the first byte arrived.
fn read_exact_deadline(
    chan: &mut dyn Transport,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = chan.read(&mut buf[filled..])?;
        filled += n;
        if n == 0 && Instant::now() >= deadline {
            if filled == 0 {
                return Ok(false);
            }
            // A torn packet is worse than no packet
            return Err(SaharaError::BadHeader.into());
        }
    }
    Ok(true)
}

/// One Sahara packet off the wire: `(command, payload-after-header)`.
fn read_packet(
    chan: &mut dyn Transport,
    deadline: Instant,
) -> Result<Option<(SaharaCommand, Vec<u8>)>> {
    let mut hdr = [0u8; 8];
    if !read_exact_deadline(chan, &mut hdr, deadline)? {
        return Ok(None);
    }
    let cmd_raw = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
    if len < 8 || len > SAHARA_MAX_PKT {
        return Err(SaharaError::BadHeader.into());
    }
    let cmd = SaharaCommand::from_u32(cmd_raw).ok_or(SaharaError::BadHeader)?;

    let mut payload = vec![0u8; (len - 8) as usize];
    if !payload.is_empty() && !read_exact_deadline(chan, &mut payload, deadline)? {
        return Err(SaharaError::BadHeader.into());
    }
    debug!("sahara <- {cmd:?} ({len} bytes)");
    Ok(Some((cmd, payload)))
}

fn expect_packet(
    chan: &mut dyn Transport,
    deadline: Instant,
) -> Result<(SaharaCommand, Vec<u8>)> {
    read_packet(chan, deadline)?.ok_or_else(|| SaharaError::HelloTimeout.into())
}

/// Answer a HELLO. Public because a host that lost the race for the original
/// HELLO packet (another tool consumed it) can send this upfront to appease
/// the state machine.
pub fn sahara_send_hello_rsp(chan: &mut dyn Transport, mode: SaharaMode) -> Result<()> {
    debug!("sahara -> HelloResp(mode={:?})", mode);
    send(
        chan,
        &HelloRespPacket {
            cmd: SaharaCommand::HelloResp as u32,
            len: 48,
            version: 2,
            version_supported: 1,
            status: 0,
            mode,
            reserved: [0; 6],
        },
    )
}

/// Ask the PBL to reset. Best-effort: some PBLs drop the link before the
/// RESET_RESP makes it out.
pub fn sahara_reset(chan: &mut dyn Transport) -> Result<()> {
    send(
        chan,
        &BareCmdPacket {
            cmd: SaharaCommand::Reset as u32,
            len: 8,
        },
    )?;
    let deadline = Instant::now() + Duration::from_secs(2);
    match read_packet(chan, deadline) {
        Ok(Some((SaharaCommand::ResetResp, _))) | Ok(None) => Ok(()),
        Ok(Some((got, _))) => Err(SaharaError::UnexpectedCommand {
            expected: SaharaCommand::ResetResp as u32,
            got: got as u32,
        }
        .into()),
        Err(e) => Err(e),
    }
}

/// Run one command-mode query: EXEC, wait for EXEC_RESP, request the data
/// with EXEC_DATA, then pull the raw response bytes.
fn sahara_exec(
    chan: &mut dyn Transport,
    cmd: SaharaCmdModeCmd,
    deadline: Instant,
) -> Result<Vec<u8>> {
    send(
        chan,
        &OneWordPacket {
            cmd: SaharaCommand::CmdExec as u32,
            len: 12,
            word: cmd as u32,
        },
    )?;

    let (got, payload) = expect_packet(chan, deadline)?;
    if got != SaharaCommand::CmdExecResp {
        return Err(SaharaError::UnexpectedCommand {
            expected: SaharaCommand::CmdExecResp as u32,
            got: got as u32,
        }
        .into());
    }
    let resp: CmdExecRespFields =
        bincode::deserialize(&payload).map_err(|_| SaharaError::BadHeader)?;
    if resp.data_length == 0 || resp.data_length > SAHARA_MAX_PKT {
        return Err(SaharaError::BadHeader.into());
    }

    send(
        chan,
        &OneWordPacket {
            cmd: SaharaCommand::CmdExecData as u32,
            len: 12,
            word: cmd as u32,
        },
    )?;

    // The response to EXEC_DATA is raw bytes, no Sahara header
    let mut data = vec![0u8; resp.data_length as usize];
    if !read_exact_deadline(chan, &mut data, deadline)? {
        return Err(SaharaError::BadHeader.into());
    }
    Ok(data)
}

fn decode_hw_id(data: &[u8], info: &mut SaharaPblInfo) {
    if data.len() < 8 {
        return;
    }
    // The PBL hands the id out little-endian; the human-readable form (and
    // our database) uses the byte-swapped rendering
    let hwid = u64::from_le_bytes(data[..8].try_into().unwrap());
    info.msm_id = (hwid >> 32) as u32;
    info.oem_id = ((hwid >> 16) & 0xFFFF) as u16;
    info.model_id = (hwid & 0xFFFF) as u16;
    info.chip_name = devicedb::chip_name(info.msm_id)
        .unwrap_or("unknown")
        .to_owned();
}

/// Options for [`sahara_smart_handshake`].
pub struct SaharaHandshake<'a> {
    /// Explicit programmer binary. Wins over any auto-match.
    pub loader: Option<&'a Path>,
    /// Directory to auto-match a programmer in, by chip name and the usual
    /// filename patterns.
    pub loader_dir: Option<&'a Path>,
    pub hello_timeout: Duration,
}

impl Default for SaharaHandshake<'_> {
    fn default() -> Self {
        SaharaHandshake {
            loader: None,
            loader_dir: None,
            hello_timeout: SAHARA_HELLO_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct SaharaOutcome {
    pub info: SaharaPblInfo,
    /// Whether a programmer was actually uploaded (false means the caller
    /// got identification only).
    pub uploaded: bool,
}

enum UploadEntry {
    /// Wait for the device to open the transfer.
    AwaitRequest,
    /// A read request arrived before we got around to the upload loop.
    Pending(SaharaCommand, Vec<u8>),
}

/// The session entry point: wait for HELLO, try command mode for chip
/// identification, then fall back to image transfer and push the loader.
///
/// Known deviations from the happy path that are handled here:
/// - Command mode refused (Sahara V3, signed-only PBLs): the device either
///   re-HELLOs or immediately requests image data. Observed packets are
///   authoritative; silence is never treated as a version signal.
/// - No loader available: returns [`EdlError::RequiresUserAction`] without
///   resetting, so the device stays receptive for a retry with a loader.
/// - The device switching between 32- and 64-bit read requests mid-transfer.
pub fn sahara_smart_handshake(
    chan: &mut dyn Transport,
    opts: &SaharaHandshake<'_>,
) -> Result<SaharaOutcome> {
    let mut info = SaharaPblInfo::default();
    let deadline = Instant::now() + opts.hello_timeout;

    let Some((cmd, payload)) = read_packet(chan, deadline)? else {
        return Err(SaharaError::HelloTimeout.into());
    };
    if cmd != SaharaCommand::Hello {
        return Err(SaharaError::UnexpectedCommand {
            expected: SaharaCommand::Hello as u32,
            got: cmd as u32,
        }
        .into());
    }
    let hello: HelloFields = bincode::deserialize(&payload).map_err(|_| SaharaError::BadHeader)?;
    info.sahara_version = hello.version;
    debug!(
        "HELLO: version {} (supports {}), mode {}, pkt len {}",
        hello.version, hello.version_supported, hello.mode, hello.cmd_packet_length
    );

    // Ask for command mode first; worst case the device refuses and we fall
    // through to a plain image transfer
    sahara_send_hello_rsp(chan, SaharaMode::Command)?;

    let step_deadline = Instant::now() + Duration::from_secs(5);
    let entry = match expect_packet(chan, step_deadline)? {
        (SaharaCommand::CmdReady, _) => {
            info!("device entered Sahara command mode");
            let d = Instant::now() + Duration::from_secs(5);

            if let Ok(sn) = sahara_exec(chan, SaharaCmdModeCmd::ReadSerialNum, d) {
                if sn.len() >= 4 {
                    info.serial =
                        u32::from_le_bytes(sn[..4].try_into().unwrap()).to_string();
                }
            }
            if let Ok(hw) = sahara_exec(chan, SaharaCmdModeCmd::ReadMsmHwId, d) {
                decode_hw_id(&hw, &mut info);
            }
            if let Ok(hash) = sahara_exec(chan, SaharaCmdModeCmd::ReadOemKeyHash, d) {
                let n = std::cmp::min(hash.len(), 32);
                info.pk_hash = hex::encode(&hash[..n]);
            }
            info!(
                "chip {} (msm 0x{:08x}), serial {}, pk hash {}..",
                info.chip_name,
                info.msm_id,
                info.serial,
                &info.pk_hash[..std::cmp::min(8, info.pk_hash.len())]
            );

            // Back to image transfer; the device re-HELLOs after the switch
            send(
                chan,
                &OneWordPacket {
                    cmd: SaharaCommand::CmdSwitchMode as u32,
                    len: 12,
                    word: SaharaMode::ImageTxPending as u32,
                },
            )?;
            let d = Instant::now() + Duration::from_secs(5);
            match expect_packet(chan, d)? {
                (SaharaCommand::Hello, _) => {
                    sahara_send_hello_rsp(chan, SaharaMode::ImageTxPending)?;
                    UploadEntry::AwaitRequest
                }
                (cmd, payload) => UploadEntry::Pending(cmd, payload),
            }
        }
        (SaharaCommand::Hello, _) => {
            // Command mode refused with a fresh handshake. Expected on V3
            // and signed-only parts.
            warn!("command mode refused, proceeding without chip identification");
            sahara_send_hello_rsp(chan, SaharaMode::ImageTxPending)?;
            UploadEntry::AwaitRequest
        }
        (cmd @ (SaharaCommand::ReadData | SaharaCommand::ReadData64), payload) => {
            // The device ignored the mode request and started the transfer
            warn!("command mode refused, device jumped straight to image transfer");
            UploadEntry::Pending(cmd, payload)
        }
        (got, _) => {
            return Err(SaharaError::UnexpectedCommand {
                expected: SaharaCommand::CmdReady as u32,
                got: got as u32,
            }
            .into());
        }
    };

    // Resolve the programmer before answering any read request. No reset on
    // failure: the device must stay receptive so the operator can retry with
    // a loader in hand.
    let loader_path: PathBuf = match opts.loader {
        Some(p) => p.to_owned(),
        None => {
            let matched = opts.loader_dir.and_then(|dir| {
                devicedb::find_matching_loader(dir, info.msm_id, &info.pk_hash)
            });
            match matched {
                Some(p) => {
                    info!("auto-matched loader {}", p.display());
                    p
                }
                None => {
                    return Err(EdlError::RequiresUserAction(format!(
                        "no Firehose programmer found for chip {} (msm 0x{:08x}); \
                         supply one with --loader and run again, the device is still waiting",
                        if info.chip_name.is_empty() { "?" } else { &info.chip_name },
                        info.msm_id
                    )));
                }
            }
        }
    };
    let loader = std::fs::read(&loader_path)?;

    upload_loader(chan, &loader, entry, &mut info)?;
    Ok(SaharaOutcome {
        info,
        uploaded: true,
    })
}

/// Serve ReadData/ReadData64 requests until EndImageTx, then close out with
/// Done/DoneResp. Success is *only* a DoneResp with status 0 (32-bit) or
/// 1 (64-bit); everything else is fatal.
fn upload_loader(
    chan: &mut dyn Transport,
    loader: &[u8],
    entry: UploadEntry,
    info: &mut SaharaPblInfo,
) -> Result<()> {
    let mut pending = match entry {
        UploadEntry::Pending(cmd, payload) => Some((cmd, payload)),
        UploadEntry::AwaitRequest => None,
    };
    let mut sent = 0usize;

    loop {
        let (cmd, payload) = match pending.take() {
            Some(p) => p,
            None => expect_packet(chan, Instant::now() + Duration::from_secs(10))?,
        };

        let (offset, length) = match cmd {
            SaharaCommand::ReadData => {
                let f: ReadDataFields =
                    bincode::deserialize(&payload).map_err(|_| SaharaError::BadHeader)?;
                debug!("ReadData32 image {} off {} len {}", f.image_id, f.offset, f.length);
                (f.offset as u64, f.length as u64)
            }
            SaharaCommand::ReadData64 => {
                let f: ReadData64Fields =
                    bincode::deserialize(&payload).map_err(|_| SaharaError::BadHeader)?;
                debug!("ReadData64 image {} off {} len {}", f.image_id, f.offset, f.length);
                info.is_64bit = true;
                (f.offset, f.length)
            }
            SaharaCommand::EndImageTx => {
                let f: EndImageTxFields =
                    bincode::deserialize(&payload).map_err(|_| SaharaError::BadHeader)?;
                if f.status != 0 {
                    return Err(SaharaError::LoaderRejected(f.status).into());
                }
                send(
                    chan,
                    &BareCmdPacket {
                        cmd: SaharaCommand::Done as u32,
                        len: 8,
                    },
                )?;
                let (cmd, payload) =
                    expect_packet(chan, Instant::now() + Duration::from_secs(10))?;
                if cmd != SaharaCommand::DoneResp {
                    return Err(SaharaError::UnexpectedCommand {
                        expected: SaharaCommand::DoneResp as u32,
                        got: cmd as u32,
                    }
                    .into());
                }
                let status = payload
                    .get(..4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .ok_or(SaharaError::BadHeader)?;
                match status {
                    0 | 1 => {
                        info!("loader accepted, {sent} bytes sent");
                        return Ok(());
                    }
                    s => return Err(SaharaError::LoaderRejected(s).into()),
                }
            }
            got => {
                return Err(SaharaError::UnexpectedCommand {
                    expected: SaharaCommand::ReadData as u32,
                    got: got as u32,
                }
                .into());
            }
        };

        if offset > loader.len() as u64 {
            return Err(SaharaError::BadHeader.into());
        }
        // The PBL rounds the last request up to its block size; pad past EOF
        // with zeroes
        let avail_end = std::cmp::min(loader.len() as u64, offset + length) as usize;
        let mut chunk = loader[offset as usize..avail_end].to_vec();
        chunk.resize(length as usize, 0);
        chan.write_all(&chunk)?;
        sent += chunk.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_sizes_match_the_wire_format() {
        let hello_rsp = HelloRespPacket {
            cmd: 2,
            len: 48,
            version: 2,
            version_supported: 1,
            status: 0,
            mode: SaharaMode::ImageTxPending,
            reserved: [0; 6],
        };
        assert_eq!(bincode::serialize(&hello_rsp).unwrap().len(), 48);

        let done = BareCmdPacket { cmd: 5, len: 8 };
        assert_eq!(bincode::serialize(&done).unwrap().len(), 8);

        let switch = OneWordPacket {
            cmd: 0x0C,
            len: 12,
            word: 0,
        };
        assert_eq!(bincode::serialize(&switch).unwrap().len(), 12);
    }

    #[test]
    fn packets_serialize_little_endian() {
        let pkt = OneWordPacket {
            cmd: 0x0C,
            len: 12,
            word: 3,
        };
        let bytes = bincode::serialize(&pkt).unwrap();
        assert_eq!(bytes, vec![0x0C, 0, 0, 0, 12, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn hw_id_decodes_byte_swapped() {
        let mut info = SaharaPblInfo::default();
        // 0x0009B0E1_0004_71C2 on the wire (little-endian)
        let data = 0x0009B0E1_000471C2u64.to_le_bytes();
        decode_hw_id(&data, &mut info);
        assert_eq!(info.msm_id, 0x0009B0E1);
        assert_eq!(info.oem_id, 0x0004);
        assert_eq!(info.model_id, 0x71C2);
    }
}
