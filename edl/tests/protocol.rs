// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Protocol-level scenarios over a scripted transport: no hardware, every
//! byte the "device" sends is canned, every byte the host sends is
//! captured and inspected.

use std::time::Duration;

use edl::session::{CancelToken, FlashSession, SessionOptions};
use edl::types::MemoryName;
use edl::{
    EdlError, FirehoseClient, FirehoseConfig, SaharaHandshake, ScriptedTransport, Transport,
    sahara_smart_handshake,
};

// --- wire helpers --------------------------------------------------------

fn sahara_pkt(cmd: u32, words: &[u32]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&cmd.to_le_bytes());
    pkt.extend_from_slice(&((8 + words.len() * 4) as u32).to_le_bytes());
    for w in words {
        pkt.extend_from_slice(&w.to_le_bytes());
    }
    pkt
}

fn hello_pkt(version: u32) -> Vec<u8> {
    sahara_pkt(0x01, &[version, 1, 48, 0, 0, 0, 0, 0, 0, 0])
}

fn xml_doc(body: &str) -> Vec<u8> {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?><data>{body}</data>").into_bytes()
}

fn ack() -> Vec<u8> {
    xml_doc(r#"<response value="ACK"/>"#)
}

fn nak_with_log(log: &str) -> Vec<u8> {
    xml_doc(&format!(
        r#"<log value="{log}"/><response value="NAK"/>"#
    ))
}

fn default_client(chan: &mut ScriptedTransport) -> FirehoseClient<'_> {
    chan.set_read_timeout(Duration::from_millis(5)).unwrap();
    FirehoseClient::new(chan, FirehoseConfig::default())
}

// --- Sahara --------------------------------------------------------------

#[test]
fn sahara_32bit_loader_upload() {
    let dir = tempfile::tempdir().unwrap();
    let loader_path = dir.path().join("prog_firehose_ddr.mbn");
    let loader: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&loader_path, &loader).unwrap();

    let mut chan = ScriptedTransport::new();
    chan.push_read(&hello_pkt(2));
    // Command mode refused: the device re-HELLOs instead of CMD_READY
    chan.push_read(&hello_pkt(2));
    // 32-bit transfer: the whole image in one request
    chan.push_read(&sahara_pkt(0x03, &[0x0D, 0, 4096]));
    chan.push_read(&sahara_pkt(0x04, &[0x0D, 0])); // EndImageTx, success
    chan.push_read(&sahara_pkt(0x06, &[0])); // DoneResp, Success32

    let outcome = sahara_smart_handshake(
        &mut chan,
        &SaharaHandshake {
            loader: Some(&loader_path),
            loader_dir: None,
            hello_timeout: Duration::from_secs(1),
        },
    )
    .unwrap();

    assert!(outcome.uploaded);
    assert!(!outcome.info.is_64bit);
    assert_eq!(outcome.info.sahara_version, 2);

    let written = chan.written();
    // HelloResp(Command), HelloResp(ImageTxPending), 4096 loader bytes, Done
    assert_eq!(written.len(), 48 + 48 + 4096 + 8);
    assert_eq!(written[0], 0x02);
    assert_eq!(u32::from_le_bytes(written[20..24].try_into().unwrap()), 3); // mode Command
    assert_eq!(written[48], 0x02);
    assert_eq!(u32::from_le_bytes(written[68..72].try_into().unwrap()), 0); // mode ImageTxPending
    assert_eq!(&written[96..96 + 4096], &loader[..]);
    assert_eq!(written[96 + 4096], 0x05); // Done
}

#[test]
fn sahara_command_mode_queries_then_64bit_upload() {
    let dir = tempfile::tempdir().unwrap();
    let loader_path = dir.path().join("loader.mbn");
    std::fs::write(&loader_path, vec![0xA5u8; 1024]).unwrap();

    let mut chan = ScriptedTransport::new();
    chan.push_read(&hello_pkt(2));
    chan.push_read(&sahara_pkt(0x0B, &[])); // CmdReady
    // Serial number
    chan.push_read(&sahara_pkt(0x0E, &[0x01, 4]));
    chan.push_read(&0x00C0FFEEu32.to_le_bytes());
    // MSM hardware id
    chan.push_read(&sahara_pkt(0x0E, &[0x02, 8]));
    chan.push_read(&0x0008F0E1_0001_71C2u64.to_le_bytes());
    // OEM PK hash
    chan.push_read(&sahara_pkt(0x0E, &[0x03, 32]));
    chan.push_read(&[0xCC; 32]);
    // Mode switch acknowledged with a fresh HELLO
    chan.push_read(&hello_pkt(2));
    // 64-bit transfer in two requests
    chan.push_read(&sahara_pkt(0x12, &[0x0D, 0, 0, 0, 1024, 0]));
    chan.push_read(&sahara_pkt(0x04, &[0x0D, 0]));
    chan.push_read(&sahara_pkt(0x06, &[1])); // Success64

    let outcome = sahara_smart_handshake(
        &mut chan,
        &SaharaHandshake {
            loader: Some(&loader_path),
            loader_dir: None,
            hello_timeout: Duration::from_secs(1),
        },
    )
    .unwrap();

    let info = &outcome.info;
    assert_eq!(info.serial, u32::to_string(&0x00C0FFEE));
    assert_eq!(info.msm_id, 0x0008F0E1);
    assert_eq!(info.chip_name, "SDM845");
    assert_eq!(info.oem_id, 0x0001);
    assert_eq!(info.model_id, 0x71C2);
    assert_eq!(info.pk_hash, "cc".repeat(32));
    assert!(info.is_64bit);
}

#[test]
fn sahara_without_loader_leaves_the_device_receptive() {
    let mut chan = ScriptedTransport::new();
    chan.push_read(&hello_pkt(2));
    chan.push_read(&hello_pkt(2));

    let err = sahara_smart_handshake(
        &mut chan,
        &SaharaHandshake {
            loader: None,
            loader_dir: None,
            hello_timeout: Duration::from_secs(1),
        },
    )
    .unwrap_err();

    assert!(matches!(err, EdlError::RequiresUserAction(_)));
    // Two HelloResps went out, and crucially no Reset (0x07)
    let written = chan.written();
    assert_eq!(written.len(), 96);
    assert!(!written.chunks(8).any(|c| c[0] == 0x07));
}

#[test]
fn sahara_reset_waits_for_the_response() {
    let mut chan = ScriptedTransport::new();
    chan.set_read_timeout(Duration::from_millis(5)).unwrap();
    chan.push_read(&sahara_pkt(0x08, &[])); // ResetResp

    edl::sahara::sahara_reset(&mut chan).unwrap();
    assert_eq!(chan.written(), &sahara_pkt(0x07, &[])[..]);
}

#[test]
fn sahara_bad_done_status_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let loader_path = dir.path().join("loader.mbn");
    std::fs::write(&loader_path, vec![0u8; 64]).unwrap();

    let mut chan = ScriptedTransport::new();
    chan.push_read(&hello_pkt(2));
    chan.push_read(&hello_pkt(2));
    chan.push_read(&sahara_pkt(0x03, &[0x0D, 0, 64]));
    chan.push_read(&sahara_pkt(0x04, &[0x0D, 0]));
    chan.push_read(&sahara_pkt(0x06, &[0x23])); // neither Success32 nor Success64

    let err = sahara_smart_handshake(
        &mut chan,
        &SaharaHandshake {
            loader: Some(&loader_path),
            loader_dir: None,
            hello_timeout: Duration::from_secs(1),
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        EdlError::Sahara(edl::SaharaError::LoaderRejected(0x23))
    ));
}

// --- Firehose configure --------------------------------------------------

#[test]
fn configure_ladder_falls_back_to_emmc() {
    let mut chan = ScriptedTransport::new();
    chan.push_read(&nak_with_log("ERROR: Not support configure MemoryName UFS"));
    chan.push_read(&xml_doc(
        r#"<response value="ACK" MemoryName="eMMC" SectorSizeInBytes="512"
           MaxPayloadSizeToTargetInBytes="1048576"
           MaxPayloadSizeToTargetInBytesSupported="1048576"
           MaxXMLSizeInBytes="4096" TargetName="8953" Version="1"/>"#,
    ));

    let mut fh = default_client(&mut chan);
    fh.configure(false).unwrap();

    assert_eq!(fh.cfg.memory_name, MemoryName::Emmc);
    assert_eq!(fh.cfg.sector_size, 512);
    assert_eq!(fh.cfg.target_name, "8953");

    let sent = String::from_utf8(chan.take_written()).unwrap();
    let first = sent.find("MemoryName=\"UFS\"").unwrap();
    let second = sent.find("MemoryName=\"eMMC\"").unwrap();
    assert!(first < second);
}

#[test]
fn configure_ladder_terminates_within_four_rounds() {
    let mut chan = ScriptedTransport::new();
    for _ in 0..6 {
        chan.push_read(&nak_with_log("ERROR: sector size mismatch"));
    }

    let mut fh = default_client(&mut chan);
    let err = fh.configure(false).unwrap_err();
    assert!(matches!(err, EdlError::MemoryNotSupported(_)));

    // Four <configure> packets, not six
    let sent = String::from_utf8(chan.take_written()).unwrap();
    assert_eq!(sent.matches("<configure").count(), 4);
}

#[test]
fn configure_auth_wall_surfaces_as_needs_auth() {
    let mut chan = ScriptedTransport::new();
    chan.push_read(&nak_with_log(
        "ERROR: Only nop and sig tag can be received before authentication",
    ));

    let mut fh = default_client(&mut chan);
    assert!(matches!(fh.configure(false), Err(EdlError::NeedsAuth)));
}

// --- Firehose read -------------------------------------------------------

#[test]
fn rawmode_read_pulls_payload_between_acks() {
    let mut chan = ScriptedTransport::new();
    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 7) as u8).collect();

    // The first payload bytes arrive glued to the rawmode ACK
    let mut first = xml_doc(r#"<response value="ACK" rawmode="true"/>"#);
    first.extend_from_slice(&payload[..100]);
    chan.push_read(&first);
    chan.push_read(&payload[100..]);
    chan.push_read(&ack());

    let mut fh = default_client(&mut chan);
    fh.cfg.sector_size = 512;

    let mut out = Vec::new();
    fh.read_storage(&mut out, "6", 4, 0, None).unwrap();
    assert_eq!(out, payload);

    let sent = String::from_utf8(chan.take_written()).unwrap();
    assert!(sent.contains("<read"));
    assert!(sent.contains("start_sector=\"6\""));
    assert!(sent.contains("num_partition_sectors=\"4\""));
}

#[test]
fn read_without_rawmode_is_an_error() {
    let mut chan = ScriptedTransport::new();
    chan.push_read(&ack());

    let mut fh = default_client(&mut chan);
    fh.cfg.sector_size = 512;
    let mut out = Vec::new();
    let err = fh.read_storage(&mut out, "0", 1, 0, None).unwrap_err();
    assert!(matches!(err, EdlError::RawmodeMissing));
}

#[test]
fn program_streams_and_pads_to_the_sector_boundary() {
    let mut chan = ScriptedTransport::new();
    chan.push_read(&xml_doc(r#"<response value="ACK" rawmode="true"/>"#));
    chan.push_read(&ack());

    let mut fh = default_client(&mut chan);
    fh.cfg.sector_size = 512;

    // 700 bytes of payload into 2 sectors: 324 bytes of zero padding
    let src = vec![0xABu8; 700];
    fh.program_storage(&mut &src[..], 700, "modem", "10", 2, 0, None)
        .unwrap();

    let written = chan.take_written();
    let tag_end = written
        .windows(7)
        .position(|w| w == b"</data>")
        .map(|p| p + 7)
        .unwrap();
    let stream = &written[tag_end..];
    assert_eq!(stream.len(), 1024);
    assert!(stream[..700].iter().all(|&b| b == 0xAB));
    assert!(stream[700..].iter().all(|&b| b == 0));
}

// --- VIP -----------------------------------------------------------------

#[test]
fn vip_exchange_streams_all_four_phases_in_order() {
    let mut chan = ScriptedTransport::new();
    let mut fh = default_client(&mut chan);

    fh.vip_exchange(b"DIGESTTABLE", b"SIGNATUREBLOB").unwrap();

    let written = chan.take_written();
    let text = String::from_utf8_lossy(&written);
    let digest_at = text.find("DIGESTTABLE").unwrap();
    let verify_at = text.find("<verify").unwrap();
    let sig_at = text.find("SIGNATUREBLOB").unwrap();
    let init_at = text.find("<sha256init").unwrap();
    assert!(digest_at < verify_at && verify_at < sig_at && sig_at < init_at);
    assert!(text.contains(r#"value="ping""#));
    assert!(text.contains(r#"EnableVip="1""#));
}

// --- supported functions -------------------------------------------------

#[test]
fn nop_banner_extends_the_function_set() {
    let mut chan = ScriptedTransport::new();
    chan.push_read(&xml_doc(
        r#"<log value="INFO: Supported functions:"/>
           <log value="demacia"/>
           <log value="setprojmodel"/>
           <log value="end of supported functions"/>
           <response value="ACK"/>"#,
    ));

    let mut fh = default_client(&mut chan);
    let funcs = fh.detect_functions().unwrap();
    assert!(funcs.contains("demacia"));
    assert!(funcs.contains("setprojmodel"));
    // Defaults are unioned in even when the banner omits them
    assert!(funcs.contains("program"));
    assert!(fh.supports("demacia"));
    assert!(!fh.supports("checkntfeature"));
}

// --- session -------------------------------------------------------------

#[test]
fn session_reuse_skips_sahara_and_runs_the_task() {
    let mut chan = ScriptedTransport::new();
    chan.set_read_timeout(Duration::from_millis(5)).unwrap();
    // configure ACK, then the task's nop ACK
    chan.push_read(&xml_doc(
        r#"<response value="ACK" MemoryName="UFS" SectorSizeInBytes="4096"
           MaxPayloadSizeToTargetInBytes="1048576"/>"#,
    ));
    chan.push_read(&ack());

    let session = FlashSession::new(SessionOptions {
        skip_loader: true,
        ..Default::default()
    });
    let cancel = CancelToken::new();
    let outcome = session.run_on(&mut chan, &cancel, |exec| exec.firehose().nop());

    assert!(outcome.ok, "reason: {:?}", outcome.reason);
    assert!(outcome.pbl.is_none());
}

#[test]
fn pre_tripped_cancellation_reports_cancelled_not_an_error() {
    let mut chan = ScriptedTransport::new();
    chan.set_read_timeout(Duration::from_millis(5)).unwrap();
    chan.push_read(&hello_pkt(2));

    let cancel = CancelToken::new();
    cancel.cancel();

    let session = FlashSession::new(SessionOptions::default());
    let outcome = session.run_on(&mut chan, &cancel, |_| Ok(()));
    assert!(!outcome.ok);
    assert_eq!(outcome.reason.as_deref(), Some("Cancelled"));
}

#[test]
fn session_failure_carries_the_reason() {
    let mut chan = ScriptedTransport::new();
    chan.set_read_timeout(Duration::from_millis(5)).unwrap();
    // Nothing scripted: Sahara HELLO never arrives

    let session = FlashSession::new(SessionOptions {
        hello_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let cancel = CancelToken::new();
    let outcome = session.run_on(&mut chan, &cancel, |_| Ok(()));
    assert!(!outcome.ok);
    assert!(outcome.reason.unwrap().contains("HELLO"));
}
