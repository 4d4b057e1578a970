// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Host-side engine for Qualcomm EDL flashing: the Sahara and Firehose
//! protocol clients, the storage-format codecs around them (GPT, Android
//! Sparse, LP/super, OFP/OZIP/OPS), vendor authentication, and the session
//! that strings it all together.
//!
//! The device side is out of scope: this crate drives a vendor-signed
//! programmer, it never replaces one.

pub mod auth;
pub mod devicedb;
pub mod error;
pub mod firehose;
pub mod fsdetect;
pub mod gpt;
pub mod keybrute;
pub mod lp;
pub mod ofp;
pub mod partitions;
pub mod sahara;
pub mod session;
pub mod sparse;
pub mod tasks;
pub mod transport;
pub mod types;

pub use error::{EdlError, Result, SaharaError, TransportError};
pub use firehose::{
    FirehoseClient, FirehoseResetMode, FirehoseResponse, VipQuirks, firehose_xml_setup,
};
pub use sahara::{SaharaHandshake, SaharaOutcome, sahara_smart_handshake};
pub use session::{CancelToken, FlashSession, SessionOptions, SessionOutcome};
pub use tasks::FlashTaskExecutor;
#[cfg(feature = "serial")]
pub use transport::SerialTransport;
pub use transport::{ScriptedTransport, Transport, TransportGuard};
pub use types::{
    AuthKind, DeviceIdentifyResult, FirehoseConfig, FsKind, ImageFormat, MemoryName,
    PartitionInfo, PartitionSource, ProgressFn, SaharaPblInfo,
};
