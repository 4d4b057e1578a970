// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Vendor authentication orchestration. Strategies are plain tagged
//! variants ([`AuthKind`]); the orchestrator picks one from what the
//! operator asked for, what the PK hash says about the OEM, and which auth
//! tags the programmer advertises, then runs the exchange over the Firehose
//! client before any storage command goes out.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::error::{EdlError, Result};
use crate::firehose::FirehoseClient;
use crate::types::AuthKind;

/// Directories inside a firmware folder where OPPO digest/signature pairs
/// are usually stashed.
const VIP_SUBDIRS: &[&str] = &["vip", "VIP", "auth", ""];

/// Inputs the exchanges may need.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Chip serial from Sahara command mode.
    pub serial: u32,
    /// Project/model identifier for Xiaomi token derivation.
    pub model: String,
    /// Project id for the Nothing `checkntfeature` handshake.
    pub project_id: String,
    /// Timestamp component of the Demacia token.
    pub ticks: u64,
    pub firmware_dir: Option<PathBuf>,
    pub digest_path: Option<PathBuf>,
    pub signature_path: Option<PathBuf>,
}

/// Resolve the strategy to actually run. An explicit request wins; a
/// "standard" request is auto-promoted when the programmer advertises a
/// vendor auth tag, because such builds refuse storage commands without it.
pub fn select_strategy(
    requested: AuthKind,
    supported: &BTreeSet<String>,
    pk_hash_strategy: AuthKind,
) -> AuthKind {
    if requested != AuthKind::Standard {
        return requested;
    }
    if ["demacia", "setprojmodel", "setswprojmodel"]
        .iter()
        .any(|t| supported.contains(*t))
    {
        return AuthKind::Xiaomi;
    }
    if supported.contains("checkntfeature") {
        return AuthKind::Nothing;
    }
    pk_hash_strategy
}

/// Run the selected exchange. `Standard` is a no-op by definition.
pub fn authenticate(
    kind: AuthKind,
    fh: &mut FirehoseClient<'_>,
    ctx: &AuthContext,
) -> Result<()> {
    match kind {
        AuthKind::Standard => Ok(()),
        AuthKind::OppoVip => oppo_vip(fh, ctx),
        AuthKind::Xiaomi => xiaomi(fh, ctx),
        AuthKind::Nothing => nothing(fh, ctx),
    }
}

fn oppo_vip(fh: &mut FirehoseClient<'_>, ctx: &AuthContext) -> Result<()> {
    let (digest_path, signature_path) = match (&ctx.digest_path, &ctx.signature_path) {
        (Some(d), Some(s)) => (d.clone(), s.clone()),
        _ => {
            let dir = ctx.firmware_dir.as_deref().ok_or_else(|| {
                EdlError::MissingVipFiles(PathBuf::from("<no firmware folder given>"))
            })?;
            locate_vip_pair(dir)?
        }
    };
    info!(
        "VIP exchange with {} / {}",
        digest_path.display(),
        signature_path.display()
    );

    let digest = std::fs::read(&digest_path)?;
    let signature = std::fs::read(&signature_path)?;
    fh.vip_exchange(&digest, &signature)
}

/// Find a digest + signature file pair under the usual subdirectories.
fn locate_vip_pair(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    for sub in VIP_SUBDIRS {
        let candidate = if sub.is_empty() {
            dir.to_path_buf()
        } else {
            dir.join(sub)
        };
        if !candidate.is_dir() {
            continue;
        }

        let mut digest = None;
        let mut signature = None;
        for entry in std::fs::read_dir(&candidate)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if name.contains("digest") && digest.is_none() {
                digest = Some(path);
            } else if name.contains("sig") && signature.is_none() {
                signature = Some(path);
            }
        }
        if let (Some(d), Some(s)) = (digest, signature) {
            return Ok((d, s));
        }
    }
    Err(EdlError::MissingVipFiles(dir.to_path_buf()))
}

fn xiaomi(fh: &mut FirehoseClient<'_>, ctx: &AuthContext) -> Result<()> {
    if fh.supports("demacia") {
        let token = demacia_token(ctx.serial, &ctx.model, ctx.ticks);
        debug!("demacia token {token}");
        let resp = fh.send_named("demacia", &[("token", &token)])?;
        return if resp.ack {
            Ok(())
        } else {
            Err(EdlError::AuthRejected("demacia refused".into()))
        };
    }

    let signature = proj_model_signature(ctx.serial, &ctx.model);
    let tag = if fh.supports("setswprojmodel") {
        "setswprojmodel"
    } else {
        "setprojmodel"
    };
    debug!("{tag} signature {signature}");
    let resp = fh.send_named(tag, &[("token", &signature), ("model", &ctx.model)])?;
    if resp.ack {
        Ok(())
    } else {
        Err(EdlError::AuthRejected(format!("{tag} refused")))
    }
}

/// First 32 hex chars of SHA-256 over `"{serial:X8}_{model}_{ticks}"`.
fn demacia_token(serial: u32, model: &str, ticks: u64) -> String {
    let seed = format!("{serial:08X}_{model}_{ticks}");
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(digest)[..32].to_owned()
}

/// SHA-256 over the little-endian serial followed by the UTF-8 model.
fn proj_model_signature(serial: u32, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serial.to_le_bytes());
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())
}

fn nothing(fh: &mut FirehoseClient<'_>, ctx: &AuthContext) -> Result<()> {
    let resp = fh.send_named("checkntfeature", &[("projid", &ctx.project_id)])?;
    if resp.ack {
        Ok(())
    } else {
        Err(EdlError::AuthRejected("checkntfeature refused".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_requests_win_over_promotion() {
        let mut supported = BTreeSet::new();
        supported.insert("demacia".to_owned());
        assert_eq!(
            select_strategy(AuthKind::OppoVip, &supported, AuthKind::Standard),
            AuthKind::OppoVip
        );
    }

    #[test]
    fn standard_promotes_from_advertised_functions() {
        let mut supported = BTreeSet::new();
        supported.insert("setswprojmodel".to_owned());
        assert_eq!(
            select_strategy(AuthKind::Standard, &supported, AuthKind::Standard),
            AuthKind::Xiaomi
        );

        let mut supported = BTreeSet::new();
        supported.insert("checkntfeature".to_owned());
        assert_eq!(
            select_strategy(AuthKind::Standard, &supported, AuthKind::Standard),
            AuthKind::Nothing
        );

        assert_eq!(
            select_strategy(AuthKind::Standard, &BTreeSet::new(), AuthKind::OppoVip),
            AuthKind::OppoVip
        );
        assert_eq!(
            select_strategy(AuthKind::Standard, &BTreeSet::new(), AuthKind::Standard),
            AuthKind::Standard
        );
    }

    #[test]
    fn demacia_token_shape() {
        let token = demacia_token(0x1234ABCD, "alioth", 638412345678901234);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic for a fixed seed
        assert_eq!(token, demacia_token(0x1234ABCD, "alioth", 638412345678901234));
        assert_ne!(token, demacia_token(0x1234ABCE, "alioth", 638412345678901234));
    }

    #[test]
    fn proj_model_signature_covers_serial_and_model() {
        let a = proj_model_signature(1, "alioth");
        let b = proj_model_signature(2, "alioth");
        let c = proj_model_signature(1, "apollo");
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn vip_pair_discovery_checks_subdirs_then_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("vip")).unwrap();
        std::fs::write(dir.path().join("vip/prog_digest.bin"), b"d").unwrap();
        std::fs::write(dir.path().join("vip/prog_sig.bin"), b"s").unwrap();

        let (d, s) = locate_vip_pair(dir.path()).unwrap();
        assert!(d.ends_with("vip/prog_digest.bin"));
        assert!(s.ends_with("vip/prog_sig.bin"));

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            locate_vip_pair(empty.path()),
            Err(EdlError::MissingVipFiles(_))
        ));
    }
}
