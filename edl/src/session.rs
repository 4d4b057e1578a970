// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! One flashing session end to end: open the port, Sahara, vendor auth,
//! `<configure>`, then hand a [`FlashTaskExecutor`] to the caller's task.
//! The session exclusively owns the transport; everything else borrows it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::auth::{self, AuthContext};
use crate::devicedb;
use crate::error::{EdlError, Result};
use crate::firehose::{FirehoseClient, VipQuirks};
use crate::sahara::{SAHARA_HELLO_TIMEOUT, SaharaHandshake, sahara_smart_handshake};
use crate::tasks::FlashTaskExecutor;
use crate::transport::Transport;
use crate::types::{AuthKind, FirehoseConfig, MemoryName, SaharaPblInfo};

/// Cooperative cancellation. Tripping the token runs every registered hook;
/// the session registers exactly one, which force-closes its transport, so
/// any blocked protocol call unwinds within one read timeout.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    tripped: AtomicBool,
    hooks: Mutex<Vec<Box<dyn Fn() + Send>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.tripped.store(true, Ordering::SeqCst);
        let hooks = self.inner.hooks.lock().expect("cancel hooks poisoned");
        for hook in hooks.iter() {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, hook: Box<dyn Fn() + Send>) {
        if self.is_cancelled() {
            hook();
            return;
        }
        self.inner
            .hooks
            .lock()
            .expect("cancel hooks poisoned")
            .push(hook);
    }

    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EdlError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// COM-port-like device name.
    pub port: String,
    pub loader_path: Option<PathBuf>,
    pub loader_dir: Option<PathBuf>,
    pub auth: AuthKind,
    /// Session reuse: the programmer is already up, so Sahara *and* the
    /// auth exchange are skipped (a repeat exchange is a protocol violation
    /// on every vendor).
    pub skip_loader: bool,
    pub digest_path: Option<PathBuf>,
    pub signature_path: Option<PathBuf>,
    pub firmware_dir: Option<PathBuf>,
    pub preferred_storage: Option<MemoryName>,
    pub skip_storage_init: bool,
    pub auth_model: String,
    pub project_id: String,
    pub vip_quirks: VipQuirks,
    pub hello_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            port: String::new(),
            loader_path: None,
            loader_dir: None,
            auth: AuthKind::Standard,
            skip_loader: false,
            digest_path: None,
            signature_path: None,
            firmware_dir: None,
            preferred_storage: None,
            skip_storage_init: false,
            auth_model: String::new(),
            project_id: String::new(),
            vip_quirks: VipQuirks::default(),
            hello_timeout: SAHARA_HELLO_TIMEOUT,
        }
    }
}

/// Boolean-plus-reason session verdict. `Cancelled` is a clean `false`,
/// never an error string with a backtrace attached.
#[derive(Debug)]
pub struct SessionOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    pub pbl: Option<SaharaPblInfo>,
}

pub struct FlashSession {
    opts: SessionOptions,
}

impl FlashSession {
    pub fn new(opts: SessionOptions) -> Self {
        FlashSession { opts }
    }

    /// Open the configured serial port and run the session on it. Port-open
    /// contention (the OS briefly holds a just-closed handle) is retried up
    /// to three times, a second apart.
    #[cfg(feature = "serial")]
    pub fn run(
        &self,
        cancel: &CancelToken,
        task: impl FnOnce(&mut FlashTaskExecutor<'_, '_>) -> Result<()>,
    ) -> SessionOutcome {
        use crate::error::TransportError;
        use crate::transport::SerialTransport;

        let mut attempt = 0;
        let mut chan = loop {
            match SerialTransport::open(&self.opts.port) {
                Ok(t) => break t,
                Err(TransportError::Open(_, ref io)) if is_contention(io) && attempt < 3 => {
                    attempt += 1;
                    warn!("port busy, retry {attempt}/3");
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => {
                    return SessionOutcome {
                        ok: false,
                        reason: Some(e.to_string()),
                        pbl: None,
                    };
                }
            }
        };

        let outcome = self.run_on(&mut chan, cancel, task);
        chan.close();
        outcome
    }

    /// Run the session over an already-open transport. This is also the
    /// test seam: anything implementing [`Transport`] will do.
    pub fn run_on(
        &self,
        chan: &mut dyn Transport,
        cancel: &CancelToken,
        task: impl FnOnce(&mut FlashTaskExecutor<'_, '_>) -> Result<()>,
    ) -> SessionOutcome {
        let mut pbl = None;
        match self.drive(chan, cancel, &mut pbl, task) {
            Ok(()) => SessionOutcome {
                ok: true,
                reason: None,
                pbl,
            },
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                info!("session cancelled");
                SessionOutcome {
                    ok: false,
                    reason: Some("Cancelled".to_owned()),
                    pbl,
                }
            }
            Err(e) => SessionOutcome {
                ok: false,
                reason: Some(e.to_string()),
                pbl,
            },
        }
    }

    fn drive(
        &self,
        chan: &mut dyn Transport,
        cancel: &CancelToken,
        pbl_out: &mut Option<SaharaPblInfo>,
        task: impl FnOnce(&mut FlashTaskExecutor<'_, '_>) -> Result<()>,
    ) -> Result<()> {
        let opts = &self.opts;

        // The registered trigger closing the transport is the single
        // cancellation mechanism; everything else just observes the
        // resulting transport error.
        let guard = chan.guard();
        cancel.register(Box::new(move || guard.force_close()));

        // Scratch space for GPT backups and friends; removed on drop, on
        // every exit path.
        let temp = tempfile::Builder::new().prefix("edl-session-").tempdir()?;

        let info = if opts.skip_loader {
            None
        } else {
            let hs = SaharaHandshake {
                loader: opts.loader_path.as_deref(),
                loader_dir: opts.loader_dir.as_deref(),
                hello_timeout: opts.hello_timeout,
            };
            let outcome = sahara_smart_handshake(chan, &hs)?;
            Some(outcome.info)
        };
        *pbl_out = info.clone();
        cancel.checkpoint()?;

        let ident = info
            .as_ref()
            .map(|i| devicedb::identify(i.msm_id, &i.pk_hash));

        // Storage choice: operator override, else what the database knows
        // about the chip, else UFS. Flagship parts are never driven as eMMC.
        let flagship = ident
            .as_ref()
            .is_some_and(|d| devicedb::is_flagship(&d.chip));
        let mut memory = opts
            .preferred_storage
            .or(ident.as_ref().map(|d| d.storage))
            .unwrap_or(MemoryName::Ufs);
        if flagship && memory == MemoryName::Emmc {
            warn!("{} is UFS-only, ignoring the eMMC request", ident.as_ref().unwrap().chip);
            memory = MemoryName::Ufs;
        }

        let cfg = FirehoseConfig {
            memory_name: memory,
            sector_size: memory.default_sector_size(),
            ..Default::default()
        };
        let mut fh = FirehoseClient::new(chan, cfg);
        fh.vip_quirks = opts.vip_quirks;
        fh.collect_welcome_logs();

        if opts.skip_loader {
            debug!("session reuse: skipping auth, the device treats a repeat exchange as a violation");
        } else {
            let supported = fh.detect_functions().unwrap_or_default();
            let pk_strategy = ident.as_ref().map_or(AuthKind::Standard, |d| d.strategy);
            let kind = auth::select_strategy(opts.auth, &supported, pk_strategy);
            if kind != AuthKind::Standard {
                info!("running {kind:?} authentication");
                let ctx = AuthContext {
                    serial: info
                        .as_ref()
                        .and_then(|i| i.serial.parse().ok())
                        .unwrap_or(0),
                    model: opts.auth_model.clone(),
                    project_id: opts.project_id.clone(),
                    ticks: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    firmware_dir: opts.firmware_dir.clone(),
                    digest_path: opts.digest_path.clone(),
                    signature_path: opts.signature_path.clone(),
                };
                auth::authenticate(kind, &mut fh, &ctx)?;
            }
        }
        cancel.checkpoint()?;

        // One automatic storage flip on a failed negotiation, and only one
        if let Err(e) = fh.configure(opts.skip_storage_init) {
            let flipped = match memory {
                MemoryName::Ufs => MemoryName::Emmc,
                MemoryName::Emmc | MemoryName::Nand => MemoryName::Ufs,
            };
            if e.is_cancelled() || (flipped == MemoryName::Emmc && flagship) {
                return Err(e);
            }
            warn!("configure as {memory} failed ({e}), retrying as {flipped}");
            fh.cfg.memory_name = flipped;
            fh.cfg.sector_size = flipped.default_sector_size();
            fh.configure(opts.skip_storage_init)?;
        }
        cancel.checkpoint()?;
        info!(
            "configured: {} {} @{} bytes/sector, payload {}",
            fh.cfg.target_name, fh.cfg.memory_name, fh.cfg.sector_size, fh.cfg.max_payload_to_target
        );

        let mut exec = FlashTaskExecutor::new(&mut fh, temp.path());
        task(&mut exec)
    }
}

#[cfg(feature = "serial")]
fn is_contention(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ResourceBusy
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_runs_hooks_once_registered() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        token.register(Box::new(move || f.store(true, Ordering::SeqCst)));
        assert!(!fired.load(Ordering::SeqCst));
        token.cancel();
        assert!(fired.load(Ordering::SeqCst));
        assert!(token.is_cancelled());
    }

    #[test]
    fn late_registration_fires_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        token.register(Box::new(move || f.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(EdlError::Cancelled)));
    }
}
