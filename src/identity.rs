// src/identity.rs
//! Anonymized network identity manager.
//!
//! Owns the Tor exit identity: exposes the current identity handle and
//! rotates it via the control port (`AUTHENTICATE` + `SIGNAL NEWNYM`).
//! Rotation policy bounds circuit churn: voluntary rotations are refused
//! within `min_rotation_interval` of the last one, forced (failure-driven)
//! rotations always proceed but add a cooldown that delays the next
//! voluntary rotation. Crossing the consecutive-failure threshold arms an
//! autonomous rotation that happens before the next fetch is permitted.
//!
//! The whole control exchange runs under one async mutex, so at most one
//! rotation is in flight process-wide and no fetch acquires an identity
//! mid-rotation.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    Voluntary,
    /// Blocking detected or failure threshold crossed; bypasses the
    /// minimum-interval check.
    ForcedFailure,
}

impl RotationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voluntary => "voluntary",
            Self::ForcedFailure => "forced-failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Healthy,
    /// Consecutive failures approaching the rotation threshold.
    Degraded,
    Rotating,
}

/// Opaque descriptor of one exit identity. `id` is monotonic across the
/// process lifetime; equality of ids means "same circuit epoch".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHandle {
    pub id: u64,
    pub created_unix: u64,
    pub failures: u32,
}

#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub handle_id: u64,
    pub reason: &'static str,
    pub at_unix: u64,
}

/// Seam over the anonymizing network's control channel. Production uses
/// [`TorControl`]; tests substitute a recording fake.
#[async_trait]
pub trait CircuitControl: Send + Sync {
    async fn renew_circuit(&self) -> Result<()>;
}

/// Tor control-port client. Speaks just enough of the control protocol to
/// request a new circuit: authenticate, `SIGNAL NEWNYM`, quit.
pub struct TorControl {
    addr: String,
    password: String,
}

impl TorControl {
    pub fn new(addr: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl CircuitControl for TorControl {
    async fn renew_circuit(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to tor control port at {}", self.addr))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("AUTHENTICATE \"{}\"\r\n", self.password).as_bytes())
            .await
            .context("sending AUTHENTICATE")?;
        expect_250(&mut reader, "AUTHENTICATE").await?;

        write_half
            .write_all(b"SIGNAL NEWNYM\r\n")
            .await
            .context("sending SIGNAL NEWNYM")?;
        expect_250(&mut reader, "SIGNAL NEWNYM").await?;

        let _ = write_half.write_all(b"QUIT\r\n").await;
        Ok(())
    }
}

async fn expect_250<R>(reader: &mut BufReader<R>, cmd: &str) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .with_context(|| format!("reading {cmd} reply"))?;
    if !line.starts_with("250") {
        bail!("tor control refused {cmd}: {}", line.trim());
    }
    Ok(())
}

/// No-op control for `identity.enabled = false`.
pub struct NullControl;

#[async_trait]
impl CircuitControl for NullControl {
    async fn renew_circuit(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct IdentityState {
    current: Option<IdentityHandle>,
    next_id: u64,
    last_rotation: Option<Instant>,
    /// Extra wait added to the next voluntary rotation by forced ones.
    pending_cooldown: Duration,
    /// Failure threshold crossed; rotate before the next fetch.
    armed: bool,
    rotations: u64,
    status: CircuitStatus,
}

pub struct IdentityManager {
    control: Box<dyn CircuitControl>,
    enabled: bool,
    socks_addr: String,
    min_rotation_interval: Duration,
    forced_cooldown: Duration,
    failure_threshold: u32,
    state: Mutex<IdentityState>,
    history: StdMutex<Vec<RotationEvent>>,
}

const HISTORY_CAP: usize = 256;

impl IdentityManager {
    pub fn new(cfg: &IdentityConfig, control: Box<dyn CircuitControl>) -> Self {
        Self {
            control,
            enabled: cfg.enabled,
            socks_addr: cfg.socks_addr.clone(),
            min_rotation_interval: Duration::from_secs(cfg.min_rotation_interval_secs),
            forced_cooldown: Duration::from_secs(cfg.forced_rotation_cooldown_secs),
            failure_threshold: cfg.failure_threshold.max(1),
            state: Mutex::new(IdentityState {
                current: None,
                next_id: 1,
                last_rotation: None,
                pending_cooldown: Duration::ZERO,
                armed: false,
                rotations: 0,
                status: CircuitStatus::Healthy,
            }),
            history: StdMutex::new(Vec::new()),
        }
    }

    /// Convenience constructor wiring the production control transport
    /// (or the null one when the identity layer is disabled).
    pub fn from_config(cfg: &IdentityConfig) -> Self {
        let control: Box<dyn CircuitControl> = if cfg.enabled {
            Box::new(TorControl::new(&cfg.control_addr, &cfg.control_password))
        } else {
            Box::new(NullControl)
        };
        Self::new(cfg, control)
    }

    /// SOCKS proxy url for fetches, `None` when the identity layer is
    /// disabled.
    pub fn proxy_url(&self) -> Option<String> {
        self.enabled
            .then(|| format!("socks5h://{}", self.socks_addr))
    }

    /// The active identity; establishes one lazily on first use. The
    /// first identity is whatever circuit the proxy already has — no
    /// control traffic is spent on it.
    pub async fn current(&self) -> IdentityHandle {
        let mut st = self.state.lock().await;
        current_or_init(&mut st).clone()
    }

    /// Gate called before every fetch: performs a pending threshold-armed
    /// rotation, then returns the identity the fetch should use.
    pub async fn ensure_ready(&self) -> Result<IdentityHandle> {
        let mut st = self.state.lock().await;
        if st.armed && self.enabled {
            self.rotate_locked(&mut st, RotationReason::ForcedFailure, Instant::now())
                .await?;
        }
        Ok(current_or_init(&mut st).clone())
    }

    pub async fn rotate(&self, reason: RotationReason) -> Result<IdentityHandle> {
        self.rotate_at(reason, Instant::now()).await
    }

    /// `now`-parameterized rotation, used directly by tests.
    pub async fn rotate_at(&self, reason: RotationReason, now: Instant) -> Result<IdentityHandle> {
        let mut st = self.state.lock().await;
        self.rotate_locked(&mut st, reason, now).await
    }

    async fn rotate_locked(
        &self,
        st: &mut IdentityState,
        reason: RotationReason,
        now: Instant,
    ) -> Result<IdentityHandle> {
        if !self.enabled {
            debug!(target: "identity", "identity layer disabled, rotation is a no-op");
            return Ok(current_or_init(st).clone());
        }

        if reason == RotationReason::Voluntary {
            if let Some(last) = st.last_rotation {
                let wait = self.min_rotation_interval + st.pending_cooldown;
                if now < last + wait {
                    debug!(
                        target: "identity",
                        cooldown_secs = st.pending_cooldown.as_secs(),
                        "voluntary rotation refused inside minimum interval"
                    );
                    return Ok(current_or_init(st).clone());
                }
            }
        }

        st.status = CircuitStatus::Rotating;
        if let Err(e) = self.control.renew_circuit().await {
            st.status = CircuitStatus::Degraded;
            return Err(e.context("circuit renewal failed"));
        }

        let id = st.next_id;
        st.next_id += 1;
        st.current = Some(IdentityHandle {
            id,
            created_unix: now_unix(),
            failures: 0,
        });
        st.last_rotation = Some(now);
        st.rotations += 1;
        st.armed = false;
        st.status = CircuitStatus::Healthy;
        match reason {
            RotationReason::Voluntary => st.pending_cooldown = Duration::ZERO,
            RotationReason::ForcedFailure => st.pending_cooldown += self.forced_cooldown,
        }

        info!(
            target: "identity",
            handle = id,
            reason = reason.as_str(),
            rotations = st.rotations,
            "rotated exit identity"
        );
        self.push_history(RotationEvent {
            handle_id: id,
            reason: reason.as_str(),
            at_unix: now_unix(),
        });
        Ok(st.current.clone().expect("just set"))
    }

    /// Report a fetch failure against a specific identity. Reports against
    /// an already-replaced handle are ignored. Crossing the threshold arms
    /// an autonomous rotation performed by the next `ensure_ready`.
    pub async fn report_failure(&self, handle: &IdentityHandle) {
        let mut st = self.state.lock().await;
        let Some(current) = st.current.as_mut() else {
            return;
        };
        if current.id != handle.id {
            debug!(target: "identity", stale = handle.id, "ignoring failure report for stale handle");
            return;
        }
        current.failures += 1;
        let failures = current.failures;
        if failures >= self.failure_threshold {
            st.armed = true;
            warn!(
                target: "identity",
                handle = handle.id,
                failures,
                "failure threshold crossed, rotation armed"
            );
        } else {
            st.status = CircuitStatus::Degraded;
        }
    }

    pub async fn status(&self) -> CircuitStatus {
        self.state.lock().await.status
    }

    /// Total rotations performed; never decreases.
    pub async fn rotation_count(&self) -> u64 {
        self.state.lock().await.rotations
    }

    /// Drain recorded rotation events (persisted by the coordinator).
    pub fn take_history(&self) -> Vec<RotationEvent> {
        let mut h = self.history.lock().expect("identity history poisoned");
        std::mem::take(&mut *h)
    }

    fn push_history(&self, ev: RotationEvent) {
        let mut h = self.history.lock().expect("identity history poisoned");
        h.push(ev);
        if h.len() > HISTORY_CAP {
            let excess = h.len() - HISTORY_CAP;
            h.drain(0..excess);
        }
    }
}

fn current_or_init(st: &mut IdentityState) -> &IdentityHandle {
    if st.current.is_none() {
        let id = st.next_id;
        st.next_id += 1;
        st.current = Some(IdentityHandle {
            id,
            created_unix: now_unix(),
            failures: 0,
        });
    }
    st.current.as_ref().expect("just initialized")
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
