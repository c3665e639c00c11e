//! Capability-matched leasing of remote channels.
//!
//! The pool keeps up to `max_channels` channels per inventory host. A lease
//! hands one channel to one job. Leases return their channel when dropped, so
//! a lease can never leak, even if the task holding it is aborted.
//!
//! A host that is dead is skipped until `dead_cooldown` passes; a host with a
//! prepare section takes no builds until its first channel has prepared it.
//!
//! Bookkeeping lives behind a `std::sync::Mutex` that is never held across an
//! await point; connecting, probing and closing happen outside the lock.

pub mod health;
pub mod prepare;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{ChannelError, Connector, RemoteChannel};
use crate::config::{HostSpec, PoolConfig};
use crate::matrix::Os;

pub use health::spawn_health_monitor;
pub use prepare::{prepare_host, PrepareState};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no channel matching {tags:?} became available within {}s", .waited.as_secs_f64())]
    Exhausted { tags: Vec<String>, waited: Duration },

    #[error("no host in the pool provides {0:?}")]
    NoMatchingHost(Vec<String>),

    #[error("channel pool is shut down")]
    Closed,

    #[error(transparent)]
    Connect(#[from] ChannelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelHealth {
    Healthy,
    Degraded,
    Dead,
}

impl ChannelHealth {
    /// Lease preference; lower is better.
    fn rank(self) -> u8 {
        match self {
            ChannelHealth::Healthy => 0,
            ChannelHealth::Degraded => 1,
            ChannelHealth::Dead => 2,
        }
    }
}

/// Snapshot of one host's channels, for dashboards and `hosts` output.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub name: String,
    pub address: String,
    pub os: Os,
    pub tags: BTreeSet<String>,
    pub max_channels: usize,
    pub idle: usize,
    pub leased: usize,
    pub health: ChannelHealth,
    pub consecutive_failures: u32,
    pub preparation: PrepareState,
}

struct PooledChannel {
    channel: Box<dyn RemoteChannel>,
    failures: u32,
}

struct HostSlot {
    spec: HostSpec,
    idle: Vec<PooledChannel>,
    /// Leased channels plus connect reservations
    leased: usize,
    /// Channels taken out of `idle` by a health probe
    probing: usize,
    health: ChannelHealth,
    failures: u32,
    /// Set while the host is dead; no leases until then
    retry_at: Option<Instant>,
    preparation: PrepareState,
}

impl HostSlot {
    fn open(&self) -> usize {
        self.idle.len() + self.leased + self.probing
    }

    fn has_capacity(&self) -> bool {
        self.open() < self.spec.max_channels
    }

    fn leasable(&self, now: Instant) -> bool {
        self.preparation.admits_leases() && self.retry_at.map_or(true, |at| at <= now)
    }

    fn record_failure(&mut self, dead_after: u32, cooldown: Duration) {
        self.failures += 1;
        if self.failures >= dead_after {
            tracing::warn!(
                host = %self.spec.name,
                cooldown_secs = cooldown.as_secs_f64(),
                "Host is dead, skipping it"
            );
            self.health = ChannelHealth::Dead;
            self.retry_at = Some(Instant::now() + cooldown);
        } else {
            self.health = ChannelHealth::Degraded;
        }
    }
}

struct PoolState {
    hosts: Vec<HostSlot>,
    closed: bool,
}

pub struct ChannelPool {
    state: Mutex<PoolState>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    released: Notify,
}

impl ChannelPool {
    pub fn new(hosts: Vec<HostSpec>, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|spec| HostSlot {
                idle: Vec::new(),
                leased: 0,
                probing: 0,
                health: ChannelHealth::Healthy,
                failures: 0,
                retry_at: None,
                preparation: PrepareState::initial(spec.prepare.as_ref()),
                spec,
            })
            .collect();
        Self {
            state: Mutex::new(PoolState {
                hosts,
                closed: false,
            }),
            connector,
            config,
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Bookkeeping stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// True when at least one host's capabilities cover `tags`. Hosts that
    /// failed preparation do not count.
    pub fn can_serve(&self, tags: &BTreeSet<String>) -> bool {
        self.lock()
            .hosts
            .iter()
            .any(|h| h.preparation != PrepareState::Failed && h.spec.provides(tags))
    }

    /// When the earliest dead host becomes leasable again.
    pub fn next_recovery(&self) -> Option<Instant> {
        let now = Instant::now();
        self.lock()
            .hosts
            .iter()
            .filter_map(|h| h.retry_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Future that completes on the next release, eviction or shutdown.
    ///
    /// Create it (and `enable` it) before checking for capacity so a release
    /// in between is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Lease a matching channel without waiting.
    ///
    /// Prefers an idle connected channel; otherwise reserves a slot on the
    /// least loaded matching host with spare capacity. Healthy hosts come
    /// before degraded ones. A reservation must be connected with
    /// [`Lease::connect`] before use.
    pub fn try_acquire(self: &Arc<Self>, tags: &BTreeSet<String>) -> Option<Lease> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let now = Instant::now();

        let idle = state
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.idle.is_empty() && h.leasable(now) && h.spec.provides(tags))
            .min_by_key(|(_, h)| (h.health.rank(), h.leased))
            .map(|(i, _)| i);
        if let Some(index) = idle {
            let slot = &mut state.hosts[index];
            let channel = slot.idle.pop();
            slot.leased += 1;
            tracing::debug!(host = %slot.spec.name, "Leased idle channel");
            return Some(Lease::new(self.clone(), index, slot.spec.clone(), channel));
        }

        let spare = state
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.has_capacity() && h.leasable(now) && h.spec.provides(tags))
            .min_by_key(|(_, h)| (h.health.rank(), h.open()))
            .map(|(i, _)| i)?;
        let slot = &mut state.hosts[spare];
        slot.leased += 1;
        if slot.retry_at.is_some() {
            // One trial lease per cooldown
            slot.retry_at = Some(now + self.config.dead_cooldown());
        }
        let mut lease = Lease::new(self.clone(), spare, slot.spec.clone(), None);
        if slot.preparation == PrepareState::Pending {
            slot.preparation = PrepareState::Running;
            lease.preparing = true;
        }
        tracing::debug!(host = %slot.spec.name, preparing = lease.preparing, "Reserved channel slot");
        Some(lease)
    }

    /// Lease a connected channel, waiting up to the configured acquire timeout.
    pub async fn acquire(self: &Arc<Self>, tags: &BTreeSet<String>) -> Result<Lease, PoolError> {
        self.acquire_within(tags, self.config.acquire_timeout()).await
    }

    /// Lease a connected channel, waiting up to `wait` for one to free up.
    pub async fn acquire_within(
        self: &Arc<Self>,
        tags: &BTreeSet<String>,
        wait: Duration,
    ) -> Result<Lease, PoolError> {
        if !self.can_serve(tags) {
            return Err(PoolError::NoMatchingHost(tags.iter().cloned().collect()));
        }
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().closed {
                return Err(PoolError::Closed);
            }
            if let Some(mut lease) = self.try_acquire(tags) {
                lease.connect().await?;
                return Ok(lease);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PoolError::Exhausted {
                    tags: tags.iter().cloned().collect(),
                    waited: wait,
                });
            }
        }
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    fn give_back(
        &self,
        index: usize,
        channel: Option<PooledChannel>,
        broken: bool,
        preparing: bool,
    ) {
        let discard = {
            let mut state = self.lock();
            let closed = state.closed;
            let dead_after = self.config.dead_after_failures;
            let cooldown = self.config.dead_cooldown();
            let slot = &mut state.hosts[index];
            slot.leased = slot.leased.saturating_sub(1);
            if preparing && slot.preparation == PrepareState::Running {
                // Preparation was abandoned midway; the next lease starts over
                slot.preparation = PrepareState::Pending;
            }
            match channel {
                Some(mut pooled) if !closed && !broken => {
                    pooled.failures = 0;
                    slot.idle.push(pooled);
                    None
                }
                Some(pooled) => {
                    // A broken connection is not reused; the next lease reconnects
                    if broken && !closed {
                        slot.record_failure(dead_after, cooldown);
                    }
                    Some(pooled)
                }
                None => None,
            }
        };
        if let Some(pooled) = discard {
            close_detached(pooled);
        }
        self.released.notify_waiters();
    }

    fn record_connect(&self, index: usize, result: Result<(), &ChannelError>) {
        let mut state = self.lock();
        let dead_after = self.config.dead_after_failures;
        let cooldown = self.config.dead_cooldown();
        let slot = &mut state.hosts[index];
        match result {
            Ok(()) => {
                slot.failures = 0;
                slot.health = ChannelHealth::Healthy;
                slot.retry_at = None;
            }
            Err(e) => {
                slot.record_failure(dead_after, cooldown);
                tracing::warn!(
                    host = %slot.spec.name,
                    failures = slot.failures,
                    error = %e,
                    "Connect failed"
                );
            }
        }
    }

    fn record_preparation(&self, index: usize, result: Result<(), &ChannelError>) {
        {
            let mut state = self.lock();
            let slot = &mut state.hosts[index];
            slot.preparation = match result {
                Ok(()) => PrepareState::Ready,
                Err(ChannelError::Prepare { .. }) => PrepareState::Failed,
                Err(_) => PrepareState::Pending,
            };
            if let Err(e) = result {
                tracing::error!(host = %slot.spec.name, error = %e, "Host preparation failed");
            }
        }
        self.released.notify_waiters();
    }

    /// Probe every idle channel once, evicting channels that keep failing.
    pub async fn check_health(&self) {
        let taken: Vec<(usize, Vec<PooledChannel>)> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state
                .hosts
                .iter_mut()
                .enumerate()
                .filter(|(_, h)| !h.idle.is_empty())
                .map(|(i, h)| {
                    let idle = std::mem::take(&mut h.idle);
                    h.probing += idle.len();
                    (i, idle)
                })
                .collect()
        };

        let timeout = self.config.health_timeout();
        let dead_after = self.config.dead_after_failures;
        let cooldown = self.config.dead_cooldown();
        for (index, channels) in taken {
            for mut pooled in channels {
                let result = pooled.channel.probe(timeout).await;
                let evicted = {
                    let mut state = self.lock();
                    let closed = state.closed;
                    let slot = &mut state.hosts[index];
                    slot.probing = slot.probing.saturating_sub(1);
                    match result {
                        Ok(()) => {
                            pooled.failures = 0;
                            if slot.failures == 0 {
                                slot.health = ChannelHealth::Healthy;
                            }
                        }
                        Err(e) => {
                            pooled.failures += 1;
                            tracing::warn!(
                                host = %slot.spec.name,
                                failures = pooled.failures,
                                error = %e,
                                "Health probe failed"
                            );
                            if pooled.failures >= dead_after {
                                slot.health = ChannelHealth::Dead;
                                slot.retry_at = Some(Instant::now() + cooldown);
                            } else {
                                slot.health = ChannelHealth::Degraded;
                            }
                        }
                    }
                    if closed || pooled.failures >= dead_after {
                        Some(pooled)
                    } else {
                        slot.idle.push(pooled);
                        None
                    }
                };
                if let Some(mut pooled) = evicted {
                    tracing::warn!(host = %pooled.channel.host().name, "Evicting dead channel");
                    pooled.channel.close().await;
                }
                self.released.notify_waiters();
            }
        }
    }

    pub fn status(&self) -> Vec<HostStatus> {
        self.lock()
            .hosts
            .iter()
            .map(|h| HostStatus {
                name: h.spec.name.clone(),
                address: h.spec.address.clone(),
                os: h.spec.os,
                tags: h.spec.capabilities(),
                max_channels: h.spec.max_channels,
                idle: h.idle.len(),
                leased: h.leased,
                health: h.health,
                consecutive_failures: h.failures,
                preparation: h.preparation,
            })
            .collect()
    }

    /// Number of channels currently leased across all hosts.
    pub fn leased(&self) -> usize {
        self.lock().hosts.iter().map(|h| h.leased).sum()
    }

    /// Close idle channels and refuse new leases. Channels still leased are
    /// closed as their leases are dropped.
    pub async fn shutdown(&self) {
        let idle: Vec<PooledChannel> = {
            let mut state = self.lock();
            state.closed = true;
            state
                .hosts
                .iter_mut()
                .flat_map(|h| std::mem::take(&mut h.idle))
                .collect()
        };
        self.released.notify_waiters();
        for mut pooled in idle {
            pooled.channel.close().await;
        }
        tracing::info!("Channel pool shut down");
    }
}

fn close_detached(mut pooled: PooledChannel) {
    // Without a runtime there is nothing left to close the transport on
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            pooled.channel.close().await;
        });
    }
}

/// Exclusive use of one channel slot on one host.
///
/// Either holds a connected channel or is a reservation waiting for
/// [`connect`](Lease::connect). Dropping the lease returns the slot.
pub struct Lease {
    pool: Arc<ChannelPool>,
    index: usize,
    host: HostSpec,
    channel: Option<PooledChannel>,
    broken: bool,
    /// This lease prepares the host before its first build
    preparing: bool,
}

impl Lease {
    fn new(
        pool: Arc<ChannelPool>,
        index: usize,
        host: HostSpec,
        channel: Option<PooledChannel>,
    ) -> Self {
        Self {
            pool,
            index,
            host,
            channel,
            broken: false,
            preparing: false,
        }
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the channel for a reservation. No-op when already connected.
    ///
    /// The first channel to a host with a prepare section runs it here; other
    /// leases on that host wait until it is done.
    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.channel.is_some() {
            return Ok(());
        }
        let result = self
            .pool
            .connector
            .connect(&self.host, self.pool.config.connect_timeout())
            .await;
        self.pool.record_connect(self.index, result.as_ref().map(|_| ()));
        let mut channel = result?;

        if self.preparing {
            if let Some(prepare) = &self.host.prepare {
                let result =
                    prepare_host(channel.as_mut(), prepare, self.pool.config.prepare_timeout())
                        .await;
                self.preparing = false;
                self.pool.record_preparation(self.index, result.as_ref().map(|_| ()));
                if let Err(e) = result {
                    channel.close().await;
                    return Err(e);
                }
            }
        }

        self.channel = Some(PooledChannel {
            channel,
            failures: 0,
        });
        Ok(())
    }

    pub fn channel_mut(&mut self) -> Option<&mut dyn RemoteChannel> {
        match self.channel.as_mut() {
            Some(pooled) => Some(pooled.channel.as_mut()),
            None => None,
        }
    }

    /// The connection misbehaved; close it instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.give_back(
            self.index,
            self.channel.take(),
            self.broken,
            self.preparing,
        );
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("host", &self.host.name)
            .field("connected", &self.channel.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}
