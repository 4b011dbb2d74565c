//! HA role state machine.
//!
//! Allowed transitions (`current` + `requested` -> `next`):
//!
//! ```text
//!   Idle        + Active      -> Active
//!   Idle        + Standby     -> Standby
//!   Idle        + Maintenance -> Maintenance
//!   Active      + Active      -> Active
//!   Active      + Standby     -> ToBeStandby
//!   ToBeActive  + Active      -> Active
//!   Standby     + Standby     -> Standby
//!   Standby     + Active      -> ToBeActive
//!   Standby     + Maintenance -> Maintenance
//!   ToBeStandby + Standby     -> Standby
//!   Maintenance + Standby     -> ToBeStandby
//! ```
//!
//! Everything else is rejected and leaves the state untouched. The
//! intermediate `ToBe*` states complete once log appliers report in
//! (`ToBeActive`) or once the last client leaves (`ToBeStandby`).

use crate::error::ConnError;
use crate::session::TransactionManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaState {
    Idle,
    Active,
    ToBeActive,
    Standby,
    ToBeStandby,
    Maintenance,
    Dead,
}

impl HaState {
    pub const ALL: [HaState; 7] = [
        HaState::Idle,
        HaState::Active,
        HaState::ToBeActive,
        HaState::Standby,
        HaState::ToBeStandby,
        HaState::Maintenance,
        HaState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HaState::Idle => "idle",
            HaState::Active => "active",
            HaState::ToBeActive => "to-be-active",
            HaState::Standby => "standby",
            HaState::ToBeStandby => "to-be-standby",
            HaState::Maintenance => "maintenance",
            HaState::Dead => "dead",
        }
    }
}

impl fmt::Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        HaState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown HA state '{}'", s))
    }
}

/// Next state for `requested` from `current`, or `None` if not allowed.
pub fn transition(current: HaState, requested: HaState) -> Option<HaState> {
    use HaState::*;
    match (current, requested) {
        (Idle, Active) => Some(Active),
        (Idle, Standby) => Some(Standby),
        (Idle, Maintenance) => Some(Maintenance),
        (Active, Active) => Some(Active),
        (Active, Standby) => Some(ToBeStandby),
        (ToBeActive, Active) => Some(Active),
        (Standby, Standby) => Some(Standby),
        (Standby, Active) => Some(ToBeActive),
        (Standby, Maintenance) => Some(Maintenance),
        (ToBeStandby, Standby) => Some(Standby),
        (Maintenance, Standby) => Some(ToBeStandby),
        _ => None,
    }
}

/// State reported by a replica's log applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogApplierState {
    Unregistered,
    Recovering,
    Working,
    Done,
    Error,
}

/// Why a client-facing HA check is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Register,
    Unregister,
    Other,
}

#[derive(Debug, Clone, Copy)]
struct ApplierSlot {
    client_id: u32,
    state: LogApplierState,
}

#[derive(Debug)]
struct HaInner {
    state: HaState,
    appliers: Vec<ApplierSlot>,
}

pub struct HaController {
    inner: Mutex<HaInner>,
    /// Serializes `change_state`, which may sleep during maintenance grace
    change_lock: tokio::sync::Mutex<()>,
    write_enabled: AtomicBool,
    txn: Arc<dyn TransactionManager>,
    replica_hosts: usize,
    maintenance_grace: Duration,
    maintenance_settle: Duration,
}

impl HaController {
    pub fn new(config: &crate::config::HaConfig, txn: Arc<dyn TransactionManager>) -> Self {
        let state = config.initial_state;
        HaController {
            inner: Mutex::new(HaInner {
                state,
                appliers: Vec::with_capacity(config.replica_hosts),
            }),
            change_lock: tokio::sync::Mutex::new(()),
            write_enabled: AtomicBool::new(!matches!(
                state,
                HaState::Standby | HaState::ToBeActive | HaState::Dead
            )),
            txn,
            replica_hosts: config.replica_hosts,
            maintenance_grace: config.maintenance_grace,
            maintenance_settle: config.maintenance_settle,
        }
    }

    pub fn state(&self) -> HaState {
        self.inner.lock().state
    }

    pub fn is_write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::Acquire)
    }

    fn set_write_enabled(&self, on: bool) {
        if self.write_enabled.swap(on, Ordering::AcqRel) != on {
            info!(enabled = on, "write access changed");
        }
    }

    fn transit_locked(inner: &mut HaInner, requested: HaState) -> Option<HaState> {
        if inner.state == requested {
            return Some(requested);
        }
        let next = transition(inner.state, requested)?;
        info!(from = %inner.state, to = %next, requested = %requested, "HA state transition");
        inner.state = next;
        Some(next)
    }

    /// Apply one table transition. `None` if the table rejects it.
    pub fn transit(&self, requested: HaState) -> Option<HaState> {
        let mut inner = self.inner.lock();
        let next = Self::transit_locked(&mut inner, requested);
        if next.is_none() {
            debug!(current = %inner.state, requested = %requested, "HA transition rejected");
        }
        next
    }

    fn appliers_done(&self, inner: &HaInner) -> bool {
        inner.appliers.len() >= self.replica_hosts
            && inner
                .appliers
                .iter()
                .take(self.replica_hosts)
                .all(|a| a.state == LogApplierState::Done)
            && matches!(inner.state, HaState::ToBeActive | HaState::Active)
    }

    fn appliers_working(&self, inner: &HaInner) -> bool {
        inner.appliers.len() >= self.replica_hosts
            && inner
                .appliers
                .iter()
                .take(self.replica_hosts)
                .all(|a| matches!(a.state, LogApplierState::Working | LogApplierState::Done))
            && matches!(inner.state, HaState::ToBeStandby | HaState::Standby)
    }

    /// Change the HA role on request of the heartbeat master or an operator.
    ///
    /// Without `heartbeat`, only Standby <-> Maintenance and a forced
    /// ToBeActive -> Active are accepted; other requests are ignored.
    /// `force` jumps straight to the requested state before the usual
    /// completion checks run.
    pub async fn change_state(
        &self,
        requested: HaState,
        force: bool,
        heartbeat: bool,
    ) -> Result<HaState, ConnError> {
        let _serial = self.change_lock.lock().await;
        let orig = self.state();

        if requested == orig
            || (!force && orig == HaState::ToBeActive && requested == HaState::Active)
            || (!force && orig == HaState::ToBeStandby && requested == HaState::Standby)
        {
            return Ok(orig);
        }
        if !heartbeat
            && !(orig == HaState::Standby && requested == HaState::Maintenance)
            && !(orig == HaState::Maintenance && requested == HaState::Standby)
            && !(force && orig == HaState::ToBeActive && requested == HaState::Active)
        {
            debug!(current = %orig, requested = %requested, "HA change ignored without heartbeat");
            return Ok(orig);
        }

        if force {
            warn!(from = %orig, to = %requested, "forcing HA state");
            self.inner.lock().state = requested;
        }

        let reached = match requested {
            HaState::Active => {
                let mut inner = self.inner.lock();
                let mut next = Self::transit_locked(&mut inner, HaState::Active);
                if next.is_some() && self.appliers_done(&inner) {
                    next = Self::transit_locked(&mut inner, HaState::Active);
                }
                drop(inner);
                if next == Some(HaState::Active) {
                    self.set_write_enabled(true);
                }
                next
            }
            HaState::Standby => {
                let mut inner = self.inner.lock();
                let mut next = Self::transit_locked(&mut inner, HaState::Standby);
                if next.is_some() {
                    let complete = if orig == HaState::Idle {
                        self.appliers_working(&inner)
                    } else {
                        self.txn.count_active_clients() == 0
                    };
                    if complete {
                        next = Self::transit_locked(&mut inner, HaState::Standby);
                    }
                }
                drop(inner);
                if next == Some(HaState::Standby) {
                    self.set_write_enabled(false);
                }
                next
            }
            HaState::Maintenance => {
                let next = self.transit(HaState::Maintenance);
                if next == Some(HaState::Maintenance) {
                    self.set_write_enabled(true);
                }
                if next.is_some() {
                    self.drain_for_maintenance().await;
                }
                next
            }
            _ => None,
        };

        reached.ok_or(ConnError::HaStateChangeRejected {
            current: orig,
            requested,
        })
    }

    /// Give disallowed clients the grace period to finish, then terminate them.
    async fn drain_for_maintenance(&self) {
        let step = Duration::from_secs(1);
        let mut waited = Duration::ZERO;
        while waited < self.maintenance_grace {
            if self.txn.count_not_allowed_in_maintenance() == 0 {
                return;
            }
            let pause = step.min(self.maintenance_grace - waited);
            tokio::time::sleep(pause).await;
            waited += pause;
        }
        if self.txn.count_not_allowed_in_maintenance() != 0 {
            let killed = self.txn.terminate_not_allowed_in_maintenance();
            warn!(killed, "terminated transactions not allowed in maintenance");
            tokio::time::sleep(self.maintenance_settle).await;
        }
    }

    /// HA gate on client registration and unregistration.
    ///
    /// In `ToBeStandby` new clients are refused, and the last client
    /// leaving completes the move to `Standby`.
    pub fn check_state_for_client(&self, event: ClientEvent) -> Result<(), ConnError> {
        let mut inner = self.inner.lock();
        if inner.state != HaState::ToBeStandby {
            return Ok(());
        }
        match event {
            ClientEvent::Register => {
                debug!("connection rejected, server is changing to standby");
                Err(ConnError::RequestRefused)
            }
            ClientEvent::Unregister => {
                // The departing client is still counted
                if self.txn.count_active_clients() <= 1
                    && Self::transit_locked(&mut inner, HaState::Standby) == Some(HaState::Standby)
                {
                    drop(inner);
                    self.set_write_enabled(false);
                }
                Ok(())
            }
            ClientEvent::Other => Ok(()),
        }
    }

    /// Record a log applier's state and complete pending transitions.
    pub fn notify_log_applier_state(&self, client_id: u32, state: LogApplierState) {
        let mut inner = self.inner.lock();
        debug!(client_id, state = ?state, "log applier state");

        let known = inner.appliers.iter().position(|a| a.client_id == client_id);
        match known {
            Some(i) if inner.appliers[i].state == state => return,
            Some(i) => inner.appliers[i].state = state,
            None => {
                let reusable = inner
                    .appliers
                    .iter()
                    .position(|a| a.state == LogApplierState::Unregistered);
                match reusable {
                    Some(i) => inner.appliers[i] = ApplierSlot { client_id, state },
                    None if inner.appliers.len() < self.replica_hosts => {
                        inner.appliers.push(ApplierSlot { client_id, state })
                    }
                    None => {
                        warn!(client_id, "log applier table full");
                        return;
                    }
                }
            }
        }

        let mut enable = None;
        if self.appliers_done(&inner)
            && Self::transit_locked(&mut inner, HaState::Active) == Some(HaState::Active)
        {
            enable = Some(true);
        }
        if self.appliers_working(&inner)
            && Self::transit_locked(&mut inner, HaState::Standby) == Some(HaState::Standby)
        {
            enable = Some(false);
        }
        drop(inner);
        if let Some(on) = enable {
            self.set_write_enabled(on);
        }
    }
}
