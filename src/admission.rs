//! Admission control per client class.
//!
//! Every connection draws one unit either from the shared pool
//! (`admission.max_clients`) or from the reserved budget of the rule that
//! matches its class:
//!
//! - `ExclusiveOnly`: own budget only.
//! - `NormalFirst`: shared pool first, own budget once the pool is full.
//! - `ReservedFirst`: own budget first, shared pool once it is spent.
//!
//! When a shared unit is freed, the first `NormalFirst` rule (in
//! registration order) that is living on its reserved budget moves one
//! holder back onto the shared pool, so reserved capacity is handed back
//! as early as possible. All counters live behind one lock.

use crate::error::ConnError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Client classes, announced in the connect request's function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientClass {
    Normal,
    ReadOnly,
    Broker,
    ReadOnlyBroker,
    AdminUtility,
    LogCopier,
    LogApplier,
}

impl ClientClass {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ClientClass::Normal),
            2 => Some(ClientClass::ReadOnly),
            3 => Some(ClientClass::Broker),
            4 => Some(ClientClass::ReadOnlyBroker),
            5 => Some(ClientClass::AdminUtility),
            6 => Some(ClientClass::LogCopier),
            7 => Some(ClientClass::LogApplier),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            ClientClass::Normal => 1,
            ClientClass::ReadOnly => 2,
            ClientClass::Broker => 3,
            ClientClass::ReadOnlyBroker => 4,
            ClientClass::AdminUtility => 5,
            ClientClass::LogCopier => 6,
            ClientClass::LogApplier => 7,
        }
    }

    /// Log-copier connections feed log-writer workers, which are stopped
    /// in the second shutdown phase.
    pub fn is_log_writer(self) -> bool {
        matches!(self, ClientClass::LogCopier)
    }

    pub fn allowed_in_maintenance(self) -> bool {
        matches!(
            self,
            ClientClass::AdminUtility | ClientClass::LogCopier | ClientClass::LogApplier
        )
    }
}

impl fmt::Display for ClientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ExclusiveOnly,
    NormalFirst,
    ReservedFirst,
}

/// A configured admission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRule {
    pub name: String,
    pub classes: Vec<ClientClass>,
    pub kind: RuleKind,
    /// Reserved budget of this rule
    pub max: usize,
}

impl AdmissionRule {
    pub fn new(name: impl Into<String>, classes: Vec<ClientClass>, kind: RuleKind, max: usize) -> Self {
        AdmissionRule {
            name: name.into(),
            classes,
            kind,
            max,
        }
    }
}

/// Proof of admission, returned to the controller on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTicket {
    rule: Option<usize>,
    class: ClientClass,
}

impl AdmissionTicket {
    pub fn class(&self) -> ClientClass {
        self.class
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub name: String,
    pub kind: RuleKind,
    pub max: usize,
    pub reserved_in_use: usize,
    pub shared_in_use: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub shared_max: usize,
    pub shared_in_use: usize,
    pub rules: Vec<RuleStats>,
}

#[derive(Debug)]
struct RuleState {
    rule: AdmissionRule,
    /// Units drawn from this rule's reserved budget
    reserved: usize,
    /// Units this rule's holders draw from the shared pool
    shared: usize,
}

#[derive(Debug)]
struct AdmissionState {
    shared_max: usize,
    shared_used: usize,
    /// Shared units held by classes without a rule
    unruled: usize,
    rules: Vec<RuleState>,
}

impl AdmissionState {
    #[inline]
    fn shared_available(&self) -> bool {
        self.shared_used < self.shared_max
    }

    /// Give a freed shared unit to the first NormalFirst rule on a reserved loan.
    fn reclaim_loan(&mut self) {
        if !self.shared_available() {
            return;
        }
        let candidate = self
            .rules
            .iter_mut()
            .find(|r| r.rule.kind == RuleKind::NormalFirst && r.reserved > 0);
        if let Some(rule) = candidate {
            rule.reserved -= 1;
            rule.shared += 1;
            self.shared_used += 1;
            debug!(rule = %rule.rule.name, "reserved loan moved back to shared pool");
        }
    }

    fn release_shared(&mut self) {
        debug_assert!(self.shared_used > 0, "shared pool underflow");
        self.shared_used = self.shared_used.saturating_sub(1);
        self.reclaim_loan();
    }
}

pub struct AdmissionController {
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(shared_max: usize, rules: Vec<AdmissionRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| RuleState {
                rule,
                reserved: 0,
                shared: 0,
            })
            .collect();
        AdmissionController {
            state: Mutex::new(AdmissionState {
                shared_max,
                shared_used: 0,
                unruled: 0,
                rules,
            }),
        }
    }

    /// Admit one client of `class`, or `ClientsExceeded`.
    pub fn admit(&self, class: ClientClass) -> Result<AdmissionTicket, ConnError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let index = st.rules.iter().position(|r| r.rule.classes.contains(&class));

        let Some(i) = index else {
            if !st.shared_available() {
                return Err(ConnError::ClientsExceeded);
            }
            st.shared_used += 1;
            st.unruled += 1;
            return Ok(AdmissionTicket { rule: None, class });
        };

        let shared_available = st.shared_available();
        let rule = &mut st.rules[i];
        let own_available = rule.reserved < rule.rule.max;
        let use_shared = match rule.rule.kind {
            RuleKind::ExclusiveOnly if own_available => false,
            RuleKind::NormalFirst if shared_available => true,
            RuleKind::NormalFirst if own_available => false,
            RuleKind::ReservedFirst if own_available => false,
            RuleKind::ReservedFirst if shared_available => true,
            _ => {
                debug!(class = %class, rule = %rule.rule.name, "admission denied");
                return Err(ConnError::ClientsExceeded);
            }
        };
        if use_shared {
            rule.shared += 1;
            st.shared_used += 1;
        } else {
            rule.reserved += 1;
        }
        Ok(AdmissionTicket {
            rule: Some(i),
            class,
        })
    }

    pub fn release(&self, ticket: AdmissionTicket) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(i) = ticket.rule else {
            debug_assert!(st.unruled > 0, "unruled counter underflow");
            st.unruled = st.unruled.saturating_sub(1);
            st.release_shared();
            return;
        };

        let rule = &mut st.rules[i];
        // Holders of one rule are interchangeable; give back whichever
        // unit frees capacity for the rest of the server first.
        let from_shared = match rule.rule.kind {
            RuleKind::ExclusiveOnly => false,
            RuleKind::NormalFirst => rule.reserved == 0,
            RuleKind::ReservedFirst => rule.shared > 0,
        };
        if from_shared {
            debug_assert!(rule.shared > 0, "rule {} shared underflow", rule.rule.name);
            rule.shared = rule.shared.saturating_sub(1);
            st.release_shared();
        } else {
            debug_assert!(rule.reserved > 0, "rule {} reserved underflow", rule.rule.name);
            rule.reserved = rule.reserved.saturating_sub(1);
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let st = self.state.lock();
        AdmissionStats {
            shared_max: st.shared_max,
            shared_in_use: st.shared_used,
            rules: st
                .rules
                .iter()
                .map(|r| RuleStats {
                    name: r.rule.name.clone(),
                    kind: r.rule.kind,
                    max: r.rule.max,
                    reserved_in_use: r.reserved,
                    shared_in_use: r.shared,
                })
                .collect(),
        }
    }

    /// Total admitted clients across the shared pool and all rules.
    pub fn admitted(&self) -> usize {
        let st = self.state.lock();
        st.shared_used + st.rules.iter().map(|r| r.reserved).sum::<usize>()
    }

    /// Verify all invariants hold (TigerStyle)
    pub fn verify_invariants(&self) {
        let st = self.state.lock();
        assert!(
            st.shared_used <= st.shared_max,
            "shared pool {} exceeds max {}",
            st.shared_used,
            st.shared_max
        );
        let shared_by_rules: usize = st.rules.iter().map(|r| r.shared).sum();
        assert_eq!(
            st.shared_used,
            st.unruled + shared_by_rules,
            "shared pool accounting mismatch"
        );
        for r in &st.rules {
            assert!(
                r.reserved <= r.rule.max,
                "rule {} reserved {} exceeds max {}",
                r.rule.name,
                r.reserved,
                r.rule.max
            );
            if r.rule.kind == RuleKind::ExclusiveOnly {
                assert_eq!(r.shared, 0, "exclusive rule {} uses shared pool", r.rule.name);
            }
        }
    }
}
