//! HA role model
//!
//! Checks that write access follows the role:
//! - STANDBY_READ_ONLY: Standby and ToBeActive never accept writes
//! - ACTIVE_WRITABLE: Active always accepts writes
//! - NEVER_DEAD: no request sequence reaches Dead

use crate::ha::{transition, HaState};
use stateright::{Model, Property};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HaRoleState {
    pub role: HaState,
    pub write_enabled: bool,
    pub clients: u8,
    pub appliers_done: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HaAction {
    Request(HaState),
    ClientJoin,
    ClientLeave,
    ApplierDone,
}

pub struct HaRoleModel {
    pub initial: Vec<HaState>,
    pub max_clients: u8,
}

impl Default for HaRoleModel {
    fn default() -> Self {
        HaRoleModel {
            initial: vec![HaState::Idle, HaState::Standby],
            max_clients: 2,
        }
    }
}

impl Model for HaRoleModel {
    type State = HaRoleState;
    type Action = HaAction;

    fn init_states(&self) -> Vec<Self::State> {
        self.initial
            .iter()
            .map(|&role| HaRoleState {
                role,
                write_enabled: !matches!(role, HaState::Standby | HaState::ToBeActive | HaState::Dead),
                clients: 0,
                appliers_done: false,
            })
            .collect()
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        // Unforced requests in a ToBe* state are ignored by the controller
        let settled = !matches!(state.role, HaState::ToBeActive | HaState::ToBeStandby);
        for requested in [HaState::Active, HaState::Standby, HaState::Maintenance] {
            if settled && state.role != requested && transition(state.role, requested).is_some() {
                actions.push(HaAction::Request(requested));
            }
        }
        if state.role != HaState::ToBeStandby && state.clients < self.max_clients {
            actions.push(HaAction::ClientJoin);
        }
        if state.clients > 0 {
            actions.push(HaAction::ClientLeave);
        }
        if !state.appliers_done {
            actions.push(HaAction::ApplierDone);
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            HaAction::Request(requested) => {
                next.role = transition(state.role, requested)?;
                match requested {
                    HaState::Active => {
                        if next.role == HaState::ToBeActive && next.appliers_done {
                            next.role = transition(next.role, HaState::Active)?;
                        }
                        if next.role == HaState::Active {
                            next.write_enabled = true;
                        }
                    }
                    HaState::Standby => {
                        if next.role == HaState::ToBeStandby && next.clients == 0 {
                            next.role = transition(next.role, HaState::Standby)?;
                        }
                        if next.role == HaState::Standby {
                            next.write_enabled = false;
                        }
                    }
                    HaState::Maintenance => next.write_enabled = true,
                    _ => return None,
                }
            }
            HaAction::ClientJoin => next.clients += 1,
            HaAction::ClientLeave => {
                if next.role == HaState::ToBeStandby && next.clients == 1 {
                    next.role = HaState::Standby;
                    next.write_enabled = false;
                }
                next.clients -= 1;
            }
            HaAction::ApplierDone => {
                next.appliers_done = true;
                if next.role == HaState::ToBeActive {
                    next.role = HaState::Active;
                    next.write_enabled = true;
                }
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("standby_read_only", |_: &HaRoleModel, s: &HaRoleState| {
                !matches!(s.role, HaState::Standby | HaState::ToBeActive) || !s.write_enabled
            }),
            Property::always("active_writable", |_: &HaRoleModel, s: &HaRoleState| {
                s.role != HaState::Active || s.write_enabled
            }),
            Property::always("never_dead", |_: &HaRoleModel, s: &HaRoleState| {
                s.role != HaState::Dead
            }),
            Property::sometimes("reaches_active", |_: &HaRoleModel, s: &HaRoleState| {
                s.role == HaState::Active
            }),
            Property::sometimes("fails_back_to_standby", |_: &HaRoleModel, s: &HaRoleState| {
                s.role == HaState::Standby && s.appliers_done
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn test_promotion_waits_for_appliers() {
        let model = HaRoleModel::default();
        let standby = &model.init_states()[1];
        let s = model
            .next_state(standby, HaAction::Request(HaState::Active))
            .unwrap();
        assert_eq!(s.role, HaState::ToBeActive);
        assert!(!s.write_enabled);
        let s = model.next_state(&s, HaAction::ApplierDone).unwrap();
        assert_eq!(s.role, HaState::Active);
        assert!(s.write_enabled);
    }

    #[test]
    fn test_rejected_request_not_enabled() {
        let model = HaRoleModel::default();
        let idle = &model.init_states()[0];
        let s = model.next_state(idle, HaAction::Request(HaState::Active)).unwrap();
        let mut actions = Vec::new();
        model.actions(&s, &mut actions);
        assert!(!actions.contains(&HaAction::Request(HaState::Maintenance)));
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_ha -- --ignored --nocapture
    fn stateright_ha_model_check() {
        let checker = HaRoleModel::default().checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }
}
