//! Stateright models of the HA role machine and admission control.
//!
//! Both models drive the real code (`ha::transition`,
//! `AdmissionController`) and check invariants over every reachable state
//! up to a bound.
//!
//! ```bash
//! # Exhaustive checks are marked #[ignore] for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod admission_model;
pub mod ha_model;

pub use admission_model::AdmissionModel;
pub use ha_model::HaRoleModel;
