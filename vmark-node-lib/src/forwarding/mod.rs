//! MEF-style VLAN forwarding: rule model, persistent store, egress-pair
//! derivation and the engine that programs the kernel map.

mod egress;
mod engine;
mod rule;
mod store;

pub use egress::derive_egress;
pub use engine::ForwardingEngine;
pub use rule::{egress_name_for, Rule};
pub use store::RuleStore;
