mod engine;
pub mod types;
mod window;

pub use engine::{ActiveAlert, AlertAction, AlertPolicy, AlertStatus, RuleEngine, WindowKey};
pub use types::{parse_rule_kind, Rule, RuleSpec};
pub use window::{Observation, WindowPoint};
