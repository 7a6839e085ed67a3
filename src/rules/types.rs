use std::fmt;
use uuid::Uuid;

pub const RULE_TYPE_THRESHOLD: &str = "THRESHOLD";
pub const RULE_TYPE_ROC: &str = "ROC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl CompareOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Gte),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Lte),
            "==" => Some(CompareOp::Eq),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Eq => "==",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

pub fn compare(value: f64, op: CompareOp, threshold: f64) -> bool {
    match op {
        CompareOp::Lt => value < threshold,
        CompareOp::Lte => value <= threshold,
        CompareOp::Gt => value > threshold,
        CompareOp::Gte => value >= threshold,
        CompareOp::Eq => (value - threshold).abs() <= f64::EPSILON,
    }
}

/// Which sign of change a rate-of-change rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RocDirection {
    #[default]
    Any,
    Increase,
    Decrease,
}

impl RocDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "any" | "abs" => Some(RocDirection::Any),
            "increase" | "up" => Some(RocDirection::Increase),
            "decrease" | "down" => Some(RocDirection::Decrease),
            _ => None,
        }
    }

    pub fn exceeds(self, delta: f64, limit: f64) -> bool {
        match self {
            RocDirection::Any => delta.abs() > limit,
            RocDirection::Increase => delta > limit,
            RocDirection::Decrease => -delta > limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    Threshold {
        operator: CompareOp,
        value: f64,
    },
    RateOfChange {
        window_seconds: i64,
        roc_value: f64,
        direction: RocDirection,
    },
}

impl RuleKind {
    pub fn type_label(&self) -> &'static str {
        match self {
            RuleKind::Threshold { .. } => RULE_TYPE_THRESHOLD,
            RuleKind::RateOfChange { .. } => RULE_TYPE_ROC,
        }
    }

    pub fn window_seconds(&self) -> Option<i64> {
        match self {
            RuleKind::RateOfChange { window_seconds, .. } => Some(*window_seconds),
            RuleKind::Threshold { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub asset_code: String,
    pub sensor: String,
    pub name: String,
    pub enabled: bool,
    pub kind: RuleKind,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleConfigError {
    #[error("unknown rule type `{0}`")]
    UnknownType(String),
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    #[error("{rule_type} rule requires `{field}`")]
    MissingField {
        rule_type: &'static str,
        field: &'static str,
    },
    #[error("`{0}` must be finite")]
    NonFinite(&'static str),
    #[error("window_seconds must be >= 1, got {0}")]
    InvalidWindow(i64),
    #[error("roc_value must be >= 0, got {0}")]
    NegativeRocValue(f64),
    #[error("unknown roc direction `{0}`")]
    UnknownDirection(String),
}

/// Raw rule columns as stored; only the fields selected by `rule_type` are consulted.
#[derive(Debug, Clone, Default)]
pub struct RuleSpec<'a> {
    pub rule_type: &'a str,
    pub operator: Option<&'a str>,
    pub value: Option<f64>,
    pub window_seconds: Option<i64>,
    pub roc_value: Option<f64>,
    pub roc_direction: Option<&'a str>,
}

pub fn parse_rule_kind(spec: &RuleSpec<'_>) -> Result<RuleKind, RuleConfigError> {
    match spec.rule_type.trim().to_ascii_uppercase().as_str() {
        RULE_TYPE_THRESHOLD => {
            let raw_op = spec.operator.ok_or(RuleConfigError::MissingField {
                rule_type: RULE_TYPE_THRESHOLD,
                field: "operator",
            })?;
            let operator = CompareOp::parse(raw_op)
                .ok_or_else(|| RuleConfigError::UnknownOperator(raw_op.to_string()))?;
            let value = spec.value.ok_or(RuleConfigError::MissingField {
                rule_type: RULE_TYPE_THRESHOLD,
                field: "value",
            })?;
            if !value.is_finite() {
                return Err(RuleConfigError::NonFinite("value"));
            }
            Ok(RuleKind::Threshold { operator, value })
        }
        RULE_TYPE_ROC => {
            let window_seconds = spec.window_seconds.ok_or(RuleConfigError::MissingField {
                rule_type: RULE_TYPE_ROC,
                field: "window_seconds",
            })?;
            if window_seconds < 1 {
                return Err(RuleConfigError::InvalidWindow(window_seconds));
            }
            let roc_value = spec.roc_value.ok_or(RuleConfigError::MissingField {
                rule_type: RULE_TYPE_ROC,
                field: "roc_value",
            })?;
            if !roc_value.is_finite() {
                return Err(RuleConfigError::NonFinite("roc_value"));
            }
            if roc_value < 0.0 {
                return Err(RuleConfigError::NegativeRocValue(roc_value));
            }
            let direction = match spec.roc_direction.map(str::trim).filter(|v| !v.is_empty()) {
                Some(raw) => RocDirection::parse(raw)
                    .ok_or_else(|| RuleConfigError::UnknownDirection(raw.to_string()))?,
                None => RocDirection::Any,
            };
            Ok(RuleKind::RateOfChange {
                window_seconds,
                roc_value,
                direction,
            })
        }
        _ => Err(RuleConfigError::UnknownType(spec.rule_type.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(op: &'static str, value: f64) -> RuleSpec<'static> {
        RuleSpec {
            rule_type: "THRESHOLD",
            operator: Some(op),
            value: Some(value),
            ..RuleSpec::default()
        }
    }

    #[test]
    fn compare_covers_every_operator() {
        assert!(compare(85.0, CompareOp::Gt, 80.0));
        assert!(!compare(80.0, CompareOp::Gt, 80.0));
        assert!(compare(80.0, CompareOp::Gte, 80.0));
        assert!(compare(79.0, CompareOp::Lt, 80.0));
        assert!(compare(80.0, CompareOp::Lte, 80.0));
        assert!(compare(0.1 + 0.2, CompareOp::Eq, 0.3));
        assert!(!compare(80.5, CompareOp::Eq, 80.0));
    }

    #[test]
    fn parses_threshold_rule() {
        let kind = parse_rule_kind(&threshold(">", 80.0)).expect("valid");
        assert_eq!(
            kind,
            RuleKind::Threshold {
                operator: CompareOp::Gt,
                value: 80.0
            }
        );
        assert_eq!(kind.type_label(), "THRESHOLD");
        assert_eq!(kind.window_seconds(), None);
    }

    #[test]
    fn threshold_ignores_roc_columns_and_vice_versa() {
        let spec = RuleSpec {
            window_seconds: Some(-5),
            roc_value: Some(f64::NAN),
            ..threshold("<=", 3.0)
        };
        assert!(parse_rule_kind(&spec).is_ok());

        let spec = RuleSpec {
            rule_type: "roc",
            operator: Some("bogus"),
            window_seconds: Some(60),
            roc_value: Some(15.0),
            ..RuleSpec::default()
        };
        let kind = parse_rule_kind(&spec).expect("valid");
        assert_eq!(
            kind,
            RuleKind::RateOfChange {
                window_seconds: 60,
                roc_value: 15.0,
                direction: RocDirection::Any
            }
        );
    }

    #[test]
    fn rejects_malformed_rules() {
        assert_eq!(
            parse_rule_kind(&threshold("=>", 1.0)),
            Err(RuleConfigError::UnknownOperator("=>".to_string()))
        );
        assert_eq!(
            parse_rule_kind(&threshold(">", f64::INFINITY)),
            Err(RuleConfigError::NonFinite("value"))
        );
        assert!(matches!(
            parse_rule_kind(&RuleSpec {
                rule_type: "THRESHOLD",
                operator: Some(">"),
                ..RuleSpec::default()
            }),
            Err(RuleConfigError::MissingField { field: "value", .. })
        ));
        assert_eq!(
            parse_rule_kind(&RuleSpec {
                rule_type: "ROC",
                window_seconds: Some(0),
                roc_value: Some(1.0),
                ..RuleSpec::default()
            }),
            Err(RuleConfigError::InvalidWindow(0))
        );
        assert_eq!(
            parse_rule_kind(&RuleSpec {
                rule_type: "ROC",
                window_seconds: Some(60),
                roc_value: Some(1.0),
                roc_direction: Some("sideways"),
                ..RuleSpec::default()
            }),
            Err(RuleConfigError::UnknownDirection("sideways".to_string()))
        );
        assert_eq!(
            parse_rule_kind(&RuleSpec {
                rule_type: "ANOMALY",
                ..RuleSpec::default()
            }),
            Err(RuleConfigError::UnknownType("ANOMALY".to_string()))
        );
    }

    #[test]
    fn direction_controls_which_deltas_fire() {
        assert!(RocDirection::Any.exceeds(-16.0, 15.0));
        assert!(RocDirection::Any.exceeds(16.0, 15.0));
        assert!(!RocDirection::Any.exceeds(15.0, 15.0));
        assert!(RocDirection::Increase.exceeds(16.0, 15.0));
        assert!(!RocDirection::Increase.exceeds(-16.0, 15.0));
        assert!(RocDirection::Decrease.exceeds(-16.0, 15.0));
        assert!(!RocDirection::Decrease.exceeds(16.0, 15.0));
    }
}
