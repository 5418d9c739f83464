//! EventBus for the `event` trigger kind (spec.md §4.7 table), grounded in
//! the original scheduler's publish/subscribe trigger with a condition
//! predicate matched against the published value.

use parking_lot::RwLock;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    In,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Operator::Eq),
            ">" => Some(Operator::Gt),
            "<" => Some(Operator::Lt),
            ">=" => Some(Operator::Ge),
            "<=" => Some(Operator::Le),
            "in" => Some(Operator::In),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl Condition {
    /// `value` must be a JSON object; `self.field` is read from it and
    /// compared against `self.value` with `self.op`.
    pub fn matches(&self, event_value: &Value) -> bool {
        let Some(actual) = event_value.get(&self.field) else {
            return false;
        };
        match self.op {
            Operator::Eq => actual == &self.value,
            Operator::In => self
                .value
                .as_array()
                .map(|arr| arr.iter().any(|v| v == actual))
                .unwrap_or(false),
            Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
                let (Some(a), Some(b)) = (actual.as_f64(), self.value.as_f64()) else {
                    return false;
                };
                match self.op {
                    Operator::Gt => a > b,
                    Operator::Lt => a < b,
                    Operator::Ge => a >= b,
                    Operator::Le => a <= b,
                    _ => unreachable!(),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PublishedEvent {
    event_type: String,
    value: Value,
}

/// In-memory publish/subscribe: `publish()` records the latest value seen
/// per `event_type`; `is_due(event_type, condition)` checks it against a
/// job's trigger condition during a scheduler tick.
#[derive(Default)]
pub struct EventBus {
    latest: RwLock<Vec<PublishedEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event_type: &str, value: Value) {
        let mut latest = self.latest.write();
        if let Some(existing) = latest.iter_mut().find(|e| e.event_type == event_type) {
            existing.value = value;
        } else {
            latest.push(PublishedEvent {
                event_type: event_type.to_string(),
                value,
            });
        }
    }

    pub fn is_due(&self, event_type: &str, condition: &Condition) -> bool {
        self.latest
            .read()
            .iter()
            .find(|e| e.event_type == event_type)
            .map(|e| condition.matches(&e.value))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_numeric_operators() {
        let bus = EventBus::new();
        bus.publish("price_alert", json!({"price": 105.0}));
        let cond = Condition { field: "price".into(), op: Operator::Gt, value: json!(100.0) };
        assert!(bus.is_due("price_alert", &cond));
        let cond_lt = Condition { field: "price".into(), op: Operator::Lt, value: json!(100.0) };
        assert!(!bus.is_due("price_alert", &cond_lt));
    }

    #[test]
    fn matches_in_operator() {
        let bus = EventBus::new();
        bus.publish("regime", json!({"state": "bull"}));
        let cond = Condition { field: "state".into(), op: Operator::In, value: json!(["bull", "neutral"]) };
        assert!(bus.is_due("regime", &cond));
    }

    #[test]
    fn unpublished_event_never_due() {
        let bus = EventBus::new();
        let cond = Condition { field: "x".into(), op: Operator::Eq, value: json!(1) };
        assert!(!bus.is_due("missing", &cond));
    }
}
