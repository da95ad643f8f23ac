//! Living-condition bookkeeping for PodIntent status.
//!
//! `ConventionsApplied` is the single tracked sub-condition; `Ready` is
//! derived from it and is `True` exactly when every tracked sub-condition is
//! `True`.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub const READY: &str = "Ready";
pub const CONVENTIONS_APPLIED: &str = "ConventionsApplied";

/// Reason carried by `Ready` when every tracked sub-condition is `True`.
const HAPPY_REASON: &str = "ConventionsApplied";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    True {
        reason: String,
    },
    False {
        reason: String,
        message: String,
    },
    Unknown {
        reason: String,
        message: String,
    },
}

/// Manages the tracked sub-conditions of an intent and derives `Ready`.
#[derive(Clone, Debug)]
pub struct Conditions {
    observed_generation: Option<i64>,
    conventions_applied: State,
}

// === impl State ===

impl State {
    fn status(&self) -> &'static str {
        match self {
            State::True { .. } => "True",
            State::False { .. } => "False",
            State::Unknown { .. } => "Unknown",
        }
    }

    fn reason(&self) -> &str {
        match self {
            State::True { reason }
            | State::False { reason, .. }
            | State::Unknown { reason, .. } => reason,
        }
    }

    fn message(&self) -> &str {
        match self {
            State::True { .. } => "",
            State::False { message, .. } | State::Unknown { message, .. } => message,
        }
    }

    fn to_condition(&self, type_: &str, observed_generation: Option<i64>) -> Condition {
        Condition {
            last_transition_time: Time(Utc::now()),
            message: self.message().to_string(),
            observed_generation,
            reason: self.reason().to_string(),
            status: self.status().to_string(),
            type_: type_.to_string(),
        }
    }
}

// === impl Conditions ===

impl Conditions {
    /// A fresh reconciliation starts from `Unknown/Initializing`; previously
    /// recorded conditions are superseded by whatever this pass concludes.
    pub fn initialize(observed_generation: Option<i64>) -> Self {
        Self {
            observed_generation,
            conventions_applied: State::Unknown {
                reason: "Initializing".to_string(),
                message: String::new(),
            },
        }
    }

    pub fn mark_applied(&mut self) {
        self.conventions_applied = State::True {
            reason: "Applied".to_string(),
        };
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        self.conventions_applied = State::False {
            reason: reason.into(),
            message: message.into(),
        };
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.conventions_applied, State::True { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.conventions_applied, State::False { .. })
    }

    /// Projects the tracked sub-conditions plus the derived `Ready` condition.
    /// `Ready` mirrors the most severe sub-condition; with a single tracked
    /// member that is a copy of its status, with the happy-path reason when
    /// everything is `True`.
    pub fn to_conditions(&self) -> Vec<Condition> {
        let ready = match &self.conventions_applied {
            State::True { .. } => State::True {
                reason: HAPPY_REASON.to_string(),
            },
            state => state.clone(),
        };
        vec![
            self.conventions_applied
                .to_condition(CONVENTIONS_APPLIED, self.observed_generation),
            ready.to_condition(READY, self.observed_generation),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_type<'c>(conditions: &'c [Condition], type_: &str) -> &'c Condition {
        conditions
            .iter()
            .find(|c| c.type_ == type_)
            .unwrap_or_else(|| panic!("missing condition {type_}"))
    }

    #[test]
    fn initializing_is_unknown() {
        let conditions = Conditions::initialize(Some(1)).to_conditions();
        let applied = by_type(&conditions, CONVENTIONS_APPLIED);
        assert_eq!(applied.status, "Unknown");
        assert_eq!(applied.reason, "Initializing");
        assert_eq!(applied.observed_generation, Some(1));
        assert_eq!(by_type(&conditions, READY).status, "Unknown");
    }

    #[test]
    fn applied_derives_ready_true() {
        let mut mgr = Conditions::initialize(None);
        mgr.mark_applied();
        assert!(mgr.is_applied());

        let conditions = mgr.to_conditions();
        let applied = by_type(&conditions, CONVENTIONS_APPLIED);
        assert_eq!(applied.status, "True");
        assert_eq!(applied.reason, "Applied");
        let ready = by_type(&conditions, READY);
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "ConventionsApplied");
    }

    #[test]
    fn failure_mirrors_onto_ready() {
        let mut mgr = Conditions::initialize(None);
        mgr.mark_failed("ImageResolutionFailed", "failed to authenticate: boom");
        assert!(mgr.is_failed());

        let conditions = mgr.to_conditions();
        for type_ in [CONVENTIONS_APPLIED, READY] {
            let c = by_type(&conditions, type_);
            assert_eq!(c.status, "False");
            assert_eq!(c.reason, "ImageResolutionFailed");
            assert_eq!(c.message, "failed to authenticate: boom");
        }
    }

    #[test]
    fn later_marks_supersede() {
        let mut mgr = Conditions::initialize(None);
        mgr.mark_failed("LabelSelector", "bad selector");
        mgr.mark_applied();
        assert!(mgr.is_applied());
        assert!(!mgr.is_failed());
    }
}
