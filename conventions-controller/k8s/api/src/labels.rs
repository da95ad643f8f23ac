use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects workloads by label. The result of `match_labels` and
/// `match_expressions` are ANDed.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSelector {
    #[error("operator {0:?} requires a non-empty values list for key {1:?}")]
    MissingValues(Operator, String),

    #[error("operator {0:?} must not carry values for key {1:?}")]
    UnexpectedValues(Operator, String),
}

// === impl Selector ===

impl Selector {
    pub fn new(labels: Map, exprs: Expressions) -> Self {
        Self {
            match_labels: Some(labels),
            match_expressions: Some(exprs),
        }
    }

    fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    /// Indicates whether this selector matches all workloads.
    pub fn selects_all(&self) -> bool {
        match (self.match_labels.as_ref(), self.match_expressions.as_ref()) {
            (None, None) => true,
            (Some(l), None) => l.is_empty(),
            (None, Some(e)) => e.is_empty(),
            (Some(l), Some(e)) => l.is_empty() && e.is_empty(),
        }
    }

    /// Checks that every expression is structurally sound. Matching against a
    /// selector that fails validation must be treated as an error by callers,
    /// not as a non-match.
    pub fn validate(&self) -> Result<(), InvalidSelector> {
        for expr in self.match_expressions.iter().flatten() {
            expr.validate()?;
        }
        Ok(())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === impl Labels ===

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === impl Expression ===

impl Expression {
    pub fn new(key: String, operator: Operator, values: Option<BTreeSet<String>>) -> Self {
        Self {
            key,
            operator,
            values,
        }
    }

    fn validate(&self) -> Result<(), InvalidSelector> {
        match (self.operator, self.values.as_ref()) {
            (Operator::In | Operator::NotIn, Some(values)) if !values.is_empty() => Ok(()),
            (op @ (Operator::In | Operator::NotIn), _) => {
                Err(InvalidSelector::MissingValues(op, self.key.clone()))
            }
            (Operator::Exists | Operator::DoesNotExist, None) => Ok(()),
            (Operator::Exists | Operator::DoesNotExist, Some(values)) if values.is_empty() => {
                Ok(())
            }
            (op, _) => Err(InvalidSelector::UnexpectedValues(op, self.key.clone())),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match (self.operator, &self.key, self.values.as_ref()) {
            (Operator::In, key, Some(values)) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            (Operator::NotIn, key, Some(values)) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            (Operator::Exists, key, _) => labels.contains_key(key),
            (Operator::DoesNotExist, key, _) => !labels.contains_key(key),
            // validate() rejects these before matching is attempted.
            (_, _, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("app", "web"))),
                Labels::from_iter(Some(("app", "web"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("app", "web"))),
                Labels::from_iter(vec![("app", "web"), ("tier", "front")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "app".into(),
                    Operator::In,
                    Some(Some("web".to_string()).into_iter().collect()),
                ))),
                Labels::from_iter(vec![("app", "web"), ("tier", "front")]),
                true,
                "In expression match",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "app".into(),
                    Operator::NotIn,
                    Some(Some("api".to_string()).into_iter().collect()),
                ))),
                Labels::from_iter(vec![("app", "web"), ("tier", "front")]),
                true,
                "NotIn expression match",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "app".into(),
                    Operator::NotIn,
                    Some(Some("web".to_string()).into_iter().collect()),
                ))),
                Labels::from_iter(vec![("app", "web"), ("tier", "front")]),
                false,
                "NotIn expression non-match",
            ),
            (
                Selector::new(
                    Map::from([("app".to_string(), "web".to_string())]),
                    vec![Expression::new(
                        "tier".into(),
                        Operator::In,
                        Some(Some("back".to_string()).into_iter().collect()),
                    )],
                ),
                Labels::from_iter(vec![("app", "web"), ("tier", "front")]),
                false,
                "matches labels but not expressions",
            ),
            (
                Selector::new(
                    Map::from([("app".to_string(), "web".to_string())]),
                    vec![Expression::new(
                        "tier".into(),
                        Operator::In,
                        Some(Some("front".to_string()).into_iter().collect()),
                    )],
                ),
                Labels::from_iter(vec![("app", "web"), ("tier", "front")]),
                true,
                "matches both labels and expressions",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn validate_rejects_in_without_values() {
        let selector = Selector::from_iter(Some(Expression::new("app".into(), Operator::In, None)));
        assert_eq!(
            selector.validate(),
            Err(InvalidSelector::MissingValues(Operator::In, "app".into())),
        );
    }

    #[test]
    fn validate_rejects_exists_with_values() {
        let selector = Selector::from_iter(Some(Expression::new(
            "app".into(),
            Operator::Exists,
            Some(Some("web".to_string()).into_iter().collect()),
        )));
        assert_eq!(
            selector.validate(),
            Err(InvalidSelector::UnexpectedValues(
                Operator::Exists,
                "app".into()
            )),
        );
    }

    #[test]
    fn empty_selector_selects_all() {
        assert!(Selector::default().selects_all());
        assert!(Selector::from_map(Map::default()).selects_all());
        assert!(!Selector::from_iter(Some(("app", "web"))).selects_all());
    }
}
