//! Kubernetes label selectors
//!
//! Two inputs produce a [`Selector`]: the structured `LabelSelector` found in
//! CRD specs, and the string form (`app=web,tier in (a,b),!canary`) that
//! arrives in `?labelSelector=` query parameters. Both end up as kube
//! [`Expression`]s, which also do the matching. Expressions are kept sorted
//! so two selectors that mean the same thing compare equal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Expression, SelectorExt};

use crate::Error;

/// Maximum length of a label value
const MAX_VALUE_LEN: usize = 63;

/// A conjunction of label expressions. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    expressions: Vec<Expression>,
}

impl Selector {
    /// Selector that matches every label set
    pub fn everything() -> Self {
        Self::default()
    }

    /// Build from checked expressions; order does not matter
    fn from_expressions(expressions: impl IntoIterator<Item = Expression>) -> Self {
        let mut expressions: Vec<Expression> = expressions.into_iter().collect();
        expressions.sort_by_cached_key(|e| e.to_string());
        expressions.dedup();
        Self { expressions }
    }

    /// True when the selector has no expressions
    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    /// Expressions, sorted
    pub fn expressions(&self) -> &[Expression] {
        &self.expressions
    }

    /// Whether every expression holds for `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.expressions.iter().all(|e| e.matches(labels))
    }

    /// Conjunction of two selectors
    pub fn and(&self, other: &Selector) -> Selector {
        Self::from_expressions(
            self.expressions
                .iter()
                .chain(other.expressions.iter())
                .cloned(),
        )
    }

    /// `(key, value)` pairs for expressions that pin a key to one value
    ///
    /// Cloud backends that only understand dimension equality filters use
    /// these; other expression kinds are not representable there.
    pub fn pinned_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.expressions.iter().filter_map(pinned_pair)
    }

    /// The same selector as kube's type, for list and watch parameters
    pub fn to_kube(&self) -> kube::core::Selector {
        self.expressions.iter().cloned().collect()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_kube(), f)
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = Error;

    fn try_from(selector: &LabelSelector) -> Result<Self, Self::Error> {
        for requirement in selector.match_expressions.iter().flatten() {
            let existence = matches!(requirement.operator.as_str(), "Exists" | "DoesNotExist");
            if existence && requirement.values.as_ref().is_some_and(|v| !v.is_empty()) {
                return Err(Error::selector(
                    requirement.key.as_str(),
                    "existence requirements take no values",
                ));
            }
        }

        let parsed = kube::core::Selector::try_from(selector.clone())
            .map_err(|e| Error::selector(structured_text(selector), e.0))?;
        let expressions = parsed
            .into_iter()
            .map(checked)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_expressions(expressions))
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut expressions = Vec::new();
        for term in split_terms(input)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let expression = parse_term(term).map_err(|msg| Error::selector(input, msg))?;
            expressions.push(checked(expression)?);
        }
        Ok(Self::from_expressions(expressions))
    }
}

fn pinned_pair(expression: &Expression) -> Option<(&str, &str)> {
    match expression {
        Expression::Equal(key, value) => Some((key.as_str(), value.as_str())),
        Expression::In(key, values) if values.len() == 1 => {
            values.iter().next().map(|v| (key.as_str(), v.as_str()))
        }
        _ => None,
    }
}

/// Enough of a structured selector to name it in errors
fn structured_text(selector: &LabelSelector) -> String {
    let labels = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v));
    let expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .map(|e| format!("{} {}", e.key, e.operator));
    labels.chain(expressions).collect::<Vec<_>>().join(",")
}

/// Syntax and arity checks kube leaves to the API server
fn checked(expression: Expression) -> Result<Expression, Error> {
    let (key, values): (&str, Option<&BTreeSet<String>>) = match &expression {
        Expression::In(key, values) | Expression::NotIn(key, values) => {
            if values.is_empty() {
                return Err(Error::selector(
                    key.as_str(),
                    "set requirements need at least one value",
                ));
            }
            (key.as_str(), Some(values))
        }
        Expression::Equal(key, value) | Expression::NotEqual(key, value) => {
            validate_value(key, value)?;
            (key.as_str(), None)
        }
        Expression::Exists(key) | Expression::DoesNotExist(key) => (key.as_str(), None),
    };

    validate_key(key)?;
    for v in values.into_iter().flatten() {
        validate_value(key, v)?;
    }
    Ok(expression)
}

/// Split on commas that are not inside a `( … )` value list
fn split_terms(input: &str) -> Result<Vec<&str>, Error> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '(' => {
                if depth > 0 {
                    return Err(Error::selector(input, "nested parentheses"));
                }
                depth += 1;
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::selector(input, "unbalanced ')'"))?;
            }
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(Error::selector(input, "unterminated value list"));
    }
    terms.push(&input[start..]);
    Ok(terms)
}

fn parse_term(term: &str) -> Result<Expression, String> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Expression::DoesNotExist(key.trim().to_string()));
    }

    if let Some((key, rest)) = term.split_once(" notin ") {
        return Ok(Expression::NotIn(key.trim().to_string(), value_list(key, rest)?));
    }
    if let Some((key, rest)) = term.split_once(" in ") {
        return Ok(Expression::In(key.trim().to_string(), value_list(key, rest)?));
    }

    let equality = term
        .split_once("!=")
        .map(|(k, v)| (k, v, false))
        .or_else(|| term.split_once("==").map(|(k, v)| (k, v, true)))
        .or_else(|| term.split_once('=').map(|(k, v)| (k, v, true)));

    Ok(match equality {
        Some((key, value, true)) => Expression::Equal(key.trim().to_string(), value.trim().to_string()),
        Some((key, value, false)) => Expression::NotEqual(key.trim().to_string(), value.trim().to_string()),
        None => Expression::Exists(term.to_string()),
    })
}

fn value_list(key: &str, rest: &str) -> Result<BTreeSet<String>, String> {
    let list = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| format!("expected '(values)' after '{}'", key.trim()))?;

    Ok(list
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

/// Keys are `[prefix/]name`; both parts use DNS-ish characters.
fn validate_key(key: &str) -> Result<(), Error> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty()
                || !prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
            {
                return Err(Error::selector(key, "invalid key prefix"));
            }
            name
        }
        None => key,
    };

    if name.is_empty() || name.len() > MAX_VALUE_LEN {
        return Err(Error::selector(key, "key name must be 1-63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::selector(key, "key contains invalid characters"));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), Error> {
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::selector(key, "value longer than 63 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::selector(
            key,
            format!("value '{}' contains invalid characters", value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use kube::core::SelectorExt;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: Selector = "".parse().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn parses_every_operator() {
        let sel: Selector = "app=web,tier!=db,env in (prod, staging),zone notin (a),canary,!legacy"
            .parse()
            .unwrap();
        assert_eq!(sel.expressions().len(), 6);

        let hit = labels(&[
            ("app", "web"),
            ("tier", "frontend"),
            ("env", "prod"),
            ("zone", "b"),
            ("canary", "true"),
        ]);
        assert!(sel.matches(&hit));

        let mut miss = hit.clone();
        miss.insert("legacy".into(), "yes".into());
        assert!(!sel.matches(&miss));

        let mut miss = hit.clone();
        miss.insert("env".into(), "dev".into());
        assert!(!sel.matches(&miss));
    }

    #[test]
    fn negative_operators_match_absent_keys() {
        let sel: Selector = "tier!=db,zone notin (a)".parse().unwrap();
        assert!(sel.matches(&labels(&[])));
        assert!(!sel.matches(&labels(&[("tier", "db")])));
    }

    #[test]
    fn double_equals_is_equality() {
        let a: Selector = "app==web".parse().unwrap();
        let b: Selector = "app=web".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn requirement_order_does_not_matter() {
        let a: Selector = "b=2,a=1".parse().unwrap();
        let b: Selector = "a=1,b=2".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "a=1,b=2");
    }

    #[test]
    fn display_round_trips_through_parse() {
        let sel: Selector = "env in (staging,prod),!legacy,app=web".parse().unwrap();
        let reparsed: Selector = sel.to_string().parse().unwrap();
        assert_eq!(sel, reparsed);
    }

    #[test]
    fn rejects_malformed_selectors() {
        for bad in [
            "env in (a,b",
            "env in a,b)",
            "env in ()",
            "=value",
            "app=we b",
            "bad key=1",
            "/name=1",
        ] {
            assert!(bad.parse::<Selector>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn converts_structured_label_selector() {
        let ls = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: "In".into(),
                values: Some(vec!["prod".into()]),
            }]),
        };
        let sel = Selector::try_from(&ls).unwrap();
        let expected: Selector = "app=web,env in (prod)".parse().unwrap();
        assert_eq!(sel, expected);
    }

    #[test]
    fn structured_selector_rejects_unknown_operator() {
        let ls = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: "Like".into(),
                values: None,
            }]),
        };
        let err = Selector::try_from(&ls).unwrap_err();
        assert!(matches!(&err, Error::Selector { selector, .. } if selector == "env Like"));
        assert!(err.to_string().contains("operator"));
    }

    #[test]
    fn structured_exists_with_values_is_rejected() {
        let ls = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: "Exists".into(),
                values: Some(vec!["x".into()]),
            }]),
        };
        assert!(Selector::try_from(&ls).is_err());
    }

    #[test]
    fn conjunction_merges_and_dedups() {
        let a: Selector = "app=web".parse().unwrap();
        let b: Selector = "app=web,queue=orders".parse().unwrap();
        let both = a.and(&b);
        assert_eq!(both.expressions().len(), 2);
        assert_eq!(both.to_string(), "app=web,queue=orders");
    }

    #[test]
    fn pinned_pairs_only_include_single_valued_positive_requirements() {
        let sel: Selector = "queue=orders,env in (prod),zone in (a,b),tier!=db,canary"
            .parse()
            .unwrap();
        let pairs: Vec<_> = sel.pinned_pairs().collect();
        assert_eq!(pairs, vec![("env", "prod"), ("queue", "orders")]);
    }

    #[test]
    fn kube_selector_keeps_the_same_meaning() {
        let sel: Selector = "tier notin (db),app=web".parse().unwrap();
        assert_eq!(sel.to_kube().to_string(), "app=web,tier notin (db)");
        let labels = labels(&[("app", "web")]);
        assert_eq!(sel.matches(&labels), sel.to_kube().matches(&labels));
    }

    #[test]
    fn prefixed_keys_are_accepted() {
        let sel: Selector = "app.kubernetes.io/name=web".parse().unwrap();
        assert!(sel.matches(&labels(&[("app.kubernetes.io/name", "web")])));
    }
}
