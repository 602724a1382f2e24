//! Label selectors used to filter cached objects
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    str::FromStr,
};
use thiserror::Error;

type Map = BTreeMap<String, String>;

/// Failed to parse a label selector string
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid label selector term {term:?}: {reason}")]
pub struct ParseError {
    /// The offending term
    pub term: String,
    /// Why the term was rejected
    pub reason: &'static str,
}

/// A single label requirement
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Expression {
    /// The label value is one of the set
    In(String, BTreeSet<String>),
    /// The label is absent or its value is not in the set
    NotIn(String, BTreeSet<String>),
    /// The label has exactly this value
    Equal(String, String),
    /// The label is absent or has another value
    NotEqual(String, String),
    /// The label is present
    Exists(String),
    /// The label is absent
    DoesNotExist(String),
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Expression::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
        }
    }

    fn parse(term: &str) -> Result<Self, ParseError> {
        let err = |reason| ParseError {
            term: term.to_string(),
            reason,
        };

        if let Some(open) = term.find('(') {
            let inner = term[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| err("unterminated value set"))?;
            let values = inner
                .split(',')
                .map(str::trim)
                .map(|v| if v.is_empty() { Err(err("empty value in set")) } else { Ok(v.to_string()) })
                .collect::<Result<BTreeSet<_>, _>>()?;
            let mut head = term[..open].split_whitespace();
            let (Some(key), Some(op), None) = (head.next(), head.next(), head.next()) else {
                return Err(err("expected `key in (..)` or `key notin (..)`"));
            };
            let key = valid_key(key).ok_or_else(|| err("invalid key"))?;
            return match op {
                "in" => Ok(Expression::In(key, values)),
                "notin" => Ok(Expression::NotIn(key, values)),
                _ => Err(err("unknown set operator")),
            };
        }

        if let Some(key) = term.strip_prefix('!') {
            return valid_key(key.trim())
                .map(Expression::DoesNotExist)
                .ok_or_else(|| err("invalid key"));
        }

        let split = [("!=", false), ("==", true), ("=", true)]
            .into_iter()
            .find_map(|(op, eq)| term.split_once(op).map(|(k, v)| (k, v, eq)));
        match split {
            Some((key, value, equal)) => {
                let key = valid_key(key.trim()).ok_or_else(|| err("invalid key"))?;
                let value = value.trim();
                if value.contains(char::is_whitespace) {
                    return Err(err("invalid value"));
                }
                Ok(if equal {
                    Expression::Equal(key, value.to_string())
                } else {
                    Expression::NotEqual(key, value.to_string())
                })
            }
            None => valid_key(term).map(Expression::Exists).ok_or_else(|| err("invalid key")),
        }
    }
}

fn valid_key(key: &str) -> Option<String> {
    let invalid = key.is_empty() || key.contains(|c: char| c.is_whitespace() || "()=!,".contains(c));
    (!invalid).then(|| key.to_string())
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Expression::In(key, values) => write!(f, "{key} in ({})", join(values)),
            Expression::NotIn(key, values) => write!(f, "{key} notin ({})", join(values)),
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// A conjunction of label requirements
///
/// The empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
pub struct Selector(Vec<Expression>);

impl Selector {
    /// Parse the string form used by the remote API, e.g. `app=web,tier in (fe,be),!legacy`
    pub fn parse(selector: &str) -> Result<Self, ParseError> {
        split_terms(selector)
            .into_iter()
            .map(Expression::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Whether this selector matches every object
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the given labels satisfy every requirement
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }

    /// The requirements of this selector
    pub fn expressions(&self) -> &[Expression] {
        &self.0
    }
}

// Commas inside a value set do not separate terms.
fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(selector[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(selector[start..].trim());
    terms.retain(|t| !t.is_empty());
    terms
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms = self.0.iter().map(ToString::to_string).collect::<Vec<_>>();
        f.write_str(&terms.join(","))
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

impl TryFrom<LabelSelector> for Selector {
    type Error = ParseError;

    fn try_from(value: LabelSelector) -> Result<Self, Self::Error> {
        let mut exprs: Vec<Expression> = value
            .match_labels
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| Expression::Equal(k, v))
            .collect();
        for req in value.match_expressions.unwrap_or_default() {
            let invalid = |reason| ParseError {
                term: format!("{} {}", req.key, req.operator),
                reason,
            };
            let values = req.values.clone().map(|v| v.into_iter().collect::<BTreeSet<_>>());
            exprs.push(match (req.operator.as_str(), values) {
                ("In", Some(values)) => Expression::In(req.key, values),
                ("NotIn", Some(values)) => Expression::NotIn(req.key, values),
                ("In" | "NotIn", None) => return Err(invalid("set operator without values")),
                ("Exists", _) => Expression::Exists(req.key),
                ("DoesNotExist", _) => Expression::DoesNotExist(req.key),
                _ => return Err(invalid("unknown operator")),
            });
        }
        Ok(Self(exprs))
    }
}

impl From<Selector> for LabelSelector {
    fn from(value: Selector) -> Self {
        let mut equality = BTreeMap::new();
        let mut expressions = vec![];
        let requirement = |key, operator: &str, values: Option<Vec<String>>| LabelSelectorRequirement {
            key,
            operator: operator.into(),
            values,
        };
        for expr in value.0 {
            match expr {
                Expression::Equal(key, value) => {
                    equality.insert(key, value);
                }
                Expression::In(key, values) => {
                    expressions.push(requirement(key, "In", Some(values.into_iter().collect())))
                }
                Expression::NotIn(key, values) => {
                    expressions.push(requirement(key, "NotIn", Some(values.into_iter().collect())))
                }
                Expression::NotEqual(key, value) => expressions.push(requirement(key, "NotIn", Some(vec![value]))),
                Expression::Exists(key) => expressions.push(requirement(key, "Exists", None)),
                Expression::DoesNotExist(key) => expressions.push(requirement(key, "DoesNotExist", None)),
            }
        }

        LabelSelector {
            match_labels: (!equality.is_empty()).then_some(equality),
            match_expressions: (!expressions.is_empty()).then_some(expressions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_every_operator() {
        let selector = Selector::parse("app=web, tier in (fe, be),env!=prod,track==stable,canary,!legacy,zone notin (a)")
            .unwrap();
        assert_eq!(selector.expressions(), &[
            Expression::Equal("app".into(), "web".into()),
            Expression::In("tier".into(), ["be".to_string(), "fe".to_string()].into()),
            Expression::NotEqual("env".into(), "prod".into()),
            Expression::Equal("track".into(), "stable".into()),
            Expression::Exists("canary".into()),
            Expression::DoesNotExist("legacy".into()),
            Expression::NotIn("zone".into(), ["a".to_string()].into()),
        ]);
        assert_eq!(
            selector.to_string(),
            "app=web,tier in (be,fe),env!=prod,track=stable,canary,!legacy,zone notin (a)"
        );
    }

    #[test]
    fn rejects_malformed_terms() {
        for bad in ["app in (a", "in (a)", "app within (a)", "=web", "a b", "tier in (a,,b)", "!"] {
            assert!(Selector::parse(bad).is_err(), "{bad}");
        }
        assert!(Selector::parse("").unwrap().selects_all());
    }

    #[test]
    fn matches_labels() {
        for (selector, l, matches) in [
            ("", labels(&[]), true),
            ("foo=bar", labels(&[("foo", "bar"), ("bah", "baz")]), true),
            ("foo=bar", labels(&[("foo", "baz")]), false),
            ("foo!=bar", labels(&[]), true),
            ("foo in (bar,baz)", labels(&[("foo", "baz")]), true),
            ("foo in (bar)", labels(&[]), false),
            ("foo notin (bar)", labels(&[]), true),
            ("foo notin (bar)", labels(&[("foo", "bar")]), false),
            ("foo", labels(&[("foo", "")]), true),
            ("!foo", labels(&[("foo", "")]), false),
            ("foo=bar,bah in (bar)", labels(&[("foo", "bar"), ("bah", "baz")]), false),
        ] {
            let parsed = Selector::parse(selector).unwrap();
            assert_eq!(parsed.matches(&l), matches, "{selector} against {l:?}");
            let converted = Selector::try_from(LabelSelector::from(parsed)).unwrap();
            assert_eq!(converted.matches(&l), matches, "after conversion: {selector}");
        }
    }

    #[test]
    fn label_selector_with_unknown_operator_is_rejected() {
        let ls = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "foo".into(),
                operator: "Near".into(),
                values: None,
            }]),
            match_labels: None,
        };
        assert!(Selector::try_from(ls).is_err());
    }
}
