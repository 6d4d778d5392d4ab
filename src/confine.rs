//! Suitability predicates for scopes and checks.
//!
//! A [`Confine`] ties a node to an environment fact or a custom predicate.
//! A node carries its confines inside a [`Confinement`], and is suitable
//! only when every confine holds. Predicate failures are logged and count
//! as non-matches; a buggy predicate must never abort the walk.

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::settings::Session;

#[derive(Debug, Error)]
pub enum ConfineError {
    #[error("a fact name requires one or more values or a predicate")]
    MissingCondition,
    #[error("acceptance values require a fact name")]
    ValuesWithoutFact,
    #[error("a fact-value predicate requires a fact name")]
    PredicateWithoutFact,
    #[error("a no-argument predicate cannot be combined with a fact name")]
    TestWithFact,
    #[error("acceptance values and a predicate cannot be combined")]
    ValuesWithPredicate,
}

/// One acceptance test for a fact value.
pub enum Matcher {
    /// Equality against a normalized value.
    Value(Value),
    /// Inclusive integer range membership.
    Range(i64, i64),
    /// Regex match against a string value.
    Pattern(Regex),
}

impl Matcher {
    pub fn value(v: impl Into<Value>) -> Self {
        Matcher::Value(v.into())
    }

    fn matches(&self, fact_value: &Value) -> bool {
        match self {
            Matcher::Value(expected) => normalize(expected.clone()) == *fact_value,
            Matcher::Range(low, high) => fact_value
                .as_i64()
                .map(|n| *low <= n && n <= *high)
                .unwrap_or(false),
            Matcher::Pattern(pattern) => fact_value
                .as_str()
                .map(|s| pattern.is_match(s))
                .unwrap_or(false),
        }
    }
}

/// A custom suitability predicate.
pub enum Predicate {
    /// Evaluated with no arguments; stands alone without a fact.
    Test(Box<dyn Fn() -> anyhow::Result<bool>>),
    /// Evaluated with the normalized value of the confine's fact.
    OfFact(Box<dyn Fn(&Value) -> anyhow::Result<bool>>),
}

/// A single boolean condition over an environment fact or predicate.
///
/// Immutable after construction. Exactly one of {fact + values},
/// {predicate alone}, or {fact + fact-value predicate} may be supplied.
pub struct Confine {
    fact: Option<String>,
    matchers: Vec<Matcher>,
    predicate: Option<Predicate>,
}

impl Confine {
    pub fn new(
        fact: Option<String>,
        matchers: Vec<Matcher>,
        predicate: Option<Predicate>,
    ) -> Result<Self, ConfineError> {
        match (&fact, matchers.is_empty(), &predicate) {
            (None, false, _) => return Err(ConfineError::ValuesWithoutFact),
            (Some(_), true, None) => return Err(ConfineError::MissingCondition),
            (None, true, None) => return Err(ConfineError::MissingCondition),
            (None, true, Some(Predicate::OfFact(_))) => {
                return Err(ConfineError::PredicateWithoutFact)
            }
            (Some(_), _, Some(Predicate::Test(_))) => return Err(ConfineError::TestWithFact),
            (Some(_), false, Some(Predicate::OfFact(_))) => {
                return Err(ConfineError::ValuesWithPredicate)
            }
            _ => {}
        }
        Ok(Self {
            fact,
            matchers,
            predicate,
        })
    }

    /// Confines a fact to one or more acceptance values.
    pub fn fact_in(fact: &str, matchers: Vec<Matcher>) -> Result<Self, ConfineError> {
        Self::new(Some(fact.to_string()), matchers, None)
    }

    /// Confines a fact to a predicate over its normalized value.
    pub fn fact_matches(
        fact: &str,
        predicate: impl Fn(&Value) -> anyhow::Result<bool> + 'static,
    ) -> Result<Self, ConfineError> {
        Self::new(
            Some(fact.to_string()),
            Vec::new(),
            Some(Predicate::OfFact(Box::new(predicate))),
        )
    }

    /// Confines to a standalone predicate.
    pub fn test(predicate: impl Fn() -> anyhow::Result<bool> + 'static) -> Result<Self, ConfineError> {
        Self::new(None, Vec::new(), Some(Predicate::Test(Box::new(predicate))))
    }

    /// Resolves the condition to true or false; never fails.
    ///
    /// Undefined facts and predicate errors are logged and count as false.
    pub fn holds(&self, session: &Session) -> bool {
        let fact_name = match &self.fact {
            None => {
                if let Some(Predicate::Test(test)) = &self.predicate {
                    return match test() {
                        Ok(result) => result,
                        Err(error) => {
                            session
                                .log
                                .error(|| format!("error raised during confine: {:#}", error));
                            false
                        }
                    };
                }
                return false;
            }
            Some(name) => name,
        };

        let raw = match session.facts.value(fact_name) {
            Some(value) if !value.is_null() => value,
            _ => {
                session
                    .log
                    .warn(|| format!("confine requested undefined fact named: {}", fact_name));
                return false;
            }
        };
        let value = normalize(raw);

        if let Some(Predicate::OfFact(predicate)) = &self.predicate {
            return match predicate(&value) {
                Ok(result) => result,
                Err(error) => {
                    session
                        .log
                        .error(|| format!("error raised during confine: {:#}", error));
                    false
                }
            };
        }

        self.matchers.iter().any(|m| m.matches(&value))
    }
}

impl std::fmt::Debug for Confine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fact {
            Some(fact) => write!(f, "Confine({} over {} values)", fact, self.matchers.len()),
            None => write!(f, "Confine(predicate)"),
        }
    }
}

/// Canonical form used for comparisons: strings compare case-insensitively.
fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other,
    }
}

/// Confine list plus an operator-controlled enabled flag, embedded in both
/// node kinds.
pub struct Confinement {
    confines: Vec<Confine>,
    enabled: bool,
}

impl Default for Confinement {
    fn default() -> Self {
        Self {
            confines: Vec::new(),
            enabled: true,
        }
    }
}

impl Confinement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts disabled; used by opt-in checks.
    pub fn disabled() -> Self {
        Self {
            confines: Vec::new(),
            enabled: false,
        }
    }

    pub fn confine(&mut self, confine: Confine) {
        self.confines.push(confine);
    }

    pub fn with(mut self, confine: Confine) -> Self {
        self.confines.push(confine);
        self
    }

    /// AND over every attached confine; vacuously true with none.
    pub fn suitable(&self, session: &Session) -> bool {
        self.confines.iter().all(|c| c.holds(session))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
