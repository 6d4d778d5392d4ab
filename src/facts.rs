//! Fact lookup for confinement decisions.
//!
//! Confines resolve environment facts by name (`kernel`, `hostname`,
//! `os.family`, ...). The engine only depends on the [`Facts`] trait; the
//! system provider reads from the running host and caches each answer, and
//! tests substitute a static map.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;

use serde_json::Value;

/// Name-to-value fact lookup; `None` means the fact is undefined here.
pub trait Facts {
    fn value(&self, name: &str) -> Option<Value>;
}

/// Facts resolved from the running host, cached per name.
#[derive(Default)]
pub struct SystemFacts {
    cache: RefCell<HashMap<String, Option<Value>>>,
}

impl SystemFacts {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        match name {
            "kernel" => Some(Value::String(std::env::consts::OS.to_string())),
            "hostname" => hostname().map(Value::String),
            "fqdn" => hostname().map(Value::String),
            "os.family" => os_release_field("ID_LIKE")
                .or_else(|| os_release_field("ID"))
                .map(Value::String),
            "os.name" => os_release_field("ID").map(Value::String),
            "identity.privileged" => Some(Value::Bool(nix::unistd::geteuid().is_root())),
            _ => None,
        }
    }
}

impl Facts for SystemFacts {
    fn value(&self, name: &str) -> Option<Value> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return cached.clone();
        }
        let resolved = self.resolve(name);
        self.cache
            .borrow_mut()
            .insert(name.to_string(), resolved.clone());
        resolved
    }
}

fn hostname() -> Option<String> {
    let name = nix::unistd::gethostname().ok()?;
    Some(name.to_string_lossy().into_owned())
}

fn os_release_field(field: &str) -> Option<String> {
    let contents = fs::read_to_string("/etc/os-release").ok()?;
    for line in contents.lines() {
        if let Some(raw) = line.strip_prefix(field).and_then(|l| l.strip_prefix('=')) {
            let value = raw.trim().trim_matches('"');
            if !value.is_empty() {
                // ID_LIKE can list several families; the first is the closest.
                return Some(
                    value
                        .split_whitespace()
                        .next()
                        .unwrap_or(value)
                        .to_string(),
                );
            }
        }
    }
    None
}

/// Fixed fact map for tests and dry-run scenarios.
#[derive(Default)]
pub struct StaticFacts {
    values: HashMap<String, Value>,
}

impl StaticFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

impl Facts for StaticFacts {
    fn value(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_facts_answer_only_what_was_set() {
        let facts = StaticFacts::new().set("kernel", "linux");
        assert_eq!(facts.value("kernel"), Some(Value::from("linux")));
        assert_eq!(facts.value("unknown"), None);
    }

    #[test]
    fn system_facts_cache_repeated_lookups() {
        let facts = SystemFacts::new();
        let first = facts.value("kernel");
        let second = facts.value("kernel");
        assert_eq!(first, second);
        assert!(facts.cache.borrow().contains_key("kernel"));
    }
}
