//! The check/scope tree.
//!
//! Diagnostics are declared as data: a [`ScopeDef`] names its children and
//! each [`CheckDef`] carries a build closure producing its confinement and
//! collector. Instantiating a definition against a session yields a [`Node`]
//! tree with resolved dotted names and enablement already settled from the
//! session's only/enable/disable lists. Running a scope walks enabled,
//! suitable children depth first, isolating each child's failures.

use std::time::Instant;

use crate::collect::display;
use crate::confine::Confinement;
use crate::settings::Session;

/// A unit of diagnostic work run by a check.
pub trait Collect {
    fn run(&self, session: &Session) -> anyhow::Result<()>;
}

impl<F> Collect for F
where
    F: Fn(&Session) -> anyhow::Result<()>,
{
    fn run(&self, session: &Session) -> anyhow::Result<()> {
        self(session)
    }
}

type CheckBuild = Box<dyn Fn(&Session) -> anyhow::Result<(Confinement, Box<dyn Collect>)>>;
type ScopeSetup = Box<dyn Fn(&Session) -> anyhow::Result<Confinement>>;

/// Declaration of a leaf check.
pub struct CheckDef {
    pub name: String,
    build: CheckBuild,
}

impl CheckDef {
    pub fn new(
        name: impl Into<String>,
        build: impl Fn(&Session) -> anyhow::Result<(Confinement, Box<dyn Collect>)> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            build: Box::new(build),
        }
    }
}

/// Declaration of a scope and its children.
pub struct ScopeDef {
    pub name: String,
    setup: Option<ScopeSetup>,
    children: Vec<ChildDef>,
}

pub enum ChildDef {
    Check(CheckDef),
    Scope(ScopeDef),
}

impl ScopeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            children: Vec::new(),
        }
    }

    /// Sets the closure deciding this scope's confinement at instantiation.
    pub fn setup(
        mut self,
        setup: impl Fn(&Session) -> anyhow::Result<Confinement> + 'static,
    ) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn check(mut self, check: CheckDef) -> Self {
        self.children.push(ChildDef::Check(check));
        self
    }

    pub fn scope(mut self, scope: ScopeDef) -> Self {
        self.children.push(ChildDef::Scope(scope));
        self
    }

    /// Instantiates this scope as the root of a node tree.
    pub fn instantiate(&self, session: &Session) -> anyhow::Result<ScopeNode> {
        self.instantiate_under(session, "")
    }

    fn instantiate_under(&self, session: &Session, parent_name: &str) -> anyhow::Result<ScopeNode> {
        let resolved_name = join_name(parent_name, &self.name);
        let confinement = match &self.setup {
            Some(setup) => setup(session)?,
            None => Confinement::new(),
        };

        let mut node = ScopeNode {
            name: resolved_name,
            confinement,
            children: Vec::new(),
        };

        // Children are built in full, with their own default enablement,
        // before this scope adjusts their flags.
        for child in &self.children {
            match child {
                ChildDef::Check(def) => {
                    let child_name = join_name(&node.name, &def.name);
                    match (def.build)(session) {
                        Ok((confinement, collect)) => node.children.push(Node::Check(CheckNode {
                            name: child_name,
                            confinement,
                            collect,
                        })),
                        Err(error) => {
                            session.log.error(|| {
                                format!("could not create check {}: {}", child_name, error)
                            });
                        }
                    }
                }
                ChildDef::Scope(def) => {
                    let child_name = join_name(&node.name, &def.name);
                    match def.instantiate_under(session, &node.name) {
                        Ok(scope) => node.children.push(Node::Scope(scope)),
                        Err(error) => {
                            session.log.error(|| {
                                format!("could not create scope {}: {}", child_name, error)
                            });
                        }
                    }
                }
            }
        }

        node.resolve_enablement(session);
        Ok(node)
    }
}

fn join_name(parent: &str, own: &str) -> String {
    if parent.is_empty() {
        own.to_string()
    } else if own.is_empty() {
        parent.to_string()
    } else {
        format!("{}.{}", parent, own)
    }
}

/// Instantiated leaf check.
pub struct CheckNode {
    name: String,
    confinement: Confinement,
    collect: Box<dyn Collect>,
}

/// Instantiated scope with resolved children.
pub struct ScopeNode {
    name: String,
    confinement: Confinement,
    children: Vec<Node>,
}

pub enum Node {
    Check(CheckNode),
    Scope(ScopeNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Check(c) => &c.name,
            Node::Scope(s) => &s.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Node::Check(c) => c.confinement.enabled(),
            Node::Scope(s) => s.confinement.enabled(),
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        match self {
            Node::Check(c) => c.confinement.set_enabled(enabled),
            Node::Scope(s) => s.confinement.set_enabled(enabled),
        }
    }

    pub fn suitable(&self, session: &Session) -> bool {
        match self {
            Node::Check(c) => c.confinement.suitable(session),
            Node::Scope(s) => s.confinement.suitable(session),
        }
    }
}

impl ScopeNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.confinement.enabled()
    }

    pub fn suitable(&self, session: &Session) -> bool {
        self.confinement.suitable(session)
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Applies the session's only/enable/disable lists to direct children.
    ///
    /// `--only` narrows to listed subtrees, `--enable` re-enables opt-in
    /// entries inside the selection, and `--disable` wins over everything.
    /// Scopes match any list entry that is an extension of their name so
    /// selection can reach into their descendants; checks only re-enable on
    /// an exact entry.
    fn resolve_enablement(&mut self, session: &Session) {
        let only = session.settings.only();
        let disable = session.settings.disable();

        let mut enable_list: Vec<String> = only.clone();
        enable_list.extend(session.settings.enable());
        enable_list.retain(|entry| entry.starts_with(&self.name));

        let parent_enabled = self.confinement.enabled();
        for child in &mut self.children {
            if !parent_enabled {
                child.set_enabled(false);
            }

            if !only.is_empty() && !enable_list.iter().any(|e| child.name().starts_with(e.as_str()))
            {
                child.set_enabled(false);
            }

            if !child.enabled() {
                let reenable = match child {
                    Node::Scope(_) => enable_list.iter().any(|e| e.starts_with(child.name())),
                    Node::Check(_) => enable_list.iter().any(|e| e == child.name()),
                };
                if reenable {
                    child.set_enabled(true);
                }
            }

            if disable.iter().any(|e| e == child.name()) {
                child.set_enabled(false);
            }
        }
    }

    /// Runs enabled, suitable children depth first, isolating failures.
    pub fn run(&self, session: &Session) {
        if !self.confinement.enabled() || !self.confinement.suitable(session) {
            return;
        }
        if !self.name.is_empty() {
            display(&format!("\nEvaluating scope: {}", self.name));
        }

        for child in &self.children {
            if !child.enabled() || !child.suitable(session) {
                continue;
            }
            session
                .log
                .info(|| format!("starting evaluation of: {}", child.name()));
            let started = Instant::now();
            match child {
                Node::Check(check) => {
                    display(&format!("Evaluating check: {}", check.name));
                    if let Err(error) = check.collect.run(session) {
                        session.record_failure();
                        session
                            .log
                            .error(|| format!("check {} failed: {:#}", check.name, error));
                    }
                }
                Node::Scope(scope) => scope.run(session),
            }
            session.log.debug(|| {
                format!(
                    "finished evaluation of {} in {:.3} seconds",
                    child.name(),
                    started.elapsed().as_secs_f64()
                )
            });
        }
    }

    /// Prints the suitable checks and scopes under this node.
    pub fn describe(&self, session: &Session) {
        for child in &self.children {
            if !child.suitable(session) {
                continue;
            }
            let note = if child.enabled() {
                ""
            } else {
                "  (opt-in with --enable)"
            };
            match child {
                Node::Check(check) => display(&format!("{}{}", check.name, note)),
                Node::Scope(scope) => {
                    display(&format!("{}{}", scope.name, note));
                    scope.describe(session);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confine::{Confine, Matcher};
    use crate::facts::StaticFacts;
    use crate::logging::{LogSink, Severity};
    use crate::settings::Settings;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session_with(options: &[(&str, serde_json::Value)]) -> Session {
        let mut settings = Settings::default();
        let pairs: Vec<(String, serde_json::Value)> = options
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        settings.configure(&pairs).unwrap();
        Session::new(settings, Box::new(StaticFacts::new().set("kernel", "linux")))
    }

    struct MemorySink {
        lines: RefCell<Vec<String>>,
    }

    impl MemorySink {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                lines: RefCell::new(Vec::new()),
            })
        }
    }

    impl LogSink for MemorySink {
        fn threshold(&self) -> Severity {
            Severity::Debug
        }

        fn write(&self, level: Severity, message: &str) {
            self.lines.borrow_mut().push(format!("{}: {}", level, message));
        }
    }

    struct Recorder {
        name: String,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Collect for Recorder {
        fn run(&self, _session: &Session) -> anyhow::Result<()> {
            self.log.borrow_mut().push(self.name.clone());
            Ok(())
        }
    }

    fn recorded_check(name: &str, log: &Rc<RefCell<Vec<String>>>) -> CheckDef {
        let log = Rc::clone(log);
        let name_owned = name.to_string();
        CheckDef::new(name, move |_s| {
            Ok((
                Confinement::new(),
                Box::new(Recorder {
                    name: name_owned.clone(),
                    log: Rc::clone(&log),
                }) as Box<dyn Collect>,
            ))
        })
    }

    fn optin_check(name: &str, log: &Rc<RefCell<Vec<String>>>) -> CheckDef {
        let log = Rc::clone(log);
        let name_owned = name.to_string();
        CheckDef::new(name, move |_s| {
            Ok((
                Confinement::disabled(),
                Box::new(Recorder {
                    name: name_owned.clone(),
                    log: Rc::clone(&log),
                }) as Box<dyn Collect>,
            ))
        })
    }

    fn tree(log: &Rc<RefCell<Vec<String>>>) -> ScopeDef {
        ScopeDef::new("")
            .scope(
                ScopeDef::new("system")
                    .check(recorded_check("config", log))
                    .check(recorded_check("logs", log)),
            )
            .scope(
                ScopeDef::new("services")
                    .check(recorded_check("status", log))
                    .check(optin_check("verbose", log)),
            )
    }

    fn run_tree(session: &Session, log: &Rc<RefCell<Vec<String>>>) -> Vec<String> {
        let root = tree(log).instantiate(session).unwrap();
        root.run(session);
        log.borrow().clone()
    }

    #[test]
    fn names_resolve_hierarchically() {
        let session = session_with(&[]);
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = tree(&log).instantiate(&session).unwrap();
        let names: Vec<&str> = root.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["system", "services"]);
        match &root.children()[0] {
            Node::Scope(system) => {
                let leaf: Vec<&str> = system.children().iter().map(|c| c.name()).collect();
                assert_eq!(leaf, vec!["system.config", "system.logs"]);
            }
            _ => panic!("expected scope"),
        }
    }

    #[test]
    fn default_run_covers_enabled_checks_in_order() {
        let session = session_with(&[]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(
            run_tree(&session, &log),
            vec!["config", "logs", "status"],
        );
    }

    #[test]
    fn only_narrows_to_listed_subtree() {
        let session = session_with(&[("only", json!(["system"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(run_tree(&session, &log), vec!["config", "logs"]);
    }

    #[test]
    fn only_selects_a_single_check() {
        let session = session_with(&[("only", json!(["system.logs"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(run_tree(&session, &log), vec!["logs"]);
    }

    #[test]
    fn enable_turns_on_opt_in_checks() {
        let session = session_with(&[("enable", json!(["services.verbose"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(
            run_tree(&session, &log),
            vec!["config", "logs", "status", "verbose"],
        );
    }

    #[test]
    fn only_reaches_opt_in_checks_by_exact_name() {
        let session = session_with(&[("only", json!(["services.verbose"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(run_tree(&session, &log), vec!["verbose"]);
    }

    #[test]
    fn disable_wins_over_enable() {
        let session = session_with(&[
            ("enable", json!(["services.verbose"])),
            ("disable", json!(["services.verbose", "system.logs"])),
        ]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(run_tree(&session, &log), vec!["config", "status"]);
    }

    #[test]
    fn enable_reaches_into_a_default_disabled_scope() {
        let session = session_with(&[("enable", json!(["extras.deep"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = ScopeDef::new("")
            .scope(
                ScopeDef::new("extras")
                    .setup(|_s| Ok(Confinement::disabled()))
                    .check(recorded_check("deep", &log))
                    .check(recorded_check("other", &log)),
            )
            .instantiate(&session)
            .unwrap();
        root.run(&session);
        // The scope chain re-enables, but only the named check inside it.
        assert_eq!(log.borrow().clone(), vec!["deep"]);
    }

    #[test]
    fn a_prefix_entry_does_not_enable_a_check_by_substring() {
        // "services.verb" extends no scope and names no check exactly.
        let session = session_with(&[("enable", json!(["services.verb"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(run_tree(&session, &log), vec!["config", "logs", "status"]);
    }

    #[test]
    fn check_failures_are_isolated() {
        let session = session_with(&[]);
        let log = Rc::new(RefCell::new(Vec::new()));
        let failing = CheckDef::new("boom", |_s| {
            Ok((
                Confinement::new(),
                Box::new(|_s: &Session| -> anyhow::Result<()> { anyhow::bail!("went wrong") })
                    as Box<dyn Collect>,
            ))
        });
        let root = ScopeDef::new("")
            .scope(
                ScopeDef::new("system")
                    .check(failing)
                    .check(recorded_check("after", &log)),
            )
            .instantiate(&session)
            .unwrap();
        root.run(&session);
        assert_eq!(log.borrow().clone(), vec!["after"]);
        assert_eq!(session.state.borrow().exit_code, 1);
    }

    #[test]
    fn check_failure_is_logged_with_its_resolved_name() {
        let session = session_with(&[]);
        let sink = MemorySink::new();
        session.log.add_sink(sink.clone());

        let failing = CheckDef::new("boom", |_s| {
            Ok((
                Confinement::new(),
                Box::new(|_s: &Session| -> anyhow::Result<()> { anyhow::bail!("went wrong") })
                    as Box<dyn Collect>,
            ))
        });
        let root = ScopeDef::new("")
            .scope(ScopeDef::new("system").check(failing))
            .instantiate(&session)
            .unwrap();
        root.run(&session);

        let lines = sink.lines.borrow();
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("ERROR") && l.contains("system.boom")),
            "{:?}",
            lines
        );
    }

    #[test]
    fn failed_construction_drops_only_that_check() {
        let session = session_with(&[]);
        let log = Rc::new(RefCell::new(Vec::new()));
        let broken = CheckDef::new("broken", |_s| anyhow::bail!("no collector"));
        let root = ScopeDef::new("")
            .scope(
                ScopeDef::new("system")
                    .check(broken)
                    .check(recorded_check("fine", &log)),
            )
            .instantiate(&session)
            .unwrap();
        root.run(&session);
        assert_eq!(log.borrow().clone(), vec!["fine"]);
    }

    #[test]
    fn unsuitable_scopes_gate_their_children() {
        let session = session_with(&[]);
        let log = Rc::new(RefCell::new(Vec::new()));
        let gated = ScopeDef::new("other")
            .setup(|_s| {
                Ok(Confinement::new()
                    .with(Confine::fact_in("kernel", vec![Matcher::value("windows")]).unwrap()))
            })
            .check(recorded_check("never", &log));
        let root = ScopeDef::new("")
            .scope(gated)
            .scope(ScopeDef::new("system").check(recorded_check("config", &log)))
            .instantiate(&session)
            .unwrap();
        root.run(&session);
        assert_eq!(log.borrow().clone(), vec!["config"]);
    }

    #[test]
    fn disabled_parent_scope_disables_children() {
        let session = session_with(&[("disable", json!(["system"]))]);
        let log = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(run_tree(&session, &log), vec!["status"]);
    }
}
