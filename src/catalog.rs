//! The built-in scope tree.
//!
//! This is where the actual diagnostics are declared; the engine modules
//! stay generic. Adding a check means adding an entry here.

use std::path::PathBuf;

use crate::checks::{CommandDrops, CommandSpec, FileDrops, Metadata, ServiceStatus};
use crate::collect;
use crate::confine::{Confine, Confinement, Matcher};
use crate::tree::{CheckDef, Collect, ScopeDef};

/// Builds the full default tree.
pub fn root() -> ScopeDef {
    ScopeDef::new("")
        .check(CheckDef::new("metadata", |_s| {
            Ok((Confinement::new(), Box::new(Metadata) as Box<dyn Collect>))
        }))
        .scope(system_scope())
        .scope(services_scope())
}

fn linux_only() -> anyhow::Result<Confinement> {
    Ok(Confinement::new()
        .with(Confine::fact_in("kernel", vec![Matcher::value("linux")])?))
}

fn system_scope() -> ScopeDef {
    ScopeDef::new("system")
        .setup(|_s| linux_only())
        .check(CheckDef::new("status", |_s| {
            let collect = CommandDrops {
                subdir: "system".to_string(),
                commands: vec![
                    CommandSpec::new("uname -a", "uname.txt", 30),
                    CommandSpec::new("uptime", "uptime.txt", 30),
                    CommandSpec::new("free -m", "free.txt", 30),
                    CommandSpec::new("df -h", "df.txt", 60),
                    CommandSpec::new("ps aux", "ps.txt", 60),
                    CommandSpec::new("vmstat 1 5", "vmstat.txt", 30),
                    CommandSpec::new("sestatus", "sestatus.txt", 30),
                    CommandSpec::new("ip addr show", "ip_addr.txt", 30),
                    CommandSpec::new("ss -tlnp", "listening_ports.txt", 60),
                ],
            };
            Ok((Confinement::new(), Box::new(collect) as Box<dyn Collect>))
        }))
        .check(CheckDef::new("config", |_s| {
            let collect = FileDrops {
                subdir: "system/config".to_string(),
                paths: vec![
                    PathBuf::from("/etc/os-release"),
                    PathBuf::from("/etc/hosts"),
                    PathBuf::from("/etc/resolv.conf"),
                    PathBuf::from("/etc/nsswitch.conf"),
                    PathBuf::from("/etc/yum.repos.d"),
                    PathBuf::from("/etc/apt/sources.list"),
                ],
                apply_log_age: false,
            };
            Ok((Confinement::new(), Box::new(collect) as Box<dyn Collect>))
        }))
        .check(CheckDef::new("logs", |_s| {
            let collect = FileDrops {
                subdir: "system/logs".to_string(),
                paths: vec![PathBuf::from("/var/log/messages"), PathBuf::from("/var/log/syslog")],
                apply_log_age: true,
            };
            Ok((Confinement::new(), Box::new(collect) as Box<dyn Collect>))
        }))
}

fn services_scope() -> ScopeDef {
    ScopeDef::new("services")
        .setup(|_s| {
            Ok(linux_only()?
                .with(Confine::test(|| Ok(collect::executable("systemctl").is_some()))?))
        })
        .check(CheckDef::new("status", |_s| {
            let collect = ServiceStatus {
                subdir: "services".to_string(),
                units: vec!["sshd.service".to_string(), "cron.service".to_string()],
            };
            Ok((Confinement::new(), Box::new(collect) as Box<dyn Collect>))
        }))
        .check(CheckDef::new("configs", |_s| {
            let collect = FileDrops {
                subdir: "services/config".to_string(),
                paths: vec![PathBuf::from("/etc/ssh/sshd_config"), PathBuf::from("/etc/crontab")],
                apply_log_age: false,
            };
            Ok((Confinement::new(), Box::new(collect) as Box<dyn Collect>))
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::StaticFacts;
    use crate::settings::{Session, Settings};
    use crate::tree::Node;

    #[test]
    fn catalog_instantiates_with_expected_names() {
        let session = Session::new(
            Settings::default(),
            Box::new(StaticFacts::new().set("kernel", "linux")),
        );
        let tree = root().instantiate(&session).unwrap();
        let names: Vec<&str> = tree.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["metadata", "system", "services"]);

        let system = tree
            .children()
            .iter()
            .find_map(|c| match c {
                Node::Scope(s) if s.name() == "system" => Some(s),
                _ => None,
            })
            .unwrap();
        let leaf: Vec<&str> = system.children().iter().map(|c| c.name()).collect();
        assert_eq!(leaf, vec!["system.status", "system.config", "system.logs"]);
    }

    #[test]
    fn system_scope_is_unsuitable_off_linux() {
        let session = Session::new(
            Settings::default(),
            Box::new(StaticFacts::new().set("kernel", "windows")),
        );
        let tree = root().instantiate(&session).unwrap();
        let system = tree
            .children()
            .iter()
            .find(|c| c.name() == "system")
            .unwrap();
        assert!(!system.suitable(&session));
    }
}
