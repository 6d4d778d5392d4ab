//! Support bundle collector for Linux hosts.
//!
//! A run walks a declared tree of scopes and checks, each gated by
//! machine facts and runtime predicates, drops what it collects into a
//! timestamped directory, and packages the result as a tarball that can
//! optionally be encrypted and uploaded to support.

pub mod archive;
pub mod catalog;
pub mod checks;
pub mod cli;
pub mod collect;
pub mod confine;
pub mod facts;
pub mod logging;
pub mod runner;
pub mod settings;
pub mod tree;
