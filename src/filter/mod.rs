//! Domain list handling.
//!
//! Parses GFWList-style rule files into bare domains and publishes them
//! as a matchable [`Blocklist`].

mod blocklist;
mod parser;

pub use blocklist::{Blocklist, Snapshot};
pub use parser::{parse_line, parse_rules};

/// Where the wider proxy should send a request for a given host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Direct,
    /// Hand the request to the named downstream filter rule.
    Rule(&'a str),
}

/// Route a host through `rule` when the list matches it.
pub fn route<'a>(blocklist: &Blocklist, rule: Option<&'a str>, host: &str) -> Route<'a> {
    match rule {
        Some(rule) if blocklist.is_blocked(host) => Route::Rule(rule),
        _ => Route::Direct,
    }
}
