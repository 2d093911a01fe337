//! Parser for AutoProxy-style rule lists (the GFWList dialect).
//!
//! Each rule is reduced to the bare host it applies to. Exception rules
//! (`@@`) are dropped rather than honoured, and so is any line whose shape
//! is not understood.

use std::collections::BTreeSet;
use std::io::BufRead;

use crate::error::{Error, Result};

/// Parse a rule list into a sorted, deduplicated list of domains.
///
/// Only fails when the reader itself fails; malformed lines are skipped.
pub fn parse_rules<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut sites = BTreeSet::new();

    for line in reader.split(b'\n') {
        let line = line.map_err(Error::Parse)?;
        let line = String::from_utf8_lossy(&line);
        if let Some(site) = parse_line(line.trim()) {
            sites.insert(site);
        }
    }

    Ok(sites.into_iter().collect())
}

/// Reduce a single rule to its host, if the rule names one.
pub fn parse_line(line: &str) -> Option<String> {
    if line.is_empty()
        || line.starts_with('[')
        || line.starts_with('!')
        || line.starts_with("||!")
        || line.starts_with("@@")
    {
        return None;
    }

    let site = if let Some(rest) = line.strip_prefix("||") {
        reduce_wildcard(before_slash(rest)).to_string()
    } else if let Some(rest) = line.strip_prefix("|http://") {
        reduce_wildcard(url_host(rest)).to_string()
    } else if let Some(rest) = line.strip_prefix('.') {
        let site = before_slash(rest);
        let site = site.split('*').next().unwrap_or(site);
        if site.ends_with(".co") {
            format!("{site}m")
        } else {
            site.to_string()
        }
    } else if !line.contains('*') {
        let site = before_slash(line);
        if !is_plain_host(site) {
            return None;
        }
        site.to_string()
    } else {
        return None;
    };

    if site.is_empty() { None } else { Some(site) }
}

fn before_slash(s: &str) -> &str {
    s.split('/').next().unwrap_or(s)
}

/// Host part of a URL with the scheme already removed, spelled as written.
fn url_host(rest: &str) -> &str {
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    host.split(':').next().unwrap_or(host)
}

/// Keep the most specific concrete suffix of a wildcarded host.
fn reduce_wildcard(site: &str) -> &str {
    if let Some(pos) = site.rfind("*.") {
        &site[pos + 2..]
    } else if site.starts_with('*') {
        site.split_once('.').map_or(site, |(_, rest)| rest)
    } else {
        site
    }
}

fn is_plain_host(site: &str) -> bool {
    !site.is_empty()
        && site
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
