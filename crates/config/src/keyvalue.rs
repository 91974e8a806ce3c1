//! Shell-style `KEY=VALUE` parsing and in-place rewriting
//!
//! The configuration files are sourced by shell scripts on the device, so the
//! format stays compatible with `source stream.conf`: one assignment per line,
//! `#` comments, optional double quotes around the value.

use std::collections::BTreeMap;

/// Flat key/value view of a configuration layer
pub type ConfigMap = BTreeMap<String, String>;

/// Parse the contents of a `KEY=VALUE` file
///
/// Comment lines and lines without `=` are ignored. Inline comments are
/// stripped from unquoted values, surrounding double quotes are removed.
/// Later assignments of the same key win, matching shell semantics.
pub fn parse_key_values(content: &str) -> ConfigMap {
    let mut map = ConfigMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        map.insert(key.to_string(), unquote(value.trim()));
    }

    map
}

/// Characters a backslash escapes inside double quotes in POSIX shells
const ESCAPED: &[char] = &['"', '\\', '$', '`'];

fn unquote(value: &str) -> String {
    if let Some(inner) = value.strip_prefix('"') {
        // Quoted: everything up to the closing quote, comments included
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => break,
                '\\' => match chars.next() {
                    Some(next) if ESCAPED.contains(&next) => out.push(next),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                c => out.push(c),
            }
        }
        return out;
    }

    match value.find('#') {
        Some(idx) => value[..idx].trim().to_string(),
        None => value.to_string(),
    }
}

/// Format a value for writing back to a config file
///
/// Values with whitespace or shell metacharacters are double-quoted, with
/// `"`, `\`, `$` and `` ` `` backslash-escaped so the file still sources
/// cleanly and parses back to the same value.
pub fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || "#\"'\\$`;&|<>()".contains(c));
    if !needs_quotes {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if ESCAPED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Rewrite `content` so each key in `updates` carries its new value
///
/// Existing assignments are replaced where they stand (comments and ordering
/// are preserved); keys not present yet are appended at the end.
pub fn apply_updates(content: &str, updates: &ConfigMap) -> String {
    let mut written = Vec::new();
    let mut out = String::with_capacity(content.len());

    for line in content.lines() {
        let trimmed = line.trim();
        let key = if trimmed.starts_with('#') {
            None
        } else {
            trimmed.split_once('=').map(|(k, _)| k.trim())
        };

        match key.and_then(|k| updates.get_key_value(k)) {
            Some((k, v)) => {
                out.push_str(&format!("{}={}\n", k, quote_value(v)));
                written.push(k.as_str());
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    for (key, value) in updates {
        if !written.contains(&key.as_str()) {
            out.push_str(&format!("{}={}\n", key, quote_value(value)));
        }
    }

    out
}
