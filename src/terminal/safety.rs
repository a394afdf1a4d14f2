//! Command safety policy for shell execution.
//!
//! Two gates, both bypassed by unsafe mode: a deny pattern set for
//! obviously destructive invocations, then a first-token allowlist.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ServiceError;

static DENY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // rm -rf / and friends aimed at the filesystem root.
        r"(?i)\brm\s+(-[a-z]+\s+)*-[a-z]*[rf][a-z]*\s+/\s*(\*|$)",
        r"(?i)\brm\s+(-[a-z]+\s+)*-[a-z]*[rf][a-z]*\s+/\S*\s*$",
        // Raw writes to block devices.
        r"(?i)\bdd\s+.*\bof=/dev/sd",
        // World-writable permission bombs.
        r"(?i)\bchmod\s+(-[a-z]+\s+)*-?777\s+/",
        // Unqualified moves/copies onto the root.
        r"(?i)\b(mv|cp)\s+(-[a-z]+\s+)*\S+\s+/\s*$",
        // Filesystem re-creation.
        r"(?i)\bmkfs(\.\w+)?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Validate a command line against the safety policy.
pub fn check_command(
    line: &str,
    allowlist: &[String],
    allow_unsafe: bool,
) -> Result<(), ServiceError> {
    if allow_unsafe {
        return Ok(());
    }

    for pattern in DENY_PATTERNS.iter() {
        if pattern.is_match(line) {
            return Err(ServiceError::Refused(format!(
                "command matches a deny pattern: {}",
                first_token(line)
            )));
        }
    }

    let token = first_token(line);
    if token.is_empty() {
        return Ok(());
    }
    if !allowlist.iter().any(|a| a == token) {
        return Err(ServiceError::Refused(format!("command not in allowlist: {token}")));
    }
    Ok(())
}

/// The command name: the first whitespace token, with any path prefix
/// stripped so `/usr/bin/git` gates like `git`.
fn first_token(line: &str) -> &str {
    let token = line.split_whitespace().next().unwrap_or("");
    token.rsplit('/').next().unwrap_or(token)
}
