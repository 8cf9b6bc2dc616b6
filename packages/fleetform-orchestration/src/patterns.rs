//! `*`-glob matching for the module hash and the fleet filters.
//!
//! `*` is the only wildcard; everything else is literal. Matching is
//! case-insensitive. Hash file patterns match from the start of the file
//! name only, while account-name filters must cover the whole name.

use regex::Regex;

/// Compile a glob pattern anchored at the start of the candidate.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let expr = format!("(?i)^{}", regex::escape(pattern).replace(r"\*", ".*"));
    // Escaped literals always produce a valid expression.
    Regex::new(&expr).expect("escaped glob pattern is a valid regex")
}

/// Compile a glob pattern anchored at both ends of the candidate.
pub fn glob_to_regex_full(pattern: &str) -> Regex {
    let expr = format!("(?i)^{}$", regex::escape(pattern).replace(r"\*", ".*"));
    Regex::new(&expr).expect("escaped glob pattern is a valid regex")
}

/// True if the start of `candidate` matches at least one of the patterns.
pub fn matches_any(candidate: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| glob_to_regex(pattern).is_match(candidate))
}

/// True if the whole of `candidate` matches at least one of the patterns.
pub fn matches_any_full(candidate: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| glob_to_regex_full(pattern).is_match(candidate))
}
