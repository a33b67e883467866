//! Subject naming and wildcard matching.
//!
//! Subjects are dot-delimited: `krustron.<domain>.<entity>.<event-type>`.
//! Patterns may use `*` for exactly one token and `>` as the last token for
//! one or more trailing tokens.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root token of every subject.
pub const SUBJECT_PREFIX: &str = "krustron";

/// Event source domains. Each one gets its own durable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Cluster lifecycle and health
    Cluster,
    /// GitOps applications
    Application,
    /// CI/CD pipelines
    Pipeline,
    /// Helm/manifest deployments
    Deployment,
    /// Security scans
    Security,
    /// Operator alerts
    Alert,
    /// Audit trail
    Audit,
}

impl Domain {
    /// Every domain, in provisioning order.
    pub const ALL: [Domain; 7] = [
        Domain::Cluster,
        Domain::Application,
        Domain::Pipeline,
        Domain::Deployment,
        Domain::Security,
        Domain::Alert,
        Domain::Audit,
    ];

    /// Lowercase token used in subjects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Cluster => "cluster",
            Domain::Application => "application",
            Domain::Pipeline => "pipeline",
            Domain::Deployment => "deployment",
            Domain::Security => "security",
            Domain::Alert => "alert",
            Domain::Audit => "audit",
        }
    }

    /// Stream name, e.g. `KRUSTRON_CLUSTER`.
    pub fn stream_name(&self) -> String {
        format!(
            "{}_{}",
            SUBJECT_PREFIX.to_uppercase(),
            self.as_str().to_uppercase()
        )
    }

    /// Wildcard subject bound to the domain's stream, e.g. `krustron.cluster.>`.
    pub fn subject_filter(&self) -> String {
        format!("{}.{}.>", SUBJECT_PREFIX, self.as_str())
    }

    /// Fully qualified subject for an entity event.
    pub fn subject(&self, entity: &str, event_type: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            SUBJECT_PREFIX,
            self.as_str(),
            token(entity),
            token(event_type)
        )
    }

    /// Domain named by the second token of a subject.
    pub fn from_subject(subject: &str) -> Option<Domain> {
        let mut tokens = subject.split('.');
        if tokens.next() != Some(SUBJECT_PREFIX) {
            return None;
        }
        let name = tokens.next()?;
        Domain::ALL.into_iter().find(|d| d.as_str() == name)
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Make an arbitrary identifier safe to use as one subject token.
pub fn token(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Validate a concrete subject (no wildcards).
pub fn validate_subject(subject: &str) -> Result<()> {
    validate(subject, false)
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    validate(pattern, true)
}

fn validate(subject: &str, wildcards: bool) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject("empty subject".to_string()));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() || tok.chars().any(char::is_whitespace) {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        let is_wild = *tok == "*" || *tok == ">";
        if is_wild && !wildcards {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        if *tok == ">" && i != tokens.len() - 1 {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        if !is_wild && (tok.contains('*') || tok.contains('>')) {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Whether `subject` matches `pattern`.
///
/// A pattern ending in `>` requires at least one token in its place.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some concrete subject matches both patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');
    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some(x), Some(y)) if x == "*" || y == "*" || x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
