//! Typed scopes, legacy alias expansion, and route scope policy.
//!
//! Scope strings only exist at the edges: token claims and config files.
//! They are parsed once into [`Scope`] values and every authorization
//! decision after that is pure set arithmetic, so evaluation order can
//! never change an outcome.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::MatchMode;

/// A canonical permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Read OCR/extraction results.
    Read,
    /// Submit documents for processing.
    Execute,
    /// Operational surfaces (metrics, admin endpoints). Satisfies any policy.
    Admin,
}

impl Scope {
    /// Canonical string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Execute => "execute",
            Self::Admin => "admin",
        }
    }

    /// Parse a scope string, expanding legacy aliases to their canonical
    /// scope. Returns `None` for unrecognized strings.
    ///
    /// The alias table is fixed at compile time. Retired names kept for
    /// older token issuers:
    /// - `write`, `legacy:write`, `ocr:write` → `execute`
    /// - `legacy:read`, `ocr:read` → `read`
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "read" | "legacy:read" | "ocr:read" => Some(Self::Read),
            "execute" | "write" | "legacy:write" | "ocr:write" => Some(Self::Execute),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expand a list of raw scope strings into a canonical scope set.
///
/// Unrecognized scopes are dropped, never an error: tokens minted for
/// other services may carry scopes this gateway does not know about.
#[must_use]
pub fn expand<I, S>(raw: I) -> BTreeSet<Scope>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|s| Scope::parse(s.as_ref()))
        .collect()
}

/// A route's scope requirement.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    /// Required canonical scopes.
    pub required: Vec<Scope>,
    /// ALL or ANY matching.
    pub mode: MatchMode,
}

impl ScopePolicy {
    /// Build a policy from config scope strings. Unknown scope names in
    /// config are a startup error, unlike token scopes.
    ///
    /// # Errors
    ///
    /// Returns the offending string if any configured scope is unknown.
    pub fn from_config(scopes: &[String], mode: MatchMode) -> Result<Self, String> {
        let required = scopes
            .iter()
            .map(|s| Scope::parse(s).ok_or_else(|| s.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { required, mode })
    }

    /// Evaluate the policy against a principal's scope set.
    ///
    /// `admin` satisfies any policy outright. On denial the returned list
    /// holds the scopes the caller is missing (for ANY mode, every
    /// acceptable scope — the caller holds none of them).
    pub fn evaluate(&self, held: &BTreeSet<Scope>) -> Result<(), Vec<Scope>> {
        if self.required.is_empty() || held.contains(&Scope::Admin) {
            return Ok(());
        }

        match self.mode {
            MatchMode::All => {
                let missing: Vec<Scope> = self
                    .required
                    .iter()
                    .copied()
                    .filter(|s| !held.contains(s))
                    .collect();
                if missing.is_empty() { Ok(()) } else { Err(missing) }
            }
            MatchMode::Any => {
                if self.required.iter().any(|s| held.contains(s)) {
                    Ok(())
                } else {
                    Err(self.required.clone())
                }
            }
        }
    }
}
