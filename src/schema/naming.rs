use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::query::ident;
use crate::reconcile::AUDIT_COLUMNS;

/// Maps raw file headers to canonical snake_case column names.
#[derive(Debug, Clone, Default)]
pub struct Naming {
    overrides: BTreeMap<String, String>,
}

impl Naming {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn canonical(&self, header: &str) -> String {
        let header = header.trim();
        match self.overrides.get(header) {
            Some(name) => name.clone(),
            None => snake_case(header),
        }
    }

    /// Canonical names for a whole header row. Names must be valid
    /// identifiers, unique after renaming and clear of the audit columns.
    pub fn canonicalize(&self, headers: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::with_capacity(headers.len());
        let mut out = Vec::with_capacity(headers.len());
        for raw in headers {
            let name = self.canonical(raw);
            ident(&name)?;
            if AUDIT_COLUMNS.iter().any(|a| a.eq_ignore_ascii_case(&name)) {
                return Err(Error::Validation(format!(
                    "header `{}` maps to reserved audit column `{}`",
                    raw, name
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::Validation(format!(
                    "header `{}` collides with another column as `{}`",
                    raw, name
                )));
            }
            out.push(name);
        }
        Ok(out)
    }
}

/// `Best3SquatKg` -> `best_3_squat_kg`, `HTTPStatus` -> `http_status`.
pub fn snake_case(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if let Some(&prev) = i.checked_sub(1).and_then(|p| chars.get(p)) {
            let next = chars.get(i + 1).copied();
            let boundary = (c.is_ascii_uppercase()
                && (prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next.is_some_and(|n| n.is_ascii_lowercase()))))
                || (c.is_ascii_digit() && prev.is_ascii_alphabetic())
                || (c.is_ascii_alphabetic() && prev.is_ascii_digit());
            if boundary && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }

    let trimmed = out.trim_matches('_');
    match trimmed.chars().next() {
        None => "col".to_string(),
        Some(first) if first.is_ascii_digit() => format!("col_{}", trimmed),
        Some(_) => trimmed.to_string(),
    }
}
