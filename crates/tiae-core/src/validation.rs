//! Input validation and normalization shared by every store.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{TiaeError, TiaeResult};

static SHORT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9-]{1,63}$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// Check a tenant short-name. It doubles as a schema name and a DNS label,
/// so nothing outside `[a-z0-9-]{1,63}` is accepted.
pub fn validate_short_name(short_name: &str) -> TiaeResult<()> {
    if SHORT_NAME.is_match(short_name) {
        Ok(())
    } else {
        Err(TiaeError::InvalidShortName(short_name.to_string()))
    }
}

/// Lowercase and trim an email address. Emails are compared in this form
/// everywhere.
pub fn normalize_email(email: &str) -> TiaeResult<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    };
    if !valid {
        return Err(TiaeError::InvalidArgument(format!(
            "invalid email address: {email:?}"
        )));
    }
    Ok(email)
}

pub fn require_non_empty(field: &str, value: &str) -> TiaeResult<()> {
    if value.trim().is_empty() {
        return Err(TiaeError::InvalidArgument(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Lowercase kebab-case form of a display name.
///
/// Runs of anything that is not an ASCII letter or digit collapse into a
/// single `-`; leading and trailing dashes are dropped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Pick the first free slug: `base`, then `base-1`, `base-2`, ...
///
/// `taken` is checked case-insensitively.
pub fn next_free_slug<'a, I>(base: &str, taken: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: Vec<String> = taken.into_iter().map(str::to_lowercase).collect();
    let is_taken = |candidate: &str| taken.iter().any(|t| t == candidate);
    if !is_taken(base) {
        return base.to_string();
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Slug for a name, rejecting names that slugify to nothing.
pub fn slug_base(name: &str) -> TiaeResult<String> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(TiaeError::InvalidArgument(format!(
            "name {name:?} must contain at least one letter or digit"
        )));
    }
    Ok(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_boundaries() {
        assert!(validate_short_name("a").is_ok());
        assert!(validate_short_name(&"a".repeat(63)).is_ok());
        assert!(validate_short_name("acme-2").is_ok());

        assert!(validate_short_name("").is_err());
        assert!(validate_short_name(&"a".repeat(64)).is_err());
        assert!(validate_short_name("acme_inc").is_err());
        assert!(validate_short_name("Acme").is_err());
        assert!(validate_short_name("acme inc").is_err());
    }

    #[test]
    fn short_name_error_carries_input() {
        match validate_short_name("no_way") {
            Err(TiaeError::InvalidShortName(name)) => assert_eq!(name, "no_way"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn emails_fold_to_lowercase() {
        assert_eq!(normalize_email("  Ada@Acme.TEST ").unwrap(), "ada@acme.test");
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("@acme.test").is_err());
        assert!(normalize_email("a@b@c").is_err());
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("rw-logs"), "rw-logs");
        assert_eq!(slugify("Read Only  Logs!"), "read-only-logs");
        assert_eq!(slugify("  --Backup__Writer--  "), "backup-writer");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn slug_collisions_get_numeric_suffix() {
        assert_eq!(next_free_slug("logs", []), "logs");
        assert_eq!(next_free_slug("logs", ["logs"]), "logs-1");
        assert_eq!(next_free_slug("logs", ["LOGS", "logs-1", "logs-3"]), "logs-2");
    }

    #[test]
    fn empty_slug_is_rejected() {
        assert!(slug_base("???").is_err());
        assert_eq!(slug_base("Logs Writer").unwrap(), "logs-writer");
    }
}
