//! Input validation — every public operation runs its inputs through here
//! before touching state.

use crate::{Error, Result};

/// Field names that can clobber object internals in downstream consumers.
pub const DANGEROUS_KEYS: &[&str] = &["__proto__", "prototype", "constructor"];

/// Reserved words that may not be used as entity type names.
const RESERVED_TYPE_NAMES: &[&str] = &["__proto__", "prototype", "constructor"];

const MAX_TYPE_NAME_LEN: usize = 64;
const MAX_ENTITY_ID_LEN: usize = 256;

/// Maximum number of items accepted by `create_many` / `update_many` /
/// `delete_many` / `perform_many`.
pub const MAX_BATCH: usize = 1000;

/// Type names: non-empty, letters/digits/underscore, max 64, not reserved.
pub fn validate_type_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("type name must not be empty".into()));
    }
    if name.len() > MAX_TYPE_NAME_LEN {
        return Err(Error::Validation(format!(
            "type name '{name}' exceeds {MAX_TYPE_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Validation(format!(
            "type name '{name}' contains invalid characters"
        )));
    }
    if RESERVED_TYPE_NAMES.contains(&name) {
        return Err(Error::Validation(format!(
            "type name '{name}' is reserved"
        )));
    }
    Ok(())
}

/// Entity ids: non-empty, no path separators, max 256.
pub fn validate_entity_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("entity id must not be empty".into()));
    }
    if id.len() > MAX_ENTITY_ID_LEN {
        return Err(Error::Validation(format!(
            "entity id exceeds {MAX_ENTITY_ID_LEN} characters"
        )));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(Error::Validation(format!(
            "entity id '{id}' must not contain path separators"
        )));
    }
    Ok(())
}

/// Field names used in `where` / `order_by` / search field lists:
/// `^[A-Za-z_][A-Za-z0-9_]*$` and not in the dangerous set. Dotted,
/// bracketed, `$`, `@`, whitespace, and non-ASCII names are rejected.
pub fn validate_field_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !head_ok || !tail_ok {
        return Err(Error::Validation(format!(
            "invalid field name '{name}'"
        )));
    }
    if DANGEROUS_KEYS.contains(&name) {
        return Err(Error::Validation(format!(
            "field name '{name}' is not allowed"
        )));
    }
    Ok(())
}

/// Escape the LIKE wildcard characters `%`, `_`, and `\` with `\`.
/// Any LIKE clause built from the result must declare `ESCAPE '\'`.
pub fn escape_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '%' || c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Reject oversized batches before any per-item work begins.
pub fn validate_batch_len(len: usize) -> Result<()> {
    if len > MAX_BATCH {
        return Err(Error::BatchTooLarge {
            len,
            max: MAX_BATCH,
        });
    }
    Ok(())
}

/// Namespace ids at the external boundary: `^[A-Za-z0-9_-]{1,64}$`.
pub fn validate_namespace(ns: &str) -> Result<()> {
    let ok = !ns.is_empty()
        && ns.len() <= 64
        && ns
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(Error::Validation(format!("invalid namespace '{ns}'")));
    }
    Ok(())
}
