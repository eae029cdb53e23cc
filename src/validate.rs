use std::sync::LazyLock;

use regex::Regex;

use crate::domain::IdentifierKind;
use crate::error::ValidationError;

static CAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9]\d{1,6}-\d{2}-\d$").expect("CAS pattern compiles"));
static INCHIKEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{14}-[A-Z]{10}-[A-Z]$").expect("InChIKey pattern compiles"));

const MAX_NAME_LEN: usize = 512;

/// Format-level validation of one identifier. CAS numbers additionally carry
/// a weighted check digit. Structural validity of SMILES is left to the
/// chemistry engine.
pub fn validate_identifier(kind: IdentifierKind, value: &str) -> Result<(), ValidationError> {
    match kind {
        IdentifierKind::Cas => validate_cas(value),
        IdentifierKind::InchiKey => {
            if INCHIKEY_RE.is_match(value) {
                Ok(())
            } else {
                Err(ValidationError::InvalidFormat)
            }
        }
        IdentifierKind::Smiles => validate_smiles(value),
        IdentifierKind::Name => {
            let trimmed = value.trim();
            if trimmed.is_empty()
                || trimmed.len() > MAX_NAME_LEN
                || trimmed.chars().any(char::is_control)
            {
                Err(ValidationError::InvalidFormat)
            } else {
                Ok(())
            }
        }
    }
}

/// Canonical spelling of an identifier before validation: trimmed, and
/// upper-cased for InChIKeys.
pub fn normalize_identifier(kind: IdentifierKind, value: &str) -> String {
    match kind {
        IdentifierKind::InchiKey => value.trim().to_ascii_uppercase(),
        _ => value.trim().to_string(),
    }
}

fn validate_cas(value: &str) -> Result<(), ValidationError> {
    if !CAS_RE.is_match(value) {
        return Err(ValidationError::InvalidFormat);
    }
    let digits: Vec<u32> = value.chars().filter_map(|ch| ch.to_digit(10)).collect();
    let Some((check, body)) = digits.split_last() else {
        return Err(ValidationError::InvalidFormat);
    };
    if cas_check_digit(body) == *check {
        Ok(())
    } else {
        Err(ValidationError::ChecksumMismatch)
    }
}

/// Rightmost body digit has weight 1, the next weight 2, and so on; the
/// check digit is the weighted sum modulo 10.
pub fn cas_check_digit(body: &[u32]) -> u32 {
    body.iter()
        .rev()
        .enumerate()
        .map(|(idx, digit)| (idx as u32 + 1) * digit)
        .sum::<u32>()
        % 10
}

fn validate_smiles(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::InvalidFormat);
    }
    let allowed = |ch: char| ch.is_ascii_alphanumeric() || "@+-[]()=#$%/\\.:*~".contains(ch);
    if !value.chars().all(allowed) {
        return Err(ValidationError::InvalidFormat);
    }
    if !value.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '[' || ch == '*') {
        return Err(ValidationError::InvalidFormat);
    }

    let mut parens = 0i32;
    let mut in_bracket = false;
    for ch in value.chars() {
        match ch {
            '(' if !in_bracket => parens += 1,
            ')' if !in_bracket => {
                parens -= 1;
                if parens < 0 {
                    return Err(ValidationError::InvalidFormat);
                }
            }
            '[' if !in_bracket => in_bracket = true,
            ']' if in_bracket => in_bracket = false,
            '[' | ']' => return Err(ValidationError::InvalidFormat),
            _ => {}
        }
    }
    if parens != 0 || in_bracket {
        return Err(ValidationError::InvalidFormat);
    }
    Ok(())
}
