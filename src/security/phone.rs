//! Privacy-preserving caller-line handling.
//!
//! Raw numbers are normalized to E.164, then hashed with SHA-256 over
//! `pepper || normalized`. Only the hash (or a masked form) may appear in
//! session state, metrics, or logs. Two peppers are supported so the
//! secret can rotate without losing continuity.

use crate::config::PhoneConfig;
use crate::error::{GatewayError, Result};
use sha2::{Digest, Sha256};

/// A hashed caller line with audit metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneHash {
    /// Lowercase hex SHA-256 digest.
    pub value: String,
    /// The E.164 form that was hashed.
    pub normalized: String,
    /// Which pepper produced the hash (`current` / `previous`).
    pub pepper_id: &'static str,
}

impl PhoneHash {
    /// 12-character prefix suitable for metric labels.
    pub fn metrics_prefix(&self) -> &str {
        &self.value[..self.value.len().min(12)]
    }
}

/// Normalize a dialed number into E.164.
///
/// Rules: strip everything but digits and a leading `+`; `00X…` becomes
/// `+X…`; a bare leading `0` is replaced by the default country code; a
/// number with no prefix gets the default country code prepended.
///
/// # Errors
///
/// Returns an error for an empty input or one with no digits.
pub fn normalize_e164(number: &str, default_country_code: &str) -> Result<String> {
    let trimmed = number.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Phone("number must not be empty".to_owned()));
    }

    let mut cleaned = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        if c.is_ascii_digit() || (c == '+' && i == 0) {
            cleaned.push(c);
        }
    }
    if cleaned.is_empty() || cleaned == "+" {
        return Err(GatewayError::Phone(format!(
            "no digits in number ({} chars)",
            trimmed.len()
        )));
    }

    let normalized = if let Some(rest) = cleaned.strip_prefix("00") {
        format!("+{rest}")
    } else if cleaned.starts_with('+') {
        cleaned
    } else if cleaned.starts_with('0') {
        format!(
            "{default_country_code}{}",
            cleaned.trim_start_matches('0')
        )
    } else {
        format!("{default_country_code}{cleaned}")
    };

    if normalized.starts_with('+') {
        Ok(normalized)
    } else {
        Ok(format!("+{normalized}"))
    }
}

fn hash_with_pepper(normalized: &str, pepper: &str) -> Result<String> {
    if pepper.is_empty() || pepper == "CHANGE_ME" {
        return Err(GatewayError::Phone(
            "phone hash pepper must be configured".to_owned(),
        ));
    }
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Normalize and hash a caller line with the current pepper.
///
/// # Errors
///
/// Returns an error for unusable numbers or an unconfigured pepper.
pub fn hash_phone_number(number: &str, config: &PhoneConfig) -> Result<PhoneHash> {
    let normalized = normalize_e164(number, &config.default_country_code)?;
    let value = hash_with_pepper(&normalized, &config.pepper)?;
    Ok(PhoneHash {
        value,
        normalized,
        pepper_id: "current",
    })
}

/// Hash with the previous pepper, if one is configured (rotation support).
pub fn rehash_with_previous_pepper(number: &str, config: &PhoneConfig) -> Option<PhoneHash> {
    let previous = config.previous_pepper.as_deref()?;
    let normalized = normalize_e164(number, &config.default_country_code).ok()?;
    let value = hash_with_pepper(&normalized, previous).ok()?;
    Some(PhoneHash {
        value,
        normalized,
        pepper_id: "previous",
    })
}

/// Masked representation for logs, e.g. `+491****1234`.
pub fn mask_number(number: &str, default_country_code: &str) -> Result<String> {
    let normalized = normalize_e164(number, default_country_code)?;
    if normalized.len() <= 6 {
        return Ok(normalized);
    }
    Ok(format!(
        "{}****{}",
        &normalized[..4],
        &normalized[normalized.len() - 4..]
    ))
}
