//! Phone number normalization and pairing code formatting.

use std::fmt;

use serde::Serialize;

use crate::error::PairingError;

/// A pairing code, grouped for a human to type on the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    /// Group a raw code from the messaging service.
    ///
    /// Nine characters become `XXX-XXX-XXX`, eight become `XXXX-XXXX`.
    /// Other lengths are only normalized.
    pub fn from_raw(raw: &str) -> Self {
        let chars: Vec<char> = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .flat_map(char::to_uppercase)
            .collect();

        let group = match chars.len() {
            9 => 3,
            8 => 4,
            _ => return Self(chars.into_iter().collect()),
        };

        let grouped = chars
            .chunks(group)
            .map(|chunk| chunk.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("-");
        Self(grouped)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce a user-supplied phone number to its digits.
///
/// Accepts a leading `+` and common separators; anything else is rejected.
pub fn normalize_phone_number(raw: &str) -> Result<String, PairingError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PairingError::InvalidInput(
            "Phone number is required".to_string(),
        ));
    }

    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits: String = body
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if digits.is_empty() {
        return Err(PairingError::InvalidInput(
            "Phone number is required".to_string(),
        ));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(PairingError::InvalidInput(format!(
            "Phone number must contain only digits: {raw}"
        )));
    }
    Ok(digits)
}

/// Keep only the last four digits, for logs and listings.
pub fn mask_phone_number(digits: &str) -> String {
    let visible = digits.len().min(4);
    let hidden = digits.len() - visible;
    format!("{}{}", "*".repeat(hidden), &digits[hidden..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nine_char_code_grouped_in_threes() {
        assert_eq!(PairingCode::from_raw("ABC123XYZ").as_str(), "ABC-123-XYZ");
        assert_eq!(PairingCode::from_raw("123456789").as_str(), "123-456-789");
    }

    #[test]
    fn test_eight_char_code_grouped_in_fours() {
        assert_eq!(PairingCode::from_raw("abcd1234").as_str(), "ABCD-1234");
    }

    #[test]
    fn test_already_grouped_code_is_regrouped() {
        assert_eq!(PairingCode::from_raw("ABCD-1234").as_str(), "ABCD-1234");
        assert_eq!(PairingCode::from_raw(" abc 123 xyz ").as_str(), "ABC-123-XYZ");
    }

    #[test]
    fn test_other_lengths_left_ungrouped() {
        assert_eq!(PairingCode::from_raw("12345").as_str(), "12345");
        assert_eq!(PairingCode::from_raw("").as_str(), "");
    }

    #[test]
    fn test_code_serializes_as_string() {
        let json = serde_json::to_string(&PairingCode::from_raw("ABC123XYZ")).unwrap();
        assert_eq!(json, "\"ABC-123-XYZ\"");
    }

    #[test]
    fn test_normalize_phone_number() {
        assert_eq!(normalize_phone_number("15551234567").unwrap(), "15551234567");
        assert_eq!(
            normalize_phone_number(" +1 (555) 123-4567 ").unwrap(),
            "15551234567"
        );
    }

    #[test]
    fn test_normalize_rejects_empty_and_garbage() {
        assert!(normalize_phone_number("").unwrap_err().is_user_error());
        assert!(normalize_phone_number("   ").unwrap_err().is_user_error());
        assert!(normalize_phone_number("+").unwrap_err().is_user_error());
        assert!(normalize_phone_number("555-CALL-NOW").unwrap_err().is_user_error());
    }

    #[test]
    fn test_mask_phone_number() {
        assert_eq!(mask_phone_number("15551234567"), "*******4567");
        assert_eq!(mask_phone_number("123"), "123");
    }
}
