//! Payer phone normalization to the `<country code><subscriber>` form
//! Daraja expects in `PartyA` and `PhoneNumber`.

use reserve_core::{ReserveError, ReserveResult};

/// Subscriber digits after the country code
const SUBSCRIBER_DIGITS: usize = 9;

/// Normalize a phone number as typed by a payer.
///
/// `+254 712-345-678`, `0712345678` and `712345678` all become
/// `254712345678`. Anything that does not end up as the country code plus
/// nine digits is rejected.
pub fn normalize_phone(raw: &str, country_code: &str) -> ReserveResult<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();
    let compact = compact.strip_prefix('+').unwrap_or(&compact);

    let normalized = if let Some(local) = compact.strip_prefix('0') {
        format!("{}{}", country_code, local)
    } else if compact.starts_with(country_code) {
        compact.to_string()
    } else {
        format!("{}{}", country_code, compact)
    };

    if normalized.len() != country_code.len() + SUBSCRIBER_DIGITS
        || !normalized.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ReserveError::GatewayRejected {
            reason: "invalid phone number".to_string(),
        });
    }

    Ok(normalized)
}
