use crate::error::{AppError, AppResult};

pub const WHATSAPP_SUFFIX: &str = "s.whatsapp.net";
pub const GROUP_SUFFIX: &str = "@g.us";

const MIN_DIGITS: usize = 7;
const LOCAL_NUMBER_MAX_DIGITS: usize = 9;

/// Turns a raw phone string into `<digits>@s.whatsapp.net`.
///
/// `00` and `+` international prefixes are dropped. Numbers of up to nine digits
/// that do not already carry `default_country` get it prepended.
pub fn normalize_address(raw: &str, default_country: &str) -> AppResult<String> {
    let stripped = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect::<String>();
    if stripped.is_empty() {
        return Err(AppError::InvalidAddress(format!("empty phone: {raw:?}")));
    }

    let mut number = stripped.as_str();
    if let Some(rest) = number.strip_prefix("00") {
        number = rest;
    }
    if let Some(rest) = number.strip_prefix('+') {
        number = rest;
    }
    // stray '+' signs past the prefix are noise
    let mut digits = number
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();

    if digits.len() <= LOCAL_NUMBER_MAX_DIGITS && !digits.starts_with(default_country) {
        digits = format!("{default_country}{digits}");
    }
    if digits.len() < MIN_DIGITS {
        return Err(AppError::InvalidAddress(format!("phone too short: {raw:?}")));
    }
    Ok(format!("{digits}@{WHATSAPP_SUFFIX}"))
}

pub fn is_group_address(address: &str) -> bool {
    address.ends_with(GROUP_SUFFIX)
}

/// Text before the channel suffix, e.g. the phone digits of a JID.
pub fn address_local_part(address: &str) -> &str {
    address.split('@').next().unwrap_or(address)
}
