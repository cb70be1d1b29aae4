use crate::error::ContractError;
use serde::{Deserialize, Serialize};

const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// Phone number split the way the provider's SMS/WhatsApp delivery expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhoneNumber {
    pub country_code: String,
    pub number: String,
}

impl PhoneNumber {
    /// Parse a raw phone number into country code + subscriber number.
    ///
    /// Known prefixes are matched first (503, 1 with 11 total digits, 56); any other
    /// number is split best-effort, taking 1 to 3 leading digits as country code.
    pub fn parse(raw: &str) -> Result<Self, ContractError> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        let digits = digits.trim_start_matches("00").to_string();

        if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
            return Err(ContractError::InvalidPhoneNumber(raw.to_string()));
        }

        let country_len = if digits.starts_with("503") {
            3
        } else if digits.starts_with('1') && digits.len() == 11 {
            1
        } else if digits.starts_with("56") {
            2
        } else {
            digits.len().saturating_sub(10).clamp(1, 3)
        };

        let (country_code, number) = digits.split_at(country_len);
        if number.len() < 6 || country_code.starts_with('0') {
            return Err(ContractError::InvalidPhoneNumber(raw.to_string()));
        }

        Ok(Self {
            country_code: country_code.to_string(),
            number: number.to_string(),
        })
    }

    pub fn e164(&self) -> String {
        format!("+{}{}", self.country_code, self.number)
    }
}
