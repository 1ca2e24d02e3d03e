//! Recipient address normalization.
//!
//! Converts freeform phone input (`+91 98765-43210`, `(987) 654 3210`) into
//! the canonical `<digits><suffix>` address the messaging network expects.

use campusline_config::BrokerConfig;

use crate::{Error, Result};

/// Number of digits in a national number that still lacks a country code.
const NATIONAL_NUMBER_LEN: usize = 10;

/// Pure phone-number to network-address converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressNormalizer {
    default_country_code: String,
    suffix: String,
}

impl AddressNormalizer {
    pub fn new(default_country_code: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            default_country_code: default_country_code.into(),
            suffix: suffix.into(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.default_country_code, &config.address_suffix)
    }

    /// The suffix appended to every canonical address.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Normalize `input` into a canonical address.
    ///
    /// Applying this to its own output returns the same address.
    pub fn normalize(&self, input: &str) -> Result<String> {
        let trimmed = input.trim();
        let body = if self.suffix.is_empty() {
            trimmed
        } else {
            trimmed.strip_suffix(self.suffix.as_str()).unwrap_or(trimmed)
        };

        let digits: String = body.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(Error::invalid_recipient(input, "no digits in phone number"));
        }

        let mut address = String::with_capacity(
            self.default_country_code.len() + digits.len() + self.suffix.len(),
        );
        if digits.len() == NATIONAL_NUMBER_LEN {
            address.push_str(&self.default_country_code);
        }
        address.push_str(&digits);
        address.push_str(&self.suffix);
        Ok(address)
    }
}
