//! Verification code newtype and shape validation.

use secrecy::{ExposeSecret, SecretString};

use crate::error::InputError;

/// A one-time verification code.
///
/// Held as a [`SecretString`], so `Debug` prints a redacted placeholder and a
/// code can sit in `tracing` fields without leaking. Call
/// [`VerificationCode::expose_secret`] only where the raw digits are needed
/// (the outbound relay body, the dead-letter file, the submit echo).
#[derive(Clone, Debug)]
pub struct VerificationCode(SecretString);

impl VerificationCode {
    /// Wrap a value that has already been validated.
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Validate a code: non-empty, ASCII digits only, exact length.
    ///
    /// Both ingress paths (HTTP submit and mailbox extraction) go through here.
    pub fn parse(raw: &str, expected_len: usize) -> Result<Self, InputError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InputError::Missing);
        }
        if !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(InputError::NotNumeric);
        }
        if trimmed.len() != expected_len {
            return Err(InputError::WrongLength {
                expected: expected_len,
                actual: trimmed.len(),
            });
        }
        Ok(Self::new(trimmed))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for VerificationCode {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl Eq for VerificationCode {}
