//! Time-based One-Time Passwords
//!
//! RFC 6238 codes for the second login factor: HMAC-SHA1 over the
//! 30-second time step, truncated to six digits. The seed is the base32
//! secret shown when TOTP was enabled on the account.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Length of one time step in seconds.
pub const TOTP_STEP_SECS: u64 = 30;

/// Number of digits in a code.
pub const TOTP_DIGITS: u32 = 6;

/// TOTP generation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    /// The seed was empty after normalization.
    #[error("TOTP seed is empty")]
    EmptySeed,

    /// The seed is not valid base32.
    #[error("TOTP seed is not valid base32: {0}")]
    InvalidSeed(String),
}

/// Generate the code for the time step containing `unix_secs`.
///
/// The seed may contain spaces, lowercase letters and `=` padding.
///
/// # Errors
///
/// Returns `TotpError` if the seed is empty or not base32.
pub fn generate(seed: &str, unix_secs: u64) -> Result<String, TotpError> {
    let key = decode_seed(seed)?;
    let counter = unix_secs / TOTP_STEP_SECS;

    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| TotpError::InvalidSeed(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 section 5.3)
    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = binary % 10_u32.pow(TOTP_DIGITS);

    Ok(format!("{code:06}"))
}

/// Generate the code for the current wall-clock time.
///
/// # Errors
///
/// Returns `TotpError` if the seed is empty or not base32.
pub fn generate_now(seed: &str) -> Result<String, TotpError> {
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    generate(seed, now)
}

fn decode_seed(seed: &str) -> Result<Vec<u8>, TotpError> {
    let normalized: String = seed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() {
        return Err(TotpError::EmptySeed);
    }

    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| TotpError::InvalidSeed(e.to_string()))
}
