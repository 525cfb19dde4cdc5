//! RFC 6238 TOTP codes for two-factor login prompts.
//!
//! Seeds generated by the creation runner are stored hex-encoded; seeds
//! issued by a platform arrive as RFC 4648 base32 and are accepted as-is.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

/// Code period in seconds.
const PERIOD: u64 = 30;

/// Code length in digits.
const DIGITS: u32 = 6;

#[derive(Debug, Error)]
pub enum TotpError {
    #[error("TOTP seed is neither valid base32 nor hex")]
    BadSeed,

    #[error("system clock is before the unix epoch")]
    ClockSkew,
}

/// Compute the current 6-digit code for a seed.
pub fn current_code(seed: &str) -> Result<String, TotpError> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| TotpError::ClockSkew)?;
    Ok(code_at(&decode_seed(seed)?, now.as_secs()))
}

/// Generate a fresh 20-byte seed, hex-encoded, for new accounts.
pub fn generate_seed() -> String {
    use rand::RngCore;
    let mut seed = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut seed);
    hex::encode(seed)
}

/// Compute the code for a raw key at a given unix timestamp.
fn code_at(key: &[u8], unix_secs: u64) -> String {
    let counter = unix_secs / PERIOD;

    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 §5.3)
    let offset = (digest[19] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    format!("{:0width$}", binary % 10u32.pow(DIGITS), width = DIGITS as usize)
}

/// Accept a seed in base32 (platform-issued) or hex (self-generated).
fn decode_seed(seed: &str) -> Result<Vec<u8>, TotpError> {
    let trimmed: String = seed.trim().chars().filter(|c| *c != ' ').collect();

    if let Some(bytes) = decode_base32(&trimmed) {
        return Ok(bytes);
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(&trimmed).map_err(|_| TotpError::BadSeed);
    }
    Err(TotpError::BadSeed)
}

/// RFC 4648 base32 decode (no padding required). None on any invalid char.
/// No example dependency covers base32, so this stays local.
fn decode_base32(s: &str) -> Option<Vec<u8>> {
    let input = s.trim_end_matches('=');
    if input.is_empty() {
        return None;
    }

    let mut bits: u64 = 0;
    let mut bit_count = 0;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);

    for c in input.chars() {
        let value = match c.to_ascii_uppercase() {
            'A'..='Z' => c.to_ascii_uppercase() as u64 - 'A' as u64,
            '2'..='7' => c as u64 - '2' as u64 + 26,
            _ => return None,
        };
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B vectors (SHA-1 key, truncated to 6 digits).
    const RFC_KEY: &[u8] = b"12345678901234567890";

    #[test]
    fn rfc6238_vectors() {
        assert_eq!(code_at(RFC_KEY, 59), "287082");
        assert_eq!(code_at(RFC_KEY, 1111111109), "081804");
        assert_eq!(code_at(RFC_KEY, 1111111111), "050471");
        assert_eq!(code_at(RFC_KEY, 1234567890), "005924");
        assert_eq!(code_at(RFC_KEY, 2000000000), "279037");
    }

    #[test]
    fn base32_decode_known_values() {
        // "MFRGG" is base32 for "abc"
        assert_eq!(decode_base32("MFRGG").unwrap(), b"abc");
        assert_eq!(decode_base32("mfrgg").unwrap(), b"abc");
        assert_eq!(decode_base32("MFRGG===").unwrap(), b"abc");
        assert!(decode_base32("MF1GG").is_none());
        assert!(decode_base32("").is_none());
    }

    #[test]
    fn hex_seed_accepted() {
        let seed = hex::encode(RFC_KEY);
        assert_eq!(decode_seed(&seed).unwrap(), RFC_KEY);
    }

    #[test]
    fn generated_seed_round_trips() {
        let seed = generate_seed();
        assert_eq!(seed.len(), 40);
        let bytes = decode_seed(&seed).unwrap();
        assert_eq!(bytes.len(), 20);
        let code = code_at(&bytes, 59);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn bad_seed_rejected() {
        assert!(decode_seed("not!a@seed").is_err());
    }
}
