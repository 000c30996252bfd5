//! Curve Keys
//!
//! P-192 key pairs in the Cube 2 text encoding:
//! - public key: `+` (even Y) or `-` (odd Y) followed by the hex X coordinate
//! - private key: the hex scalar
//!
//! Hex output is lowercase without leading zeros. Y is never transmitted; it
//! is recovered from `y² = x³ - 3x + B` when decoding.

use std::fmt;
use std::str::FromStr;

use elliptic_curve::sec1::ToEncodedPoint;
use p192::NistP192;
use rand_core::{OsRng, RngCore};

use super::{CryptoError, ParseError};

pub(crate) type SecretKey = elliptic_curve::SecretKey<NistP192>;
pub(crate) type CurvePoint = elliptic_curve::PublicKey<NistP192>;

/// Size of a P-192 field element in bytes.
pub const FIELD_BYTES: usize = 24;

/// SEC1 tag for a compressed point with even Y.
const TAG_EVEN: u8 = 0x02;
/// SEC1 tag for a compressed point with odd Y.
const TAG_ODD: u8 = 0x03;

/// Draws before giving up on finding an in-range scalar.
const MAX_SCALAR_DRAWS: usize = 16;

// =============================================================================
// KEYS
// =============================================================================

/// A P-192 private key (scalar).
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(SecretKey);

impl PrivateKey {
    /// Derive the matching public key (`priv * G`).
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(self.0.to_bytes().as_slice()))
    }
}

impl FromStr for PrivateKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_field(s.trim())?;
        SecretKey::from_slice(&bytes)
            .map(PrivateKey)
            .map_err(|_| ParseError::InvalidScalar)
    }
}

/// A P-192 public key (curve point).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(CurvePoint);

impl PublicKey {
    pub(crate) fn as_point(&self) -> &CurvePoint {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_point(&self.0))
    }
}

impl FromStr for PublicKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_point(s.trim()).map(PublicKey)
    }
}

/// Generate a fresh key pair from the OS entropy source.
pub fn generate_key_pair() -> Result<(PrivateKey, PublicKey), CryptoError> {
    let secret = random_secret()?;
    let private = PrivateKey(secret);
    let public = private.public_key();
    Ok((private, public))
}

// =============================================================================
// ENCODING HELPERS
// =============================================================================

/// Draw a uniformly random non-zero scalar.
pub(crate) fn random_secret() -> Result<SecretKey, CryptoError> {
    let mut bytes = [0u8; FIELD_BYTES];
    for _ in 0..MAX_SCALAR_DRAWS {
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return Ok(secret);
        }
    }
    Err(CryptoError::Entropy("no in-range scalar drawn".to_string()))
}

/// Encode a point as sign character plus hex X.
pub(crate) fn encode_point(point: &CurvePoint) -> String {
    let encoded = point.to_encoded_point(true);
    let bytes = encoded.as_bytes();
    let sign = if bytes[0] == TAG_ODD { '-' } else { '+' };
    format!("{}{}", sign, encode_hex(&bytes[1..]))
}

/// Decode a sign-plus-hex-X point, recovering Y from the curve equation.
pub(crate) fn decode_point(text: &str) -> Result<CurvePoint, ParseError> {
    let mut chars = text.chars();
    let tag = match chars.next() {
        Some('+') => TAG_EVEN,
        Some('-') => TAG_ODD,
        Some(c) => return Err(ParseError::InvalidSign(c)),
        None => return Err(ParseError::TooShort),
    };

    let x = decode_field(chars.as_str())?;
    let mut sec1 = [0u8; FIELD_BYTES + 1];
    sec1[0] = tag;
    sec1[1..].copy_from_slice(&x);

    CurvePoint::from_sec1_bytes(&sec1).map_err(|_| ParseError::NotOnCurve)
}

/// Lowercase hex without leading zeros ("0" for zero).
pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    let full = hex::encode(bytes);
    let trimmed = full.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parse a hex number into a big-endian field element, left-padding short input.
pub(crate) fn decode_field(text: &str) -> Result<[u8; FIELD_BYTES], ParseError> {
    if text.is_empty() {
        return Err(ParseError::TooShort);
    }

    let digits = text.trim_start_matches('0');
    if digits.len() > FIELD_BYTES * 2 {
        return Err(ParseError::TooLong(FIELD_BYTES * 2));
    }

    let padded = format!("{:0>width$}", digits, width = FIELD_BYTES * 2);
    let mut out = [0u8; FIELD_BYTES];
    hex::decode_to_slice(&padded, &mut out).map_err(|e| ParseError::InvalidHex(e.to_string()))?;
    Ok(out)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generated_keys_round_trip() {
        let (private, public) = generate_key_pair().unwrap();

        let parsed_private: PrivateKey = private.to_string().parse().unwrap();
        let parsed_public: PublicKey = public.to_string().parse().unwrap();

        assert_eq!(parsed_private, private);
        assert_eq!(parsed_public, public);
        assert_eq!(parsed_private.public_key(), public);
    }

    #[test]
    fn test_public_key_sign_prefix() {
        let (_, public) = generate_key_pair().unwrap();
        let text = public.to_string();
        assert!(text.starts_with('+') || text.starts_with('-'));
        assert!(text[1..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_flipped_sign_is_a_different_point() {
        let (_, public) = generate_key_pair().unwrap();
        let text = public.to_string();
        let flipped = match &text[..1] {
            "+" => format!("-{}", &text[1..]),
            _ => format!("+{}", &text[1..]),
        };

        let other: PublicKey = flipped.parse().unwrap();
        assert_ne!(other, public);
    }

    #[test]
    fn test_leading_zeros_accepted() {
        let (private, public) = generate_key_pair().unwrap();
        let padded_private = format!("000{}", private);
        let padded_public = format!("{}000{}", &public.to_string()[..1], &public.to_string()[1..]);

        assert_eq!(padded_private.parse::<PrivateKey>().unwrap(), private);
        assert_eq!(padded_public.parse::<PublicKey>().unwrap(), public);
    }

    #[test]
    fn test_malformed_public_keys() {
        assert_eq!("".parse::<PublicKey>(), Err(ParseError::TooShort));
        assert_eq!("+".parse::<PublicKey>(), Err(ParseError::TooShort));
        assert_eq!("*abc".parse::<PublicKey>(), Err(ParseError::InvalidSign('*')));
        assert!(matches!("+xyz".parse::<PublicKey>(), Err(ParseError::InvalidHex(_))));

        let too_long = format!("+1{}", "0".repeat(FIELD_BYTES * 2));
        assert_eq!(too_long.parse::<PublicKey>(), Err(ParseError::TooLong(FIELD_BYTES * 2)));
    }

    #[test]
    fn test_some_x_values_are_not_on_curve() {
        // Roughly half of all X coordinates have no square root for Y
        let results: Vec<_> = (1u32..64)
            .map(|x| format!("+{:x}", x).parse::<PublicKey>())
            .collect();

        assert!(results.iter().any(|r| r == &Err(ParseError::NotOnCurve)));
        assert!(results.iter().any(|r| r.is_ok()));
    }

    #[test]
    fn test_malformed_private_keys() {
        assert_eq!("".parse::<PrivateKey>(), Err(ParseError::TooShort));
        assert_eq!("0".parse::<PrivateKey>(), Err(ParseError::InvalidScalar));
        assert!(matches!("g1".parse::<PrivateKey>(), Err(ParseError::InvalidHex(_))));
        // Larger than the group order
        assert_eq!("f".repeat(FIELD_BYTES * 2).parse::<PrivateKey>(), Err(ParseError::InvalidScalar));
    }

    #[test]
    fn test_private_key_debug_hides_scalar() {
        let (private, _) = generate_key_pair().unwrap();
        assert_eq!(format!("{:?}", private), "PrivateKey(..)");
    }

    #[test]
    fn test_encode_hex_strips_zeros() {
        assert_eq!(encode_hex(&[0, 0, 0x0a, 0xbc]), "abc");
        assert_eq!(encode_hex(&[0, 0]), "0");
    }

    proptest! {
        #[test]
        fn prop_key_text_round_trip(bytes in proptest::array::uniform24(any::<u8>())) {
            let parsed = hex::encode(bytes).parse::<PrivateKey>();
            prop_assume!(parsed.is_ok());
            let private = parsed.unwrap();
            let public = private.public_key();

            prop_assert_eq!(private.to_string().parse::<PrivateKey>().unwrap(), private.clone());
            prop_assert_eq!(public.to_string().parse::<PublicKey>().unwrap(), public);
        }
    }
}
