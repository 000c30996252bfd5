//! Challenges and Solutions
//!
//! A challenge is the point `s * G` for a fresh scalar `s`; its solution is
//! the X coordinate of `s * pub`. Both come out of one call so they cannot
//! drift apart.

use std::fmt;
use std::str::FromStr;

use elliptic_curve::ecdh::diffie_hellman;

use super::keys::{decode_point, encode_hex, encode_point, random_secret, CurvePoint};
use super::{CryptoError, ParseError, PrivateKey, PublicKey};

/// An ephemeral curve point sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge(CurvePoint);

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_point(&self.0))
    }
}

impl FromStr for Challenge {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_point(s.trim()).map(Challenge)
    }
}

/// Expected answer to a challenge: bare hex X coordinate, no sign character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution(String);

impl Solution {
    fn from_x(x: &[u8]) -> Self {
        Solution(encode_hex(x))
    }

    /// Check a peer's answer. Case and leading zeros are ignored.
    pub fn matches(&self, answer: &str) -> bool {
        let answer = answer.trim().to_ascii_lowercase();
        let digits = answer.trim_start_matches('0');
        let digits = if digits.is_empty() { "0" } else { digits };
        digits == self.0
    }

    /// Wire form of the solution.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a challenge for `public` together with the expected solution.
pub fn generate_challenge(public: &PublicKey) -> Result<(Challenge, Solution), CryptoError> {
    let secret = random_secret()?;
    let challenge = Challenge(secret.public_key());
    let shared = diffie_hellman(secret.to_nonzero_scalar(), public.as_point().as_affine());
    let solution = Solution::from_x(shared.raw_secret_bytes().as_slice());
    Ok((challenge, solution))
}

/// Answer a challenge with a private key: the X coordinate of `priv * challenge`.
pub fn solve(challenge: &Challenge, key: &PrivateKey) -> Solution {
    let shared = diffie_hellman(key.secret().to_nonzero_scalar(), challenge.0.as_affine());
    Solution::from_x(shared.raw_secret_bytes().as_slice())
}

// =============================================================================
// TESTS
// =============================================================================
