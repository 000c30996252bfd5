//! Curve Authentication
//!
//! Public-key challenge-response on NIST P-192, compatible with the Cube 2
//! auth scheme.
//!
//! Private keys are random scalars and public keys are `priv * G`. To check
//! that a peer holds the private key for a stored public key, the server draws
//! a fresh scalar `s`, sends the point `s * G` as the challenge, and expects the
//! X coordinate of `s * pub` back. The key holder computes `priv * (s * G)`,
//! which is the same point. Only X is compared: both Y values at that X are
//! accepted.
//!
//! [`AuthManager`] sits on top: it routes a game server's player logins to
//! one [`AuthProvider`] per auth domain.

pub mod challenge;
pub mod keys;
pub mod manager;

pub use challenge::{generate_challenge, solve, Challenge, Solution};
pub use keys::{generate_key_pair, PrivateKey, PublicKey};
pub use manager::{AuthManager, AuthManagerError, AuthProvider, Authenticated, ProviderError, Role};

use thiserror::Error;

/// Malformed key, challenge, or curve point text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Input is empty or only a sign character.
    #[error("too short")]
    TooShort,
    /// Hex value has more significant digits than a field element.
    #[error("hex value longer than {0} digits")]
    TooLong(usize),
    /// Point encoding does not start with `+` or `-`.
    #[error("invalid sign character '{0}'")]
    InvalidSign(char),
    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    /// No curve point has this X coordinate (no square root for Y).
    #[error("no point on the curve with this X coordinate")]
    NotOnCurve,
    /// Scalar is zero or not smaller than the group order.
    #[error("scalar out of range")]
    InvalidScalar,
}

/// Failure while drawing key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The operating system entropy source failed.
    #[error("entropy source failed: {0}")]
    Entropy(String),
}
