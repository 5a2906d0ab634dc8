//! Passcode-derived key material for the pre-shared-key handshake.
//!
//! Both peers type the same passcode.  Each side computes
//! `HMAC-SHA256(key = passcode, msg = APP_IDENTITY)` and uses the result as
//! the pre-shared authentication key; the identity string itself is the
//! verification token presented alongside it.  Identical passcodes give
//! identical material, so the handshake succeeds; anything else fails there.
//!
//! # Known weakness
//!
//! There is no salt and no key stretching.  A captured handshake allows an
//! offline brute force of short passcodes.  This is accepted for casual chat on
//! a local network, where typing a short passcode quickly matters more.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed application identity used as MAC input and verification token.
pub const APP_IDENTITY: &str = "LanChat";

/// Length of the derived authentication key in bytes.
pub const AUTHENTICATION_KEY_LEN: usize = 32;

/// Key material produced from a passcode.
///
/// Immutable once derived.  The transport consumes it during the handshake and
/// drops it afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecretMaterial {
    authentication_key: [u8; AUTHENTICATION_KEY_LEN],
    verification_token: Vec<u8>,
}

impl SharedSecretMaterial {
    /// The 256-bit pre-shared key.
    pub fn authentication_key(&self) -> &[u8; AUTHENTICATION_KEY_LEN] {
        &self.authentication_key
    }

    /// The identity hint sent in the clear during the handshake.
    pub fn verification_token(&self) -> &[u8] {
        &self.verification_token
    }
}

impl fmt::Debug for SharedSecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretMaterial")
            .field("authentication_key", &"<redacted>")
            .field(
                "verification_token",
                &String::from_utf8_lossy(&self.verification_token),
            )
            .finish()
    }
}

/// Derives [`SharedSecretMaterial`] for a fixed identity string.
#[derive(Debug, Clone)]
pub struct SecretDeriver {
    identity: String,
}

impl SecretDeriver {
    /// Creates a deriver for `identity`.  Peers must agree on it.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// Computes the key material for `passcode`.
    pub fn derive(&self, passcode: &str) -> SharedSecretMaterial {
        let mut mac = HmacSha256::new_from_slice(passcode.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(self.identity.as_bytes());

        let mut authentication_key = [0u8; AUTHENTICATION_KEY_LEN];
        authentication_key.copy_from_slice(&mac.finalize().into_bytes());

        SharedSecretMaterial {
            authentication_key,
            verification_token: self.identity.as_bytes().to_vec(),
        }
    }
}

impl Default for SecretDeriver {
    fn default() -> Self {
        Self::new(APP_IDENTITY)
    }
}

/// Derives key material for `passcode` with the default [`APP_IDENTITY`].
///
/// ```rust
/// use lanchat_core::crypto::derive;
///
/// let a = derive("hunter2");
/// let b = derive("hunter2");
/// assert_eq!(a, b);
/// assert_ne!(a, derive("wrong"));
/// ```
pub fn derive(passcode: &str) -> SharedSecretMaterial {
    SecretDeriver::default().derive(passcode)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
