//! Key material derived from the user's passcode.

pub mod secret;

pub use secret::{derive, SecretDeriver, SharedSecretMaterial, APP_IDENTITY};
