//! Injected signing capability.

use crate::nip01::{
    Event, EventTemplate, Nip01Error, finalize_event, generate_secret_key, get_public_key_hex,
};
use async_trait::async_trait;
use std::fmt;

/// Something that can author events.
///
/// Passed explicitly to whatever needs to sign. Implementations may be
/// remote (a browser extension, a bunker), so both methods are async.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key of the author.
    async fn public_key(&self) -> Result<String, Nip01Error>;

    /// Fill in pubkey, id and sig for `template`.
    async fn sign_event(&self, template: EventTemplate) -> Result<Event, Nip01Error>;
}

/// Local secp256k1 key pair.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    pub fn generate() -> Self {
        let secret_key = generate_secret_key();
        match Self::from_secret_key(secret_key) {
            Ok(keys) => keys,
            Err(_) => Self::generate(),
        }
    }

    pub fn from_secret_key(secret_key: [u8; 32]) -> Result<Self, Nip01Error> {
        let public_key = get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn from_hex(secret_key: &str) -> Result<Self, Nip01Error> {
        let bytes = hex::decode(secret_key).map_err(|e| Nip01Error::InvalidHex(e.to_string()))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Nip01Error::InvalidHex("secret key must be 32 bytes".to_string()))?;
        Self::from_secret_key(secret_key)
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key
    }

    /// Sign synchronously.
    pub fn sign(&self, template: &EventTemplate) -> Result<Event, Nip01Error> {
        finalize_event(template, &self.secret_key)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Keys {
    async fn public_key(&self) -> Result<String, Nip01Error> {
        Ok(self.public_key.clone())
    }

    async fn sign_event(&self, template: EventTemplate) -> Result<Event, Nip01Error> {
        self.sign(&template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::verify_event;

    #[tokio::test]
    async fn keys_sign_through_the_trait() {
        let keys = Keys::generate();
        let signer: &dyn Signer = &keys;
        let event = signer
            .sign_event(EventTemplate::new(1, "through a trait object"))
            .await
            .unwrap();
        assert_eq!(event.pubkey, signer.public_key().await.unwrap());
        assert!(verify_event(&event));
    }

    #[test]
    fn from_hex_validates_length() {
        assert!(Keys::from_hex("abcd").is_err());
        assert!(Keys::from_hex("zz").is_err());
        let keys = Keys::from_hex(&format!("{}01", "0".repeat(62))).unwrap();
        assert_eq!(keys.public_key_hex().len(), 64);
    }

    #[test]
    fn debug_hides_secret() {
        let keys = Keys::from_hex(&format!("{}01", "0".repeat(62))).unwrap();
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains("secret"));
    }
}
