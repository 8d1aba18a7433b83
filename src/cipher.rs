use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use aead::{AeadCore, AeadInPlace, Key, KeyInit, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use bytes::{Buf, BytesMut};
use serde_json::{Map, Value};
use tracing::{info, trace};

use crate::error::{DispatchError, DispatchResult};

/// A structured message as it is exchanged between orchestration instances: a JSON object with
///  string keys and values of mixed type
pub type Message = Map<String, Value>;

/// The boundary that every message crosses on its way to or from the network. Router and client
///  are polymorphic over it and make no assumption about the algorithm behind it.
///
/// Implementations are read concurrently by many in-flight requests. Replacing the key (e.g.
///  during rotation) is the responsibility of whoever provisions it, and it must not be visible
///  to readers in a half-updated state.
pub trait CipherBoundary: Send + Sync {
    fn has_key(&self) -> bool;

    /// fails with [DispatchError::KeyNotConfigured] if there is no key
    fn encrypt(&self, message: &Message) -> DispatchResult<Vec<u8>>;

    /// fails with [DispatchError::KeyNotConfigured] if there is no key
    fn decrypt(&self, ciphertext: &[u8]) -> DispatchResult<Message>;
}

pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmCipher {
    pub const KEY_LEN: usize = 32;
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    /// key must be exactly 32 bytes
    pub fn new(key: &[u8]) -> DispatchResult<Aes256GcmCipher> {
        if key.len() != Self::KEY_LEN {
            return Err(DispatchError::Crypto(format!("key must be {} bytes, was {}", Self::KEY_LEN, key.len())));
        }

        let key = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(key);

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut nonce_buf: &[u8] = nonce.as_slice();
        let nonce_fixed = nonce_buf.get_u32();
        let nonce_incremented = AtomicU64::new(nonce_buf.get_u64());

        Ok(Aes256GcmCipher {
            cipher,
            nonce_fixed,
            nonce_incremented,
        })
    }

    fn unique_nonce(&self) -> Nonce<Aes256Gcm> {
        let mut buf: Vec<u8> = Vec::with_capacity(Self::NONCE_LEN);
        buf.extend_from_slice(self.nonce_fixed.to_le_bytes().as_ref());
        buf.extend_from_slice(self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_le_bytes().as_ref());
        Nonce::<Aes256Gcm>::clone_from_slice(&buf)
    }

    /// encrypts the buffer in place, appending tag and nonce
    pub fn seal(&self, buf: &mut BytesMut) -> DispatchResult<()> {
        let nonce = self.unique_nonce();
        trace!("encrypting {} bytes with nonce {:?}", buf.len(), nonce);

        self.cipher.encrypt_in_place(&nonce, b"", buf)
            .map_err(|e| DispatchError::Crypto(format!("encryption failed: {}", e)))?;

        buf.extend_from_slice(nonce.as_slice());
        Ok(())
    }

    /// reverses [Aes256GcmCipher::seal], leaving only the plaintext in the buffer
    pub fn open(&self, buf: &mut BytesMut) -> DispatchResult<()> {
        if buf.len() < Self::NONCE_LEN + Self::TAG_LEN {
            return Err(DispatchError::Crypto(format!("ciphertext too short: {} bytes", buf.len())));
        }

        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&buf.as_ref()[buf.len() - Self::NONCE_LEN..]);
        buf.truncate(buf.len() - Self::NONCE_LEN);
        trace!("decrypting {} bytes, nonce: {:?}", buf.len(), nonce);

        self.cipher.decrypt_in_place(&nonce, b"", buf)
            .map_err(|e| DispatchError::Crypto(format!("decryption failed: {}", e)))
    }
}

/// The key configuration of a [CipherContext]. There is no way to reach key material in the
///  `Unconfigured` state, so every operation has to go through the "is there a key" decision.
#[derive(Clone)]
pub enum CipherState {
    Unconfigured,
    Ready(Arc<Aes256GcmCipher>),
}

/// The cipher context that clients and servers hold. It starts out unconfigured, and a key is
///  provisioned later by [CipherContext::set_key].
///
/// Readers take a snapshot of the current state and work with that, so a concurrent key change
///  affects only requests that start after it.
pub struct CipherContext {
    state: RwLock<CipherState>,
}

impl Default for CipherContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CipherContext {
    pub fn new() -> CipherContext {
        CipherContext {
            state: RwLock::new(CipherState::Unconfigured),
        }
    }

    pub fn with_key(key: &[u8]) -> DispatchResult<CipherContext> {
        let result = CipherContext::new();
        result.set_key(key)?;
        Ok(result)
    }

    pub fn set_key(&self, key: &[u8]) -> DispatchResult<()> {
        let cipher = Arc::new(Aes256GcmCipher::new(key)?);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = CipherState::Ready(cipher);
        info!("encryption key configured");
        Ok(())
    }

    pub fn clear_key(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = CipherState::Unconfigured;
        info!("encryption key removed");
    }

    pub fn state(&self) -> CipherState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CipherBoundary for CipherContext {
    fn has_key(&self) -> bool {
        matches!(self.state(), CipherState::Ready(_))
    }

    fn encrypt(&self, message: &Message) -> DispatchResult<Vec<u8>> {
        let cipher = match self.state() {
            CipherState::Unconfigured => return Err(DispatchError::KeyNotConfigured),
            CipherState::Ready(cipher) => cipher,
        };

        let plaintext = serde_json::to_vec(message)
            .map_err(|e| DispatchError::Crypto(format!("can not serialize message: {}", e)))?;

        let mut buf = BytesMut::from(plaintext.as_slice());
        cipher.seal(&mut buf)?;
        Ok(buf.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> DispatchResult<Message> {
        let cipher = match self.state() {
            CipherState::Unconfigured => return Err(DispatchError::KeyNotConfigured),
            CipherState::Ready(cipher) => cipher,
        };

        let mut buf = BytesMut::from(ciphertext);
        cipher.open(&mut buf)?;

        serde_json::from_slice::<Message>(&buf)
            .map_err(|e| DispatchError::Crypto(format!("decrypted payload is not a message: {}", e)))
    }
}
