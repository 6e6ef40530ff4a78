/*
[INPUT]:  Per-channel iv/key material from subscription results, encrypted payloads
[OUTPUT]: Decrypted event payloads
[POS]:    WebSocket layer - session-scoped channel key storage
[UPDATE]: When the cipher or the plaintext channel list changes
*/

use std::collections::HashMap;
use std::fmt;

use aes::{Aes128, Aes192, Aes256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::http::{KisError, Result};
use crate::types::TransactionRequest;

/// Execution-notice channels. The provider sends these as plaintext no matter
/// what the frame flag says or whether key material was handed out.
pub const PLAINTEXT_TR_IDS: [&str; 4] = ["H0STCNI0", "H0STCNI9", "H0GSCNI0", "H0GSCNI9"];

pub fn is_plaintext(tr_id: &str) -> bool {
    PLAINTEXT_TR_IDS.contains(&tr_id)
}

const IV_LEN: usize = 16;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-CBC key material for one channel.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    iv: Vec<u8>,
    key: Vec<u8>,
}

impl EncryptionKey {
    /// Key length picks AES-128/192/256; the iv must be one block.
    pub fn new(iv: impl AsRef<[u8]>, key: impl AsRef<[u8]>) -> Result<Self> {
        let iv = iv.as_ref().to_vec();
        let key = key.as_ref().to_vec();
        if iv.len() != IV_LEN {
            return Err(KisError::Decrypt(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(KisError::Decrypt(format!(
                "key must be 16, 24 or 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self { iv, key })
    }

    /// Decode base64 ciphertext, decrypt and strip PKCS7 padding.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|err| KisError::Decrypt(format!("invalid base64: {err}")))?;

        let plaintext = match self.key.len() {
            16 => Aes128CbcDec::new_from_slices(&self.key, &self.iv)
                .map(|cipher| cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)),
            24 => Aes192CbcDec::new_from_slices(&self.key, &self.iv)
                .map(|cipher| cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)),
            _ => Aes256CbcDec::new_from_slices(&self.key, &self.iv)
                .map(|cipher| cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)),
        }
        .map_err(|err| KisError::Decrypt(format!("invalid key material: {err}")))?
        .map_err(|_| KisError::Decrypt("bad padding or truncated ciphertext".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| KisError::Decrypt("plaintext is not valid UTF-8".to_string()))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_bits", &(self.key.len() * 8))
            .finish_non_exhaustive()
    }
}

/// Channel keys for the current session. Purged whenever a session ends.
#[derive(Debug, Default)]
pub struct EncryptionKeyring {
    keys: HashMap<TransactionRequest, EncryptionKey>,
}

impl EncryptionKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tr: TransactionRequest, iv: &str, key: &str) -> Result<()> {
        let key = EncryptionKey::new(iv.as_bytes(), key.as_bytes())?;
        self.keys.insert(tr, key);
        Ok(())
    }

    pub fn get(&self, tr: &TransactionRequest) -> Option<&EncryptionKey> {
        self.keys.get(tr)
    }

    pub fn remove(&mut self, tr: &TransactionRequest) -> Option<EncryptionKey> {
        self.keys.remove(tr)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Event frames only name the `tr_id`; the server hands out one key per id.
    pub fn find_by_id(&self, tr_id: &str) -> Option<&EncryptionKey> {
        self.keys
            .iter()
            .filter(|(tr, _)| tr.id == tr_id)
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, key)| key)
    }

    pub fn decrypt(&self, tr: &TransactionRequest, ciphertext_b64: &str) -> Result<String> {
        let key = self
            .get(tr)
            .ok_or_else(|| KisError::Decrypt(format!("no key on file for {tr}")))?;
        key.decrypt(ciphertext_b64)
    }
}
