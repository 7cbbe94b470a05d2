use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::Rng;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// The fleet sealing key shared by the manager and its agents. The manager
/// seals BMC credentials into server tokens with it; gateways, which do not
/// hold the key, pass the blob through opaquely.
#[derive(Clone)]
pub struct SealingKey {
    cipher: ChaCha20Poly1305,
}

impl SealingKey {
    pub fn from_bytes(key: &[u8]) -> Result<Self, String> {
        if key.len() != KEY_LEN {
            return Err(format!(
                "sealing key must be {KEY_LEN} bytes, got {}",
                key.len()
            ));
        }
        Ok(SealingKey {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Parse a key from its base64 form, e.g. the AGENT_ENCRYPTION_KEY
    /// environment variable.
    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|err| format!("sealing key is not valid base64: {err}"))?;
        Self::from_bytes(&key)
    }

    /// Seal a plaintext, returning base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes[..]);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| format!("seal failed: {err}"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Open a blob produced by `seal`.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, String> {
        let sealed = BASE64
            .decode(sealed.trim())
            .map_err(|err| format!("sealed blob is not valid base64: {err}"))?;
        if sealed.len() < NONCE_LEN {
            return Err("sealed blob too short".to_owned());
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|err| format!("open failed: {err}"))
    }
}
