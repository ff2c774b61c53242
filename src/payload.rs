// ============================================================================
// SEND payload processing pipeline
// ============================================================================
//
// Applied to every SEND payload, in order:
//   1. validate  - non-empty, length cap, denylist of dangerous substrings
//   2. sanitize  - escape markup characters (coarse filter; renderers still
//                  own encoding-aware output escaping)
//   3. encrypt   - ChaCha20-Poly1305, random nonce per message, base64 wire
//
// The stages are an explicit ordered list rather than nested handler
// decorators so ordering and error propagation stay visible.
//
// ============================================================================

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::ValidationConfig;
use crate::error::{GatewayError, GatewayResult};

const NONCE_LEN: usize = 12;

/// Symmetric payload cipher. Output layout: base64(nonce || ciphertext).
pub struct MessageCipher {
    cipher: ChaCha20Poly1305,
}

impl MessageCipher {
    /// Derive the cipher key from a shared secret
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::from_slice(&digest);
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> GatewayResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| GatewayError::internal(format!("encryption failed: {}", e)))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> GatewayResult<Vec<u8>> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| GatewayError::validation(format!("invalid ciphertext encoding: {}", e)))?;
        if raw.len() < NONCE_LEN {
            return Err(GatewayError::validation("ciphertext too short"));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| GatewayError::internal(format!("decryption failed: {}", e)))
    }
}

/// Validate + sanitize + encrypt, in that order.
pub struct PayloadPipeline {
    max_message_len: usize,
    denied_patterns: Vec<String>,
    cipher: MessageCipher,
}

impl PayloadPipeline {
    pub fn new(validation: &ValidationConfig, secret: &str) -> Self {
        Self {
            max_message_len: validation.max_message_len,
            denied_patterns: validation
                .denied_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            cipher: MessageCipher::from_secret(secret),
        }
    }

    /// Run the full pipeline, returning the base64 ciphertext for the wire
    pub fn process(&self, payload: &str) -> GatewayResult<String> {
        self.validate(payload)?;
        let sanitized = sanitize(payload);
        self.cipher.encrypt(sanitized.as_bytes())
    }

    pub fn validate(&self, payload: &str) -> GatewayResult<()> {
        if payload.trim().is_empty() {
            return Err(GatewayError::validation("message body is empty"));
        }
        if payload.len() > self.max_message_len {
            return Err(GatewayError::validation(format!(
                "message too long: {} bytes (max {})",
                payload.len(),
                self.max_message_len
            )));
        }

        let lowered = payload.to_lowercase();
        for pattern in &self.denied_patterns {
            if lowered.contains(pattern) {
                return Err(GatewayError::validation(
                    "message contains potentially dangerous content",
                ));
            }
        }
        Ok(())
    }

    pub fn cipher(&self) -> &MessageCipher {
        &self.cipher
    }
}

/// Escape markup-significant characters
pub fn sanitize(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
