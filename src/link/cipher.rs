//! Payload encryption for an established link
//!
//! ChaCha20-Poly1305 keyed per link. The nonce is the frame counter plus a
//! direction byte, so the two sides never reuse a nonce under the shared key.

use chacha20poly1305::{aead::{Aead, KeyInit}, ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Frames this far behind the newest counter are treated as replays
const REORDER_WINDOW: u64 = 64;

/// One direction of a link's cipher state
#[derive(Clone)]
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    /// Highest counter accepted so far (receive side)
    recv_counter: Option<u64>,
    /// true if our ephemeral key sorts before the peer's
    is_low_side: bool,
}

impl SessionCipher {
    /// Derive the link key from the X25519 shared secret and both ephemeral keys
    pub fn derive(shared_secret: &[u8; 32], my_ephemeral: &[u8; 32], peer_ephemeral: &[u8; 32]) -> Self {
        let is_low_side = my_ephemeral < peer_ephemeral;
        let (low, high) = if is_low_side {
            (my_ephemeral, peer_ephemeral)
        } else {
            (peer_ephemeral, my_ephemeral)
        };

        let mut hasher = Sha256::new();
        hasher.update(b"warpdrive link v1");
        hasher.update(shared_secret);
        hasher.update(low);
        hasher.update(high);
        let key = hasher.finalize();

        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            recv_counter: None,
            is_low_side,
        }
    }

    fn make_nonce(counter: u64, from_low_side: bool) -> Nonce {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..8].copy_from_slice(&counter.to_le_bytes());
        nonce_bytes[11] = if from_low_side { 0x00 } else { 0x01 };
        *Nonce::from_slice(&nonce_bytes)
    }

    /// Encrypt a payload sent with `counter`
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::make_nonce(counter, self.is_low_side);
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Link("encryption failed".into()))
    }

    /// Decrypt a payload received with `counter`
    pub fn open(&mut self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if let Some(last) = self.recv_counter {
            if counter + REORDER_WINDOW < last {
                return Err(Error::Link(format!("stale frame counter {} (latest {})", counter, last)));
            }
        }

        let nonce = Self::make_nonce(counter, !self.is_low_side);
        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::Link("decryption failed (invalid key or corrupted frame)".into()))?;

        if self.recv_counter.map_or(true, |last| counter > last) {
            self.recv_counter = Some(counter);
        }
        Ok(plaintext)
    }
}
