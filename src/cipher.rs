//! AES-CTR block cipher: random per-ciphertext IV prepended to the
//! ciphertext body. Pure and stateless beyond the key schedule, safe to
//! share across threads.

use crate::error::{Error, Result};
use openssl::symm::{Cipher, Crypter, Mode};
use rand::RngCore;

const IV_LEN: usize = 16;

/// AES in CTR mode, keyed with a 16/24/32-byte key (AES-128/192/256).
pub struct BlockCipher {
    cipher: Cipher,
    key: Vec<u8>,
}

impl BlockCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = match key.len() {
            16 => Cipher::aes_128_ctr(),
            24 => Cipher::aes_192_ctr(),
            32 => Cipher::aes_256_ctr(),
            n => return Err(Error::KeyInvalid(n)),
        };
        Ok(Self {
            cipher,
            key: key.to_vec(),
        })
    }

    /// Generates a random IV, returns `IV ‖ CTR(plaintext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let body = self.xcrypt(Mode::Encrypt, &iv, plaintext)?;

        let mut out = Vec::with_capacity(IV_LEN + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Splits `IV, body = ciphertext[:16], ciphertext[16:]` and returns
    /// `CTR(body)`. Fails if `ciphertext` is shorter than the IV.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < IV_LEN {
            return Err(Error::CiphertextCorrupt(ciphertext.len()));
        }
        let (iv, body) = ciphertext.split_at(IV_LEN);
        self.xcrypt(Mode::Decrypt, iv, body)
    }

    fn xcrypt(&self, mode: Mode, iv: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        let mut crypter = Crypter::new(self.cipher, mode, &self.key, Some(iv))
            .map_err(|e| Error::Internal(format!("cipher init failed: {e}")))?;
        crypter.pad(false);

        let block_size = self.cipher.block_size();
        let mut out = vec![0u8; input.len() + block_size];
        let mut count = crypter
            .update(input, &mut out)
            .map_err(|e| Error::Internal(format!("cipher update failed: {e}")))?;
        count += crypter
            .finalize(&mut out[count..])
            .map_err(|e| Error::Internal(format!("cipher finalize failed: {e}")))?;
        out.truncate(count);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_key_sizes() {
        for key_len in [16, 24, 32] {
            let key = vec![0x42; key_len];
            let cipher = BlockCipher::new(&key).unwrap();
            let plaintext = b"the quick brown fox jumps over the lazy dog";
            let ciphertext = cipher.encrypt(plaintext).unwrap();
            assert_eq!(ciphertext.len(), IV_LEN + plaintext.len());
            assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(matches!(
            BlockCipher::new(&[0u8; 10]),
            Err(Error::KeyInvalid(10))
        ));
    }

    #[test]
    fn rejects_short_ciphertext() {
        let cipher = BlockCipher::new(&[0u8; 16]).unwrap();
        assert!(matches!(
            cipher.decrypt(&[1, 2, 3]),
            Err(Error::CiphertextCorrupt(3))
        ));
    }

    #[test]
    fn two_encryptions_differ_by_iv() {
        let cipher = BlockCipher::new(&[1u8; 32]).unwrap();
        let a = cipher.encrypt(b"same plaintext").unwrap();
        let b = cipher.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }
}
