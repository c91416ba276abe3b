//! At-rest secret encryption for configuration values.
//!
//! Secrets such as API tokens are stored in configuration as
//! `base64(IV || AES-256-CBC(PKCS7, plaintext))`, with the key derived from a
//! passphrase by PBKDF2-HMAC-SHA256 over a fixed salt. Decryption is
//! fail-open: a value that cannot be decrypted is assumed to be plaintext and
//! is returned unchanged.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;
use sha2::Sha256;
use tracing::warn;

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_SALT: &[u8] = b"FixedSaltValue";
const PBKDF2_ROUNDS: u32 = 10_000;
const IV_LEN: usize = 16;

/// Stateless cipher for configuration secrets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretCipher;

impl SecretCipher {
    /// Creates a new cipher.
    pub fn new() -> Self {
        Self
    }

    /// Encrypts a secret with a fresh random IV.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EmptyInput` for empty plaintext or passphrase.
    pub fn encrypt(&self, plaintext: &str, passphrase: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyInput("plaintext"));
        }
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyInput("passphrase"));
        }

        let key = derive_key(passphrase);
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|_| CryptoError::InvalidLength)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut framed = Vec::with_capacity(IV_LEN + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    /// Decrypts a secret produced by [`SecretCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if the input is empty, not base64, too short,
    /// fails the padding check, or does not decode to UTF-8.
    pub fn decrypt(&self, ciphertext: &str, passphrase: &str) -> Result<String, CryptoError> {
        if ciphertext.is_empty() {
            return Err(CryptoError::EmptyInput("ciphertext"));
        }
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyInput("passphrase"));
        }

        let framed = STANDARD.decode(ciphertext.trim())?;
        if framed.len() <= IV_LEN {
            return Err(CryptoError::TooShort { len: framed.len() });
        }
        let (iv, body) = framed.split_at(IV_LEN);

        let key = derive_key(passphrase);
        let plaintext = Aes256CbcDec::new_from_slices(&key, iv)
            .map_err(|_| CryptoError::InvalidLength)?
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CryptoError::BadPadding)?;

        Ok(String::from_utf8(plaintext)?)
    }

    /// Decrypts a secret, returning the input unchanged when it is not a
    /// valid ciphertext for this passphrase.
    pub fn decrypt_or_original(&self, value: &str, passphrase: &str) -> String {
        match self.decrypt(value, passphrase) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(error = %error, "secret decryption failed, using configured value as-is");
                value.to_string()
            },
        }
    }
}

fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), KEY_SALT, PBKDF2_ROUNDS, &mut key);
    key
}
