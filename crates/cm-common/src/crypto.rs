//! Channel crypto: session-key generation and the per-packet cipher.
//!
//! The handshake produces a random 32-byte AES key, RSA-OAEP-wrapped with
//! the CM's well-known public key. Once installed, every payload is
//! AES-256-CBC encrypted with a fresh IV derived from an HMAC-SHA1 over the
//! plaintext, which doubles as the integrity check on decrypt:
//!
//! ```text
//! prefix = 3 random bytes
//! iv     = HMAC-SHA1(key[..16], prefix ‖ plaintext)[..13] ‖ prefix
//! wire   = AES-256-ECB(iv) ‖ AES-256-CBC(plaintext, iv)
//! ```

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use std::sync::OnceLock;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha1 = Hmac<Sha1>;

/// Byte length of the plain session key.
pub const SESSION_KEY_LEN: usize = 32;

const IV_LEN: usize = 16;
const IV_PREFIX_LEN: usize = 3;
const HMAC_KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Well-known public key of the CM fleet.
const CM_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIGdMA0GCSqGSIb3DQEBAQUAA4GLADCBhwKBgQDf7BrWLBBmLBc1OhSwfFkRf53T
2Ct64+AVzRkeRuh7h3SiGEYxqQMUeYKO6UWiSRKpI2hzic9pobFhRr3Bvr/WARvY
gdTckPv+T1JzZsuVcNfFjrocejN1oWI0Rrtgt4Bo+hOneoo3S57G9F1fOpn5nsQ6
6WOiu4gZKODnFMBCiQIBEQ==
-----END PUBLIC KEY-----";

/// Returns the CM fleet's well-known public key.
pub fn well_known_key() -> &'static RsaPublicKey {
    static KEY: OnceLock<RsaPublicKey> = OnceLock::new();
    KEY.get_or_init(|| {
        use rsa::pkcs8::DecodePublicKey;
        RsaPublicKey::from_public_key_pem(CM_PUBLIC_KEY_PEM).expect("embedded CM key is valid")
    })
}

/// Errors arising from channel crypto operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// RSA wrap of the session key failed.
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    /// The ciphertext is not a whole number of blocks after the IV.
    #[error("malformed ciphertext: {0} bytes")]
    Malformed(usize),
    /// CBC unpadding failed; the key does not match or the data is corrupt.
    #[error("bad padding")]
    BadPadding,
    /// The HMAC-derived IV did not authenticate the plaintext.
    #[error("integrity check failed")]
    IntegrityCheckFailed,
}

/// A freshly generated session key: the plain AES key and its RSA-wrapped
/// form for the `ChannelEncryptResponse` body.
pub struct SessionKey {
    /// The 32-byte AES key.
    pub plain: [u8; SESSION_KEY_LEN],
    /// The key wrapped with the CM's public key.
    pub encrypted: Vec<u8>,
}

/// Generates a random session key wrapped with the given RSA public key.
///
/// # Errors
///
/// Returns [`CryptoError::Rsa`] if the wrap fails.
pub fn generate_session_key(wrap_key: &RsaPublicKey) -> Result<SessionKey, CryptoError> {
    let mut plain = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut plain);
    let encrypted = wrap_key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &plain)?;
    Ok(SessionKey { plain, encrypted })
}

/// CRC32 over the wrapped key blob, sent alongside it in the handshake.
pub fn key_checksum(encrypted: &[u8]) -> u32 {
    crc32fast::hash(encrypted)
}

/// Symmetric packet cipher installed on the channel after the handshake.
pub struct ChannelCipher {
    key: [u8; SESSION_KEY_LEN],
}

impl ChannelCipher {
    /// Creates a cipher from the plain session key.
    pub fn new(key: [u8; SESSION_KEY_LEN]) -> Self {
        Self { key }
    }

    fn derive_iv(&self, prefix: &[u8; IV_PREFIX_LEN], plaintext: &[u8]) -> [u8; IV_LEN] {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.key[..HMAC_KEY_LEN])
            .expect("hmac accepts any key length");
        mac.update(prefix);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let digest = digest.as_slice();
        let mut iv = [0u8; IV_LEN];
        iv[..IV_LEN - IV_PREFIX_LEN].copy_from_slice(&digest[..IV_LEN - IV_PREFIX_LEN]);
        iv[IV_LEN - IV_PREFIX_LEN..].copy_from_slice(prefix);
        iv
    }

    /// Encrypts one payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut prefix = [0u8; IV_PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        let iv = self.derive_iv(&prefix, plaintext);

        let mut iv_block = aes::Block::from(iv);
        aes::Aes256::new((&self.key).into()).encrypt_block(&mut iv_block);

        let body = Aes256CbcEnc::new((&self.key).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + body.len());
        out.extend_from_slice(iv_block.as_slice());
        out.extend_from_slice(&body);
        out
    }

    /// Decrypts one payload and authenticates it against the embedded IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Malformed`] on a short or ragged ciphertext,
    /// [`CryptoError::BadPadding`] when unpadding fails, and
    /// [`CryptoError::IntegrityCheckFailed`] when the recomputed IV does not
    /// match the one carried on the wire.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < IV_LEN + BLOCK_LEN || (data.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(CryptoError::Malformed(data.len()));
        }

        let mut iv_block = aes::Block::clone_from_slice(&data[..IV_LEN]);
        aes::Aes256::new((&self.key).into()).decrypt_block(&mut iv_block);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(iv_block.as_slice());

        let plaintext = Aes256CbcDec::new((&self.key).into(), (&iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&data[IV_LEN..])
            .map_err(|_| CryptoError::BadPadding)?;

        let mut prefix = [0u8; IV_PREFIX_LEN];
        prefix.copy_from_slice(&iv[IV_LEN - IV_PREFIX_LEN..]);
        let expected = self.derive_iv(&prefix, &plaintext);
        if expected != iv {
            return Err(CryptoError::IntegrityCheckFailed);
        }
        Ok(plaintext)
    }
}
