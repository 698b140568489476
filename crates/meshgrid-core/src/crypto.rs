//! Node identity and the two cipher generations
//!
//! ## Identity
//!
//! Each node owns an Ed25519 keypair. The 1-byte MeshCore hash is
//! `pubkey[0]`; the 2-byte v1 hash is the first two bytes of
//! `SHA256(pubkey)`. Pairwise secrets come from X25519 over the
//! Montgomery form of both Ed25519 keys.
//!
//! ## v0 (MeshCore)
//!
//! ```text
//! ciphertext = AES-128-ECB(secret[..16], zero_pad(plaintext))
//! output     = HMAC-SHA256(secret, ciphertext)[..2] || ciphertext
//! ```
//!
//! ## v1
//!
//! ```text
//! nonce  = timestamp_ms (8B big-endian) || random (4B)
//! output = nonce || AES-256-GCM(secret, nonce, plaintext) || tag (16B)
//! ```

use crate::error::{CryptoError, CryptoResult};
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt};
use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

pub const PUBKEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const SECRET_SIZE: usize = 32;

/// Truncated MAC length for v0
pub const V0_MAC_SIZE: usize = 2;
pub const AES_BLOCK_SIZE: usize = 16;

pub const V1_NONCE_SIZE: usize = 12;
pub const V1_TAG_SIZE: usize = 16;
/// Smallest v1 frame payload worth attempting
pub const V1_MIN_LEN: usize = 1 + V1_NONCE_SIZE + 8 + V1_TAG_SIZE;

/// 32-byte symmetric secret (pairwise ECDH result or channel PSK)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SECRET_SIZE]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Zero-extend a 16- or 32-byte PSK
    pub fn from_psk(psk: &[u8]) -> CryptoResult<Self> {
        if psk.len() != 16 && psk.len() != SECRET_SIZE {
            return Err(CryptoError::InvalidKey);
        }
        let mut bytes = [0u8; SECRET_SIZE];
        bytes[..psk.len()].copy_from_slice(psk);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// This node's keypair
pub struct Identity {
    signing_key: SigningKey,
    public_key: [u8; PUBKEY_SIZE],
}

impl Identity {
    /// Generate a fresh keypair from the node RNG
    pub fn generate<G: RngCore + ?Sized>(rng: &mut G) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let identity = Self::from_seed(&seed);
        seed.zeroize();
        identity
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            public_key,
        }
    }

    /// Seed for persisting the identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> &[u8; PUBKEY_SIZE] {
        &self.public_key
    }

    /// MeshCore 1-byte hash
    pub fn hash(&self) -> u8 {
        self.public_key[0]
    }

    pub fn v1_hash(&self) -> u16 {
        v1_hash(&self.public_key)
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// X25519 over the Montgomery form of both Ed25519 keys
    ///
    /// Fails for keys that do not decode to a curve point or that yield
    /// an all-zero secret (small-order points).
    pub fn shared_secret(&self, peer_public: &[u8; PUBKEY_SIZE]) -> CryptoResult<SharedSecret> {
        let peer = VerifyingKey::from_bytes(peer_public).map_err(|_| CryptoError::InvalidKey)?;
        let mut scalar = self.signing_key.to_scalar_bytes();
        let secret = x25519_dalek::x25519(scalar, peer.to_montgomery().to_bytes());
        scalar.zeroize();
        if secret.iter().all(|&b| b == 0) {
            return Err(CryptoError::InvalidKey);
        }
        Ok(SharedSecret(secret))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex_prefix(&self.public_key))
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Check an Ed25519 signature; malformed keys or signatures are simply invalid
pub fn verify_signature(
    public_key: &[u8; PUBKEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key.verify(message, &Signature::from_bytes(signature)).is_ok(),
        Err(_) => false,
    }
}

/// 2-byte v1 node hash
pub fn v1_hash(public_key: &[u8]) -> u16 {
    let digest = Sha256::digest(public_key);
    u16::from_be_bytes([digest[0], digest[1]])
}

/// 1-byte channel hash of a PSK
pub fn channel_hash(psk: &[u8]) -> u8 {
    Sha256::digest(psk)[0]
}

// ----------------------------------------------------------------------------
// v0: AES-128-ECB + truncated HMAC
// ----------------------------------------------------------------------------

/// Encrypt and prepend a 2-byte MAC
pub fn v0_encrypt(secret: &SharedSecret, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes128::new(GenericArray::from_slice(&secret.0[..16]));

    let blocks = plaintext.len().div_ceil(AES_BLOCK_SIZE).max(1);
    let mut out = vec![0u8; V0_MAC_SIZE + blocks * AES_BLOCK_SIZE];
    out[V0_MAC_SIZE..V0_MAC_SIZE + plaintext.len()].copy_from_slice(plaintext);

    for chunk in out[V0_MAC_SIZE..].chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&secret.0).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(&out[V0_MAC_SIZE..]);
    let tag = mac.finalize().into_bytes();
    out[..V0_MAC_SIZE].copy_from_slice(&tag[..V0_MAC_SIZE]);

    Ok(out)
}

/// Verify the MAC and decrypt
///
/// The result keeps the zero padding; callers strip it where the
/// plaintext format allows.
pub fn v0_decrypt(secret: &SharedSecret, data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < V0_MAC_SIZE + AES_BLOCK_SIZE {
        return Err(CryptoError::TooShort(data.len()));
    }
    let (tag, ciphertext) = data.split_at(V0_MAC_SIZE);
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::AuthenticationFailed);
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&secret.0).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(ciphertext);
    mac.verify_truncated_left(tag)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let cipher = Aes128::new(GenericArray::from_slice(&secret.0[..16]));
    let mut plaintext = ciphertext.to_vec();
    for chunk in plaintext.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(plaintext)
}

// ----------------------------------------------------------------------------
// v1: AES-256-GCM
// ----------------------------------------------------------------------------

/// Build the 12-byte nonce from a millisecond timestamp and 4 random bytes
pub fn v1_nonce<G: RngCore + ?Sized>(timestamp_ms: u64, rng: &mut G) -> [u8; V1_NONCE_SIZE] {
    let mut nonce = [0u8; V1_NONCE_SIZE];
    nonce[..8].copy_from_slice(&timestamp_ms.to_be_bytes());
    rng.fill_bytes(&mut nonce[8..]);
    nonce
}

/// Returns `nonce || ciphertext || tag`
pub fn v1_encrypt(
    secret: &SharedSecret,
    nonce: &[u8; V1_NONCE_SIZE],
    plaintext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&secret.0).map_err(|_| CryptoError::InvalidKey)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(V1_NONCE_SIZE + sealed.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn v1_decrypt(secret: &SharedSecret, data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < V1_NONCE_SIZE + V1_TAG_SIZE {
        return Err(CryptoError::TooShort(data.len()));
    }
    let (nonce, sealed) = data.split_at(V1_NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(&secret.0).map_err(|_| CryptoError::InvalidKey)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AuthenticationFailed)
}
