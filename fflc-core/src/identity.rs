//! Node identity and crypto: long-term signing keys, ephemeral key exchange, session encryption.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const SESSION_KEY_LEN: usize = 32;
pub const SESSION_NONCE_LEN: usize = 12;
/// Serialized session material: key followed by nonce.
pub const SESSION_MATERIAL_LEN: usize = SESSION_KEY_LEN + SESSION_NONCE_LEN;

const WRAP_INFO: &[u8] = b"fflc-session-wrap-v1";

/// Long-term public key (32 bytes, Ed25519). Its hex form is the directory fingerprint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes. Point validity is checked at verification time.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(PublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyParseError> {
        let bytes = hex::decode(s.trim())?;
        let len = bytes.len();
        let key = Self::from_slice(&bytes).ok_or(KeyParseError::Length(len))?;
        VerifyingKey::from_bytes(&key.0).map_err(|_| KeyParseError::Point)?;
        Ok(key)
    }

    /// Check an Ed25519 signature over `message`. Weak or malformed keys never verify.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        key.verify_strict(message, &Signature::from_bytes(signature))
            .is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
    #[error("not a valid Ed25519 public key")]
    Point,
}

/// Long-term Ed25519 keypair. Keep the signing key private; expose only the public key.
pub struct Identity {
    signing: SigningKey,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Rebuild an identity from a stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}

/// X25519 keypair living for a single handshake.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    /// Diffie-Hellman with a peer's ephemeral key. Low-order peer keys are rejected.
    pub fn shared_secret(&self, other_public: &[u8; 32]) -> Result<[u8; 32], WireCryptoError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*other_public));
        if !shared.was_contributory() {
            return Err(WireCryptoError::Key);
        }
        Ok(shared.to_bytes())
    }

    /// Open a box produced by [`seal_to`] for this keypair's public key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        if sealed.len() < 32 {
            return Err(WireCryptoError::Decrypt);
        }
        let (wrap_public, ciphertext) = sealed.split_at(32);
        let mut wrap = [0u8; 32];
        wrap.copy_from_slice(wrap_public);
        let shared = self.shared_secret(&wrap)?;
        let key = derive_wrap_key(&shared, &wrap, &self.public)?;
        decrypt_wire(&key, &[0u8; SESSION_NONCE_LEN], ciphertext)
    }
}

/// Encrypt `plaintext` so only the holder of `recipient`'s ephemeral secret can read it.
/// Output: `32:wrap_public · ciphertext`. The wrap key is fresh per call, so the zero nonce is
/// never reused.
pub fn seal_to(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
    let wrap = EphemeralKeypair::generate();
    let shared = wrap.shared_secret(recipient)?;
    let key = derive_wrap_key(&shared, wrap.public_bytes(), recipient)?;
    let ciphertext = encrypt_wire(&key, &[0u8; SESSION_NONCE_LEN], plaintext)?;
    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(wrap.public_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn derive_wrap_key(
    shared: &[u8; 32],
    wrap_public: &[u8; 32],
    recipient: &[u8; 32],
) -> Result<[u8; 32], WireCryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(wrap_public);
    salt[32..].copy_from_slice(recipient);
    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(Some(&salt), shared)
        .expand(WRAP_INFO, &mut key)
        .map_err(|_| WireCryptoError::Key)?;
    Ok(key)
}

/// Symmetric material for one session: ChaCha20-Poly1305 key and nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_LEN],
    nonce: [u8; SESSION_NONCE_LEN],
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        let mut nonce = [0u8; SESSION_NONCE_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    pub fn to_bytes(&self) -> [u8; SESSION_MATERIAL_LEN] {
        let mut out = [0u8; SESSION_MATERIAL_LEN];
        out[..SESSION_KEY_LEN].copy_from_slice(&self.key);
        out[SESSION_KEY_LEN..].copy_from_slice(&self.nonce);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SESSION_MATERIAL_LEN {
            return None;
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        let mut nonce = [0u8; SESSION_NONCE_LEN];
        key.copy_from_slice(&bytes[..SESSION_KEY_LEN]);
        nonce.copy_from_slice(&bytes[SESSION_KEY_LEN..]);
        Some(Self { key, nonce })
    }

    /// A session carries exactly one payload, so the negotiated nonce is used once.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        encrypt_wire(&self.key, &self.nonce, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        decrypt_wire(&self.key, &self.nonce, ciphertext)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Wire encryption: ChaCha20-Poly1305 (ciphertext carries a 16-byte tag).
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: &[u8; SESSION_NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let nonce = chacha20poly1305::Nonce::from_slice(nonce);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption. Fails on any tampering with the ciphertext or tag.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: &[u8; SESSION_NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let nonce = chacha20poly1305::Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
