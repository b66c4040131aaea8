use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of an X25519 key in bytes, public or private
pub const KEY_SIZE: usize = 32;

/// Magic word opening a `c4gh-v1` private key blob
const C4GH_MAGIC: &[u8] = b"c4gh-v1";
/// Nonce size of the ChaCha20-Poly1305 key-wrapping cipher
const WRAP_NONCE_SIZE: usize = 12;
/// scrypt cost parameters used by the `c4gh-v1` format (N = 2^14, r = 8, p = 1)
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Errors that can occur during key parsing and handling
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] pem::PemError),
    #[error("unexpected PEM tag: {0}")]
    UnexpectedTag(String),
    #[error("invalid key size, expected {expected}, got {got}")]
    InvalidSize { expected: usize, got: usize },
    #[error("key hex decode error")]
    Hex,
    #[error("malformed c4gh-v1 key blob")]
    MalformedBlob,
    #[error("unsupported key derivation function: {0}")]
    UnsupportedKdf(String),
    #[error("unsupported key cipher: {0}")]
    UnsupportedCipher(String),
    #[error("key file is passphrase-protected but no passphrase was supplied")]
    PassphraseRequired,
    #[error("failed to decrypt private key (wrong passphrase?)")]
    Decrypt,
}

/// Public half of an X25519 keypair
///
/// Identifies a recipient of a Crypt4GH header packet. Requesters hand
/// their public key to the service to receive containers re-encrypted for
/// them; the archive's own public key is the implicit recipient of every
/// stored header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(X25519PublicKey);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl From<[u8; KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        PublicKey(X25519PublicKey::from(bytes))
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| KeyError::InvalidSize {
            expected: KEY_SIZE,
            got: bytes.len(),
        })?;
        Ok(buff.into())
    }
}

impl PublicKey {
    /// Parse a public key from a hexadecimal string
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let mut buff = [0; KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| KeyError::Hex)?;
        Ok(buff.into())
    }

    /// Parse a public key from PEM
    ///
    /// Accepts the `CRYPT4GH PUBLIC KEY` armor emitted by crypt4gh key
    /// generators as well as a bare `PUBLIC KEY` tag; in both cases the
    /// payload is the raw 32-byte key.
    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str)?;
        if !pem.tag().ends_with("PUBLIC KEY") {
            return Err(KeyError::UnexpectedTag(pem.tag().to_string()));
        }
        Self::try_from(pem.contents())
    }

    /// Encode in the `CRYPT4GH PUBLIC KEY` PEM armor
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CRYPT4GH PUBLIC KEY", self.to_bytes().to_vec()))
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        *self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub(crate) fn as_x25519(&self) -> &X25519PublicKey {
        &self.0
    }
}

/// Private half of an X25519 keypair
///
/// The archive's long-term key; unwraps every stored header and acts as
/// the writer key when containers are re-encrypted for a requester.
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log private key material
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

impl From<[u8; KEY_SIZE]> for SecretKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        SecretKey(StaticSecret::from(bytes))
    }
}

impl SecretKey {
    /// Generate a new random secret key using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self::from(bytes)
    }

    /// Derive the public key from this secret key
    pub fn public(&self) -> PublicKey {
        PublicKey(X25519PublicKey::from(&self.0))
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    pub(crate) fn as_x25519(&self) -> &StaticSecret {
        &self.0
    }

    /// Parse a private key from PEM, decrypting it when needed
    ///
    /// Accepts:
    /// - a bare `PRIVATE KEY` block holding the raw 32-byte key
    /// - a `CRYPT4GH PRIVATE KEY` block holding a `c4gh-v1` blob, with
    ///   kdf `none` or `scrypt` and cipher `none` or `chacha20_poly1305`
    ///
    /// `passphrase` is only consulted for encrypted blobs; supplying one
    /// for an unencrypted key is not an error.
    pub fn from_pem(pem_str: &str, passphrase: Option<&str>) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str)?;
        if !pem.tag().ends_with("PRIVATE KEY") {
            return Err(KeyError::UnexpectedTag(pem.tag().to_string()));
        }
        let contents = pem.contents();
        if contents.starts_with(C4GH_MAGIC) {
            return Self::from_c4gh_blob(contents, passphrase);
        }
        let buff: [u8; KEY_SIZE] = contents.try_into().map_err(|_| KeyError::InvalidSize {
            expected: KEY_SIZE,
            got: contents.len(),
        })?;
        Ok(Self::from(buff))
    }

    /// Encode as an unencrypted `CRYPT4GH PRIVATE KEY` PEM block
    pub fn to_pem(&self) -> String {
        let mut blob = Vec::new();
        blob.extend_from_slice(C4GH_MAGIC);
        push_lv(&mut blob, b"none");
        push_lv(&mut blob, b"none");
        push_lv(&mut blob, &self.to_bytes());
        pem::encode(&pem::Pem::new("CRYPT4GH PRIVATE KEY", blob))
    }

    /// Encode as a passphrase-protected `CRYPT4GH PRIVATE KEY` PEM block
    ///
    /// Uses the same scheme crypt4gh key generators emit: scrypt over the
    /// passphrase with a random 16-byte salt, ChaCha20-Poly1305 over the
    /// raw key.
    pub fn to_pem_with_passphrase(&self, passphrase: &str) -> Result<String, KeyError> {
        let mut salt = [0u8; 16];
        getrandom::getrandom(&mut salt).expect("failed to generate random bytes");
        let kek = derive_kek(passphrase, &salt)?;

        let mut nonce_bytes = [0u8; WRAP_NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).expect("failed to generate random bytes");
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&kek));
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), self.to_bytes().as_ref())
            .map_err(|_| KeyError::Decrypt)?;

        let mut rounds_and_salt = Vec::with_capacity(4 + salt.len());
        rounds_and_salt.extend_from_slice(&0u32.to_be_bytes());
        rounds_and_salt.extend_from_slice(&salt);

        let mut key_blob = Vec::with_capacity(WRAP_NONCE_SIZE + wrapped.len());
        key_blob.extend_from_slice(&nonce_bytes);
        key_blob.extend_from_slice(&wrapped);

        let mut blob = Vec::new();
        blob.extend_from_slice(C4GH_MAGIC);
        push_lv(&mut blob, b"scrypt");
        push_lv(&mut blob, &rounds_and_salt);
        push_lv(&mut blob, b"chacha20_poly1305");
        push_lv(&mut blob, &key_blob);
        Ok(pem::encode(&pem::Pem::new("CRYPT4GH PRIVATE KEY", blob)))
    }

    fn from_c4gh_blob(blob: &[u8], passphrase: Option<&str>) -> Result<Self, KeyError> {
        let mut cursor = &blob[C4GH_MAGIC.len()..];
        let kdfname = read_lv(&mut cursor)?;

        let salt = match kdfname {
            b"none" => None,
            b"scrypt" => {
                let rounds_and_salt = read_lv(&mut cursor)?;
                if rounds_and_salt.len() <= 4 {
                    return Err(KeyError::MalformedBlob);
                }
                // first 4 bytes are a rounds count, unused by scrypt
                Some(rounds_and_salt[4..].to_vec())
            }
            other => {
                return Err(KeyError::UnsupportedKdf(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        };

        let ciphername = read_lv(&mut cursor)?.to_vec();
        let key_blob = read_lv(&mut cursor)?;

        match ciphername.as_slice() {
            b"none" => {
                let buff: [u8; KEY_SIZE] =
                    key_blob.try_into().map_err(|_| KeyError::InvalidSize {
                        expected: KEY_SIZE,
                        got: key_blob.len(),
                    })?;
                Ok(Self::from(buff))
            }
            b"chacha20_poly1305" => {
                let salt = salt.ok_or(KeyError::MalformedBlob)?;
                let passphrase = passphrase.ok_or(KeyError::PassphraseRequired)?;
                let kek = derive_kek(passphrase, &salt)?;
                if key_blob.len() <= WRAP_NONCE_SIZE {
                    return Err(KeyError::MalformedBlob);
                }
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&kek));
                let nonce = Nonce::from_slice(&key_blob[..WRAP_NONCE_SIZE]);
                let unwrapped = cipher
                    .decrypt(nonce, &key_blob[WRAP_NONCE_SIZE..])
                    .map_err(|_| KeyError::Decrypt)?;
                let buff: [u8; KEY_SIZE] =
                    unwrapped
                        .as_slice()
                        .try_into()
                        .map_err(|_| KeyError::InvalidSize {
                            expected: KEY_SIZE,
                            got: unwrapped.len(),
                        })?;
                Ok(Self::from(buff))
            }
            other => Err(KeyError::UnsupportedCipher(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

fn derive_kek(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_SIZE], KeyError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_SIZE)
        .map_err(|_| KeyError::MalformedBlob)?;
    let mut kek = [0u8; KEY_SIZE];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut kek)
        .map_err(|_| KeyError::MalformedBlob)?;
    Ok(kek)
}

/// Append a 2-byte big-endian length-prefixed value
fn push_lv(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

/// Read a 2-byte big-endian length-prefixed value, advancing the cursor
fn read_lv<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], KeyError> {
    if cursor.len() < 2 {
        return Err(KeyError::MalformedBlob);
    }
    let len = u16::from_be_bytes([cursor[0], cursor[1]]) as usize;
    if cursor.len() < 2 + len {
        return Err(KeyError::MalformedBlob);
    }
    let value = &cursor[2..2 + len];
    *cursor = &cursor[2 + len..];
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let secret = SecretKey::generate();
        let public = secret.public();

        let hex = public.to_hex();
        let recovered = PublicKey::from_hex(&hex).unwrap();
        assert_eq!(public.to_bytes(), recovered.to_bytes());
    }

    #[test]
    fn test_public_pem_roundtrip() {
        let public = SecretKey::generate().public();
        let pem = public.to_pem();
        assert!(pem.contains("CRYPT4GH PUBLIC KEY"));
        let recovered = PublicKey::from_pem(&pem).unwrap();
        assert_eq!(public.to_bytes(), recovered.to_bytes());
    }

    #[test]
    fn test_private_pem_roundtrip_unencrypted() {
        let secret = SecretKey::generate();
        let pem = secret.to_pem();
        let recovered = SecretKey::from_pem(&pem, None).unwrap();
        assert_eq!(secret.to_bytes(), recovered.to_bytes());
        // a stray passphrase is ignored for unencrypted keys
        let recovered = SecretKey::from_pem(&pem, Some("unused")).unwrap();
        assert_eq!(secret.to_bytes(), recovered.to_bytes());
    }

    #[test]
    fn test_private_pem_roundtrip_with_passphrase() {
        let secret = SecretKey::generate();
        let pem = secret.to_pem_with_passphrase("correct horse").unwrap();

        let recovered = SecretKey::from_pem(&pem, Some("correct horse")).unwrap();
        assert_eq!(secret.to_bytes(), recovered.to_bytes());
        assert_eq!(
            secret.public().to_bytes(),
            recovered.public().to_bytes()
        );

        assert!(matches!(
            SecretKey::from_pem(&pem, Some("wrong")),
            Err(KeyError::Decrypt)
        ));
        assert!(matches!(
            SecretKey::from_pem(&pem, None),
            Err(KeyError::PassphraseRequired)
        ));
    }

    #[test]
    fn test_raw_private_key_pem() {
        let secret = SecretKey::generate();
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", secret.to_bytes().to_vec()));
        let recovered = SecretKey::from_pem(&pem, None).unwrap();
        assert_eq!(secret.to_bytes(), recovered.to_bytes());
    }

    #[test]
    fn test_rejects_wrong_tag() {
        let secret = SecretKey::generate();
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", secret.to_bytes().to_vec()));
        assert!(matches!(
            SecretKey::from_pem(&pem, None),
            Err(KeyError::UnexpectedTag(_))
        ));
    }
}
