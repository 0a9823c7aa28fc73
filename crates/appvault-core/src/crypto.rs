//! Artifact cipher: Argon2id key derivation and chunked XChaCha20-Poly1305.
//!
//! Artifacts are sealed with the STREAM construction (BE32 counter + last-block
//! flag) so a binary can be encrypted while it downloads and decrypted while it
//! is written out, without either side holding the whole payload. Each segment
//! is `chunk_size` plaintext bytes plus a 16-byte tag; the final segment may be
//! shorter (down to a bare tag for an empty payload).
//!
//! Keys are never stored. They are re-derived from the shared secret and the
//! per-artifact salt on every use and zeroized on drop.

use argon2::{Algorithm, Argon2, Params};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{Result, SyncError};

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
/// XChaCha20 nonce minus the 5 bytes STREAM reserves for counter and flag.
pub const STREAM_NONCE_LEN: usize = 19;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub type DerivedKey = Zeroizing<[u8; DERIVED_KEY_LEN]>;
pub type StreamNonce = [u8; STREAM_NONCE_LEN];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_COST,
            iterations: KDF_TIME_COST,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    pub fn validate(&self) -> Result<()> {
        self.argon2_params().map(|_| ())
    }

    fn argon2_params(&self) -> Result<Params> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(DERIVED_KEY_LEN),
        )
        .map_err(|e| SyncError::KeyDerivation(format!("argon2 params: {e}")))
    }
}

/// The passphrase shared with the distribution side. Cheap to clone, wiped on
/// the last drop, never printed.
#[derive(Clone)]
pub struct SharedSecret(Arc<Zeroizing<Vec<u8>>>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(Zeroizing::new(bytes.into())))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

pub fn derive_key(secret: &SharedSecret, salt: &[u8], params: &KdfParams) -> Result<DerivedKey> {
    let argon = Argon2::new(
        Algorithm::Argon2id,
        argon2::Version::V0x13,
        params.argon2_params()?,
    );
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(secret.expose(), salt, &mut key[..])
        .map_err(|e| SyncError::KeyDerivation(format!("argon2 derive: {e}")))?;
    Ok(key)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_stream_nonce() -> StreamNonce {
    let mut nonce = [0u8; STREAM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Incremental sealer. Plaintext is buffered until a full chunk is known not
/// to be the last one, so arbitrary read sizes produce the same framing.
pub struct StreamSealer {
    encryptor: Option<EncryptorBE32<XChaCha20Poly1305>>,
    aad: Vec<u8>,
    chunk_size: usize,
    pending: Zeroizing<Vec<u8>>,
}

impl StreamSealer {
    pub fn new(key: &DerivedKey, nonce: &StreamNonce, aad: Vec<u8>, chunk_size: usize) -> Self {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let encryptor = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(nonce));
        Self {
            encryptor: Some(encryptor),
            aad,
            chunk_size,
            pending: Zeroizing::new(Vec::with_capacity(chunk_size * 2)),
        }
    }

    pub fn update<W: Write>(&mut self, data: &[u8], out: &mut W) -> Result<()> {
        self.pending.extend_from_slice(data);
        let encryptor = self
            .encryptor
            .as_mut()
            .ok_or_else(|| SyncError::Encryption("sealer already finished".into()))?;
        let mut offset = 0;
        while self.pending.len() - offset > self.chunk_size {
            let segment = encryptor
                .encrypt_next(Payload {
                    msg: &self.pending[offset..offset + self.chunk_size],
                    aad: &self.aad,
                })
                .map_err(|e| SyncError::Encryption(format!("seal segment: {e}")))?;
            out.write_all(&segment)?;
            offset += self.chunk_size;
        }
        if offset > 0 {
            self.pending.drain(..offset);
        }
        Ok(())
    }

    pub fn finish<W: Write>(mut self, out: &mut W) -> Result<()> {
        let encryptor = self
            .encryptor
            .take()
            .ok_or_else(|| SyncError::Encryption("sealer already finished".into()))?;
        let segment = encryptor
            .encrypt_last(Payload {
                msg: &self.pending[..],
                aad: &self.aad,
            })
            .map_err(|e| SyncError::Encryption(format!("seal final segment: {e}")))?;
        out.write_all(&segment)?;
        Ok(())
    }
}

/// Decrypt `body_len` bytes of sealed segments from `reader` into `writer`.
/// Returns the number of plaintext bytes written. Any tag mismatch, truncation
/// or reordering yields `AuthenticationFailure`; plaintext written before the
/// failure must be discarded by the caller.
pub fn open_stream<R: Read, W: Write>(
    key: &DerivedKey,
    nonce: &StreamNonce,
    aad: &[u8],
    chunk_size: usize,
    body_len: u64,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let mut decryptor = DecryptorBE32::from_aead(cipher, GenericArray::from_slice(nonce));
    let segment_len = (chunk_size + TAG_LEN) as u64;
    if body_len < TAG_LEN as u64 {
        return Err(SyncError::AuthenticationFailure);
    }

    let mut remaining = body_len;
    let mut written = 0u64;
    let mut segment = vec![0u8; segment_len as usize];
    while remaining > segment_len {
        reader.read_exact(&mut segment)?;
        let plain = Zeroizing::new(
            decryptor
                .decrypt_next(Payload {
                    msg: &segment[..],
                    aad,
                })
                .map_err(|_| SyncError::AuthenticationFailure)?,
        );
        writer.write_all(&plain)?;
        written += plain.len() as u64;
        remaining -= segment_len;
    }

    let last = &mut segment[..remaining as usize];
    reader.read_exact(last)?;
    let plain = Zeroizing::new(
        decryptor
            .decrypt_last(Payload { msg: &*last, aad })
            .map_err(|_| SyncError::AuthenticationFailure)?,
    );
    writer.write_all(&plain)?;
    written += plain.len() as u64;
    Ok(written)
}

/// One-shot encryption with a fresh nonce, same framing as artifacts.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> Result<(StreamNonce, Vec<u8>)> {
    let nonce = generate_stream_nonce();
    let mut sealer = StreamSealer::new(key, &nonce, Vec::new(), DEFAULT_CHUNK_SIZE);
    let mut ciphertext = Vec::with_capacity(plaintext.len() + TAG_LEN);
    sealer.update(plaintext, &mut ciphertext)?;
    sealer.finish(&mut ciphertext)?;
    Ok((nonce, ciphertext))
}

pub fn decrypt(
    key: &DerivedKey,
    nonce: &StreamNonce,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let mut plaintext = Zeroizing::new(Vec::with_capacity(ciphertext.len()));
    let mut reader = ciphertext;
    open_stream(
        key,
        nonce,
        &[],
        DEFAULT_CHUNK_SIZE,
        ciphertext.len() as u64,
        &mut reader,
        &mut *plaintext,
    )?;
    Ok(plaintext)
}

#[cfg(test)]
pub(crate) fn test_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}
