//! On-disk encrypted artifact.
//!
//! Layout (all integers little endian):
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 8    | magic `APVLT01\0`              |
//! | 8      | 4    | format version                 |
//! | 12     | 4    | argon2 memory (KiB)            |
//! | 16     | 4    | argon2 iterations              |
//! | 20     | 4    | argon2 parallelism             |
//! | 24     | 4    | plaintext chunk size           |
//! | 28     | 32   | salt                           |
//! | 60     | 19   | stream nonce                   |
//! | 79     | 17   | zero                           |
//! | 96     | ..   | sealed segments                |
//!
//! The 96 header bytes are the associated data of every segment, so the file
//! needs nothing but the shared secret to be opened and any header edit is
//! caught as an authentication failure.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::crypto::{
    derive_key, generate_salt, generate_stream_nonce, open_stream, KdfParams, SharedSecret,
    StreamNonce, StreamSealer, SALT_LEN, STREAM_NONCE_LEN,
};
use crate::error::{Result, SyncError};
use crate::fsutil::{commit_staged, staging_file_for};

pub const ARTIFACT_MAGIC: &[u8; 8] = b"APVLT01\0";
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 96;
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_KDF_ITERATIONS: u32 = 64;
const MAX_KDF_PARALLELISM: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub format_version: u32,
    pub kdf: KdfParams,
    pub chunk_size: u32,
    pub salt: [u8; SALT_LEN],
    pub nonce: StreamNonce,
}

impl ArtifactHeader {
    /// New header with a salt and nonce that have never been used before.
    pub fn fresh(kdf: KdfParams, chunk_size: usize) -> Result<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(SyncError::Config(format!(
                "chunk size {chunk_size} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}"
            )));
        }
        kdf.validate()?;
        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            kdf,
            chunk_size: chunk_size as u32,
            salt: generate_salt(),
            nonce: generate_stream_nonce(),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(ARTIFACT_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[24..28].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[28..60].copy_from_slice(&self.salt);
        buf[60..79].copy_from_slice(&self.nonce);
        buf
    }

    /// Parse a header. Anything that does not look like one of ours is
    /// reported as an authentication failure: the file is corrupt, not the disk.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[..8] != ARTIFACT_MAGIC {
            return Err(SyncError::AuthenticationFailure);
        }
        let format_version = read_u32(buf, 8);
        if format_version != ARTIFACT_FORMAT_VERSION {
            return Err(SyncError::AuthenticationFailure);
        }
        if buf[60 + STREAM_NONCE_LEN..].iter().any(|b| *b != 0) {
            return Err(SyncError::AuthenticationFailure);
        }
        let kdf = KdfParams {
            memory_kib: read_u32(buf, 12),
            iterations: read_u32(buf, 16),
            parallelism: read_u32(buf, 20),
        };
        if kdf.memory_kib > MAX_KDF_MEMORY_KIB
            || kdf.iterations > MAX_KDF_ITERATIONS
            || kdf.parallelism > MAX_KDF_PARALLELISM
            || kdf.validate().is_err()
        {
            return Err(SyncError::AuthenticationFailure);
        }
        let chunk_size = read_u32(buf, 24);
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&(chunk_size as usize)) {
            return Err(SyncError::AuthenticationFailure);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[28..60]);
        let mut nonce = [0u8; STREAM_NONCE_LEN];
        nonce.copy_from_slice(&buf[60..60 + STREAM_NONCE_LEN]);
        Ok(Self {
            format_version,
            kdf,
            chunk_size,
            salt,
            nonce,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Seals plaintext into a staging file beside the final artifact path.
/// Dropping the writer (or the staged result) deletes the staging file.
pub struct ArtifactWriter {
    file: BufWriter<NamedTempFile>,
    sealer: StreamSealer,
    plaintext_len: u64,
}

impl ArtifactWriter {
    pub fn create(
        target: &Path,
        secret: &SharedSecret,
        kdf: &KdfParams,
        chunk_size: usize,
    ) -> Result<Self> {
        let header = ArtifactHeader::fresh(*kdf, chunk_size)?;
        let key = derive_key(secret, &header.salt, &header.kdf)?;
        let header_bytes = header.to_bytes();
        let mut file = BufWriter::new(staging_file_for(target)?);
        file.write_all(&header_bytes)?;
        let sealer = StreamSealer::new(&key, &header.nonce, header_bytes.to_vec(), chunk_size);
        Ok(Self {
            file,
            sealer,
            plaintext_len: 0,
        })
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.sealer.update(data, &mut self.file)?;
        self.plaintext_len += data.len() as u64;
        Ok(())
    }

    pub fn finish(self) -> Result<StagedArtifact> {
        let ArtifactWriter {
            mut file,
            sealer,
            plaintext_len,
        } = self;
        sealer.finish(&mut file)?;
        let staged = file
            .into_inner()
            .map_err(|e| SyncError::StorageFailure(e.into_error()))?;
        Ok(StagedArtifact {
            file: staged,
            plaintext_len,
        })
    }
}

/// A fully sealed artifact waiting to replace the installed one.
pub struct StagedArtifact {
    file: NamedTempFile,
    plaintext_len: u64,
}

impl StagedArtifact {
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    /// Atomically replace `target` with the staged artifact.
    pub fn install(self, target: &Path) -> Result<()> {
        commit_staged(self.file, target)
    }
}

pub struct ArtifactReader {
    file: BufReader<File>,
    header: ArtifactHeader,
    header_bytes: [u8; HEADER_SIZE],
    body_len: u64,
}

impl ArtifactReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let total_len = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let mut header_bytes = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SyncError::AuthenticationFailure)
            }
            Err(e) => return Err(e.into()),
        }
        let header = ArtifactHeader::from_bytes(&header_bytes)?;
        Ok(Self {
            file,
            header,
            header_bytes,
            body_len: total_len - HEADER_SIZE as u64,
        })
    }

    /// Re-derive the key from `secret` and the stored salt, then stream the
    /// plaintext into `out`.
    pub fn decrypt_to<W: Write>(mut self, secret: &SharedSecret, out: &mut W) -> Result<u64> {
        let key = derive_key(secret, &self.header.salt, &self.header.kdf)?;
        open_stream(
            &key,
            &self.header.nonce,
            &self.header_bytes,
            self.header.chunk_size as usize,
            self.body_len,
            &mut self.file,
            out,
        )
    }

    /// Authenticate the whole artifact without keeping any plaintext.
    pub fn verify(self, secret: &SharedSecret) -> Result<u64> {
        self.decrypt_to(secret, &mut io::sink())
    }

    pub fn read_to_vec(self, secret: &SharedSecret) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::new());
        self.decrypt_to(secret, &mut *out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_kdf;
    use std::fs;
    use tempfile::tempdir;

    fn seal(target: &Path, secret: &SharedSecret, data: &[u8]) {
        let mut writer = ArtifactWriter::create(target, secret, &test_kdf(), MIN_CHUNK_SIZE).unwrap();
        for piece in data.chunks(1000) {
            writer.write_chunk(piece).unwrap();
        }
        writer.finish().unwrap().install(target).unwrap();
    }

    #[test]
    fn header_roundtrip() {
        let header = ArtifactHeader::fresh(test_kdf(), MIN_CHUNK_SIZE).unwrap();
        let parsed = ArtifactHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn fresh_headers_never_share_salt_or_nonce() {
        let a = ArtifactHeader::fresh(test_kdf(), MIN_CHUNK_SIZE).unwrap();
        let b = ArtifactHeader::fresh(test_kdf(), MIN_CHUNK_SIZE).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn write_install_and_read_back() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("demo.vault");
        let secret = SharedSecret::new("s3cret");
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        seal(&target, &secret, &payload);

        let out = ArtifactReader::open(&target).unwrap().read_to_vec(&secret).unwrap();
        assert_eq!(&out[..], &payload[..]);
        // only the artifact remains; the staging file was renamed away
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn wrong_secret_is_authentication_failure() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("demo.vault");
        seal(&target, &SharedSecret::new("right"), b"binary");
        let err = ArtifactReader::open(&target)
            .unwrap()
            .verify(&SharedSecret::new("wrong"))
            .unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailure));
    }

    #[test]
    fn tampering_anywhere_is_detected() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("demo.vault");
        let secret = SharedSecret::new("s3cret");
        seal(&target, &secret, &vec![42u8; 9000]);
        let original = fs::read(&target).unwrap();

        // magic, salt, nonce, padding, first/last ciphertext bytes
        for offset in [0usize, 30, 59, 65, 80, 95, HEADER_SIZE, original.len() - 1] {
            let mut bytes = original.clone();
            bytes[offset] ^= 0x10;
            fs::write(&target, &bytes).unwrap();
            let result = ArtifactReader::open(&target).and_then(|r| r.verify(&secret));
            assert!(
                matches!(result, Err(SyncError::AuthenticationFailure)),
                "offset {offset}"
            );
        }
    }

    #[test]
    fn short_file_is_corrupt_not_io_error() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("demo.vault");
        fs::write(&target, b"APVLT01").unwrap();
        assert!(matches!(
            ArtifactReader::open(&target),
            Err(SyncError::AuthenticationFailure)
        ));
    }

    #[test]
    fn abandoned_staging_keeps_previous_artifact() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("demo.vault");
        let secret = SharedSecret::new("s3cret");
        seal(&target, &secret, b"version one");

        let mut writer = ArtifactWriter::create(&target, &secret, &test_kdf(), MIN_CHUNK_SIZE).unwrap();
        writer.write_chunk(b"version two").unwrap();
        let staged = writer.finish().unwrap();
        assert_eq!(staged.plaintext_len(), 11);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
        drop(staged);

        let out = ArtifactReader::open(&target).unwrap().read_to_vec(&secret).unwrap();
        assert_eq!(&out[..], b"version one");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
