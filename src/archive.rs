// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Hazard archive: long-term encrypted storage for confirmed-malicious files.
//!
//! Files are sealed to a public key whose private half is not present on the
//! processing host. This module deliberately has no decrypt operation.
//!
//! Sealed file layout:
//! `QGA1 | ephemeral X25519 public key (32) | nonce prefix (7) | chunk size (u32 BE) | chunks`
//!
//! The AES-256-GCM key is derived with HKDF-SHA256 from the X25519 shared
//! secret, salted with both public keys. The plaintext is encrypted as a
//! STREAM (big-endian 32-bit counter) of `chunk size` pieces, each followed by
//! its 16-byte tag; the final piece may be shorter and is flagged as last, so
//! truncation is detected. Memory use is bounded by two chunks.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::EncryptorBE32;
use aes_gcm::aead::{AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use log::{debug, info};
use sha2::Sha256;
use tempfile::NamedTempFile;
use x25519_dalek::{EphemeralSecret, PublicKey};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"QGA1";
pub const ARCHIVE_EXTENSION: &str = "qga";
const HKDF_INFO: &[u8] = b"quarantine-gate-archive-v1";
const KEY_LEN: usize = 32;
/// AES-GCM nonce minus the 5 bytes of STREAM counter and last-chunk flag.
const NONCE_PREFIX_LEN: usize = 7;
/// Plaintext bytes per encrypted chunk.
pub const CHUNK_SIZE: u32 = 64 * 1024;
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveKeyError {
    #[error("archive public key {path} is not readable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive public key {path} is not a base64 encoded 32-byte X25519 key")]
    Malformed { path: PathBuf },
}

/// Recipient public key for the hazard archive.
#[derive(Clone)]
pub struct ArchivePublicKey(PublicKey);

impl std::fmt::Debug for ArchivePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArchivePublicKey({})", BASE64.encode(self.0.as_bytes()))
    }
}

impl ArchivePublicKey {
    /// Load a base64 encoded public key file.
    pub fn load(path: &Path) -> Result<Self, ArchiveKeyError> {
        let text = fs::read_to_string(path).map_err(|source| ArchiveKeyError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let malformed = || ArchiveKeyError::Malformed {
            path: path.to_path_buf(),
        };
        let bytes = BASE64.decode(text.trim()).map_err(|_| malformed())?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| malformed())?;
        Ok(Self::from_bytes(bytes))
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

/// Write-only encrypted archive directory.
#[derive(Debug)]
pub struct HazardArchive {
    dir: PathBuf,
    key: ArchivePublicKey,
}

impl HazardArchive {
    #[must_use]
    pub const fn new(dir: PathBuf, key: ArchivePublicKey) -> Self {
        Self { dir, key }
    }

    /// Encrypt `plaintext` into the archive as `<name>.qga`.
    ///
    /// The sealed file is fully written and synced before it becomes visible,
    /// and never replaces an existing archive entry. The plaintext is left in
    /// place; the caller removes it.
    pub fn seal(&self, plaintext: &Path, name: &str) -> Result<PathBuf> {
        let input = File::open(plaintext)
            .with_context(|| format!("Failed to read {}", plaintext.display()))?;

        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(format!("{name}.{ARCHIVE_EXTENSION}"));
        let mut tmp = NamedTempFile::new_in(&self.dir).context("failed to create temp file")?;
        let written = {
            let mut out = io::BufWriter::new(tmp.as_file_mut());
            let written = self.seal_stream(input, &mut out)?;
            out.flush()?;
            written
        };
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&dest)
            .with_context(|| format!("failed to persist to {}", dest.display()))?;

        info!(
            "Archive: sealed {} -> {} ({written} bytes)",
            plaintext.display(),
            dest.display(),
        );
        Ok(dest)
    }

    /// Move a metadata sidecar into the archive next to its sealed file.
    pub fn store_metadata(&self, metadata: &Path) -> Result<PathBuf> {
        let name = metadata.file_name().context("metadata path has no file name")?;
        let dest = self.dir.join(name);
        fs::create_dir_all(&self.dir)?;
        crate::quarantine::move_file_noclobber(metadata, &dest)
            .with_context(|| format!("Failed to move {} into archive", metadata.display()))?;
        debug!("Archive: stored metadata {}", dest.display());
        Ok(dest)
    }

    /// Write the header and encrypted chunks of `reader` to `writer`.
    /// Returns the number of bytes written.
    fn seal_stream<R: Read, W: Write>(&self, mut reader: R, writer: &mut W) -> Result<u64> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.key.0);

        let cipher = Aes256Gcm::new(&derive_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            self.key.0.as_bytes(),
        )?);
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&Aes256Gcm::generate_nonce(&mut OsRng)[..NONCE_PREFIX_LEN]);
        let mut encryptor = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&prefix));

        writer.write_all(ARCHIVE_MAGIC)?;
        writer.write_all(ephemeral_public.as_bytes())?;
        writer.write_all(&prefix)?;
        writer.write_all(&CHUNK_SIZE.to_be_bytes())?;
        let mut written = (ARCHIVE_MAGIC.len() + KEY_LEN + NONCE_PREFIX_LEN + 4) as u64;

        let encryption_failed = |e: aes_gcm::aead::Error| anyhow::anyhow!("Encryption failed: {e}");
        let mut chunk = read_chunk(&mut reader)?;
        loop {
            let next = if chunk.len() == CHUNK_SIZE as usize {
                read_chunk(&mut reader)?
            } else {
                Vec::new()
            };
            if next.is_empty() {
                break;
            }
            let sealed = encryptor
                .encrypt_next(chunk.as_slice())
                .map_err(encryption_failed)?;
            writer.write_all(&sealed)?;
            written += sealed.len() as u64;
            chunk = next;
        }
        let sealed = encryptor
            .encrypt_last(chunk.as_slice())
            .map_err(encryption_failed)?;
        writer.write_all(&sealed)?;
        written += sealed.len() as u64;

        debug!("Archive: {written} bytes sealed");
        Ok(written)
    }
}

/// Read up to `CHUNK_SIZE` bytes. Shorter only at end of input.
fn read_chunk<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(CHUNK_SIZE as usize);
    Read::take(&mut *reader, u64::from(CHUNK_SIZE)).read_to_end(&mut buf)?;
    Ok(buf)
}

fn derive_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Result<Key<Aes256Gcm>> {
    let mut salt = [0u8; 2 * KEY_LEN];
    salt[..KEY_LEN].copy_from_slice(ephemeral);
    salt[KEY_LEN..].copy_from_slice(recipient);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| anyhow::anyhow!("HKDF expand failed"))?;
    Ok(*Key::<Aes256Gcm>::from_slice(&okm))
}
