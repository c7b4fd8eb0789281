//! Artifact encryption: AES-256-GCM in independently sealed 64 KiB frames.
//!
//! Layout: `MAGIC | KDF rounds (u32 BE) | salt (16) | nonce prefix (8)`,
//! then frames of
//! `flag (1) | ciphertext length (u32 BE) | ciphertext`. The flag marks the
//! final frame and is bound as associated data, so truncation is detected.
//! Each frame's nonce is the prefix followed by the big-endian frame counter.
//! Framing lets the verifier decrypt the first frame alone.
//!
//! The key is PBKDF2-HMAC-SHA256 of the passphrase over the header's salt.
//! One salt is drawn per [`Encryptor`], so a run derives its key once;
//! derived keys are cached per (rounds, salt) for decryption.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use anyhow::{Context, Result, anyhow, bail};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{DrError, DrResult};

pub const MAGIC: &[u8; 8] = b"DRSENC02";
pub const FRAME_SIZE: usize = 64 * 1024;

const SALT_LEN: usize = 16;
pub const KDF_ROUNDS: u32 = 600_000;
/// Headers asking for more work than this are rejected as corrupt.
const MAX_KDF_ROUNDS: u32 = 10_000_000;
const NONCE_PREFIX_LEN: usize = 8;
const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;
/// Upper bound on a frame's ciphertext: plaintext plus the GCM tag.
const MAX_CIPHERTEXT: usize = FRAME_SIZE + 16;

pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Read a passphrase file, ignoring a trailing newline.
    pub async fn from_file(path: &Path) -> DrResult<Self> {
        let mut bytes = tokio::fs::read(path).await.map_err(|e| {
            DrError::Prerequisite(format!(
                "cannot read passphrase file {}: {}",
                path.display(),
                e
            ))
        })?;
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        if bytes.is_empty() {
            return Err(DrError::Prerequisite(format!(
                "passphrase file {} is empty",
                path.display()
            )));
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

type KeyCache = HashMap<(u32, [u8; SALT_LEN]), [u8; 32]>;

/// Symmetric encryption provider for artifacts.
#[derive(Clone)]
pub struct Encryptor {
    passphrase: Arc<Passphrase>,
    salt: [u8; SALT_LEN],
    keys: Arc<Mutex<KeyCache>>,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}

impl Encryptor {
    pub fn new(passphrase: Passphrase) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            passphrase: Arc::new(passphrase),
            salt,
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cipher(&self, rounds: u32, salt: &[u8; SALT_LEN]) -> Aes256Gcm {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let key = keys.entry((rounds, *salt)).or_insert_with(|| {
            let mut key = [0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(&self.passphrase.0, salt, rounds, &mut key);
            key
        });
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()))
    }

    /// Encrypt everything from `reader` into `writer`. Returns plaintext bytes read.
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);

        let cipher = self.cipher(KDF_ROUNDS, &self.salt);
        writer.write_all(MAGIC)?;
        writer.write_all(&KDF_ROUNDS.to_be_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&prefix)?;

        let mut total = 0u64;
        let mut counter = 0u32;
        let mut current = read_frame(&mut reader)?;
        loop {
            let next = if current.len() == FRAME_SIZE {
                read_frame(&mut reader)?
            } else {
                Vec::new()
            };
            let flag = if next.is_empty() { FLAG_LAST } else { FLAG_MORE };

            let nonce = frame_nonce(&prefix, counter);
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &current,
                        aad: &[flag],
                    },
                )
                .map_err(|_| anyhow!("Encryption failed at frame {}", counter))?;

            writer.write_all(&[flag])?;
            writer.write_all(&(sealed.len() as u32).to_be_bytes())?;
            writer.write_all(&sealed)?;
            total += current.len() as u64;

            if flag == FLAG_LAST {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| anyhow!("Artifact too large to encrypt"))?;
            current = next;
        }

        writer.flush()?;
        Ok(total)
    }

    /// Decrypt everything from `reader` into `writer`. Returns plaintext bytes written.
    pub fn decrypt_stream<R: Read, W: Write>(&self, reader: R, mut writer: W) -> Result<u64> {
        let mut plain = self.decrypting_reader(reader)?;
        let n = io::copy(&mut plain, &mut writer).context("Decryption failed")?;
        writer.flush()?;
        Ok(n)
    }

    /// Decrypt only the first frame. Used to prove the passphrase and header
    /// are good without reading the whole artifact.
    pub fn decrypt_head<R: Read>(&self, reader: R) -> Result<Vec<u8>> {
        let mut plain = self.decrypting_reader(reader)?;
        plain.fill_next_frame()?;
        Ok(std::mem::take(&mut plain.buffer))
    }

    pub fn decrypting_reader<R: Read>(&self, mut reader: R) -> Result<DecryptReader<R>> {
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .context("Encrypted artifact is missing its header")?;
        if &magic != MAGIC {
            bail!("Not an encrypted artifact (bad magic)");
        }
        let mut rounds = [0u8; 4];
        let mut salt = [0u8; SALT_LEN];
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        reader.read_exact(&mut rounds)?;
        reader.read_exact(&mut salt)?;
        reader.read_exact(&mut prefix)?;
        let rounds = u32::from_be_bytes(rounds);
        if rounds == 0 || rounds > MAX_KDF_ROUNDS {
            bail!("Corrupt header: {} key derivation rounds", rounds);
        }

        Ok(DecryptReader {
            inner: reader,
            cipher: self.cipher(rounds, &salt),
            prefix,
            counter: 0,
            buffer: Vec::new(),
            pos: 0,
            finished: false,
        })
    }
}

/// Streaming plaintext view over an encrypted artifact.
pub struct DecryptReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buffer: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    fn fill_next_frame(&mut self) -> Result<()> {
        let mut flag = [0u8; 1];
        self.inner
            .read_exact(&mut flag)
            .context("Encrypted artifact is truncated")?;
        let mut len = [0u8; 4];
        self.inner.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_CIPHERTEXT {
            bail!("Corrupt frame {}: length {} exceeds limit", self.counter, len);
        }

        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed)?;

        let nonce = frame_nonce(&self.prefix, self.counter);
        self.buffer = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &flag,
                },
            )
            .map_err(|_| {
                anyhow!(
                    "Frame {} failed authentication (wrong passphrase or corrupt data)",
                    self.counter
                )
            })?;
        self.pos = 0;

        match flag[0] {
            FLAG_LAST => self.finished = true,
            FLAG_MORE => {
                self.counter = self
                    .counter
                    .checked_add(1)
                    .ok_or_else(|| anyhow!("Frame counter overflow"))?;
            }
            other => bail!("Corrupt frame flag {}", other),
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buffer.len() {
            if self.finished {
                return Ok(0);
            }
            self.fill_next_frame()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }
        let n = out.len().min(self.buffer.len() - self.pos);
        out[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Fill up to one frame of plaintext, stopping early only at end of input.
fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; FRAME_SIZE];
    let mut filled = 0;
    while filled < FRAME_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor(secret: &str) -> Encryptor {
        Encryptor::new(Passphrase::new(secret.as_bytes().to_vec()))
    }

    fn seal(enc: &Encryptor, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        enc.encrypt_stream(plaintext, &mut out).unwrap();
        out
    }

    fn open(enc: &Encryptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        enc.decrypt_stream(ciphertext, &mut out)?;
        Ok(out)
    }

    #[test]
    fn multi_frame_payload_survives() {
        let enc = encryptor("correct horse");
        let payload: Vec<u8> = (0..(FRAME_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();

        let sealed = seal(&enc, &payload);
        assert_eq!(&sealed[..8], MAGIC);
        assert_eq!(open(&enc, &sealed).unwrap(), payload);
    }

    #[test]
    fn empty_and_exact_frame_payloads() {
        let enc = encryptor("pw");
        assert!(open(&enc, &seal(&enc, b"")).unwrap().is_empty());

        let exact = vec![7u8; FRAME_SIZE];
        assert_eq!(open(&enc, &seal(&enc, &exact)).unwrap(), exact);
    }

    #[test]
    fn head_returns_first_frame_only() {
        let enc = encryptor("pw");
        let mut payload = vec![0x1f, 0x8b];
        payload.extend(vec![1u8; FRAME_SIZE * 3]);
        let sealed = seal(&enc, &payload);

        let head = enc.decrypt_head(sealed.as_slice()).unwrap();
        assert_eq!(head.len(), FRAME_SIZE);
        assert_eq!(&head[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let sealed = seal(&encryptor("right"), b"secret data");
        let err = open(&encryptor("wrong"), &sealed).unwrap_err();
        assert!(err.to_string().contains("Decryption failed"));
    }

    #[test]
    fn truncation_is_detected() {
        let enc = encryptor("pw");
        let payload = vec![9u8; FRAME_SIZE + 10];
        let sealed = seal(&enc, &payload);
        // Drop the final frame entirely
        let first_frame_end = MAGIC.len() + 4 + SALT_LEN + NONCE_PREFIX_LEN + 1 + 4 + FRAME_SIZE + 16;
        assert!(open(&enc, &sealed[..first_frame_end]).is_err());
    }

    #[test]
    fn plaintext_is_rejected() {
        assert!(open(&encryptor("pw"), b"\x1f\x8bplain gzip").is_err());
    }

    #[test]
    fn key_comes_from_the_header_salt() {
        let writer = encryptor("pw");
        let sealed = seal(&writer, b"payload");
        assert_eq!(&sealed[8..12], &KDF_ROUNDS.to_be_bytes());
        assert_eq!(&sealed[12..12 + SALT_LEN], &writer.salt);

        // A fresh instance with its own salt still opens it
        let reader = encryptor("pw");
        assert_ne!(reader.salt, writer.salt);
        assert_eq!(open(&reader, &sealed).unwrap(), b"payload");
    }

    #[test]
    fn absurd_round_count_is_rejected() {
        let enc = encryptor("pw");
        let mut sealed = seal(&enc, b"payload");
        sealed[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = open(&enc, &sealed).unwrap_err();
        assert!(format!("{err:#}").contains("key derivation rounds"));
    }
}
