use anyhow::{Result, bail};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::artifact::{self, GZIP_MAGIC, HashingReader};
use super::crypto::Encryptor;
use super::manifest::{ArtifactFormat, ArtifactRef};
use crate::error::{DrError, DrResult};

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub component: String,
    /// Tar entries listed, or 1 for a single gzip stream
    pub entries: usize,
    /// Plaintext bytes streamed through the checksum
    pub bytes_checked: u64,
}

/// Validates captured artifacts before they are trusted.
///
/// Checks stream through the artifact and never materialize its payload:
/// encrypted artifacts must decrypt their first frame to a gzip header,
/// bundles must list cleanly, single files must decompress cleanly, and the
/// plaintext checksum must match the one recorded at capture.
#[derive(Clone)]
pub struct IntegrityVerifier {
    encryptor: Option<Encryptor>,
    timeout: Duration,
}

impl IntegrityVerifier {
    pub fn new(encryptor: Option<Encryptor>, timeout: Duration) -> Self {
        Self { encryptor, timeout }
    }

    /// Verify `artifact`, setting `verified` only on success. A failure leaves
    /// the local file in place for inspection.
    pub async fn verify(&self, artifact: &mut ArtifactRef) -> DrResult<VerifyReport> {
        artifact.verified = false;
        let component = artifact.component.clone();

        info!(component = %component, path = %artifact.local_path.display(), "Verifying artifact");

        let snapshot = artifact.clone();
        let encryptor = self.encryptor.clone();
        let task = tokio::task::spawn_blocking(move || check(&snapshot, encryptor.as_ref()));

        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map_err(|e| format!("{e:#}")),
            Ok(Err(join)) => Err(format!("verification task failed: {join}")),
            Err(_) => Err(format!(
                "verification timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        match outcome {
            Ok(report) => {
                artifact.verified = true;
                info!(
                    component = %component,
                    entries = report.entries,
                    bytes_checked = report.bytes_checked,
                    "Verification complete"
                );
                Ok(report)
            }
            Err(message) => {
                warn!(component = %component, error = %message, "Verification failed");
                Err(DrError::Verification { component, message })
            }
        }
    }
}

fn check(artifact: &ArtifactRef, encryptor: Option<&Encryptor>) -> Result<VerifyReport> {
    let path = artifact.local_path.as_path();
    let metadata = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("Failed to stat {}: {}", path.display(), e))?;
    if metadata.len() != artifact.size_bytes {
        bail!(
            "size mismatch: manifest records {} bytes, file has {}",
            artifact.size_bytes,
            metadata.len()
        );
    }

    if artifact.encrypted {
        let Some(encryptor) = encryptor else {
            bail!("artifact is encrypted but no passphrase is configured");
        };

        // Decrypt round-trip on the first frame before streaming everything
        let head = encryptor.decrypt_head(open(path)?)?;
        if !head.starts_with(&GZIP_MAGIC) {
            bail!("decrypted header is not a gzip stream");
        }
        debug!(component = %artifact.component, head_bytes = head.len(), "Decrypt round-trip ok");

        let plain = encryptor.decrypting_reader(open(path)?)?;
        check_stream(artifact, plain)
    } else {
        check_stream(artifact, open(path)?)
    }
}

fn check_stream<R: Read>(artifact: &ArtifactRef, reader: R) -> Result<VerifyReport> {
    let mut hashing = HashingReader::new(reader);
    let entries = match artifact.format {
        ArtifactFormat::TarGz => artifact::list_tar_gz(&mut hashing)?,
        ArtifactFormat::Gzip => {
            artifact::test_gzip(&mut hashing)?;
            1
        }
    };
    let (bytes_checked, checksum) = hashing.drain_and_finish()?;

    if checksum != artifact.checksum {
        bail!(
            "checksum mismatch: expected {}, got {}",
            artifact.checksum,
            checksum
        );
    }

    Ok(VerifyReport {
        component: artifact.component.clone(),
        entries,
        bytes_checked,
    })
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file =
        File::open(path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;
    Ok(BufReader::with_capacity(128 * 1024, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::{CapturedPayload, pack, seal};
    use crate::core::crypto::Passphrase;
    use tempfile::tempdir;

    fn encryptor() -> Encryptor {
        Encryptor::new(Passphrase::new(b"test-passphrase".to_vec()))
    }

    fn verifier(encryptor: Option<Encryptor>) -> IntegrityVerifier {
        IntegrityVerifier::new(encryptor, Duration::from_secs(30))
    }

    /// Package a directory fixture into an artifact, optionally encrypted
    fn make_artifact(root: &Path, encrypt: bool) -> ArtifactRef {
        let src = root.join("config");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("configmap.yaml"), b"kind: ConfigMap").unwrap();
        std::fs::write(src.join("secret.yaml"), b"kind: Secret").unwrap();

        let packed = pack(&CapturedPayload::Directory(src), root, "configuration").unwrap();
        let (local_path, size_bytes) = if encrypt {
            seal(&packed.path, &encryptor()).unwrap()
        } else {
            (packed.path.clone(), packed.size_bytes)
        };

        ArtifactRef {
            component: "configuration".into(),
            local_path,
            remote_uri: None,
            size_bytes,
            checksum: packed.checksum,
            format: packed.format,
            encrypted: encrypt,
            verified: false,
            upload_error: None,
        }
    }

    #[tokio::test]
    async fn test_verify_encrypted_bundle() {
        let temp = tempdir().unwrap();
        let mut artifact = make_artifact(temp.path(), true);

        let report = verifier(Some(encryptor())).verify(&mut artifact).await.unwrap();
        assert!(artifact.verified);
        assert_eq!(report.entries, 2);
        assert!(report.bytes_checked > 0);
    }

    #[tokio::test]
    async fn test_verify_plain_bundle() {
        let temp = tempdir().unwrap();
        let mut artifact = make_artifact(temp.path(), false);

        verifier(None).verify(&mut artifact).await.unwrap();
        assert!(artifact.verified);
    }

    #[tokio::test]
    async fn test_verify_wrong_passphrase() {
        let temp = tempdir().unwrap();
        let mut artifact = make_artifact(temp.path(), true);
        let wrong = Encryptor::new(Passphrase::new(b"other".to_vec()));

        let err = verifier(Some(wrong)).verify(&mut artifact).await.unwrap_err();
        assert!(!artifact.verified);
        assert!(matches!(err, DrError::Verification { .. }));
        // Failed artifacts stay on disk for the operator
        assert!(artifact.local_path.exists());
    }

    #[tokio::test]
    async fn test_verify_checksum_mismatch() {
        let temp = tempdir().unwrap();
        let mut artifact = make_artifact(temp.path(), true);
        artifact.checksum = "0".repeat(64);

        let err = verifier(Some(encryptor())).verify(&mut artifact).await.unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!artifact.verified);
    }

    #[tokio::test]
    async fn test_verify_truncated_file() {
        let temp = tempdir().unwrap();
        let mut artifact = make_artifact(temp.path(), false);
        let bytes = std::fs::read(&artifact.local_path).unwrap();
        std::fs::write(&artifact.local_path, &bytes[..bytes.len() / 2]).unwrap();
        artifact.size_bytes = (bytes.len() / 2) as u64;

        let result = verifier(None).verify(&mut artifact).await;
        assert!(result.is_err());
        assert!(!artifact.verified);
    }

    #[tokio::test]
    async fn test_verify_size_mismatch() {
        let temp = tempdir().unwrap();
        let mut artifact = make_artifact(temp.path(), false);
        artifact.size_bytes += 1;

        let err = verifier(None).verify(&mut artifact).await.unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
    }
}
