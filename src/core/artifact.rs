//! Packaging of captured payloads into artifacts and back.
//!
//! Single files become gzip streams carrying the original file name in the
//! gzip header; directories become tar bundles with normalized headers (sorted
//! entries, mtime 0, fixed modes) so identical state yields identical bytes.
//! All functions here block and are meant for `spawn_blocking`.

use anyhow::{Context, Result, anyhow, bail};
use flate2::{Compression, GzBuilder, read::GzDecoder};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::crypto::Encryptor;
use super::manifest::ArtifactFormat;

const BUFFER_SIZE: usize = 128 * 1024;
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// What a component handler produced in its staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedPayload {
    File(PathBuf),
    Directory(PathBuf),
}

impl CapturedPayload {
    pub fn path(&self) -> &Path {
        match self {
            Self::File(p) | Self::Directory(p) => p,
        }
    }
}

/// A packaged, not yet encrypted artifact.
#[derive(Debug, Clone)]
pub struct PackedArtifact {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    /// BLAKE3 hex digest of the packaged bytes.
    pub checksum: String,
}

/// Package `payload` into `out_dir/<component>.gz` or `.tar.gz`.
pub fn pack(payload: &CapturedPayload, out_dir: &Path, component: &str) -> Result<PackedArtifact> {
    let (format, file_name) = match payload {
        CapturedPayload::File(_) => (ArtifactFormat::Gzip, format!("{component}.gz")),
        CapturedPayload::Directory(_) => (ArtifactFormat::TarGz, format!("{component}.tar.gz")),
    };
    let path = out_dir.join(file_name);
    let file =
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut hashing = HashingWriter::new(BufWriter::with_capacity(BUFFER_SIZE, file));

    match payload {
        CapturedPayload::File(src) => {
            let name = src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{component}.payload"));
            let mut encoder = GzBuilder::new()
                .filename(name.into_bytes())
                .write(&mut hashing, Compression::default());
            let mut reader = BufReader::with_capacity(
                BUFFER_SIZE,
                File::open(src).with_context(|| format!("Failed to open {}", src.display()))?,
            );
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?;
        }
        CapturedPayload::Directory(src) => {
            let encoder = GzBuilder::new().write(&mut hashing, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_tree(&mut builder, src, src)?;
            builder.into_inner()?.finish()?;
        }
    }

    hashing.flush()?;
    let (size_bytes, checksum) = hashing.finish();
    Ok(PackedArtifact {
        path,
        format,
        size_bytes,
        checksum,
    })
}

fn append_tree<W: Write>(builder: &mut tar::Builder<W>, base: &Path, dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(base)
            .map_err(|_| anyhow!("{} escaped {}", path.display(), base.display()))?;
        let metadata = fs::symlink_metadata(&path)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, relative, io::empty())?;
            append_tree(builder, base, &path)?;
        } else if metadata.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(metadata.len());
            let file = File::open(&path)?;
            builder.append_data(&mut header, relative, BufReader::new(file))?;
        }
        // Symlinks and special files are not part of any component payload
    }
    Ok(())
}

/// Encrypt a packed artifact to `<path>.enc` and remove the plaintext.
/// Returns the sealed path and its size.
pub fn seal(packed: &Path, encryptor: &Encryptor) -> Result<(PathBuf, u64)> {
    let mut sealed_name = packed.as_os_str().to_owned();
    sealed_name.push(".enc");
    let sealed = PathBuf::from(sealed_name);

    let reader = BufReader::with_capacity(BUFFER_SIZE, File::open(packed)?);
    let writer = BufWriter::with_capacity(BUFFER_SIZE, File::create(&sealed)?);
    encryptor
        .encrypt_stream(reader, writer)
        .with_context(|| format!("Failed to encrypt {}", packed.display()))?;
    fs::remove_file(packed)?;

    let size = fs::metadata(&sealed)?.len();
    Ok((sealed, size))
}

/// Decrypt `sealed` into `dest`, returning the BLAKE3 hex digest of the plaintext.
pub fn unseal(sealed: &Path, dest: &Path, encryptor: &Encryptor) -> Result<String> {
    let reader = BufReader::with_capacity(BUFFER_SIZE, File::open(sealed)?);
    let mut writer = HashingWriter::new(BufWriter::with_capacity(BUFFER_SIZE, File::create(dest)?));
    encryptor
        .decrypt_stream(reader, &mut writer)
        .with_context(|| format!("Failed to decrypt {}", sealed.display()))?;
    writer.flush()?;
    Ok(writer.finish().1)
}

/// Unpack a packaged artifact into `dest_dir`, returning the restored payload.
pub fn unpack(archive: &Path, format: ArtifactFormat, dest_dir: &Path) -> Result<CapturedPayload> {
    fs::create_dir_all(dest_dir)?;
    let reader = BufReader::with_capacity(BUFFER_SIZE, File::open(archive)?);

    match format {
        ArtifactFormat::Gzip => {
            let mut decoder = GzDecoder::new(reader);
            let name = decoder
                .header()
                .and_then(|h| h.filename())
                .map(|n| String::from_utf8_lossy(n).into_owned())
                .filter(|n| !n.is_empty() && !n.contains('/') && n != "..")
                .unwrap_or_else(|| "payload".to_string());
            let out = dest_dir.join(name);
            let mut writer = BufWriter::new(File::create(&out)?);
            io::copy(&mut decoder, &mut writer)
                .with_context(|| format!("Failed to decompress {}", archive.display()))?;
            writer.flush()?;
            Ok(CapturedPayload::File(out))
        }
        ArtifactFormat::TarGz => {
            let mut archive_reader = tar::Archive::new(GzDecoder::new(reader));
            archive_reader
                .unpack(dest_dir)
                .with_context(|| format!("Failed to unpack {}", archive.display()))?;
            Ok(CapturedPayload::Directory(dest_dir.to_path_buf()))
        }
    }
}

/// Walk a tar.gz stream's headers without writing anything. Returns entry count.
pub fn list_tar_gz<R: Read>(reader: R) -> Result<usize> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut count = 0;
    for entry in archive.entries()? {
        let entry = entry?;
        entry.path()?;
        count += 1;
    }
    Ok(count)
}

/// Decompress a gzip stream into nothing. Returns decompressed length.
pub fn test_gzip<R: Read>(reader: R) -> Result<u64> {
    let mut decoder = GzDecoder::new(reader);
    let n = io::copy(&mut decoder, &mut io::sink())?;
    if decoder.header().is_none() {
        bail!("Missing gzip header");
    }
    Ok(n)
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
    let mut reader = HashingReader::new(BufReader::with_capacity(BUFFER_SIZE, file));
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finish().1)
}

/// Read adapter that hashes everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    /// Drain whatever is left, then return `(bytes, hex digest)`.
    pub fn drain_and_finish(mut self) -> io::Result<(u64, String)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(self.finish())
    }

    pub fn finish(self) -> (u64, String) {
        (self.bytes, self.hasher.finalize().to_hex().to_string())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Write adapter that hashes everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    pub fn finish(self) -> (u64, String) {
        (self.bytes, self.hasher.finalize().to_hex().to_string())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::Passphrase;
    use tempfile::tempdir;

    fn write(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn directory_bundles_are_deterministic() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("b.yaml"), b"kind: Secret");
        write(&src.join("a.yaml"), b"kind: ConfigMap");
        write(&src.join("nested/c.txt"), b"nested");

        let out1 = temp.path().join("out1");
        let out2 = temp.path().join("out2");
        fs::create_dir_all(&out1).unwrap();
        fs::create_dir_all(&out2).unwrap();

        let payload = CapturedPayload::Directory(src.clone());
        let first = pack(&payload, &out1, "configuration").unwrap();
        let second = pack(&payload, &out2, "configuration").unwrap();

        assert_eq!(first.format, ArtifactFormat::TarGz);
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.checksum, hash_file(&first.path).unwrap());
        assert_eq!(list_tar_gz(File::open(&first.path).unwrap()).unwrap(), 4);
    }

    #[test]
    fn single_file_keeps_its_name() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("staging/database.dump");
        write(&src, b"PGDMP fake dump");

        let packed = pack(&CapturedPayload::File(src), temp.path(), "database").unwrap();
        assert_eq!(packed.format, ArtifactFormat::Gzip);
        assert!(packed.path.ends_with("database.gz"));

        let restored = unpack(&packed.path, packed.format, &temp.path().join("restore")).unwrap();
        assert_eq!(restored.path().file_name().unwrap(), "database.dump");
        assert_eq!(fs::read(restored.path()).unwrap(), b"PGDMP fake dump");
    }

    #[test]
    fn seal_and_unseal_preserve_checksum() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("dump.rdb");
        write(&src, &vec![42u8; 200_000]);
        let packed = pack(&CapturedPayload::File(src), temp.path(), "cache").unwrap();

        let enc = Encryptor::new(Passphrase::new(b"pw".to_vec()));
        let (sealed, size) = seal(&packed.path, &enc).unwrap();
        assert!(!packed.path.exists());
        assert!(sealed.to_string_lossy().ends_with("cache.gz.enc"));
        assert!(size > 0);

        let digest = unseal(&sealed, &temp.path().join("cache.gz"), &enc).unwrap();
        assert_eq!(digest, packed.checksum);
    }

    #[test]
    fn corrupt_gzip_fails_test() {
        let mut bytes = GZIP_MAGIC.to_vec();
        bytes.extend_from_slice(b"definitely not deflate");
        assert!(test_gzip(bytes.as_slice()).is_err());
    }
}
