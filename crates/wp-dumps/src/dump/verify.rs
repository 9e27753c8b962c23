//! Check downloaded files against the sizes and SHA1 hashes in the dump manifest.

use crate::util::fmt::{Bytes, Sha1Hash};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tokio_stream::StreamExt;

/// What a file should look like according to the manifest. Either part may be unknown.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Expected {
    pub size: Option<Bytes>,
    pub sha1: Option<Sha1Hash>,
}

/// A file that passed verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Verified {
    pub len: Bytes,

    /// Only calculated when a hash was expected.
    pub sha1: Option<Sha1Hash>,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum IntegrityError {
    #[error("file was the wrong size expected_len={expected:?} file_len={actual:?}")]
    SizeMismatch {
        expected: Bytes,
        actual: Bytes,
    },

    #[error("bad SHA1 hash expected_sha1={expected} computed_sha1={actual}")]
    Sha1Mismatch {
        expected: Sha1Hash,
        actual: Sha1Hash,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("while reading a file to verify it path='{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Expected {
    pub fn new(size: Option<Bytes>, sha1: Option<Sha1Hash>) -> Expected {
        Expected { size, sha1 }
    }
}

/// Verify the file at `path` has the expected length and SHA1 hash.
///
/// The length is checked first so a truncated file is rejected without hashing it.
#[tracing::instrument(level = "trace", ret)]
pub async fn verify(path: &Path, expected: &Expected) -> Result<Verified, VerifyError> {
    let io_err = |source: std::io::Error| VerifyError::Io { path: path.to_owned(), source };

    let len = Bytes(tokio::fs::metadata(path).await.map_err(io_err)?.len());

    if let Some(expected_len) = expected.size {
        if len != expected_len {
            return Err(IntegrityError::SizeMismatch { expected: expected_len, actual: len }.into());
        }
    }

    let Some(expected_sha1) = expected.sha1 else {
        tracing::debug!(path = %path.display(),
                        "No expected SHA1 hash, only the file length was checked");
        return Ok(Verified { len, sha1: None });
    };

    let sha1 = calculate_file_sha1(path).await.map_err(io_err)?;
    if sha1 != expected_sha1 {
        return Err(IntegrityError::Sha1Mismatch { expected: expected_sha1, actual: sha1 }.into());
    }

    tracing::debug!(path = %path.display(),
                    %sha1,
                    "File OK: SHA1 hash matched the expected value");

    Ok(Verified { len, sha1: Some(sha1) })
}

/// Calculate the SHA1 hash of the data in a file.
pub async fn calculate_file_sha1(path: &Path) -> std::io::Result<Sha1Hash> {
    let file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut chunks = tokio_util::io::ReaderStream::new(file);

    while let Some(chunk) = chunks.next().await {
        hasher.update(&chunk?);
    }

    Ok(Sha1Hash(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verifies_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.xml.gz");
        std::fs::write(&path, b"abc").unwrap();

        let good = Expected::new(Some(Bytes(3)), Some(Sha1Hash::calculate_from_bytes(b"abc")));
        let verified = verify(&path, &good).await.unwrap();
        assert_eq!(verified.len, Bytes(3));
        assert_eq!(verified.sha1, good.sha1);

        let size_only = Expected::new(Some(Bytes(3)), None);
        assert_eq!(verify(&path, &size_only).await.unwrap().sha1, None);

        let nothing = Expected::default();
        assert_eq!(verify(&path, &nothing).await.unwrap().len, Bytes(3));
    }

    #[tokio::test]
    async fn reports_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.xml.gz");
        std::fs::write(&path, b"abd").unwrap();

        let wrong_len = Expected::new(Some(Bytes(4)), None);
        assert!(matches!(verify(&path, &wrong_len).await,
                         Err(VerifyError::Integrity(IntegrityError::SizeMismatch { .. }))));

        let wrong_hash = Expected::new(Some(Bytes(3)),
                                       Some(Sha1Hash::calculate_from_bytes(b"abc")));
        match verify(&path, &wrong_hash).await {
            Err(VerifyError::Integrity(IntegrityError::Sha1Mismatch { actual, .. })) =>
                assert_eq!(actual, Sha1Hash::calculate_from_bytes(b"abd")),
            other => panic!("expected a SHA1 mismatch, got {other:?}"),
        }

        let missing = dir.path().join("missing");
        assert!(matches!(verify(&missing, &Expected::default()).await,
                         Err(VerifyError::Io { .. })));
    }
}
