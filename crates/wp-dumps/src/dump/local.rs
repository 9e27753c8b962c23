//! Local layout of downloaded dump files.
//!
//! Downloaded files mirror their relative URL under the output directory, e.g.
//! `{out_dir}/enwiki/20230301/enwiki-20230301-abstract.xml.gz`. A partially downloaded
//! file uses the same path, so a later run can resume it by looking at its length.

use anyhow::{bail, Context};
use crate::Result;
use std::path::{Path, PathBuf};

/// The local path for a file with relative URL `rel_url`.
///
/// Doesn't validate `rel_url`; call [`validate_file_relative_url`] before writing to the path.
pub fn destination_path(out_dir: &Path, rel_url: &str) -> PathBuf {
    let mut path = out_dir.to_owned();
    for segment in rel_url.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

pub fn validate_file_relative_url(url: &str) -> Result<()> {
    // Wrap everything in a closure to add context with anyhow.
    (|| -> Result<()> {
        if url.is_empty() {
            bail!("URL was the empty string");
        }

        let mut rel_segments = url.split('/');
        let first = rel_segments.next().expect("split always returns at least one segment");

        if !first.is_empty() {
            bail!("Path missing initial '/'");
        }

        for segment in rel_segments {
            if segment == "." || segment == ".." {
                bail!("Path segment was '.' or '..' segment='{segment}'");
            }

            if !lazy_regex!(r"^[-a-z_0-9A-Z.]+$").is_match(segment) {
                bail!("Path segment didn't match regex segment='{segment}'");
            }
        }

        Ok(())
    })().with_context(|| format!("Bad file metadata relative URL file_url='{url}'"))
}

/// Length of an existing file at `path`, or `None` if there is nothing there.
pub async fn existing_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!(
            "while checking for an existing file path='{path}'",
            path = path.display()))),
        Ok(meta) if !meta.is_file() => {
            bail!("Found an item that's not a file path='{path}' file_type={file_type:?}",
                  path = path.display(),
                  file_type = meta.file_type());
        },
        Ok(meta) => Ok(Some(meta.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::{destination_path, existing_len, validate_file_relative_url};
    use std::path::Path;

    #[test]
    fn test_validate_file_relative_url() {
        let cases: &[(&str, bool)] = &[
            ("/enwiki/20230301/enwiki-20230301-abstract17.xml.gz", true),
            ("", false),
            ("/", false),
            ("a", false),
            ("a/", false),
            ("/a", true),
            ("/abc123ABC.-_", true),
            ("//", false),
            ("//a", false),
            ("/abc/123", true),
            ("/abc/123/", false),
            ("/abc/123/..", false),
            ("/abc/123/.", false),
            ("/abc/../123", false),
            ("/abc/./123", false),
            ("/abc/1 2", false),
        ];

        let failures = cases.iter()
            .filter(|(input, expected_ok)| {
                let output = validate_file_relative_url(input);
                println!(r#"case input="{input}" expected_ok={expected_ok} output={output:?}"#);
                output.is_ok() != *expected_ok
            })
            .count();

        assert_eq!(failures, 0);
    }

    #[test]
    fn destination_mirrors_relative_url() {
        assert_eq!(destination_path(Path::new("/data/dumps"),
                                    "/enwiki/20230301/enwiki-20230301-abstract.xml.gz"),
                   Path::new("/data/dumps/enwiki/20230301/enwiki-20230301-abstract.xml.gz"));
    }

    #[tokio::test]
    async fn existing_len_of_file_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        assert_eq!(existing_len(&path).await.unwrap(), None);

        std::fs::write(&path, b"12345").unwrap();
        assert_eq!(existing_len(&path).await.unwrap(), Some(5));

        assert!(existing_len(dir.path()).await.is_err());
    }
}
