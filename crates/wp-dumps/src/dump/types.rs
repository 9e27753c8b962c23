//! Data types used in Wikimedia dump status documents and the manifests built from them.

use anyhow::bail;
use crate::{
    Error,
    Result,
    util::fmt::{Bytes, Sha1Hash},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    result::Result as StdResult,
    str::FromStr,
};
use valuable::Valuable;

/// The `dumpstatus.json` document for one dump version, as served by the dumps server.
#[derive(Debug, Deserialize, Serialize)]
pub struct DumpVersionStatus {
    pub jobs: BTreeMap<String, JobStatus>,

    #[allow(dead_code)] // Not used currently
    pub version: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobStatus {
    pub status: String,

    #[serde(default)]
    pub updated: String,

    #[serde(default)]
    pub files: BTreeMap<String, FileMetadata>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileMetadata {
    /// File length in bytes. Missing for jobs with status "waiting".
    pub size: Option<u64>,

    /// File relative URL under the dumps root. Missing for jobs with status "waiting".
    pub url: Option<String>,

    /// Expected SHA1 hash of the file's data, formatted as a hex string.
    pub sha1: Option<String>,

    #[allow(dead_code)] // Not verified
    pub md5: Option<String>,
}

/// The parsed status of a dump's versions, oldest first.
#[derive(Clone, Debug, Serialize)]
pub struct Manifest {
    pub dump_name: DumpName,
    pub versions: BTreeMap<Version, VersionManifest>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VersionManifest {
    pub version: Version,
    pub jobs: BTreeMap<JobName, JobManifest>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobManifest {
    pub name: JobName,

    /// The job's completion marker: "done" once every file is published.
    pub status: String,
    pub updated: String,

    /// Files with a published URL, natural-sorted by name.
    pub files: Vec<FileEntry>,

    /// Count of files listed without a URL yet.
    pub pending_files: usize,
}

/// One remote file of a dump version.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FileEntry {
    pub job: JobName,
    pub name: String,

    /// Relative URL under the dumps root, e.g. `/enwiki/20230301/enwiki-20230301-abstract.xml.gz`.
    pub path: String,

    pub size: Option<Bytes>,
    pub sha1: Option<Sha1Hash>,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Valuable)]
#[serde(transparent)]
pub struct DumpName(pub String);

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Valuable)]
#[serde(transparent)]
pub struct Version(pub String);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VersionSpec {
    Latest,
    Version(Version),
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Valuable)]
#[serde(transparent)]
pub struct JobName(pub String);

#[derive(Debug, Serialize)]
pub struct JobOutput {
    pub name: String,

    /// Sum of the sizes of each file.
    pub files_size: Bytes,

    /// Count of files.
    pub files_count: usize,

    pub status: String,
    pub updated: String,
}

impl Manifest {
    pub fn latest_version(&self) -> Option<&VersionManifest> {
        self.versions.values().next_back()
    }
}

impl VersionManifest {
    /// True when every job in `jobs` has finished, or every job in the version when `jobs`
    /// is empty. Jobs the dump run skipped don't count against completion.
    pub fn is_complete(&self, jobs: &[JobName]) -> bool {
        if jobs.is_empty() {
            self.jobs.values().all(|job| job.is_done() || job.is_skipped())
        } else {
            jobs.iter().all(|name| self.jobs.get(name).map(|job| job.is_done()).unwrap_or(false))
        }
    }

    /// Jobs from `jobs` (or all jobs when empty) that have not finished, with their status.
    pub fn unfinished_jobs(&self, jobs: &[JobName]) -> Vec<(JobName, String)> {
        self.jobs.values()
            .filter(|job| jobs.is_empty() || jobs.contains(&job.name))
            .filter(|job| !(job.is_done() || (jobs.is_empty() && job.is_skipped())))
            .map(|job| (job.name.clone(), job.status.clone()))
            .collect()
    }
}

impl JobManifest {
    pub fn is_done(&self) -> bool {
        self.status == "done"
    }

    pub fn is_skipped(&self) -> bool {
        self.status == "skipped"
    }

    pub fn files_size(&self) -> Bytes {
        Bytes(self.files.iter().filter_map(|f| f.size).map(|b| b.0).sum())
    }
}

impl Display for DumpName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&*self.0)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&*self.0)
    }
}

impl Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&*self.0)
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VersionSpec::Latest => f.write_str("latest"),
            VersionSpec::Version(ver) => Display::fmt(ver, f),
        }
    }
}

impl FromStr for DumpName {
    type Err = Error;

    fn from_str(s: &str) -> Result<DumpName> {
        // Dump names are used in URLs and local paths.
        if !lazy_regex!(r"^[-_a-zA-Z0-9]+$").is_match(s) {
            bail!("Dump name must be non-empty and contain only ASCII letters, digits, \
                   '-' or '_' dump_name='{s}'");
        }
        Ok(DumpName(s.to_string()))
    }
}

impl FromStr for JobName {
    type Err = Error;

    fn from_str(s: &str) -> Result<JobName> {
        if s.is_empty() {
            bail!("Job name must not be empty");
        }
        Ok(JobName(s.to_string()))
    }
}

impl FromStr for VersionSpec {
    type Err = clap::Error;

    fn from_str(s: &str) -> StdResult<VersionSpec, clap::Error> {
        if s == "latest" {
            return Ok(VersionSpec::Latest);
        }

        if lazy_regex!(r"^\d{8}$").is_match(s) {
            Ok(VersionSpec::Version(Version(s.to_string())))
        } else {
            Err(clap::error::Error::raw(
                clap::error::ErrorKind::ValueValidation,
                "The value must be 8 numerical digits (e.g. \"20230301\") \
                 or the string \"latest\"."))
        }
    }
}

impl FromStr for Version {
    type Err = clap::Error;

    fn from_str(s: &str) -> StdResult<Version, clap::Error> {
        if lazy_regex!(r"^\d{8}$").is_match(s) {
            Ok(Version(s.to_string()))
        } else {
            Err(clap::error::Error::raw(
                clap::error::ErrorKind::ValueValidation,
                "The value must be 8 numerical digits (e.g. \"20230301\")."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, status: &str) -> JobManifest {
        JobManifest {
            name: JobName(name.to_string()),
            status: status.to_string(),
            updated: String::new(),
            files: vec![],
            pending_files: 0,
        }
    }

    fn version(jobs: Vec<JobManifest>) -> VersionManifest {
        VersionManifest {
            version: Version("20230301".to_string()),
            jobs: jobs.into_iter().map(|j| (j.name.clone(), j)).collect(),
        }
    }

    #[test]
    fn completion_marker() {
        let ver = version(vec![job("abstractsdump", "done"),
                               job("articlesdump", "in-progress"),
                               job("xmlpagelogsdumprecombine", "skipped")]);

        assert!(!ver.is_complete(&[]));
        assert!(ver.is_complete(&[JobName("abstractsdump".to_string())]));
        assert!(!ver.is_complete(&[JobName("articlesdump".to_string())]));
        assert!(!ver.is_complete(&[JobName("nosuchjob".to_string())]));

        assert_eq!(ver.unfinished_jobs(&[]),
                   vec![(JobName("articlesdump".to_string()), "in-progress".to_string())]);

        let done = version(vec![job("abstractsdump", "done"),
                                job("xmlpagelogsdumprecombine", "skipped")]);
        assert!(done.is_complete(&[]));
    }

    #[test]
    fn parse_specs() {
        assert_eq!("latest".parse::<VersionSpec>().unwrap(), VersionSpec::Latest);
        assert_eq!("20230301".parse::<VersionSpec>().unwrap(),
                   VersionSpec::Version(Version("20230301".to_string())));
        assert!("2023030".parse::<VersionSpec>().is_err());
        assert!("enwiki".parse::<DumpName>().is_ok());
        assert!("../etc".parse::<DumpName>().is_err());
        assert!("".parse::<JobName>().is_err());
    }
}
