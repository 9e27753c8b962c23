//! Choose which files of a dump to download.

use crate::{
    dump::{
        engine::DownloadTask,
        local,
        DumpName, FileEntry, JobName, Manifest, Version, VersionManifest, VersionSpec,
    },
    FilePattern,
};
use std::path::Path;

/// User filters for [`select`].
#[derive(Clone, Debug)]
pub struct Selection {
    pub version: VersionSpec,

    /// Jobs to take files from. Empty means every job.
    pub jobs: Vec<JobName>,

    /// Glob patterns matched against file names. Empty means every file.
    pub patterns: Vec<FilePattern>,

    /// Permit selecting a version whose jobs have not all finished.
    pub allow_incomplete: bool,
}

/// The result of [`select`]: files from one dump version, in manifest order.
#[derive(Clone, Debug)]
pub struct Selected {
    pub dump_name: DumpName,
    pub version: Version,

    /// Whether all the selected jobs had finished.
    pub complete: bool,

    pub files: Vec<FileEntry>,

    /// Files listed by the selected jobs that have no URL yet, so can't be downloaded.
    pub pending_files: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SelectError {
    #[error("Dump version not found in the manifest dump='{dump}' version='{version}'")]
    VersionNotFound {
        dump: DumpName,
        version: Version,
    },

    #[error("Dump version is not complete dump='{dump}' version='{version_str}' \
             unfinished_jobs={unfinished_str}. Pass the allow incomplete option to download it \
             anyway.",
            version_str = format_version(.version),
            unfinished_str = format_unfinished(.unfinished))]
    IncompleteDump {
        dump: DumpName,
        version: Option<Version>,
        unfinished: Vec<(JobName, String)>,
    },

    #[error("No files matched the selection dump='{dump}' version='{version}': {reason}")]
    NoMatch {
        dump: DumpName,
        version: String,
        reason: String,
    },
}

fn format_version(version: &Option<Version>) -> &str {
    version.as_ref().map(|v| &*v.0).unwrap_or("latest")
}

fn format_unfinished(unfinished: &[(JobName, String)]) -> String {
    let list = unfinished.iter()
                         .map(|(job, status)| format!("{job}:{status}"))
                         .collect::<Vec<String>>()
                         .join(",");
    format!("[{list}]")
}

/// Select the files to download from `manifest`.
///
/// Pure function of its inputs. Patterns that match no file are logged as warnings; the
/// selection only fails on them when nothing at all is selected.
#[tracing::instrument(level = "debug", skip(manifest), fields(dump = %manifest.dump_name))]
pub fn select(manifest: &Manifest, selection: &Selection) -> Result<Selected, SelectError> {
    let dump = &manifest.dump_name;
    let jobs = &*selection.jobs;

    let no_match = |version: &str, reason: String| SelectError::NoMatch {
        dump: dump.clone(),
        version: version.to_string(),
        reason,
    };

    for job in jobs.iter() {
        if !manifest.versions.values().any(|ver| ver.jobs.contains_key(job)) {
            return Err(no_match(&*selection.version.to_string(),
                                format!("job '{job}' not found in any fetched version")));
        }
    }

    let version: &VersionManifest = match &selection.version {
        VersionSpec::Version(ver) => {
            let Some(ver_manifest) = manifest.versions.get(ver) else {
                return Err(SelectError::VersionNotFound {
                    dump: dump.clone(),
                    version: ver.clone(),
                });
            };
            if !ver_manifest.is_complete(jobs) && !selection.allow_incomplete {
                return Err(SelectError::IncompleteDump {
                    dump: dump.clone(),
                    version: Some(ver.clone()),
                    unfinished: ver_manifest.unfinished_jobs(jobs),
                });
            }
            ver_manifest
        },
        VersionSpec::Latest => {
            let latest_complete = manifest.versions.values().rev()
                                          .find(|ver| ver.is_complete(jobs));
            match (latest_complete, manifest.latest_version()) {
                (Some(ver), _) => ver,
                (None, None) => return Err(no_match("latest",
                                                    "the manifest has no versions".to_string())),
                (None, Some(latest)) if selection.allow_incomplete => latest,
                (None, Some(latest)) => return Err(SelectError::IncompleteDump {
                    dump: dump.clone(),
                    version: None,
                    unfinished: latest.unfinished_jobs(jobs),
                }),
            }
        },
    };

    let complete = version.is_complete(jobs);
    if !complete {
        tracing::warn!(dump = %dump,
                       version = %version.version,
                       unfinished = %format_unfinished(&*version.unfinished_jobs(jobs)),
                       "Selected a dump version that is not complete");
    }

    for job in jobs.iter() {
        if !version.jobs.contains_key(job) {
            return Err(no_match(&*version.version.0,
                                format!("job '{job}' not found in this version")));
        }
    }

    let mut pattern_matches = vec![0_usize; selection.patterns.len()];
    let mut files = Vec::<FileEntry>::new();
    let mut pending_files: usize = 0;

    for job in version.jobs.values()
                           .filter(|job| jobs.is_empty() || jobs.contains(&job.name)) {
        pending_files += job.pending_files;

        for file in job.files.iter() {
            let mut selected = selection.patterns.is_empty();
            for (idx, pattern) in selection.patterns.iter().enumerate() {
                if pattern.matches(&*file.name) {
                    pattern_matches[idx] += 1;
                    selected = true;
                }
            }

            if selected {
                files.push(file.clone());
            }
        }
    }

    for (pattern, count) in selection.patterns.iter().zip(pattern_matches.iter()) {
        if *count == 0 {
            tracing::warn!(%pattern,
                           version = %version.version,
                           "File pattern did not match any files");
        }
    }

    if pending_files > 0 {
        tracing::warn!(pending_files,
                       version = %version.version,
                       "Some files in the selected jobs have no URL yet and will not be downloaded");
    }

    if files.is_empty() {
        return Err(no_match(&*version.version.0,
                            format!("no files matched jobs={jobs:?} patterns=[{patterns}]",
                                    jobs = jobs.iter().map(|j| &*j.0).collect::<Vec<&str>>(),
                                    patterns = selection.patterns.iter()
                                                   .map(|p| p.as_str())
                                                   .collect::<Vec<&str>>()
                                                   .join(", "))));
    }

    tracing::debug!(version = %version.version,
                    files_count = files.len(),
                    complete,
                    "Selected dump files");

    Ok(Selected {
        dump_name: dump.clone(),
        version: version.version.clone(),
        complete,
        files,
        pending_files,
    })
}

/// Plan one [`DownloadTask`] per selected file, in selection order.
///
/// Files are fetched from `{mirror_url}{path}` and saved under `out_dir` at their relative
/// URL, so distinct files always get distinct destinations.
pub fn plan_tasks(selected: &Selected, mirror_url: &str, out_dir: &Path) -> Vec<DownloadTask> {
    let mirror_url = mirror_url.trim_end_matches('/');
    selected.files.iter()
                  .enumerate()
                  .map(|(id, entry)| {
                      DownloadTask::new(id,
                                        entry.clone(),
                                        format!("{mirror_url}{path}", path = entry.path),
                                        local::destination_path(out_dir, &*entry.path))
                  })
                  .collect()
}
