//! Fetch and parse dump status documents from the Wikimedia dumps server.

use crate::{
    dump::{
        DumpName, DumpVersionStatus, FileEntry, JobManifest, JobName, Manifest, Version,
        VersionManifest, VersionSpec, DUMPS_WIKIMEDIA_SERVER,
    },
    http,
    util::fmt::{Bytes, Sha1Hash},
};
use derive_builder::Builder;
use std::collections::BTreeMap;
use tracing::Level;

#[derive(Builder, Clone, Debug)]
pub struct Options {
    /// Base URL of the server hosting the dump status documents, without a trailing '/'.
    #[builder(default = "DUMPS_WIKIMEDIA_SERVER.to_string()", setter(into))]
    server_url: String,

    /// When fetching the latest version, only fetch status documents for this many of
    /// the newest versions. No limit if `None`.
    #[builder(default)]
    versions_limit: Option<usize>,
}

pub struct ManifestFetcher {
    client: http::Client,
    options: Options,
}

/// Manifest fetches fail as a whole; a partial manifest is never returned.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("network error fetching dump metadata url='{url}'")]
    Network {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("could not parse dump metadata url='{url}': {message}")]
    Parse {
        url: String,
        message: String,
    },
}

impl ManifestFetcher {
    pub fn new(client: http::Client, options: Options) -> ManifestFetcher {
        ManifestFetcher {
            client,
            options,
        }
    }

    /// Build the manifest for `dump_name`.
    ///
    /// For a specific version this is a single request for its status document. For
    /// `latest` the versions index is fetched, then the status document of each listed
    /// version (newest first, up to `versions_limit`).
    #[tracing::instrument(level = "debug", skip(self), fields(dump = %dump_name, version = %version_spec))]
    pub async fn fetch(
        &self,
        dump_name: &DumpName,
        version_spec: &VersionSpec,
    ) -> Result<Manifest, ManifestError> {
        let versions: Vec<Version> = match version_spec {
            VersionSpec::Version(ver) => vec![ver.clone()],
            VersionSpec::Latest => {
                let mut vers = self.get_dump_versions(dump_name).await?;
                vers.reverse();
                if let Some(limit) = self.options.versions_limit {
                    vers.truncate(limit.max(1));
                }
                vers
            },
        };

        let mut manifest = Manifest {
            dump_name: dump_name.clone(),
            versions: BTreeMap::new(),
        };

        for ver in versions.into_iter() {
            let ver_manifest = self.fetch_version(dump_name, &ver).await?;
            manifest.versions.insert(ver, ver_manifest);
        }

        tracing::info!(dump = %dump_name,
                       versions_count = manifest.versions.len(),
                       latest = ?manifest.latest_version().map(|v| &v.version),
                       "Fetched dump manifest");

        Ok(manifest)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn fetch_version(
        &self,
        dump_name: &DumpName,
        version: &Version,
    ) -> Result<VersionManifest, ManifestError> {
        let url = format!("{server}/{dump_name}/{version}/dumpstatus.json",
                          server = self.options.server_url);
        let body = self.fetch_text(&url).await?;
        parse_version_status(&url, version, &body)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get_dumps(&self) -> Result<Vec<DumpName>, ManifestError> {
        let url = format!("{server}/backup-index-bydb.html", server = self.options.server_url);
        let body = self.fetch_text(&url).await?;
        parse_dumps_index(&url, &body)
    }

    /// List the versions of a dump, oldest first.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get_dump_versions(
        &self,
        dump_name: &DumpName,
    ) -> Result<Vec<Version>, ManifestError> {
        let url = format!("{server}/{dump_name}/", server = self.options.server_url);
        let body = self.fetch_text(&url).await?;
        parse_versions_index(&url, &body)
    }

    async fn fetch_text(&self, url: &str) -> Result<String, ManifestError> {
        let network_err = |source: anyhow::Error| ManifestError::Network {
            url: url.to_string(),
            source: source.into(),
        };

        let req = self.client.get(url)
                             .build()
                             .map_err(|e| network_err(e.into()))?;
        let res = http::fetch_text(&self.client, req).await.map_err(network_err)?;
        Ok(res.response_body)
    }
}

/// Parse the dumps index page into dump names, sorted and deduplicated.
pub fn parse_dumps_index(url: &str, html: &str) -> Result<Vec<DumpName>, ManifestError> {
    let mut dumps = links(html, "dumps index")
        .filter_map(|href| {
            lazy_regex!(r"^(?P<dump>[-_a-zA-Z0-9]+)/(?P<date>\d{8})$")
                .captures(&*href)
                .map(|cap| DumpName(cap["dump"].to_string()))
        })
        .collect::<Vec<DumpName>>();
    dumps.sort();
    dumps.dedup();

    if dumps.is_empty() {
        return Err(ManifestError::Parse {
            url: url.to_string(),
            message: "No dumps were listed in the index page".to_string(),
        });
    }

    tracing::debug!(dumps_count = dumps.len(), "dumps ret count");

    Ok(dumps)
}

/// Parse a dump's index page into its versions, oldest first.
pub fn parse_versions_index(url: &str, html: &str) -> Result<Vec<Version>, ManifestError> {
    let mut versions = links(html, "dump versions")
        .filter_map(|href| {
            lazy_regex!(r"^(?P<date>\d{8})/$")
                .captures(&*href)
                .map(|cap| Version(cap["date"].to_string()))
        })
        .collect::<Vec<Version>>();
    versions.sort();
    versions.dedup();

    if versions.is_empty() {
        return Err(ManifestError::Parse {
            url: url.to_string(),
            message: "No versions were listed in the dump's index page".to_string(),
        });
    }

    if tracing::enabled!(Level::TRACE) {
        tracing::trace!(?versions, "dump versions ret data");
    }

    Ok(versions)
}

/// Parse a `dumpstatus.json` document into a [`VersionManifest`].
pub fn parse_version_status(
    url: &str,
    version: &Version,
    json: &str,
) -> Result<VersionManifest, ManifestError> {
    let parse_err = |message: String| ManifestError::Parse { url: url.to_string(), message };

    let status: DumpVersionStatus = serde_json::from_str(json)
        .map_err(|e| parse_err(format!("Dump status JSON didn't match the expected shape: {e}")))?;

    let mut jobs = BTreeMap::<JobName, JobManifest>::new();

    for (job_name, job_status) in status.jobs.into_iter() {
        let job_name = JobName(job_name);
        let mut files = Vec::<FileEntry>::with_capacity(job_status.files.len());
        let mut pending_files: usize = 0;

        for (file_name, meta) in job_status.files.into_iter() {
            let Some(path) = meta.url else {
                pending_files += 1;
                continue;
            };

            let sha1 = match meta.sha1.as_deref() {
                None | Some("") => None,
                Some(s) => Some(Sha1Hash::from_hex(s).map_err(|e| parse_err(format!(
                    "Bad SHA1 hash for file job='{job_name}' file='{file_name}': {e:#}")))?),
            };

            files.push(FileEntry {
                job: job_name.clone(),
                name: file_name,
                path,
                size: meta.size.map(Bytes),
                sha1,
            });
        }

        files.sort_by(|a, b| natord::compare(&*a.name, &*b.name));

        jobs.insert(job_name.clone(), JobManifest {
            name: job_name,
            status: job_status.status,
            updated: job_status.updated,
            files,
            pending_files,
        });
    }

    tracing::debug!(%url,
                    %version,
                    jobs_count = jobs.len(),
                    "Parsed dump version status");

    Ok(VersionManifest {
        version: version.clone(),
        jobs,
    })
}

fn links<'a>(html: &'a str, label: &'static str) -> impl Iterator<Item = String> + 'a {
    let doc = scraper::Html::parse_document(html);
    if !doc.errors.is_empty() {
        tracing::warn!(errors = ?doc.errors, label, "Index page had HTML parse errors");
    }

    let selector = scraper::Selector::parse("a").expect("parse selector");
    let hrefs = doc.select(&selector)
                   .filter_map(|link| link.value().attr("href").map(|s| s.to_string()))
                   .collect::<Vec<String>>();
    hrefs.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_URL: &str = "https://dumps.wikimedia.org/simplewiki/20230301/dumpstatus.json";

    fn ver() -> Version {
        Version("20230301".to_string())
    }

    #[test]
    fn parses_status_document() {
        let json = r#"{
          "version": "0.8",
          "jobs": {
            "articlesdump": {
              "status": "done",
              "updated": "2023-03-02 10:11:12",
              "files": {
                "simplewiki-20230301-pages-articles10.xml.bz2": {
                  "size": 200, "url": "/simplewiki/20230301/simplewiki-20230301-pages-articles10.xml.bz2",
                  "sha1": "A9993E364706816ABA3E25717850C26C9CD0D89D", "md5": "x"
                },
                "simplewiki-20230301-pages-articles2.xml.bz2": {
                  "size": 100, "url": "/simplewiki/20230301/simplewiki-20230301-pages-articles2.xml.bz2"
                }
              }
            },
            "abstractsdump": {
              "status": "waiting",
              "updated": "2023-03-01 00:00:00",
              "files": {
                "simplewiki-20230301-abstract.xml.gz": {}
              }
            },
            "noop": { "status": "skipped", "updated": "" }
          }
        }"#;

        let manifest = parse_version_status(STATUS_URL, &ver(), json).unwrap();
        assert_eq!(manifest.jobs.len(), 3);

        let articles = &manifest.jobs[&JobName("articlesdump".to_string())];
        assert!(articles.is_done());
        // Natural sort: 2 before 10.
        assert_eq!(articles.files.iter().map(|f| &*f.name).collect::<Vec<&str>>(),
                   vec!["simplewiki-20230301-pages-articles2.xml.bz2",
                        "simplewiki-20230301-pages-articles10.xml.bz2"]);
        assert_eq!(articles.files[1].size, Some(Bytes(200)));
        assert_eq!(articles.files[1].sha1.unwrap().to_string(),
                   "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(articles.files[0].sha1, None);
        assert_eq!(articles.files_size(), Bytes(300));

        let abstracts = &manifest.jobs[&JobName("abstractsdump".to_string())];
        assert!(abstracts.files.is_empty());
        assert_eq!(abstracts.pending_files, 1);
    }

    #[test]
    fn rejects_unrecognized_documents() {
        for json in ["", "[]", r#"{"jobs": 3, "version": "0.8"}"#, "<html></html>"] {
            assert!(matches!(parse_version_status(STATUS_URL, &ver(), json),
                             Err(ManifestError::Parse { .. })),
                    "json={json}");
        }

        let bad_sha1 = r#"{"version": "0.8", "jobs": {"j": {"status": "done", "updated": "",
            "files": {"f": {"size": 1, "url": "/f", "sha1": "nothex"}}}}}"#;
        assert!(matches!(parse_version_status(STATUS_URL, &ver(), bad_sha1),
                         Err(ManifestError::Parse { .. })));
    }

    #[test]
    fn parses_versions_index() {
        let html = r#"<html><body>
            <a href="../">../</a>
            <a href="20230220/">20230220/</a>
            <a href="20230301/">20230301/</a>
            <a href="20230201/">20230201/</a>
            <a href="latest/">latest/</a>
            </body></html>"#;
        let versions = parse_versions_index("https://x/enwiki/", html).unwrap();
        assert_eq!(versions.iter().map(|v| &*v.0).collect::<Vec<&str>>(),
                   vec!["20230201", "20230220", "20230301"]);

        assert!(matches!(parse_versions_index("https://x/enwiki/", "<html></html>"),
                         Err(ManifestError::Parse { .. })));
    }

    #[test]
    fn parses_dumps_index() {
        let html = r#"<ul>
            <li><a href="enwiki/20230301">enwiki</a>: done</li>
            <li><a href="simplewiki/20230320">simplewiki</a>: in progress</li>
            <li><a href="aawiki/20230301">aawiki</a>: done</li>
            <li><a href="https://example.org/">elsewhere</a></li>
            </ul>"#;
        let dumps = parse_dumps_index("https://x/backup-index-bydb.html", html).unwrap();
        assert_eq!(dumps.iter().map(|d| &*d.0).collect::<Vec<&str>>(),
                   vec!["aawiki", "enwiki", "simplewiki"]);
    }
}
