pub mod completion;
pub mod download;
pub mod get_dumps;
pub mod get_file_info;
pub mod get_job;
pub mod get_versions;

use anyhow::format_err;
use wp_dumps::{
    dump::{manifest::ManifestFetcher, DumpName, Version, VersionSpec},
    Result,
};

/// Resolve "latest" to the newest version listed on the server.
async fn resolve_version(
    fetcher: &ManifestFetcher,
    dump_name: &DumpName,
    version_spec: &VersionSpec,
) -> Result<Version> {
    match version_spec {
        VersionSpec::Version(ver) => Ok(ver.clone()),
        VersionSpec::Latest => {
            let versions = fetcher.get_dump_versions(dump_name).await?;
            versions.last().cloned().ok_or_else(|| format_err!(
                "No versions found for dump dump_name='{dump_name}'"))
        },
    }
}
