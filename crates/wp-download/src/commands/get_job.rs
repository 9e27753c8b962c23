use anyhow::bail;
use crate::args::{CommonArgs, DumpNameArg, JsonOutputArg, VersionSpecArg};
use std::process::ExitCode;
use wp_dumps::{
    dump::{JobManifest, JobName, JobOutput},
    Result,
};

/// Get data about a dump version's jobs.
#[derive(clap::Args, Clone, Debug)]
pub struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    dump_name: DumpNameArg,

    #[clap(flatten)]
    version: VersionSpecArg,

    /// The specific job name to get. By default information is returned about all jobs in
    /// the dump version.
    #[arg(long = "job")]
    job_name: Option<JobName>,

    #[clap(flatten)]
    json: JsonOutputArg,
}

#[tracing::instrument(level = "trace")]
pub async fn main(args: Args) -> Result<ExitCode> {
    let dump_name = &args.dump_name.value;

    let fetcher = args.common.manifest_fetcher(None)?;
    let version = super::resolve_version(&fetcher, dump_name, &args.version.value).await?;
    let version_manifest = fetcher.fetch_version(dump_name, &version).await?;

    let jobs: Vec<&JobManifest> = match args.job_name.as_ref() {
        Some(job_name) => {
            let Some(job) = version_manifest.jobs.get(job_name) else {
                bail!("No status found for job job_name='{job_name}' version='{version}' \
                       dump_name='{dump_name}'");
            };
            vec![job]
        },
        None => version_manifest.jobs.values().collect(),
    };

    if args.json.value {
        for job in jobs.into_iter() {
            let output = JobOutput {
                name: job.name.0.clone(),
                files_size: job.files_size(),
                files_count: job.files.len() + job.pending_files,
                status: job.status.clone(),
                updated: job.updated.clone(),
            };
            serde_json::to_writer_pretty(&std::io::stdout(), &output)?;
            println!();
        }
    } else {
        for job in jobs.into_iter() {
            println!("{name:<40} {status:<12} {count:>5} files {size:>12}",
                     name = job.name.0,
                     status = job.status,
                     count = job.files.len() + job.pending_files,
                     size = job.files_size());
        }
    }

    Ok(ExitCode::SUCCESS)
}
