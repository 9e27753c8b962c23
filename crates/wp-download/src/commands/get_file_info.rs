use crate::args::{CommonArgs, DumpNameArg, JsonOutputArg, SelectionArgs};
use std::process::ExitCode;
use wp_dumps::{
    dump::select,
    Result,
};

/// List the files a download would fetch, with their sizes and SHA1 hashes.
#[derive(clap::Args, Clone, Debug)]
pub struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    dump_name: DumpNameArg,

    #[clap(flatten)]
    selection: SelectionArgs,

    #[clap(flatten)]
    json: JsonOutputArg,
}

#[tracing::instrument(level = "trace")]
pub async fn main(args: Args) -> Result<ExitCode> {
    let dump_name = &args.dump_name.value;

    let fetcher = args.common.manifest_fetcher(Some(args.selection.versions_limit))?;
    let manifest = fetcher.fetch(dump_name, &args.selection.version.value).await?;
    let selected = select::select(&manifest, &args.selection.selection())?;

    if args.json.value {
        for file in selected.files.iter() {
            serde_json::to_writer_pretty(&std::io::stdout(), file)?;
            println!();
        }
    } else {
        println!("# dump={dump_name} version={version} complete={complete} files={count}",
                 version = selected.version,
                 complete = selected.complete,
                 count = selected.files.len());
        for file in selected.files.iter() {
            println!("{name:<60} {size:>12} {sha1}",
                     name = file.name,
                     size = file.size.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string()),
                     sha1 = file.sha1.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string()));
        }
    }

    Ok(ExitCode::SUCCESS)
}
