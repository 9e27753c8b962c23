use crate::args::{CommonArgs, DumpNameArg, JsonOutputArg};
use std::process::ExitCode;
use wp_dumps::Result;

/// List the versions of a dump, oldest first.
#[derive(clap::Args, Clone, Debug)]
pub struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    dump_name: DumpNameArg,

    #[clap(flatten)]
    json: JsonOutputArg,
}

#[tracing::instrument(level = "trace")]
pub async fn main(args: Args) -> Result<ExitCode> {
    let fetcher = args.common.manifest_fetcher(None)?;

    let versions = fetcher.get_dump_versions(&args.dump_name.value).await?;

    if args.json.value {
        serde_json::to_writer_pretty(&std::io::stdout(), &versions)?;
        println!();
    } else {
        for version in versions {
            println!("{version}");
        }
    }

    Ok(ExitCode::SUCCESS)
}
