use crate::args::{CommonArgs, JsonOutputArg};
use std::process::ExitCode;
use wp_dumps::Result;

/// List the names of the dumps available on the server, e.g. `enwiki`.
#[derive(clap::Args, Clone, Debug)]
pub struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(flatten)]
    json: JsonOutputArg,
}

#[tracing::instrument(level = "trace")]
pub async fn main(args: Args) -> Result<ExitCode> {
    let fetcher = args.common.manifest_fetcher(None)?;

    let dumps = fetcher.get_dumps().await?;

    if args.json.value {
        serde_json::to_writer_pretty(&std::io::stdout(), &dumps)?;
        println!();
    } else {
        for dump in dumps {
            println!("{dump}");
        }
    }

    Ok(ExitCode::SUCCESS)
}
