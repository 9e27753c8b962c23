use clap::CommandFactory;
use http_cache_reqwest::CacheMode as HttpCacheMode;
use std::path::PathBuf;
use wp_dumps::{
    dump::{self, manifest, DumpName, JobName, VersionSpec},
    http,
    FilePattern,
    Result,
};

#[derive(clap::Args, Clone, Debug)]
pub struct CommonArgs {
    #[arg(from_global)]
    pub log_json: bool,

    /// The directory to save the program's output, including downloaded files and HTTP cache.
    ///
    /// If not present tries these alternatives in order:
    ///
    ///   * Value in environment variable `WPD_OUT_DIR`.
    ///   * A subdirectory `wp-download` under the platform data directory returned by
    ///     `platform_dirs::AppDirs.data_dir`.
    ///
    ///     For Linux this is: `${XDG_DATA_HOME}` if set or `~/.local/share`
    ///
    ///     For Windows this is `%LOCALAPPDATA%` if set or `C:\Users\%USERNAME%\AppData\Local`
    ///
    ///     For macOS this is `~/Library/Application Support`
    ///
    /// The dump files downloaded will be placed under the subdirectory `dumps`,
    /// at the same relative path they have on the server, for example:
    /// `dumps/enwiki/20230301/enwiki-20230301-abstract.xml.gz`
    #[arg(long, env = "WPD_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// HTTP cache mode to use when fetching dump metadata. File downloads are never cached.
    ///
    /// See the `http-cache` crate documentation for an explanation of each of the options:
    /// <https://docs.rs/http-cache/0.10.1/http_cache/enum.CacheMode.html>
    #[arg(long, value_enum, default_value_t = HttpCacheModeArg::Default)]
    http_cache_mode: HttpCacheModeArg,

    /// Base URL of the server to fetch dump metadata from.
    #[arg(long, default_value = dump::DUMPS_WIKIMEDIA_SERVER, env = "WPD_DUMPS_SERVER_URL")]
    dumps_server_url: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum HttpCacheModeArg {
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

#[derive(clap::Args, Clone, Debug)]
pub struct DumpNameArg {
    /// The name of the dump to use, e.g. `enwiki`.
    ///
    /// If not present tries to read the environment variable `WPD_DUMP`,
    /// finally uses `enwiki` as a default.
    #[arg(id = "dump", long = "dump", default_value = "enwiki", env = "WPD_DUMP")]
    pub value: DumpName,
}

#[derive(clap::Args, Clone, Debug)]
pub struct VersionSpecArg {
    /// The dump version to use. If omitted tries to read the
    /// environment variable "WPD_VERSION", then falls back to the
    /// default "latest".
    ///
    /// The value must be 8 numerical digits (e.g. "20230301") or the string "latest".
    #[arg(id = "version", long = "version", default_value = "latest", env = "WPD_VERSION")]
    pub value: VersionSpec,
}

#[derive(clap::Args, Clone, Debug)]
pub struct JobNamesArg {
    /// Names of jobs to take files from, e.g. `articlesdump`. Repeat the flag or separate
    /// names with commas. Files from every job are used if omitted.
    ///
    /// If not present tries to read the environment variable `WPD_JOB`.
    #[arg(id = "job", long = "job", env = "WPD_JOB", value_delimiter = ',')]
    pub values: Vec<JobName>,
}

#[derive(clap::Args, Clone, Debug)]
pub struct FilePatternsArg {
    /// Glob patterns to filter file names, e.g. `*-abstract*.xml.gz`. A file is selected if
    /// any pattern matches. Repeat the flag to give more than one pattern.
    ///
    /// `*` doesn't match '/'; file names never contain '/' anyway.
    #[arg(id = "file-pattern", long = "file-pattern")]
    pub values: Vec<FilePattern>,
}

#[derive(clap::Args, Clone, Debug)]
pub struct SelectionArgs {
    #[clap(flatten)]
    pub version: VersionSpecArg,

    #[clap(flatten)]
    pub jobs: JobNamesArg,

    #[clap(flatten)]
    pub patterns: FilePatternsArg,

    /// Select files from a dump version even if some of its jobs haven't finished.
    ///
    /// With "latest", the newest version is used when no version is complete.
    #[arg(long, default_value_t = false)]
    pub allow_incomplete: bool,

    /// With version "latest", only consider this many of the newest dump versions.
    #[arg(long, default_value_t = 3)]
    pub versions_limit: usize,
}

#[derive(clap::Args, Clone, Debug)]
pub struct JsonOutputArg {
    /// Print results to stdout as JSON. By default the data will be printed as text.
    #[arg(id = "json", long = "json", default_value_t = false)]
    pub value: bool,
}

impl From<HttpCacheModeArg> for HttpCacheMode {
    fn from(mode: HttpCacheModeArg) -> HttpCacheMode {
        match mode {
            HttpCacheModeArg::Default => HttpCacheMode::Default,
            HttpCacheModeArg::NoStore => HttpCacheMode::NoStore,
            HttpCacheModeArg::Reload => HttpCacheMode::Reload,
            HttpCacheModeArg::NoCache => HttpCacheMode::NoCache,
            HttpCacheModeArg::ForceCache => HttpCacheMode::ForceCache,
            HttpCacheModeArg::OnlyIfCached => HttpCacheMode::OnlyIfCached,
        }
    }
}

impl CommonArgs {
    pub fn out_dir(&self) -> PathBuf {
        if let Some(dir) = self.out_dir.as_ref() {
            return dir.clone();
        }

        // Fall back to platform-dirs.

        let Some(dirs) = platform_dirs::AppDirs::new(
            Some(env!("CARGO_BIN_NAME")) /* app name */,
            false /* use_xdg_on_macos */) else
        {
            let mut cmd = crate::Args::command();

            let err = cmd.error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "Tried to fall back and get out-dir from platform_dirs, \
                 but AppDirs::new returned None. \
                 Try passing out-dir in environment value `WPD_OUT_DIR` \
                 or with flag `--out-dir`.");
            err.exit(); // Exits the process.
        };

        dirs.data_dir
    }

    pub fn dumps_path(&self) -> PathBuf {
        self.out_dir().join("dumps")
    }

    pub fn http_cache_path(&self) -> PathBuf {
        self.out_dir().join("http_cache")
    }

    pub fn http_options(&self) -> Result<http::Options> {
        Ok(http::OptionsBuilder::default()
               .cache_path(self.http_cache_path())
               .cache_mode(self.http_cache_mode.into())
               .build()?)
    }

    pub fn manifest_fetcher(&self, versions_limit: Option<usize>) -> Result<manifest::ManifestFetcher> {
        let client = http::metadata_client(&self.http_options()?)?;
        let options = manifest::OptionsBuilder::default()
                          .server_url(self.dumps_server_url.trim_end_matches('/'))
                          .versions_limit(versions_limit)
                          .build()?;
        Ok(manifest::ManifestFetcher::new(client, options))
    }
}

impl SelectionArgs {
    pub fn selection(&self) -> dump::select::Selection {
        dump::select::Selection {
            version: self.version.value.clone(),
            jobs: self.jobs.values.clone(),
            patterns: self.patterns.values.clone(),
            allow_incomplete: self.allow_incomplete,
        }
    }
}
