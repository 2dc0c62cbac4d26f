//! tweetpipe CLI
//!
//! Local entry point: resolves one search or profile request through the
//! pipeline and prints the result as JSON.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tweetpipe::{
    Pipeline, Request,
    error::Result,
    models::{Config, RequestKind},
};

/// tweetpipe - cached tweet search through Nitter
#[derive(Parser, Debug)]
#[command(
    name = "tweetpipe",
    version,
    about = "Cached, rate-limited tweet search and profile fetching"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Keep raw pages in the configured archive directory
    #[arg(long)]
    archive: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search tweets
    Search {
        /// Search query
        query: String,

        #[command(flatten)]
        options: RequestOptions,

        /// Tweet language (e.g. "en")
        #[arg(long)]
        lang: Option<String>,

        /// Only tweets posted near this location
        #[arg(long)]
        near: Option<String>,
    },

    /// Fetch a user's profile and tweets
    Profile {
        /// Username, with or without '@'
        username: String,

        #[command(flatten)]
        options: RequestOptions,
    },

    /// Validate the configuration file
    Validate,
}

#[derive(Args, Debug)]
struct RequestOptions {
    /// Only tweets matching these filters (comma separated)
    #[arg(short, long)]
    include: Option<String>,

    /// Drop tweets matching these filters (comma separated)
    #[arg(short, long)]
    exclude: Option<String>,

    /// First day, YYYY-MM-DD
    #[arg(long)]
    since: Option<String>,

    /// Day after the last, YYYY-MM-DD
    #[arg(long)]
    until: Option<String>,

    /// Maximum number of tweets
    #[arg(short, long)]
    max: Option<usize>,
}

impl RequestOptions {
    fn apply(self, mut request: Request) -> Request {
        let pairs = [
            ("include_filters", self.include),
            ("exclude_filters", self.exclude),
            ("since", self.since),
            ("until", self.until),
            ("max_tweets", self.max.map(|m| m.to_string())),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                request = request.with_param(key, value);
            }
        }
        request
    }
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .target(env_logger::Target::Stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        log::info!("No config at {}, using defaults", cli.config.display());
        Config::default()
    };
    if cli.archive {
        config.archive.enabled = true;
    }

    let request = match cli.command {
        Command::Validate => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("Config OK");
            return Ok(());
        }
        Command::Search {
            query,
            options,
            lang,
            near,
        } => {
            let mut request = options.apply(Request::search(query));
            if let Some(lang) = lang {
                request = request.with_language(lang);
            }
            if let Some(near) = near {
                request = request.with_param("near", near);
            }
            request
        }
        Command::Profile { username, options } => options.apply(Request::profile(username)),
    };

    let pipeline = Pipeline::from_config(&config)?;
    let result = pipeline.resolve(&request).await;
    pipeline.shutdown();
    let result = result?;

    if request.kind() == RequestKind::UserProfile {
        if let Some(profile) = &result.profile {
            log::info!("{} (@{}): {} followers", profile.full_name, profile.username, profile.followers);
        }
    }
    log::info!("{} tweet(s)", result.len());

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
