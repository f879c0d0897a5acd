use anyhow::Context;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tidalrip::{PollPolicy, RunOptions, api, events};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

/// Download a Tidal track through the lucida.to conversion relay.
#[derive(Debug, Parser)]
#[command(name = "tidalrip", version, about)]
struct Args {
    /// Tidal track URL (https://listen.tidal.com/track/<id>)
    url: String,

    /// Directory the downloaded file is written to
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Seconds between job status polls
    #[arg(long, value_name = "SECS", default_value_t = PollPolicy::DEFAULT_INTERVAL_SECS)]
    poll_interval: u64,

    /// Overall polling time budget in seconds
    #[arg(long, value_name = "SECS", default_value_t = PollPolicy::DEFAULT_BUDGET_SECS)]
    poll_timeout: u64,

    /// Maximum number of status polls before giving up
    #[arg(long, value_name = "COUNT", default_value_t = PollPolicy::DEFAULT_MAX_POLLS)]
    max_polls: u32,

    /// Base URL of the conversion service
    #[arg(long, value_name = "URL", default_value = "https://lucida.to")]
    endpoint: Url,
}

impl Args {
    fn into_options(self, token: String) -> RunOptions {
        RunOptions {
            track_url: self.url,
            output_dir: self.output,
            endpoint: self.endpoint,
            token,
            poll: PollPolicy {
                interval: Duration::from_secs(self.poll_interval),
                budget: Duration::from_secs(self.poll_timeout),
                max_polls: self.max_polls,
            },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(err) = init_tracing() {
        eprintln!("tidalrip: {err:#}");
        return ExitCode::FAILURE;
    }

    let args = Args::parse();
    let token = env::var("LUCIDA_TOKEN").unwrap_or_else(|_| api::DEFAULT_TOKEN.to_string());
    let opts = args.into_options(token);

    let report = tidalrip::run(&opts).await;
    events::emit(&report);
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// stdout belongs to the JSON event stream, so diagnostics go to stderr.
fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish()
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_cover_a_full_five_minute_poll() {
        let args = Args::try_parse_from(["tidalrip", "https://listen.tidal.com/track/1"]).unwrap();
        assert_eq!(args.output, PathBuf::from("."));
        assert_eq!(args.poll_interval, 2);
        assert_eq!(args.poll_timeout, 300);
        assert_eq!(args.max_polls, 150);
        assert_eq!(args.endpoint.as_str(), "https://lucida.to/");
    }

    #[test]
    fn flags_override_the_defaults() {
        let args = Args::try_parse_from([
            "tidalrip",
            "https://listen.tidal.com/track/1",
            "-o",
            "/tmp/music",
            "--poll-interval",
            "1",
            "--poll-timeout",
            "30",
            "--max-polls",
            "10",
            "--endpoint",
            "http://127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(args.output, PathBuf::from("/tmp/music"));
        assert_eq!(args.poll_interval, 1);
        assert_eq!(args.poll_timeout, 30);
        assert_eq!(args.max_polls, 10);
        assert_eq!(args.endpoint.as_str(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn url_argument_is_required() {
        assert!(Args::try_parse_from(["tidalrip"]).is_err());
    }
}
