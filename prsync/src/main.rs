use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "prsync",
    version,
    long_version = common::version::long_version(),
    disable_help_flag = true,
    about = "Sync a directory tree to a remote host with many rsync transfers running in parallel",
    long_about = "`prsync` copies a local directory into a directory on a remote host by running \
one rsync transfer per file, many of them at once. The remote directory tree is created first; \
after that every file is transferred independently and a failed transfer is restarted after a \
short random delay, resuming from its partial data.

EXAMPLE:
    # Mirror /data/photos as /backup/photos on storage.example.com
    prsync -u backup -h storage.example.com /data/photos /backup

    # Bounded retries and a summary at the end
    prsync -u backup -h storage.example.com --max-attempts 10 --summary /data/photos /backup

Note: with the default policy failed transfers are retried forever. A file that can never be \
transferred keeps the run going until it is interrupted."
)]
struct Args {
    // Remote
    /// User name on the remote host
    #[arg(short = 'u', long = "user", value_name = "USER", help_heading = "Remote")]
    user: String,

    /// Remote host name or address
    #[arg(short = 'h', long = "host", value_name = "HOST", help_heading = "Remote")]
    host: String,

    /// SSH port of the remote host
    #[arg(
        short = 'p',
        long = "port",
        default_value = "22",
        value_name = "PORT",
        help_heading = "Remote"
    )]
    port: u16,

    // Transfer
    /// I/O timeout passed to each transfer, in seconds
    #[arg(
        short = 't',
        long = "timeout",
        default_value = "90",
        value_name = "SECS",
        help_heading = "Transfer"
    )]
    timeout: u64,

    /// Transfer tool to run, must accept rsync's command line
    #[arg(
        long,
        default_value = "rsync",
        value_name = "PATH",
        help_heading = "Transfer"
    )]
    transfer_tool: std::path::PathBuf,

    /// Print the commands that would be run without running them
    #[arg(long, help_heading = "Transfer")]
    dry_run: bool,

    // Scheduling
    /// Maximum number of files being worked on at the same time, 0 means no limit
    #[arg(
        short = 'w',
        long,
        default_value = "25",
        value_name = "N",
        help_heading = "Scheduling"
    )]
    max_workers: usize,

    /// Seconds between progress reports while waiting for transfers
    #[arg(
        short = 'T',
        long,
        default_value = "5",
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..),
        help_heading = "Scheduling"
    )]
    poll_interval: u64,

    // Retry policy
    /// Random delay before the first transfer of each file
    ///
    /// Accepts a range "MIN..MAX" or a single value, using human readable durations,
    /// e.g. "3s..7s", "500ms..2s" or "0s".
    #[arg(
        long,
        default_value = "3s..7s",
        value_name = "RANGE",
        help_heading = "Retry policy"
    )]
    start_jitter: common::retry::DelayRange,

    /// Random delay before a failed transfer is restarted
    ///
    /// Same format as --start-jitter.
    #[arg(
        long,
        default_value = "15s..30s",
        value_name = "RANGE",
        help_heading = "Retry policy"
    )]
    retry_backoff: common::retry::DelayRange,

    /// Give up on a file after this many failed attempts, 0 means never give up
    ///
    /// Files that were given up on make the run exit with an error.
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Retry policy"
    )]
    max_attempts: u32,

    // Progress & output
    /// Verbose level: -v DEBUG / -vv TRACE (default: INFO)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, only log errors and don't report the final error
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of runtime worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    runtime_threads: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    #[allow(dead_code)]
    help: Option<bool>,

    // ARGUMENTS
    /// Local directory to sync, it is recreated by name inside the remote directory
    #[arg()]
    local_directory: std::path::PathBuf,

    /// Directory on the remote host to sync into
    #[arg()]
    remote_directory: std::path::PathBuf,
}

/// Renders a command line so it can be pasted into a shell.
fn shell_line(program: &std::path::Path, args: &[std::ffi::OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(|arg| arg.as_os_str()))
        .map(|arg| {
            let arg = arg.to_string_lossy();
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_=.,/:@+%".contains(c))
            {
                arg.into_owned()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn watch_interrupt(cancel: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping all transfers");
            cancel.cancel();
        }
    });
}

#[instrument(skip_all)]
async fn async_main(args: Args) -> Result<common::scheduler::Summary> {
    let remote = common::remote::Remote::new(args.user, args.host, args.port);
    let transfer_settings = common::transfer::Settings {
        tool: args.transfer_tool,
        timeout_secs: args.timeout,
    };
    let local_root = common::job::resolve_local_root(&args.local_directory).await?;
    if args.dry_run {
        let skeleton_args =
            common::skeleton::args(&local_root, &args.remote_directory, &remote);
        println!("{}", shell_line(&transfer_settings.tool, &skeleton_args));
        let jobs = common::job::build(
            &local_root,
            &args.remote_directory,
            &remote,
            &transfer_settings,
        )
        .await?;
        for job in &jobs {
            println!("{}", shell_line(&transfer_settings.tool, &job.args()));
        }
        return Ok(common::scheduler::Summary {
            jobs: jobs.len(),
            ..Default::default()
        });
    }
    let transport = std::sync::Arc::new(common::transfer::CommandTransport::new(
        &transfer_settings.tool,
    ));
    common::skeleton::prepare(&*transport, &local_root, &args.remote_directory, &remote).await?;
    let jobs = common::job::build(
        &local_root,
        &args.remote_directory,
        &remote,
        &transfer_settings,
    )
    .await?;
    let cancel = tokio_util::sync::CancellationToken::new();
    watch_interrupt(cancel.clone());
    let settings = common::scheduler::Settings {
        max_workers: args.max_workers,
        poll_interval: std::time::Duration::from_secs(args.poll_interval),
        retry: common::retry::RetryPolicy::new(
            args.start_jitter,
            args.retry_backoff,
            args.max_attempts,
        ),
    };
    let progress = std::sync::Arc::new(common::progress::Progress::new());
    match common::scheduler::run(transport, jobs, &settings, progress, cancel).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            tracing::error!("{:#}", &error);
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary && !args.dry_run,
    };
    let runtime = common::RuntimeConfig {
        worker_threads: args.runtime_threads,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
