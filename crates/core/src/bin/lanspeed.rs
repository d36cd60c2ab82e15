use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use lanspeed::client::{ensure_remote_target, HttpTransport};
use lanspeed::config::{set_logger, Cli, Command, ConfigFile, RunArgs, ServeArgs};
use lanspeed::measurement::{Phase, ProgressObserver, RateUpdate};
use lanspeed::server::run_server;
use lanspeed::SpeedTest;
use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;

/// Minimum time between two live-rate lines.
const REFRESH: Duration = Duration::from_millis(500);

/// Prints progress to stdout.
struct ConsoleReporter {
    last_rate: Mutex<Option<Instant>>,
}

impl ConsoleReporter {
    fn new() -> Self {
        Self {
            last_rate: Mutex::new(None),
        }
    }
}

impl ProgressObserver for ConsoleReporter {
    fn on_rate(&self, update: &RateUpdate) {
        {
            let mut last = self.last_rate.lock();
            if last.is_some_and(|at| at.elapsed() < REFRESH) {
                return;
            }
            *last = Some(Instant::now());
        }
        let mut out = std::io::stdout().lock();
        let _ = writeln!(
            out,
            "  {:<8} {:>9.2} Mbps  best {:>9.2} Mbps  [{:>4.1}s / {:.1}s]",
            update.role,
            update.current_mbps,
            update.best_mbps,
            update.elapsed.as_secs_f64(),
            update.phase_duration.as_secs_f64()
        );
    }

    fn on_phase(&self, phase: Phase) {
        *self.last_rate.lock() = None;
        println!("[{phase}]");
    }

    fn on_log(&self, line: &str) {
        println!("  {line}");
    }
}

async fn serve(args: ServeArgs, file: ConfigFile) -> anyhow::Result<()> {
    let config = args.merge(file.serve).build()?;
    run_server(config).await
}

async fn measure(args: RunArgs, file: ConfigFile) -> anyhow::Result<()> {
    let config = args.merge(file.run).build()?;
    if !config.allow_loopback {
        ensure_remote_target(&config.server).await?;
    }

    let transport = HttpTransport::new(config.server.clone())
        .context("failed building http client")?
        .with_streaming_upload(!config.settings.force_loop_upload);
    let mut test = SpeedTest::new(Arc::new(transport), config.settings);
    if !config.json {
        println!("Testing against {}", config.server);
        test = test.with_observer(Arc::new(ConsoleReporter::new()));
    }

    let report = test.run().await?;
    if config.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n{report}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // keep the live output of a measurement readable unless asked otherwise
    let default_level = match cli.command {
        Command::Serve(_) => None,
        Command::Run(_) => Some(LevelFilter::WARN),
    };
    set_logger(cli.log_level.or(default_level));
    let file = ConfigFile::load_optional(cli.config.as_deref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        match cli.command {
            Command::Serve(args) => serve(args, file).await,
            Command::Run(args) => measure(args, file).await,
        }
    })
}
