// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use cloud_detect::config::load_config;
use cloud_detect::detect_engine::DetectEngine;
use cloud_detect::image_source::select_image_source;
use cloud_detect::mqtt_publisher::MqttPublisher;
use cloud_detect::scheduler::{RunMode, Scheduler};
use cloud_detect::shutdown::ShutdownSignal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cloud detection for observatory automation",
          long_about=None)]
struct Args {
    /// Configuration file. Created with default contents if it does not
    /// exist.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Classify this image once, bypassing the camera and the daytime check.
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Run a single detection cycle and exit.
    #[arg(long)]
    once: bool,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors, and don't print the result summary.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[arg(long = "log_dir", default_value = ".")]
    log_dir: PathBuf,

    /// Log file name prefix; files rotate daily.
    #[arg(long = "log_file", default_value = "cloud_detect.log")]
    log_file: String,
}

impl Args {
    fn run_mode(&self) -> RunMode {
        match (&self.image, self.once) {
            (Some(image), _) => RunMode::SpecificImage(image.clone()),
            (None, true) => RunMode::SingleShot,
            (None, false) => RunMode::Continuous,
        }
    }

    fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

fn main() {
    // Exit only after real_main() has dropped the log writer guards, so that
    // buffered log lines are flushed.
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args = Args::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Cannot create log file in {:?}: {}", args.log_dir, e);
            return 1;
        }
    };
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let level = args.default_log_level();
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let shutdown = ShutdownSignal::new();
    let handler_shutdown = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c; stopping after the current cycle");
        handler_shutdown.request();
    }) {
        error!("Cannot install signal handler: {:?}", e);
        return 1;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start tokio runtime: {:?}", e);
            return 1;
        }
    };
    runtime.block_on(async_main(args, shutdown))
}

async fn async_main(args: Args, shutdown: ShutdownSignal) -> i32 {
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:?}", e);
            return 1;
        }
    };
    let source = match select_image_source(&config.camera) {
        Ok(source) => source,
        Err(e) => {
            error!("Configuration error: {:?}", e);
            return 1;
        }
    };
    let engine = match DetectEngine::load(&config.model) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Cannot load model: {:?}", e);
            return 1;
        }
    };

    let publisher = if config.mqtt.enabled {
        match MqttPublisher::connect(&config.mqtt).await {
            Ok(publisher) => Some(publisher),
            Err(e) => {
                error!("MQTT publishing disabled: {:?}", e);
                None
            }
        }
    } else {
        info!("MQTT disabled; writing status file only");
        None
    };

    let mode = args.run_mode();
    let mut scheduler = Scheduler::new(&config, source, engine, publisher, shutdown);
    scheduler.set_quiet(args.quiet);
    scheduler.run(mode).await
}
