// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, CanonicalErrorCode};
use chrono::Utc;
use log::{debug, error, info, warn};
use tracing::Instrument;

use crate::config::{Config, ScheduleConfig, StatusConfig};
use crate::daytime_gate::DaytimeGate;
use crate::detect_engine::{DetectEngine, DetectionResult};
use crate::image_source_trait::ImageSource;
use crate::mqtt_publisher::MqttPublisher;
use crate::mqtt_session::StatusPayload;
use crate::shutdown::ShutdownSignal;
use crate::state_tracker::{ObservatoryState, StateTracker};
use crate::status_file::StatusFile;
use crate::value_stats::ValueStatsAccumulator;

// Number of cycles in the "recent" statistics window.
const STATS_WINDOW: usize = 30;

#[derive(Clone, Debug, PartialEq)]
pub enum RunMode {
    /// Run cycles until shutdown is requested.
    Continuous,
    /// One cycle on the latest image.
    SingleShot,
    /// One cycle on the given image, regardless of the Sun.
    SpecificImage(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    // Waiting for the next tick.
    Idle,
    // Executing a cycle.
    Running,
    // Shut down; no further cycles.
    Stopped,
}

#[derive(Clone, Debug)]
pub enum CycleOutcome {
    Classified {
        detection: DetectionResult,
        state: ObservatoryState,
        sun_altitude: f64,
        status_written: bool,
    },
    // The Sun was up; nothing was classified.
    Daytime {
        sun_altitude: f64,
        status_written: bool,
    },
}

impl CycleOutcome {
    /// False if the status file could not be updated this cycle.
    pub fn status_written(&self) -> bool {
        match self {
            CycleOutcome::Classified{status_written, ..} => *status_written,
            CycleOutcome::Daytime{status_written, ..} => *status_written,
        }
    }
}

/// Errors that mean the configuration or installation is broken. Retrying
/// cannot help, so the loop stops.
pub fn is_fatal(error: &CanonicalError) -> bool {
    matches!(error.code, CanonicalErrorCode::InvalidArgument |
                         CanonicalErrorCode::FailedPrecondition)
}

/// Drives detection cycles: daytime check, image lookup, classification,
/// state update, then notification.
pub struct Scheduler {
    schedule: ScheduleConfig,
    status_messages: StatusConfig,

    gate: DaytimeGate,
    source: Box<dyn ImageSource + Send + Sync>,
    engine: DetectEngine,
    tracker: StateTracker,
    status_file: StatusFile,

    // Absent when MQTT is disabled.
    publisher: Option<MqttPublisher>,

    shutdown: ShutdownSignal,
    loop_state: LoopState,

    // Suppresses the stdout summary in the one-cycle modes.
    quiet: bool,

    cycle_count: u64,
    latency_stats: ValueStatsAccumulator,
    confidence_stats: ValueStatsAccumulator,
}

impl Scheduler {
    pub fn new(config: &Config,
               source: Box<dyn ImageSource + Send + Sync>,
               engine: DetectEngine,
               publisher: Option<MqttPublisher>,
               shutdown: ShutdownSignal) -> Self {
        Scheduler{
            schedule: config.schedule.clone(),
            status_messages: config.status.clone(),
            gate: DaytimeGate::new(&config.observatory),
            source,
            engine,
            tracker: StateTracker::new(config.schedule.pending_threshold),
            status_file: StatusFile::new(&config.status.status_file),
            publisher,
            shutdown,
            loop_state: LoopState::Idle,
            quiet: false,
            cycle_count: 0,
            latency_stats: ValueStatsAccumulator::new("inference_ms", STATS_WINDOW),
            confidence_stats: ValueStatsAccumulator::new("confidence", STATS_WINDOW),
        }
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    pub fn state(&self) -> ObservatoryState {
        self.tracker.state()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    /// Runs in `mode` and returns the process exit code. The publisher, if
    /// any, is closed before returning.
    pub async fn run(&mut self, mode: RunMode) -> i32 {
        info!("Starting {:?} run using {}", mode, self.source.describe());
        let exit_code = match mode {
            RunMode::Continuous => self.run_continuous().await,
            RunMode::SingleShot => self.run_once(None).await,
            RunMode::SpecificImage(path) => self.run_once(Some(&path)).await,
        };
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.close().await;
        }
        self.loop_state = LoopState::Stopped;
        exit_code
    }

    async fn run_once(&mut self, image_path: Option<&Path>) -> i32 {
        self.loop_state = LoopState::Running;
        let result = self.run_cycle(image_path).await;
        self.loop_state = LoopState::Idle;
        match result {
            Ok(outcome) => {
                if !self.quiet {
                    println!("{}", self.summarize(&outcome));
                }
                if outcome.status_written() {
                    0
                } else {
                    error!("Status file {:?} was not updated", self.status_file.path());
                    1
                }
            },
            Err(e) => {
                error!("Detection cycle failed: {:?}", e);
                1
            },
        }
    }

    async fn run_continuous(&mut self) -> i32 {
        let interval = Duration::from_secs(self.schedule.interval_secs);
        let daytime_interval = Duration::from_secs(self.schedule.daytime_interval_secs);
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let start = Instant::now();
            let span = tracing::info_span!("cycle", number = self.cycle_count + 1);
            self.loop_state = LoopState::Running;
            let result = self.run_cycle(None).instrument(span).await;
            self.loop_state = LoopState::Idle;
            let period = match result {
                Ok(CycleOutcome::Daytime{..}) => daytime_interval,
                Ok(CycleOutcome::Classified{..}) => interval,
                Err(e) if is_fatal(&e) => {
                    error!("Stopping on fatal error: {:?}", e);
                    return 1;
                },
                Err(e) => {
                    if e.code == CanonicalErrorCode::Unavailable {
                        warn!("Skipping cycle: {}", e.message);
                    } else {
                        error!("Skipping cycle: {:?}", e);
                    }
                    interval
                },
            };
            let pause = period.saturating_sub(start.elapsed());
            debug!("Next cycle in {:?}", pause);
            tokio::select! {
                _ = tokio::time::sleep(pause) => (),
                _ = self.shutdown.wait() => (),
            }
        }
        info!("Shutdown requested; stopped after {} cycles", self.cycle_count);
        0
    }

    /// Performs one detection cycle. With `image_path` given, that image is
    /// classified and the daytime check is bypassed; otherwise the image
    /// source supplies the latest frame.
    pub async fn run_cycle(&mut self, image_path: Option<&Path>)
                           -> Result<CycleOutcome, CanonicalError> {
        self.cycle_count += 1;
        let gate = self.gate.check(&Utc::now());
        debug!("Sun altitude {:.2}", gate.sun_altitude);
        if gate.skip && image_path.is_none() {
            info!("Sun altitude {:.1} is above threshold; skipping detection",
                  gate.sun_altitude);
            let status_written = self.write_status(&self.status_messages.daytime_message);
            return Ok(CycleOutcome::Daytime{sun_altitude: gate.sun_altitude, status_written});
        }

        let image_path = match image_path {
            Some(path) => path.to_path_buf(),
            None => self.source.latest_image().await?,
        };
        let detection = self.engine.classify(&image_path)?;
        self.update_stats(&detection);

        let state = self.tracker.observe(detection.is_cloudy);
        let roof_status = state.status_message(&self.status_messages);
        info!("{:?}: {} ({:.3}); {}", image_path, detection.class_name,
              detection.confidence, roof_status);
        let status_written = self.write_status(roof_status);
        if let Some(publisher) = &self.publisher {
            publisher.publish(StatusPayload::new(&detection, roof_status,
                                                 gate.sun_altitude));
        }
        Ok(CycleOutcome::Classified{detection, state, sun_altitude: gate.sun_altitude,
                                    status_written})
    }

    // Status file problems are logged and reported in the CycleOutcome; they
    // don't stop the cycle from publishing.
    fn write_status(&self, status: &str) -> bool {
        match self.status_file.write(status) {
            Ok(()) => true,
            Err(e) => {
                error!("{:?}", e);
                false
            },
        }
    }

    fn update_stats(&mut self, detection: &DetectionResult) {
        self.latency_stats.add_value(
            detection.processing_duration.as_secs_f64() * 1000.0);
        self.confidence_stats.add_value(detection.confidence as f64);
        for stats in [&self.latency_stats, &self.confidence_stats] {
            debug!("{} recent: {}; session: {}",
                   stats.name(), stats.recent(), stats.session());
        }
    }

    fn summarize(&self, outcome: &CycleOutcome) -> String {
        match outcome {
            CycleOutcome::Daytime{sun_altitude, ..} => {
                format!("{}: sun altitude {:.1} deg, detection skipped",
                        self.status_messages.daytime_message, sun_altitude)
            },
            CycleOutcome::Classified{detection, state, sun_altitude, ..} => {
                format!("Image: {}\n\
                         Sky: {} (confidence {:.4})\n\
                         Cloudy: {}\n\
                         Roof: {}\n\
                         Sun altitude: {:.1} deg\n\
                         Inference time: {:?}",
                        detection.image_path.display(), detection.class_name,
                        detection.confidence, detection.is_cloudy,
                        state.status_message(&self.status_messages),
                        sun_altitude, detection.processing_duration)
            },
        }
    }
}

// mod tests.
