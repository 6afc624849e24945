// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Configuration file handling. The configuration is loaded once at startup
//! and handed, immutable, to each component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use log::info;
use serde::Deserialize;

pub const DEFAULT_CONFIG: &str = r#"# Cloud detection configuration

[observatory]
# Observer location for sun altitude calculations. Leaving both at 0.0
# disables the daytime check.
latitude = 0.0
longitude = 0.0

# Sun altitude threshold (degrees); detection is skipped when the sun is
# above this. -12 = astronomical twilight, -6 = civil twilight, 0 = horizon.
daytime_threshold = -12.0

[camera]
# Camera type: "indi-allsky" or "file".
type = "indi-allsky"

# For indi-allsky: camera id in the database.
camera_id = 1

# For indi-allsky: path to the SQLite database.
database_path = "/var/lib/indi-allsky/indi-allsky.sqlite"

# For indi-allsky: base directory of the image filenames in the database.
image_base_path = "/var/www/html/allsky/images"

# For file: direct path to the latest image.
image_file = ""

# Seconds allowed for locating the latest image.
timeout_secs = 10

[model]
model_path = "model.onnx"
labels_path = "labels.txt"
image_size = 224

# A label containing this text (case-insensitive) means cloudy.
cloudy_marker = "cloudy"

[mqtt]
enabled = false
broker = "localhost"
port = 1883
username = ""
password = ""
topic = "observatory/clouds"
ha_discovery = true
ha_discovery_prefix = "homeassistant"
device_name = "Observatory Cloud Detector"
device_id = "mlclouddetect"
connect_timeout_secs = 10
reconnect_delay_secs = 5

[schedule]
# Seconds between detection cycles.
interval_secs = 60

# Seconds between checks while the sun is up.
daytime_interval_secs = 300

# Number of consecutive agreeing readings needed to open or close the roof.
pending_threshold = 10

[status]
status_file = "roofStatus.txt"
clear_message = "Roof Open"
cloud_message = "Roof Closed"
clear_pending_message = "Open Pending"
cloud_pending_message = "Close Pending"
daytime_message = "Daytime"
"#;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub observatory: ObservatoryConfig,
    pub camera: CameraConfig,
    pub model: ModelConfig,
    pub mqtt: MqttConfig,
    pub schedule: ScheduleConfig,
    pub status: StatusConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub latitude: f64,  // -90..90
    pub longitude: f64,  // -180..180, positive east.
    pub daytime_threshold: f64,  // Degrees.
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        ObservatoryConfig{latitude: 0.0, longitude: 0.0, daytime_threshold: -12.0}
    }
}

impl ObservatoryConfig {
    /// A location of exactly (0, 0) means "not set".
    pub fn location_configured(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    #[serde(rename = "type")]
    pub camera_type: String,
    pub camera_id: i64,
    pub database_path: PathBuf,
    pub image_base_path: PathBuf,
    pub image_file: String,
    pub timeout_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig{
            camera_type: "indi-allsky".to_string(),
            camera_id: 1,
            database_path: PathBuf::from("/var/lib/indi-allsky/indi-allsky.sqlite"),
            image_base_path: PathBuf::from("/var/www/html/allsky/images"),
            image_file: String::new(),
            timeout_secs: 10,
        }
    }
}

impl CameraConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub image_size: u32,
    pub cloudy_marker: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig{
            model_path: PathBuf::from("model.onnx"),
            labels_path: PathBuf::from("labels.txt"),
            image_size: 224,
            cloudy_marker: "cloudy".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic: String,
    pub ha_discovery: bool,
    pub ha_discovery_prefix: String,
    pub device_name: String,
    pub device_id: String,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig{
            enabled: false,
            broker: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            topic: "observatory/clouds".to_string(),
            ha_discovery: true,
            ha_discovery_prefix: "homeassistant".to_string(),
            device_name: "Observatory Cloud Detector".to_string(),
            device_id: "mlclouddetect".to_string(),
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
        }
    }
}

impl MqttConfig {
    /// Topic carrying ON/OFF for the discovered binary sensor.
    pub fn state_topic(&self) -> String {
        format!("{}/state", self.topic)
    }

    pub fn discovery_topic(&self) -> String {
        format!("{}/binary_sensor/{}/config",
                self.ha_discovery_prefix, self.device_id)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub daytime_interval_secs: u64,
    pub pending_threshold: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig{interval_secs: 60, daytime_interval_secs: 300,
                       pending_threshold: 10}
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub status_file: PathBuf,
    pub clear_message: String,
    pub cloud_message: String,
    pub clear_pending_message: String,
    pub cloud_pending_message: String,
    pub daytime_message: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig{
            status_file: PathBuf::from("roofStatus.txt"),
            clear_message: "Roof Open".to_string(),
            cloud_message: "Roof Closed".to_string(),
            clear_pending_message: "Open Pending".to_string(),
            cloud_pending_message: "Close Pending".to_string(),
            daytime_message: "Daytime".to_string(),
        }
    }
}

pub fn parse_config(text: &str) -> Result<Config, CanonicalError> {
    toml::from_str(text).map_err(|e| invalid_argument_error(
        format!("Malformed configuration: {}", e).as_str()))
}

/// Reads the configuration at `path`. If the file does not exist it is first
/// created with default contents.
pub fn load_config(path: &Path) -> Result<Config, CanonicalError> {
    if !path.exists() {
        info!("Creating default config file {:?}", path);
        fs::write(path, DEFAULT_CONFIG).map_err(|e| invalid_argument_error(
            format!("Cannot create config file {:?}: {:?}", path, e).as_str()))?;
    }
    info!("Loading config from {:?}", path);
    let text = fs::read_to_string(path).map_err(|e| invalid_argument_error(
        format!("Cannot read config file {:?}: {:?}", path, e).as_str()))?;
    parse_config(&text)
}

// mod tests.
