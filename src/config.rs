//! Runtime configuration for the MLLP consumer.
//!
//! Every field has a default so a configuration file only needs to name what it changes:
//!
//! ```toml
//! ack_mode = "manual"
//! read_timeout_ms = 15000
//! max_connections = 32
//!
//! [default_msh]
//! sending_application = "MLLP"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::ack::AckCode;
use crate::error::ConfigError;

/// Who supplies the acknowledgement for each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The connection handler always generates the acknowledgement.
    #[default]
    Auto,
    /// The processor supplies it through [`Reply`](crate::Reply).
    Manual,
}

/// Header used for acknowledgements when the received message has no usable MSH.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DefaultMsh {
    pub field_separator: char,
    pub encoding_characters: String,
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub processing_id: String,
    pub version: String,
}

impl Default for DefaultMsh {
    fn default() -> Self {
        DefaultMsh {
            field_separator: '|',
            encoding_characters: "^~\\&".to_string(),
            sending_application: String::new(),
            sending_facility: String::new(),
            receiving_application: String::new(),
            receiving_facility: String::new(),
            processing_id: "P".to_string(),
            version: "2.5".to_string(),
        }
    }
}

impl DefaultMsh {
    /// Checks the header can be written without producing a malformed segment.
    pub fn validate(&self) -> Result<(), String> {
        let fs = self.field_separator;
        if !fs.is_ascii() || fs.is_ascii_alphanumeric() || fs.is_ascii_whitespace() || fs.is_ascii_control() {
            return Err(format!("unusable field separator {:?}", fs));
        }

        let encoding = &self.encoding_characters;
        if encoding.len() != 4 || !encoding.is_ascii() || encoding.contains(fs) {
            return Err(format!("encoding characters {:?} must be four ASCII characters", encoding));
        }

        for (name, value) in [
            ("sending_application", &self.sending_application),
            ("sending_facility", &self.sending_facility),
            ("receiving_application", &self.receiving_application),
            ("receiving_facility", &self.receiving_facility),
            ("processing_id", &self.processing_id),
            ("version", &self.version),
        ] {
            if value.contains(|c: char| c == fs || c == '\r' || c == '\n') {
                return Err(format!("{} {:?} contains a separator", name, value));
            }
        }

        Ok(())
    }
}

/// Configuration shared (read-only) by the listener and every connection handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MllpConfig {
    pub ack_mode: AckMode,
    /// Forward transport faults to the failure sink instead of only logging them.
    pub bridge_error_handler: bool,
    /// Acknowledge application failures; when false the connection is closed instead.
    pub acknowledge_failures: bool,
    /// `AE` or `AR`.
    pub application_failure_code: AckCode,
    pub default_msh: DefaultMsh,
    /// Attach MSH routing fields to each received message.
    pub hl7_headers: bool,
    pub require_end_of_data: bool,
    pub max_frame_length: Option<usize>,
    pub max_connections: Option<usize>,
    pub tcp_nodelay: bool,
    #[serde(rename = "read_timeout_ms", deserialize_with = "optional_millis")]
    pub read_timeout: Option<Duration>,
    #[serde(rename = "write_timeout_ms", deserialize_with = "optional_millis")]
    pub write_timeout: Option<Duration>,
    #[serde(rename = "bind_timeout_ms", deserialize_with = "millis")]
    pub bind_timeout: Duration,
    #[serde(rename = "bind_retry_interval_ms", deserialize_with = "millis")]
    pub bind_retry_interval: Duration,
    /// Capacity of each outcome channel.
    pub sink_capacity: usize,
}

impl Default for MllpConfig {
    fn default() -> Self {
        MllpConfig {
            ack_mode: AckMode::Auto,
            bridge_error_handler: false,
            acknowledge_failures: true,
            application_failure_code: AckCode::ApplicationError,
            default_msh: DefaultMsh::default(),
            hl7_headers: true,
            require_end_of_data: !cfg!(feature = "noncompliance"),
            max_frame_length: None,
            max_connections: None,
            tcp_nodelay: true,
            read_timeout: None,
            write_timeout: None,
            bind_timeout: Duration::from_secs(30),
            bind_retry_interval: Duration::from_secs(5),
            sink_capacity: 64,
        }
    }
}

impl MllpConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: MllpConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        MllpConfig::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_msh
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("default_msh: {}", e)))?;

        match self.application_failure_code {
            AckCode::ApplicationError | AckCode::ApplicationReject => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "application_failure_code must be AE or AR, not {}",
                    other
                )))
            }
        }

        if self.sink_capacity == 0 {
            return Err(ConfigError::Invalid("sink_capacity must be at least 1".into()));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_frame_length == Some(0) {
            return Err(ConfigError::Invalid("max_frame_length must be at least 1".into()));
        }

        Ok(())
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}
