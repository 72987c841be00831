//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! of a configuration file can be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedround_core::{mask::MaskConfig, message::TrainingArgs};

use crate::aggregation::{Aggregator, ServerOptimizer};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub experiment: ExperimentSettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub aggregator: AggregatorSettings,
    #[serde(default)]
    #[validate]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    #[validate]
    pub secagg: SecaggSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedround").separator("__"))?;
        config.try_into()
    }

    /// Checks the preconditions of the configured aggregator.
    ///
    /// The configuration of the aggregator depends on the training and secure aggregation
    /// settings, hence it can't be validated by its own section.
    fn validate_aggregator(&self) -> Result<(), ValidationError> {
        Aggregator::from(&self.aggregator)
            .check_preconditions(&TrainingArgs::from(&self.training), self.secagg.enable)
            .map_err(|_| ValidationError::new("aggregator preconditions not met"))
    }
}

fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_aggregator()
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Experiment settings.
pub struct ExperimentSettings {
    /// The identifier of the researcher driving the experiment.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// researcher_id = "researcher-0"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_EXPERIMENT__RESEARCHER_ID=researcher-0
    /// ```
    #[validate(length(min = 1))]
    pub researcher_id: String,

    /// The identifier of the experiment. A random identifier is generated if it is missing.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// experiment_id = "mnist-fedavg"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_EXPERIMENT__EXPERIMENT_ID=mnist-fedavg
    /// ```
    #[serde(default)]
    pub experiment_id: Option<String>,

    /// The number of rounds after which the experiment stops. It can be extended at run time.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// round_limit = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_EXPERIMENT__ROUND_LIMIT=10
    /// ```
    pub round_limit: u64,

    /// The tags a dataset must carry to be used for training. The datasets are resolved from the
    /// node catalog when the experiment is built.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// tags = ["mnist", "train"]
    /// ```
    #[serde(default)]
    pub tags: Vec<String>,

    /// Restricts the federation to the listed nodes. All nodes of the catalog are considered if it
    /// is empty.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// nodes = ["node-1", "node-2"]
    /// ```
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round settings.
pub struct RoundSettings {
    /// The amount of time in seconds to wait for the replies of all selected nodes. A round fails
    /// when it elapses.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// timeout = 600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_ROUND__TIMEOUT=600
    /// ```
    #[validate(range(min = 1))]
    pub timeout: u64,
}

impl RoundSettings {
    /// Gets the round timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
/// The variants of aggregators.
pub enum AggregatorKind {
    /// A sample count weighted average.
    FedAverage,
    /// A weighted average with per node control variates.
    Scaffold,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_aggregator"))]
/// Aggregator settings.
pub struct AggregatorSettings {
    /// The aggregator.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// kind = "Scaffold"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_AGGREGATOR__KIND=Scaffold
    /// ```
    pub kind: AggregatorKind,

    /// The global learning rate of the `Scaffold` aggregator. It must be positive and is ignored by
    /// the other aggregators.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// server_lr = 1.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_AGGREGATOR__SERVER_LR=1.0
    /// ```
    #[serde(default = "default_server_lr")]
    pub server_lr: f64,
}

fn default_server_lr() -> f64 {
    1.0
}

impl AggregatorSettings {
    fn validate_aggregator(&self) -> Result<(), ValidationError> {
        if self.server_lr.is_finite() && self.server_lr > 0. {
            Ok(())
        } else {
            Err(ValidationError::new("invalid server learning rate"))
        }
    }
}

fn validate_aggregator(s: &AggregatorSettings) -> Result<(), ValidationError> {
    s.validate_aggregator()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
/// The variants of server optimizers.
pub enum OptimizerKind {
    /// Gradient descent, the identity with a learning rate of 1.
    Sgd,
    /// Gradient descent with momentum.
    Momentum,
    /// FedAdam.
    Adam,
    /// FedYogi.
    Yogi,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_optimizer"))]
/// Server optimizer settings.
///
/// The optimizer is applied to the aggregated parameters of every round. The hyperparameters which
/// don't apply to the configured optimizer are ignored.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [optimizer]
/// kind = "Adam"
/// learning_rate = 0.01
/// beta1 = 0.9
/// beta2 = 0.99
/// epsilon = 0.001
/// ```
///
/// **Environment variable**
/// ```text
/// FEDROUND_OPTIMIZER__KIND=Momentum
/// FEDROUND_OPTIMIZER__BETA=0.9
/// ```
pub struct OptimizerSettings {
    pub kind: OptimizerKind,
    /// The server learning rate.
    #[serde(default = "default_optimizer_lr")]
    pub learning_rate: f64,
    /// The momentum of the `Momentum` optimizer.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// The decay rate of the first moment of the adaptive optimizers.
    #[serde(default = "default_beta")]
    pub beta1: f64,
    /// The decay rate of the second moment of the adaptive optimizers.
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// The stabilizer of the adaptive optimizers.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_optimizer_lr() -> f64 {
    1.0
}

fn default_beta() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.99
}

fn default_epsilon() -> f64 {
    1e-3
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate: default_optimizer_lr(),
            beta: default_beta(),
            beta1: default_beta(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
        }
    }
}

impl OptimizerSettings {
    fn validate_optimizer(&self) -> Result<(), ValidationError> {
        ServerOptimizer::from(self)
            .check_preconditions()
            .map_err(|_| ValidationError::new("invalid optimizer hyperparameters"))
    }
}

fn validate_optimizer(s: &OptimizerSettings) -> Result<(), ValidationError> {
    s.validate_optimizer()
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
/// Local training settings, sent to every node.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [training]
/// num_updates = 100
/// learning_rate = 0.01
/// batch_size = 32
/// ```
///
/// **Environment variable**
/// ```text
/// FEDROUND_TRAINING__NUM_UPDATES=100
/// ```
pub struct TrainingSettings {
    /// The fixed number of local iterations. Required by the `Scaffold` aggregator.
    #[serde(default)]
    pub num_updates: Option<u64>,
    /// The number of local epochs.
    #[serde(default)]
    pub epochs: Option<u64>,
    /// The local learning rate. Required by the `Scaffold` aggregator.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// The local batch size.
    #[serde(default)]
    pub batch_size: Option<u64>,
}

impl From<&TrainingSettings> for TrainingArgs {
    fn from(settings: &TrainingSettings) -> Self {
        Self {
            num_updates: settings.num_updates,
            epochs: settings.epochs,
            learning_rate: settings.learning_rate,
            batch_size: settings.batch_size,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_secagg"))]
/// Secure aggregation settings.
pub struct SecaggSettings {
    /// Whether the nodes mask their parameters.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [secagg]
    /// enable = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_SECAGG__ENABLE=true
    /// ```
    #[serde(default)]
    pub enable: bool,

    /// The absolute bound enforced on every parameter before masking.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [secagg]
    /// clipping_range = 3.0
    /// ```
    #[serde(default = "default_clipping_range")]
    pub clipping_range: f64,

    /// The number of fractional bits of the fixed point representation of masked parameters.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [secagg]
    /// fixed_point_bits = 20
    /// ```
    #[serde(default = "default_fixed_point_bits")]
    pub fixed_point_bits: u8,

    /// The amount of time in seconds to wait for all parties to join a session.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [secagg]
    /// timeout = 30
    /// ```
    #[serde(default = "default_secagg_timeout")]
    pub timeout: u64,
}

fn default_clipping_range() -> f64 {
    MaskConfig::default().clipping_range
}

fn default_fixed_point_bits() -> u8 {
    MaskConfig::default().fixed_point_bits
}

fn default_secagg_timeout() -> u64 {
    30
}

impl Default for SecaggSettings {
    fn default() -> Self {
        Self {
            enable: false,
            clipping_range: default_clipping_range(),
            fixed_point_bits: default_fixed_point_bits(),
            timeout: default_secagg_timeout(),
        }
    }
}

impl SecaggSettings {
    /// Gets the masking configuration.
    pub fn mask_config(&self) -> MaskConfig {
        MaskConfig {
            clipping_range: self.clipping_range,
            fixed_point_bits: self.fixed_point_bits,
        }
    }

    /// Gets the setup timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn validate_secagg(&self) -> Result<(), ValidationError> {
        self.mask_config()
            .validate()
            .map_err(|_| ValidationError::new("invalid masking configuration"))?;
        if self.timeout == 0 {
            return Err(ValidationError::new("invalid setup timeout"));
        }
        Ok(())
    }
}

fn validate_secagg(s: &SecaggSettings) -> Result<(), ValidationError> {
    s.validate_secagg()
}

#[derive(Debug, Deserialize, Clone)]
/// Checkpoint settings.
pub struct CheckpointSettings {
    /// Whether a checkpoint is saved after every completed round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [checkpoint]
    /// enable = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_CHECKPOINT__ENABLE=true
    /// ```
    #[serde(default)]
    pub enable: bool,

    /// The directory the checkpoints are stored in, one subdirectory per experiment.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [checkpoint]
    /// path = "./checkpoints"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_CHECKPOINT__PATH=/var/lib/fedround/checkpoints
    /// ```
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./checkpoints")
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enable: false,
            path: default_checkpoint_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDROUND_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests;
