// ABOUTME: Pipeline configuration loaded from TOML
// ABOUTME: Defines sync units, connection settings, extraction tuning and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::mapping::FieldMapping;
use crate::utils::validate_identifier;
use crate::watermark::{FileWatermarkStore, WatermarkValue};

/// Write semantics of a sync unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Overwrite the destination table with this run's records
    Replace,
    /// Insert new records only
    Append,
    /// Upsert records keyed by the unit's primary key
    Merge,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Disposition::Replace => "replace",
            Disposition::Append => "append",
            Disposition::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// One source collection bound to one destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUnit {
    /// Unit id used for watermarks and reporting (defaults to `source`)
    #[serde(default)]
    pub name: String,
    /// Source collection
    pub source: String,
    /// Destination table (defaults to `source`)
    #[serde(default)]
    pub table: String,
    #[serde(default = "default_disposition")]
    pub disposition: Disposition,
    /// Monotonic field driving incremental extraction
    #[serde(default)]
    pub cursor_field: Option<String>,
    /// Lower bound used when no watermark has been persisted yet
    #[serde(default, deserialize_with = "cursor_literal")]
    pub initial_value: Option<WatermarkValue>,
    /// Exclusive upper bound for bounded backfills
    #[serde(default, deserialize_with = "cursor_literal")]
    pub end_value: Option<WatermarkValue>,
    /// Canonical field identifying a record for merge
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Split the cursor range into concurrently fetched partitions
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub mapping: FieldMapping,
}

fn default_disposition() -> Disposition {
    Disposition::Append
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CursorLiteral {
    Int(i64),
    Text(String),
}

fn cursor_literal<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<WatermarkValue>, D::Error> {
    let literal = Option::<CursorLiteral>::deserialize(deserializer)?;
    literal
        .map(|lit| match lit {
            CursorLiteral::Int(i) => Ok(WatermarkValue::Int(i)),
            CursorLiteral::Text(s) => WatermarkValue::parse(&s).map_err(serde::de::Error::custom),
        })
        .transpose()
}

impl SyncUnit {
    pub fn new(source: &str, disposition: Disposition) -> Self {
        Self {
            name: source.to_string(),
            source: source.to_string(),
            table: source.to_string(),
            disposition,
            cursor_field: None,
            initial_value: None,
            end_value: None,
            primary_key: None,
            parallel: false,
            mapping: FieldMapping::default(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_cursor(mut self, field: &str, initial_value: Option<WatermarkValue>) -> Self {
        self.cursor_field = Some(field.to_string());
        self.initial_value = initial_value;
        self
    }

    pub fn with_end_value(mut self, end_value: WatermarkValue) -> Self {
        self.end_value = Some(end_value);
        self
    }

    pub fn with_primary_key(mut self, key: &str) -> Self {
        self.primary_key = Some(key.to_string());
        self
    }

    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Fill `name` and `table` from `source` when left empty.
    fn apply_defaults(&mut self) {
        if self.name.trim().is_empty() {
            self.name = self.source.clone();
        }
        if self.table.trim().is_empty() {
            self.table = self.source.clone();
        }
    }

    /// Check the unit definition before any extraction is attempted.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.source.trim().is_empty() {
            return Err(SyncError::Configuration(format!(
                "unit '{}' has no source collection",
                self.name
            )));
        }
        if self.table.trim().is_empty() {
            return Err(SyncError::Configuration(format!(
                "unit '{}' has no destination table",
                self.name
            )));
        }
        validate_identifier(&self.table).map_err(|e| {
            SyncError::Configuration(format!("unit '{}' table: {}", self.name, e))
        })?;

        if self.disposition == Disposition::Merge {
            match self.primary_key.as_deref() {
                Some(key) if !key.trim().is_empty() => {}
                _ => {
                    return Err(SyncError::Configuration(format!(
                        "unit '{}' uses merge but declares no primary_key",
                        self.name
                    )))
                }
            }
        }

        if self.cursor_field.is_none()
            && (self.initial_value.is_some() || self.end_value.is_some() || self.parallel)
        {
            return Err(SyncError::Configuration(format!(
                "unit '{}' sets initial_value, end_value or parallel without a cursor_field",
                self.name
            )));
        }

        // Replace always reloads the full collection
        if self.disposition == Disposition::Replace && self.cursor_field.is_some() {
            return Err(SyncError::Configuration(format!(
                "unit '{}' uses replace, which reloads the whole collection; remove cursor_field or use append/merge",
                self.name
            )));
        }

        if let (Some(initial), Some(end)) = (&self.initial_value, &self.end_value) {
            if !initial.same_kind(end) {
                return Err(SyncError::Configuration(format!(
                    "unit '{}' mixes {} and {} cursor bounds",
                    self.name,
                    initial.kind(),
                    end.kind()
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// MongoDB connection string
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// PostgreSQL connection string
    pub url: String,
    /// Schema that receives the unit tables
    pub dataset: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
    /// Location of the watermark file or database
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StateConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, StateBackend::File) => FileWatermarkStore::default_path(),
            (None, StateBackend::Sqlite) => PathBuf::from(".collection-sync/watermarks.db"),
        }
    }
}

/// Tuning for source extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Partitions fetched concurrently in parallel mode
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Number of sub-ranges a parallel unit is cut into
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Retries per partition after a transient source error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff delay, doubled on each retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_parallelism() -> usize {
    4
}

fn default_partitions() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            partitions: default_partitions(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Complete pipeline configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub units: Vec<SyncUnit>,
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: PipelineConfig =
            toml::from_str(contents).context("Failed to parse pipeline config")?;
        for unit in &mut config.units {
            unit.apply_defaults();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate settings that apply to the whole pipeline.
    pub fn validate(&self) -> Result<(), SyncError> {
        validate_identifier(&self.destination.dataset)
            .map_err(|e| SyncError::Configuration(format!("dataset: {}", e)))?;
        if self.extract.parallelism == 0 || self.extract.partitions == 0 {
            return Err(SyncError::Configuration(
                "extract.parallelism and extract.partitions must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for unit in &self.units {
            unit.validate()?;
            if !names.insert(unit.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "unit '{}' is defined more than once",
                    unit.name
                )));
            }
        }
        Ok(())
    }

    /// Find a unit by name.
    pub fn unit(&self, name: &str) -> Option<&SyncUnit> {
        self.units.iter().find(|u| u.name == name)
    }
}
