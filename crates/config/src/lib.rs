use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ── Backend config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the workbench API server.  Overridden at runtime by the
    /// `PROMPTLAB_BASE_URL` environment variable when set.
    pub base_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8338".to_string(),
        }
    }
}

// ── Experiment config ─────────────────────────────────────────────────────────

/// The experiment this session operates on: which foundation model is loaded,
/// which adaptor (if any) is layered on top, and the system message to send
/// with every exchange.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExperimentConfig {
    pub id: String,
    /// Foundation model id.  Empty means no model is running, which blocks
    /// the entire interaction surface before any request is made.
    pub model: String,
    /// Fine-tuned adaptor id layered on the foundation model.  Opaque here.
    pub adaptor: String,
    pub system_message: String,
    /// Generation-parameter blob as the experiment server stores it (legacy
    /// encoding, `stop_str` double-encoded).  When non-empty it overrides the
    /// `[generation]` section at load time.
    pub generation_params: String,
}

impl ExperimentConfig {
    /// An adaptor is optional; the backend expects it to be absent, not empty.
    pub fn adaptor_opt(&self) -> Option<&str> {
        if self.adaptor.is_empty() {
            None
        } else {
            Some(&self.adaptor)
        }
    }
}

// ── Generation parameters ─────────────────────────────────────────────────────

/// Sampling knobs sent with every exchange.
///
/// Internally `stop` is a proper typed sequence.  The experiment store keeps
/// these as a legacy JSON blob in which `stop_str` is itself a JSON-encoded
/// string; [`GenerationConfig::from_legacy_json`] / [`GenerationConfig::to_legacy_json`]
/// are the only places that encoding is handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    /// Stop sequences.  Empty means none.
    pub stop: Vec<String>,
    /// Bootstrap flag: when set, parameters should be re-read from the
    /// experiment store instead of edited locally.  Never sent to the backend.
    pub needs_reset: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            frequency_penalty: 0.0,
            stop: vec![],
            needs_reset: false,
        }
    }
}

/// Wire shape of the legacy generation-parameter blob stored on the
/// experiment.  Field names are fixed by the store: camelCase knobs next to
/// a snake_case `stop_str`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyGenerationParams {
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(rename = "maxTokens", default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(rename = "topP", default = "default_top_p")]
    top_p: f32,
    #[serde(rename = "frequencyPenalty", default)]
    frequency_penalty: f32,
    /// Either a JSON array of strings or a string containing a JSON array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_str: Option<serde_json::Value>,
    #[serde(rename = "needsReset", default)]
    needs_reset: bool,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_top_p() -> f32 {
    1.0
}

/// Decode the store's `stop_str` value into a typed sequence.
///
/// The value arrives double-encoded (`"[\"</s>\"]"`) in the common case, but
/// older experiments hold a plain array.  Anything that fails to decode is
/// treated as "no stop sequences", logged, never fatal.
fn decode_stop_str(value: Option<&serde_json::Value>) -> Vec<String> {
    let Some(value) = value else {
        return vec![];
    };
    let decoded = match value {
        serde_json::Value::String(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(inner) => inner,
            Err(err) => {
                warn!("unparseable stop_str {raw:?}: {err}");
                return vec![];
            }
        },
        other => other.clone(),
    };
    match decoded {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(ToString::to_string))
            .collect(),
        serde_json::Value::String(single) => vec![single],
        other => {
            warn!("stop_str decoded to non-sequence {other:?}; ignoring");
            vec![]
        }
    }
}

impl GenerationConfig {
    /// Parse the experiment store's generation-parameter blob.
    ///
    /// A blob that is not valid JSON at the top level yields the defaults
    /// (matching the store's own bootstrap behaviour); a bad `stop_str`
    /// inside a valid blob degrades to no stop sequences.
    pub fn from_legacy_json(raw: &str) -> Self {
        let legacy: LegacyGenerationParams = match serde_json::from_str(raw) {
            Ok(legacy) => legacy,
            Err(err) => {
                warn!("unparseable generation parameters: {err}");
                return Self::default();
            }
        };
        Self {
            temperature: legacy.temperature,
            max_tokens: legacy.max_tokens,
            top_p: legacy.top_p,
            frequency_penalty: legacy.frequency_penalty,
            stop: decode_stop_str(legacy.stop_str.as_ref()),
            needs_reset: legacy.needs_reset,
        }
    }

    /// Re-encode into the store's legacy shape, `stop_str` double-encoding
    /// included, for writing back to the experiment config.
    pub fn to_legacy_json(&self) -> Result<String> {
        let stop_str = if self.stop.is_empty() {
            None
        } else {
            Some(serde_json::Value::String(serde_json::to_string(
                &self.stop,
            )?))
        };
        let legacy = LegacyGenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            stop_str,
            needs_reset: self.needs_reset,
        };
        Ok(serde_json::to_string(&legacy)?)
    }
}

// ── Telemetry config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// ── App config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub experiment: ExperimentConfig,
    pub generation: GenerationConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("PROMPTLAB_BASE_URL") {
            if !value.is_empty() {
                config.backend.base_url = value;
            }
        }

        if !config.experiment.generation_params.is_empty() {
            config.generation =
                GenerationConfig::from_legacy_json(&config.experiment.generation_params);
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Whether a foundation model is configured.  Without one the whole
    /// interaction surface is blocked up front.
    pub fn has_model(&self) -> bool {
        !self.experiment.model.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Defaults ───────────────────────────────────────────────────────────

    #[test]
    fn generation_defaults() {
        let generation = GenerationConfig::default();
        assert!((generation.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(generation.max_tokens, 1024);
        assert!((generation.top_p - 1.0).abs() < f32::EPSILON);
        assert!((generation.frequency_penalty).abs() < f32::EPSILON);
        assert!(generation.stop.is_empty());
        assert!(!generation.needs_reset);
    }

    #[test]
    fn backend_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.backend.base_url, "http://localhost:8338");
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(!cfg.has_model());
    }

    #[test]
    fn adaptor_opt_empty_is_none() {
        let mut experiment = ExperimentConfig::default();
        assert!(experiment.adaptor_opt().is_none());
        experiment.adaptor = "alpaca-lora".to_string();
        assert_eq!(experiment.adaptor_opt(), Some("alpaca-lora"));
    }

    // ── Legacy generation blob ─────────────────────────────────────────────

    #[test]
    fn legacy_blob_with_double_encoded_stop_str() {
        let raw = r#"{"temperature":0.2,"maxTokens":256,"topP":0.9,"frequencyPenalty":0.5,"stop_str":"[\"</s>\",\"<|end|>\"]","needsReset":false}"#;
        let generation = GenerationConfig::from_legacy_json(raw);
        assert!((generation.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(generation.max_tokens, 256);
        assert!((generation.top_p - 0.9).abs() < f32::EPSILON);
        assert!((generation.frequency_penalty - 0.5).abs() < f32::EPSILON);
        assert_eq!(generation.stop, vec!["</s>", "<|end|>"]);
    }

    #[test]
    fn legacy_blob_with_plain_array_stop_str() {
        let raw = r####"{"temperature":0.7,"stop_str":["###"]}"####;
        let generation = GenerationConfig::from_legacy_json(raw);
        assert_eq!(generation.stop, vec!["###"]);
    }

    #[test]
    fn legacy_blob_with_single_string_stop() {
        // A stop_str holding one double-encoded bare string.
        let raw = r#"{"stop_str":"\"</s>\""}"#;
        let generation = GenerationConfig::from_legacy_json(raw);
        assert_eq!(generation.stop, vec!["</s>"]);
    }

    #[test]
    fn legacy_blob_malformed_stop_str_degrades_to_empty() {
        let raw = r#"{"temperature":0.3,"stop_str":"not json at all"}"#;
        let generation = GenerationConfig::from_legacy_json(raw);
        assert!((generation.temperature - 0.3).abs() < f32::EPSILON);
        assert!(generation.stop.is_empty());
    }

    #[test]
    fn legacy_blob_missing_stop_str_is_empty() {
        let generation = GenerationConfig::from_legacy_json(r#"{"temperature":0.5}"#);
        assert!(generation.stop.is_empty());
    }

    #[test]
    fn legacy_blob_unparseable_returns_defaults() {
        let generation = GenerationConfig::from_legacy_json("{{{not json");
        assert_eq!(generation, GenerationConfig::default());
    }

    #[test]
    fn legacy_blob_needs_reset_flag_survives() {
        let generation = GenerationConfig::from_legacy_json(r#"{"needsReset":true}"#);
        assert!(generation.needs_reset);
    }

    #[test]
    fn legacy_encode_decode_roundtrip() {
        let generation = GenerationConfig {
            temperature: 0.1,
            max_tokens: 64,
            top_p: 0.8,
            frequency_penalty: 1.1,
            stop: vec!["</s>".to_string(), "STOP".to_string()],
            needs_reset: false,
        };
        let raw = generation.to_legacy_json().unwrap();
        // The encoded blob must carry stop_str as a *string*, not an array.
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["stop_str"].is_string());
        assert_eq!(GenerationConfig::from_legacy_json(&raw), generation);
    }

    #[test]
    fn legacy_encode_omits_empty_stop() {
        let raw = GenerationConfig::default().to_legacy_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("stop_str").is_none());
        assert_eq!(value["maxTokens"], 1024);
    }

    // ── load_from / save_to ────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.backend.base_url, "http://localhost:8338");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[experiment]
id = "exp-1"
model = "llama-3-8b"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.experiment.id, "exp-1");
        assert_eq!(cfg.experiment.model, "llama-3-8b");
        assert!(cfg.has_model());
        assert_eq!(cfg.generation.max_tokens, 1024);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.experiment.model = "mistral-7b".to_string();
        cfg.experiment.adaptor = "tuned".to_string();
        cfg.generation.stop = vec!["###".to_string()];

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.experiment.model, "mistral-7b");
        assert_eq!(loaded.experiment.adaptor, "tuned");
        assert_eq!(loaded.generation.stop, vec!["###"]);
    }

    #[test]
    fn experiment_generation_params_blob_overrides_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.toml");
        fs::write(
            &path,
            r####"
[generation]
temperature = 0.9

[experiment]
model = "llama-3-8b"
generation_params = '{"temperature":0.1,"maxTokens":32,"stop_str":"[\"###\"]"}'
"####,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert!((cfg.generation.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(cfg.generation.max_tokens, 32);
        assert_eq!(cfg.generation.stop, vec!["###"]);
    }

    // ── Env var override ───────────────────────────────────────────────────

    #[test]
    fn env_base_url_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[backend]
base_url = "http://from-file:8338"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("PROMPTLAB_BASE_URL", "http://from-env:9000") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.backend.base_url, "http://from-env:9000");
        unsafe { env::remove_var("PROMPTLAB_BASE_URL") };
    }
}
