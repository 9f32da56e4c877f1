use std::path::{Path, PathBuf};

pub const CIRCUIT_DIAGRAMS_FOLDER: &str = "circuit_diagrams";
pub const SYSTEM_DESCRIPTIONS_FOLDER: &str = "system_descriptions";
pub const IO_LISTS_FOLDER: &str = "io_lists";
pub const DTC_SPECIFICATIONS_FOLDER: &str = "dtc_specifications";
pub const DIAGNOSTIC_FILES_FOLDER: &str = "diagnostic_files";
pub const BASE_CONFIGS_FOLDER: &str = "base_configs";
pub const FUNCTION_GROUPS_FOLDER: &str = "FunctionViewAdjust";
pub const PHYSICAL_QUANTITY_FOLDER: &str = "PhysicalQuantity";
pub const LOGS_FOLDER: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierProvider {
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Ollama,
    Hashing,
}

/// Pipeline settings, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_root: PathBuf,
    pub input_root: String,
    pub output_root: String,
    pub archive_root: String,
    pub input_archive_name: String,
    pub output_archive_name: String,
    pub template_path: Option<PathBuf>,
    pub store_path: PathBuf,
    pub openai_api_base: String,
    pub openai_api_key: Option<String>,
    /// The OpenAI-compatible server is vLLM and accepts `guided_json`.
    pub openai_guided_json: bool,
    pub classifier_model: String,
    pub classifier_provider: ClassifierProvider,
    pub ollama_host: String,
    pub embedding_model: String,
    pub embedding_provider: EmbeddingProvider,
    pub max_parallel_workers: usize,
    pub batch_size: usize,
    pub unit_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            input_root: "input".to_string(),
            output_root: "output".to_string(),
            archive_root: "archive".to_string(),
            input_archive_name: "input".to_string(),
            output_archive_name: "output".to_string(),
            template_path: None,
            store_path: PathBuf::from("./data/ecu-synth.db"),
            openai_api_base: "http://localhost:9000/v1".to_string(),
            openai_api_key: None,
            openai_guided_json: true,
            classifier_model: "NovaSky-AI/Sky-T1-32B-Flash".to_string(),
            classifier_provider: ClassifierProvider::OpenAi,
            ollama_host: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_provider: EmbeddingProvider::Ollama,
            max_parallel_workers: 8,
            batch_size: 50,
            unit_timeout_secs: 30,
            max_attempts: 3,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let classifier_provider = match env_or("CLASSIFIER_PROVIDER", "openai").to_lowercase().as_str() {
            "ollama" => ClassifierProvider::Ollama,
            _ => ClassifierProvider::OpenAi,
        };
        let embedding_provider = match env_or("EMBEDDING_PROVIDER", "ollama").to_lowercase().as_str() {
            "hashing" => EmbeddingProvider::Hashing,
            _ => EmbeddingProvider::Ollama,
        };

        Self {
            data_root: PathBuf::from(env_or("DATA_ROOT_FOLDER", "./data")),
            input_root: env_or("INPUT_ROOT_FOLDER", &defaults.input_root),
            output_root: env_or("OUTPUT_ROOT_FOLDER", &defaults.output_root),
            archive_root: env_or("ROOT_ARCHIVE_FOLDER", &defaults.archive_root),
            input_archive_name: env_or("INPUT_ARCHIVE_NAME", &defaults.input_archive_name),
            output_archive_name: env_or("OUTPUT_ARCHIVE_NAME", &defaults.output_archive_name),
            template_path: std::env::var("EXPORT_TEMPLATE_PATH").ok().map(PathBuf::from),
            store_path: PathBuf::from(env_or("STORE_PATH", "./data/ecu-synth.db")),
            openai_api_base: env_or("OPENAI_API_BASE", &defaults.openai_api_base),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|key| !key.is_empty()),
            openai_guided_json: env_parse("OPENAI_GUIDED_JSON", defaults.openai_guided_json),
            classifier_model: env_or("CLASSIFIER_MODEL", &defaults.classifier_model),
            classifier_provider,
            ollama_host: env_or("OLLAMA_HOST", &defaults.ollama_host),
            embedding_model: env_or("EMBEDDING_MODEL", &defaults.embedding_model),
            embedding_provider,
            max_parallel_workers: env_parse("MAX_PARALLEL_WORKERS", defaults.max_parallel_workers).max(1),
            batch_size: env_parse("BATCH_SIZE", defaults.batch_size).max(1),
            unit_timeout_secs: env_parse("UNIT_TIMEOUT_SECS", defaults.unit_timeout_secs),
            max_attempts: env_parse("MAX_ATTEMPTS", defaults.max_attempts).max(1),
        }
    }

    /// `{data_root}/{ecu}/{version}`
    pub fn run_folder(&self, ecu: &str, version: u32) -> PathBuf {
        self.data_root.join(ecu).join(version.to_string())
    }
}

/// The input, output and archive trees of one run.
#[derive(Debug, Clone)]
pub struct RunFolders {
    pub base: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub archive: PathBuf,
}

impl RunFolders {
    pub fn new(config: &PipelineConfig, base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            input: base.join(&config.input_root),
            output: base.join(&config.output_root),
            archive: base.join(&config.archive_root),
        }
    }

    pub fn input_category(&self, folder: &str) -> PathBuf {
        self.input.join(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.unit_timeout_secs, 30);
        assert!(config.openai_guided_json);
        assert_eq!(config.run_folder("TPM2", 4), PathBuf::from("./data/TPM2/4"));
    }

    #[test]
    fn test_run_folders() {
        let config = PipelineConfig::default();
        let folders = RunFolders::new(&config, Path::new("/tmp/run"));
        assert_eq!(folders.input_category(IO_LISTS_FOLDER), PathBuf::from("/tmp/run/input/io_lists"));
        assert_eq!(folders.archive, PathBuf::from("/tmp/run/archive"));
    }
}
