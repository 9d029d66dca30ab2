use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    pub labels: LabelsConfig,
    pub uploads: UploadConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn get_path(&self) -> PathBuf;

    fn validate(&self) -> Result<(), String> {
        let path = self.get_path();
        if !path.exists() {
            return Err(format!("File not found: {:?}", path));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default)]
    pub download_url: Option<String>,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Validatable for ModelConfig {
    fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelsConfig {
    pub labels_dir: PathBuf,
    pub labels_file: String,
}

impl Validatable for LabelsConfig {
    fn get_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_files() -> usize {
    100
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("LD")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize::<Config>()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_YAML: &str = r#"
log_level: DEBUG
server:
  host: 127.0.0.1
  port: 5000
model:
  model_dir: model
  onnx_file: model0.onnx
  num_instances: 2
labels:
  labels_dir: model
  labels_file: class_indices.json
uploads:
  upload_dir: uploads
"#;

    fn parse(yaml: &str) -> Result<Config, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()
    }

    #[test]
    fn test_parse_base_configuration() {
        let config = parse(BASE_YAML).unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.server.get_address(), "127.0.0.1:5000");
        assert_eq!(config.model.num_instances, 2);
        assert_eq!(config.model.get_path(), PathBuf::from("model/model0.onnx"));
        assert!(config.model.download_url.is_none());
        assert_eq!(
            config.labels.get_path(),
            PathBuf::from("model/class_indices.json")
        );
        assert_eq!(config.uploads.max_files, 100);
        assert_eq!(config.uploads.max_upload_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let yaml = BASE_YAML.replace("DEBUG", "trace");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn test_environment_from_string() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_validate_missing_model() {
        let model = ModelConfig {
            model_dir: PathBuf::from("/nonexistent"),
            onnx_file: "model0.onnx".to_string(),
            num_instances: 1,
            download_url: None,
        };
        assert!(model.validate().is_err());
    }
}
