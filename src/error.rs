use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("System time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error("Source unavailable [{source_name}]: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Invalid node '{name}': {reason}")]
    InvalidNode { name: String, reason: String },

    #[error("Tunnel failed to start: {0}")]
    ProbeStartup(String),

    #[error("Timed out during {0}")]
    ProbeTimeout(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No nodes found in any subscription")]
    NoNodes,

    #[error("No node passed all {rounds} rounds")]
    NoSurvivors { rounds: u32 },

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, CheckError>;
