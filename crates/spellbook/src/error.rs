use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpellError>;

#[derive(Error, Debug)]
pub enum SpellError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid spell: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher error: {0}")]
    Watcher(String),
}
