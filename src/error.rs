use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetDiagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote session error: {0}")]
    Remote(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Report error: {0}")]
    Report(String),
}

impl From<ssh2::Error> for FleetDiagError {
    fn from(e: ssh2::Error) -> Self {
        FleetDiagError::Remote(e.to_string())
    }
}

pub type Error = FleetDiagError;
pub type Result<T> = std::result::Result<T, Error>;
