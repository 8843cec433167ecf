use thiserror::Error;

use crate::model::MediaKind;

#[derive(Error, Debug)]
pub enum CompanionError {
    #[error("Missing parameter '{0}'")]
    MissingParameter(String),
    #[error("Invalid value for '{0}': {1}")]
    InvalidParameter(String, String),
    #[error("Unknown task action '{0}'")]
    UnknownAction(String),
    #[error("Media type '{0}' maps to no supported kind")]
    UnsupportedKind(String),
    #[error("No metadata available for {0}")]
    MetadataUnavailable(String),
    #[error("Remote play queue {0} could not be downloaded")]
    QueueUnavailable(String),
    #[error("Nothing is playing in the {0} queue")]
    NothingPlaying(MediaKind),
    #[error("Stream {0} is not known for the playing item")]
    UnknownStream(String),
    #[error("No media server known")]
    NoServer,
    #[error("HTTP Error: {0}")]
    Http(String),
    #[error("{0} returned HTTP status {1}")]
    HttpStatus(String, u16),
    #[error("XML Error: {0}")]
    Xml(String),
    #[error("Player Error: {0}")]
    Player(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompanionError {
    pub fn missing(name: &str) -> Self {
        CompanionError::MissingParameter(name.to_string())
    }

    pub fn invalid(name: &str, value: &str) -> Self {
        CompanionError::InvalidParameter(name.to_string(), value.to_string())
    }

    pub fn http(err: impl std::fmt::Display) -> Self {
        CompanionError::Http(err.to_string())
    }

    pub fn xml(err: impl std::fmt::Display) -> Self {
        CompanionError::Xml(err.to_string())
    }

    pub fn player(err: impl std::fmt::Display) -> Self {
        CompanionError::Player(err.to_string())
    }
}

impl From<ureq::Error> for CompanionError {
    fn from(err: ureq::Error) -> Self {
        CompanionError::Http(err.to_string())
    }
}

impl From<xmltree::ParseError> for CompanionError {
    fn from(err: xmltree::ParseError) -> Self {
        CompanionError::Xml(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CompanionError>;
