use bsds::provider;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDto {
    pub kind: String,
    pub error: String,
}

impl ErrorDto {
    pub fn from(err: &provider::Error) -> Self {
        let kind = match err {
            provider::Error::NoStop => "no-stop",
            provider::Error::NoIndex => "no-schedule",
            provider::Error::UnknownStop(_) => "unknown-stop",
            provider::Error::Unavailable { .. } => "unavailable",
        };
        Self {
            kind: kind.to_string(),
            error: err.to_string(),
        }
    }
}
