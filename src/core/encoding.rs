use super::{DbError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Key or value encoding applied by a session.
///
/// `encode` turns caller bytes into the bytes handed to the substrate and
/// `decode` reverses it on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Binary,
    Json,
    Base64,
}

impl Encoding {
    pub fn encode(&self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => {
                std::str::from_utf8(input)
                    .map_err(|e| DbError::EncodingError(format!("invalid utf8: {}", e)))?;
                Ok(input.to_vec())
            }
            Encoding::Binary => Ok(input.to_vec()),
            Encoding::Json => {
                let value: serde_json::Value = serde_json::from_slice(input)
                    .map_err(|e| DbError::EncodingError(format!("invalid json: {}", e)))?;
                serde_json::to_vec(&value).map_err(|e| DbError::EncodingError(e.to_string()))
            }
            Encoding::Base64 => STANDARD
                .decode(input)
                .map_err(|e| DbError::EncodingError(format!("invalid base64: {}", e))),
        }
    }

    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => {
                std::str::from_utf8(stored).map_err(|e| {
                    DbError::EncodingError(format!("stored bytes are not utf8: {}", e))
                })?;
                Ok(stored.to_vec())
            }
            Encoding::Binary | Encoding::Json => Ok(stored.to_vec()),
            Encoding::Base64 => Ok(STANDARD.encode(stored).into_bytes()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Binary => "binary",
            Encoding::Json => "json",
            Encoding::Base64 => "base64",
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "binary" | "buffer" => Ok(Encoding::Binary),
            "json" => Ok(Encoding::Json),
            "base64" => Ok(Encoding::Base64),
            other => Err(DbError::ConfigError(format!("unknown encoding '{}'", other))),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
