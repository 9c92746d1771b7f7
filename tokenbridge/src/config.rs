//! Tokenizer configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Which engine backs a tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// External subword engine reached through a C-style function table
    Foreign,
    SentencePiece,
    /// Built-in greedy longest-prefix tokenizer
    Trie,
}

/// Configuration for building a tokenizer
///
/// Usually parsed from a small JSON file that sits beside the model blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Backend to construct
    pub backend: BackendKind,

    /// Marker emitted by the trie backend for ids missing from its vocabulary
    #[serde(default = "default_unk_token")]
    pub unk_token: String,

    /// Value used to right-pad short rows of a batch's id block
    #[serde(default)]
    pub pad_id: u32,
}

fn default_unk_token() -> String {
    "<unk>".to_string()
}

impl TokenizerConfig {
    /// Configuration with every default for `backend`
    #[must_use]
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            unk_token: default_unk_token(),
            pad_id: 0,
        }
    }

    /// Parse configuration from a JSON string
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or names an unknown backend
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TokenizerConfig::from_json(r#"{"backend": "trie"}"#).unwrap();
        assert_eq!(config, TokenizerConfig::new(BackendKind::Trie));
        assert_eq!(config.unk_token, "<unk>");
        assert_eq!(config.pad_id, 0);
    }

    #[test]
    fn test_all_fields() {
        let config = TokenizerConfig::from_json(
            r#"{"backend": "sentence_piece", "unk_token": "[UNK]", "pad_id": 3}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::SentencePiece);
        assert_eq!(config.unk_token, "[UNK]");
        assert_eq!(config.pad_id, 3);
    }

    #[test]
    fn test_unknown_backend_is_error() {
        let err = TokenizerConfig::from_json(r#"{"backend": "wordpiece"}"#).unwrap_err();
        assert!(matches!(err, crate::Error::Json(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = TokenizerConfig::from_file("/nonexistent/tokenizer_config.json").unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
