//! SentencePiece backend
//!
//! The processor is reached through [`SentencePieceEngine`], a narrow
//! boundary whose calls report success as a [`Status`] rather than an error
//! type. [`SentencePieceTokenizer`] turns failed statuses into
//! [`Error::Foreign`] and applies the facade's conventions on top (the
//! not-found sentinel, empty text for unknown ids).

#![allow(clippy::doc_markdown)]

use std::sync::Arc;

use super::{Tokenizer, TOKEN_NOT_FOUND};
use crate::config::BackendKind;
use crate::{Decoding, Encoding, Error, Result};

/// Outcome of a SentencePiece engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Status {
    Ok,
    Error(String),
}

impl Status {
    /// Convert into the crate's error taxonomy, naming the failed call.
    ///
    /// # Errors
    /// Returns [`Error::Foreign`] for a failed status.
    pub fn into_result(self, call: &str) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Error(msg) => Err(Error::Foreign(format!("sentencepiece {call}: {msg}"))),
        }
    }
}

/// Operations the SentencePiece processor offers.
///
/// Mirrors the processor's own API: a default-constructed engine is loaded
/// in place, and outputs are written into caller-provided containers.
pub trait SentencePieceEngine: Default + Send + Sync {
    fn load_from_serialized_proto(&mut self, model: &[u8]) -> Status;

    fn encode(&self, text: &str, ids: &mut Vec<u32>) -> Status;

    fn decode(&self, ids: &[u32], text: &mut String) -> Status;

    /// Number of pieces in the loaded model.
    fn piece_size(&self) -> usize;

    /// `None` if `id` is out of range.
    fn id_to_piece(&self, id: u32) -> Option<String>;

    /// `None` if `piece` is not in the model (rather than the unk id).
    fn piece_to_id(&self, piece: &str) -> Option<u32>;
}

/// Facade adapter over a loaded [`SentencePieceEngine`].
pub struct SentencePieceTokenizer<E> {
    engine: Arc<E>,
    pad_id: u32,
}

impl<E> Clone for SentencePieceTokenizer<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            pad_id: self.pad_id,
        }
    }
}

impl<E: SentencePieceEngine> SentencePieceTokenizer<E> {
    /// Load a serialized model proto.
    ///
    /// # Errors
    /// Returns [`Error::Foreign`] if the engine fails to load the model; no
    /// half-initialised tokenizer is ever returned.
    pub fn from_blob(model: &[u8]) -> Result<Self> {
        let mut engine = E::default();
        engine
            .load_from_serialized_proto(model)
            .into_result("load")?;
        tracing::debug!(pieces = engine.piece_size(), "loaded SentencePiece model");
        Ok(Self {
            engine: Arc::new(engine),
            pad_id: 0,
        })
    }

    #[must_use]
    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }
}

impl<E: SentencePieceEngine + 'static> Tokenizer for SentencePieceTokenizer<E> {
    /// The model's own normalisation decides on BOS/EOS; the flag is ignored.
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Encoding> {
        let mut ids = Vec::new();
        self.engine.encode(text, &mut ids).into_result("encode")?;
        Ok(Encoding::from_ids(ids))
    }

    fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<Decoding> {
        let mut text = String::new();
        self.engine.decode(ids, &mut text).into_result("decode")?;
        Ok(Decoding::from_string(text))
    }

    fn vocab_size(&self) -> Result<usize> {
        match self.engine.piece_size() {
            0 => Err(Error::Integrity("SentencePiece model has no pieces".into())),
            n => Ok(n),
        }
    }

    fn id_to_token(&self, id: u32) -> Result<Decoding> {
        Ok(self
            .engine
            .id_to_piece(id)
            .map_or_else(|| Decoding::from_static(b""), Decoding::from_string))
    }

    fn token_to_id(&self, token: &str) -> u32 {
        self.engine.piece_to_id(token).unwrap_or(TOKEN_NOT_FOUND)
    }

    fn backend(&self) -> BackendKind {
        BackendKind::SentencePiece
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

/// [`SentencePieceEngine`] backed by the `sentencepiece` crate.
#[cfg(feature = "sentencepiece")]
#[derive(Default)]
pub struct SpmProcessor {
    inner: Option<::sentencepiece::SentencePieceProcessor>,
}

#[cfg(feature = "sentencepiece")]
impl SpmProcessor {
    fn loaded(&self) -> std::result::Result<&::sentencepiece::SentencePieceProcessor, Status> {
        self.inner
            .as_ref()
            .ok_or_else(|| Status::Error("no model loaded".into()))
    }
}

#[cfg(feature = "sentencepiece")]
impl SentencePieceEngine for SpmProcessor {
    fn load_from_serialized_proto(&mut self, model: &[u8]) -> Status {
        match ::sentencepiece::SentencePieceProcessor::from_serialized_proto(model) {
            Ok(p) => {
                self.inner = Some(p);
                Status::Ok
            }
            Err(e) => Status::Error(e.to_string()),
        }
    }

    fn encode(&self, text: &str, ids: &mut Vec<u32>) -> Status {
        let spp = match self.loaded() {
            Ok(spp) => spp,
            Err(status) => return status,
        };
        match spp.encode(text) {
            Ok(pieces) => {
                ids.extend(pieces.iter().map(|p| p.id));
                Status::Ok
            }
            Err(e) => Status::Error(e.to_string()),
        }
    }

    fn decode(&self, ids: &[u32], text: &mut String) -> Status {
        let spp = match self.loaded() {
            Ok(spp) => spp,
            Err(status) => return status,
        };
        match spp.decode_piece_ids(ids) {
            Ok(s) => {
                text.push_str(&s);
                Status::Ok
            }
            Err(e) => Status::Error(e.to_string()),
        }
    }

    fn piece_size(&self) -> usize {
        self.inner.as_ref().map_or(0, ::sentencepiece::SentencePieceProcessor::len)
    }

    // The crate exposes no raw piece lookup; this is the piece's surface text.
    fn id_to_piece(&self, id: u32) -> Option<String> {
        let spp = self.inner.as_ref()?;
        if id as usize >= spp.len() {
            return None;
        }
        spp.decode_piece_ids(&[id]).ok()
    }

    fn piece_to_id(&self, piece: &str) -> Option<u32> {
        self.inner.as_ref()?.piece_to_id(piece).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Whitespace "model": the blob is a newline-separated piece list.
    #[derive(Default)]
    struct ListEngine {
        pieces: Vec<String>,
        index: HashMap<String, u32>,
    }

    impl SentencePieceEngine for ListEngine {
        fn load_from_serialized_proto(&mut self, model: &[u8]) -> Status {
            let Ok(text) = std::str::from_utf8(model) else {
                return Status::Error("model is not UTF-8".into());
            };
            if text.starts_with("corrupt") {
                return Status::Error("bad proto".into());
            }
            self.pieces = text.lines().map(str::to_string).collect();
            self.index = self
                .pieces
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), i as u32))
                .collect();
            Status::Ok
        }

        fn encode(&self, text: &str, ids: &mut Vec<u32>) -> Status {
            for word in text.split_whitespace() {
                match self.index.get(word) {
                    Some(&id) => ids.push(id),
                    None => return Status::Error(format!("no piece for {word:?}")),
                }
            }
            Status::Ok
        }

        fn decode(&self, ids: &[u32], text: &mut String) -> Status {
            let mut words = Vec::new();
            for &id in ids {
                match self.pieces.get(id as usize) {
                    Some(p) => words.push(p.as_str()),
                    None => return Status::Error(format!("id {id} out of range")),
                }
            }
            text.push_str(&words.join(" "));
            Status::Ok
        }

        fn piece_size(&self) -> usize {
            self.pieces.len()
        }

        fn id_to_piece(&self, id: u32) -> Option<String> {
            self.pieces.get(id as usize).cloned()
        }

        fn piece_to_id(&self, piece: &str) -> Option<u32> {
            self.index.get(piece).copied()
        }
    }

    fn tokenizer() -> SentencePieceTokenizer<ListEngine> {
        SentencePieceTokenizer::from_blob(b"<unk>\nhello\nworld").unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let tok = tokenizer();
        let enc = tok.encode("hello world", true).unwrap();
        assert_eq!(enc.ids(), &[1, 2]);
        assert!(enc.attention_mask().is_none());
        assert_eq!(tok.decode(enc.ids(), true).unwrap(), "hello world");
    }

    #[test]
    fn test_load_failure_is_foreign_error() {
        let err = SentencePieceTokenizer::<ListEngine>::from_blob(b"corrupt").err().unwrap();
        assert!(matches!(err, Error::Foreign(ref m) if m.contains("load")));
    }

    #[test]
    fn test_encode_failure_is_foreign_error() {
        let err = tokenizer().encode("hello there", true).unwrap_err();
        assert!(matches!(err, Error::Foreign(_)));
    }

    #[test]
    fn test_vocab_size_and_lookup() {
        let tok = tokenizer();
        assert_eq!(tok.vocab_size().unwrap(), 3);
        assert_eq!(tok.id_to_token(2).unwrap(), "world");
        assert!(tok.id_to_token(42).unwrap().is_empty());
        assert_eq!(tok.token_to_id("hello"), 1);
        assert_eq!(tok.token_to_id("token-not-in-vocab"), TOKEN_NOT_FOUND);
    }

    #[test]
    fn test_empty_model_is_integrity_error() {
        let tok = SentencePieceTokenizer::<ListEngine>::from_blob(b"").unwrap();
        assert!(matches!(tok.vocab_size(), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_default_batch_paths() {
        let tok = tokenizer().with_pad_id(0);
        let batch = tok.encode_batch(&["hello world", "world"], true).unwrap();
        assert_eq!(batch[1].ids(), &[2]);
        let padded = batch.padded().input_ids.as_ref().unwrap();
        assert_eq!(padded.as_slice(), &[1, 2, 2, 0]);

        let decoded = tok.decode_batch(&[&[2, 1], &[]], true).unwrap();
        assert_eq!(decoded[0], "world hello");
        assert!(decoded[1].is_empty());
    }
}
