//! Tokenizer facade
//!
//! Defines the [`Tokenizer`] trait and the backends that implement it:
//! [`ForeignTokenizer`] (an external engine behind a C-style function table),
//! [`SentencePieceTokenizer`] and the built-in [`TrieTokenizer`].

#[cfg(feature = "hf")]
pub mod foreign;
pub mod spm;
mod trie;
mod trie_tokenizer;

use crate::config::{BackendKind, TokenizerConfig};
use crate::{Decoding, Encoding, EncodingBatch, Result};

#[cfg(feature = "hf")]
pub use foreign::ForeignTokenizer;
pub use spm::{SentencePieceEngine, SentencePieceTokenizer, Status};
pub use trie::VocabularyTrie;
pub use trie_tokenizer::TrieTokenizer;

/// Returned by [`Tokenizer::token_to_id`] when the token is not in the
/// vocabulary. Identical across every backend.
pub const TOKEN_NOT_FOUND: u32 = u32::MAX;

/// Trait for tokenizers that convert between text and token IDs.
///
/// Each call's result is self-contained: it owns (or shares) whatever memory
/// its views point into, so results may outlive further calls and move
/// across threads.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token IDs.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding>;

    /// Encode a batch of texts. Output order matches input order.
    ///
    /// The default encodes each text in turn.
    ///
    /// # Errors
    /// Returns the first encoding error.
    fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<EncodingBatch> {
        texts
            .iter()
            .map(|text| self.encode(text, add_special_tokens))
            .collect::<Result<Vec<_>>>()
            .map(|encodings| EncodingBatch::new(encodings).with_pad_id(self.pad_id()))
    }

    /// Decode token IDs to text.
    ///
    /// # Errors
    /// Returns an error if decoding fails.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<Decoding>;

    /// Decode a batch of id sequences. Output order matches input order.
    ///
    /// # Errors
    /// Returns the first decoding error.
    fn decode_batch(&self, ids_batch: &[&[u32]], skip_special_tokens: bool) -> Result<Vec<Decoding>> {
        ids_batch
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }

    /// Vocabulary size, special tokens included.
    ///
    /// # Errors
    /// Returns [`crate::Error::Integrity`] if the vocabulary is empty.
    fn vocab_size(&self) -> Result<usize>;

    /// Text of a single token.
    ///
    /// # Errors
    /// Returns an error if the backend cannot answer.
    fn id_to_token(&self, id: u32) -> Result<Decoding>;

    /// Id of `token`, or [`TOKEN_NOT_FOUND`].
    fn token_to_id(&self, token: &str) -> u32;

    /// Which backend this is.
    fn backend(&self) -> BackendKind;

    /// Value used to pad short rows of the id block in batches.
    fn pad_id(&self) -> u32 {
        crate::encoding::DEFAULT_PAD_ID
    }

    /// Drop any cached state. Backends without caches ignore this.
    fn clear_cache(&self) {}
}

impl<T: Tokenizer + ?Sized> Tokenizer for Box<T> {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding> {
        (**self).encode(text, add_special_tokens)
    }

    fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<EncodingBatch> {
        (**self).encode_batch(texts, add_special_tokens)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<Decoding> {
        (**self).decode(ids, skip_special_tokens)
    }

    fn decode_batch(&self, ids_batch: &[&[u32]], skip_special_tokens: bool) -> Result<Vec<Decoding>> {
        (**self).decode_batch(ids_batch, skip_special_tokens)
    }

    fn vocab_size(&self) -> Result<usize> {
        (**self).vocab_size()
    }

    fn id_to_token(&self, id: u32) -> Result<Decoding> {
        (**self).id_to_token(id)
    }

    fn token_to_id(&self, token: &str) -> u32 {
        (**self).token_to_id(token)
    }

    fn backend(&self) -> BackendKind {
        (**self).backend()
    }

    fn pad_id(&self) -> u32 {
        (**self).pad_id()
    }

    fn clear_cache(&self) {
        (**self).clear_cache();
    }
}

fn ensure_blob(blob: &[u8], what: &str) -> Result<()> {
    if blob.is_empty() {
        return Err(crate::Error::InvalidInput(format!("empty {what} blob")));
    }
    Ok(())
}

#[cfg(feature = "hf")]
fn foreign_from_json(json: &[u8]) -> Result<ForeignTokenizer> {
    ensure_blob(json, "tokenizer.json")?;
    ForeignTokenizer::from_json(json)
}

#[cfg(feature = "sentencepiece")]
fn sentencepiece_from_blob(model: &[u8]) -> Result<SentencePieceTokenizer<spm::SpmProcessor>> {
    ensure_blob(model, "SentencePiece model")?;
    SentencePieceTokenizer::from_blob(model)
}

fn trie_from_blob(json: &[u8]) -> Result<TrieTokenizer> {
    ensure_blob(json, "trie vocabulary")?;
    TrieTokenizer::from_json(json)
}

#[cfg(not(feature = "hf"))]
fn foreign_unsupported() -> crate::Error {
    crate::Error::Unsupported("foreign engine not compiled in (enable feature `hf`)".into())
}

#[cfg(not(feature = "sentencepiece"))]
fn sentencepiece_unsupported() -> crate::Error {
    crate::Error::Unsupported(
        "SentencePiece engine not compiled in (enable feature `sentencepiece`)".into(),
    )
}

/// Build the foreign-engine backend from a serialized `tokenizer.json` blob.
///
/// # Errors
/// Returns [`crate::Error::InvalidInput`] for an empty blob,
/// [`crate::Error::Foreign`] if the engine rejects it, or
/// [`crate::Error::Unsupported`] if the `hf` feature is disabled.
pub fn from_blob_json(json: &[u8]) -> Result<Box<dyn Tokenizer>> {
    #[cfg(feature = "hf")]
    {
        Ok(Box::new(foreign_from_json(json)?))
    }
    #[cfg(not(feature = "hf"))]
    {
        let _ = json;
        Err(foreign_unsupported())
    }
}

/// Build a byte-level BPE tokenizer on the foreign engine from `vocab.json`,
/// `merges.txt` and an optional `added_tokens.json` (pass `""` for none).
///
/// # Errors
/// Returns [`crate::Error::InvalidInput`] for an empty vocab or merges blob,
/// [`crate::Error::Foreign`] if the engine rejects any blob, or
/// [`crate::Error::Unsupported`] if the `hf` feature is disabled.
pub fn from_blob_byte_level_bpe(
    vocab: &str,
    merges: &str,
    added_tokens: &str,
) -> Result<Box<dyn Tokenizer>> {
    #[cfg(feature = "hf")]
    {
        ensure_blob(vocab.as_bytes(), "vocab.json")?;
        ensure_blob(merges.as_bytes(), "merges.txt")?;
        Ok(Box::new(ForeignTokenizer::from_byte_level_bpe(
            vocab,
            merges,
            added_tokens,
        )?))
    }
    #[cfg(not(feature = "hf"))]
    {
        let _ = (vocab, merges, added_tokens);
        Err(foreign_unsupported())
    }
}

/// Build the SentencePiece backend from a serialized model proto.
///
/// # Errors
/// Returns [`crate::Error::InvalidInput`] for an empty blob,
/// [`crate::Error::Foreign`] if the model fails to load, or
/// [`crate::Error::Unsupported`] if the `sentencepiece` feature is disabled.
pub fn from_blob_sentencepiece(model: &[u8]) -> Result<Box<dyn Tokenizer>> {
    #[cfg(feature = "sentencepiece")]
    {
        Ok(Box::new(sentencepiece_from_blob(model)?))
    }
    #[cfg(not(feature = "sentencepiece"))]
    {
        let _ = model;
        Err(sentencepiece_unsupported())
    }
}

/// Build the trie backend from a JSON object mapping id to token text.
///
/// # Errors
/// Returns [`crate::Error::InvalidInput`] for an empty blob or
/// [`crate::Error::Json`] if it is not such an object.
pub fn from_trie_vocab(json: &[u8]) -> Result<Box<dyn Tokenizer>> {
    Ok(Box::new(trie_from_blob(json)?))
}

/// Build whichever backend `config` names from `blob`, applying the
/// configured pad id (and, for the trie, the unk marker).
///
/// # Errors
/// Fails eagerly with [`crate::Error::Unsupported`] if that backend is compiled out,
/// otherwise with whatever the backend's constructor reports.
pub fn load(config: &TokenizerConfig, blob: &[u8]) -> Result<Box<dyn Tokenizer>> {
    tracing::debug!(backend = ?config.backend, bytes = blob.len(), "loading tokenizer");
    match config.backend {
        #[cfg(feature = "hf")]
        BackendKind::Foreign => Ok(Box::new(foreign_from_json(blob)?.with_pad_id(config.pad_id))),
        #[cfg(not(feature = "hf"))]
        BackendKind::Foreign => Err(foreign_unsupported()),
        #[cfg(feature = "sentencepiece")]
        BackendKind::SentencePiece => Ok(Box::new(
            sentencepiece_from_blob(blob)?.with_pad_id(config.pad_id),
        )),
        #[cfg(not(feature = "sentencepiece"))]
        BackendKind::SentencePiece => Err(sentencepiece_unsupported()),
        BackendKind::Trie => Ok(Box::new(trie_from_blob(blob)?.with_config(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const TRIE_VOCAB: &[u8] = br#"{"0": "a", "1": "b", "2": "ab"}"#;

    #[test]
    fn test_load_trie_applies_config() {
        let config = TokenizerConfig::from_json(
            r#"{"backend": "trie", "unk_token": "?", "pad_id": 5}"#,
        )
        .unwrap();
        let tok = load(&config, TRIE_VOCAB).unwrap();
        assert_eq!(tok.backend(), BackendKind::Trie);
        assert_eq!(tok.pad_id(), 5);
        assert_eq!(tok.decode(&[2, 40], true).unwrap(), "ab?");
    }

    #[test]
    fn test_empty_blob_is_invalid_input() {
        assert!(matches!(from_trie_vocab(b""), Err(Error::InvalidInput(_))));
        let config = TokenizerConfig::new(BackendKind::Trie);
        assert!(matches!(load(&config, b""), Err(Error::InvalidInput(_))));
    }

    #[cfg(feature = "hf")]
    #[test]
    fn test_empty_foreign_blobs_never_reach_engine() {
        assert!(matches!(from_blob_json(b""), Err(Error::InvalidInput(_))));
        assert!(matches!(
            from_blob_byte_level_bpe("", "", ""),
            Err(Error::InvalidInput(ref m)) if m.contains("vocab.json")
        ));
        assert!(matches!(
            from_blob_byte_level_bpe(r#"{"a": 0}"#, "", ""),
            Err(Error::InvalidInput(ref m)) if m.contains("merges.txt")
        ));
    }

    #[cfg(not(feature = "sentencepiece"))]
    #[test]
    fn test_compiled_out_sentencepiece_is_unsupported() {
        let config = TokenizerConfig::new(BackendKind::SentencePiece);
        assert!(matches!(load(&config, b"model"), Err(Error::Unsupported(_))));
        assert!(matches!(
            from_blob_sentencepiece(b"model"),
            Err(Error::Unsupported(_))
        ));
    }

    #[cfg(feature = "hf")]
    #[test]
    fn test_load_foreign_rejects_garbage() {
        let config = TokenizerConfig::new(BackendKind::Foreign);
        assert!(matches!(load(&config, b"not json"), Err(Error::Foreign(_))));
    }

    #[test]
    fn test_boxed_tokenizer_forwards() {
        let tok: Box<dyn Tokenizer> = from_trie_vocab(TRIE_VOCAB).unwrap();
        let boxed: Box<Box<dyn Tokenizer>> = Box::new(tok);
        assert_eq!(boxed.encode("abba", true).unwrap().ids(), &[2, 1, 0]);
        assert_eq!(boxed.token_to_id("zz"), TOKEN_NOT_FOUND);
        assert_eq!(boxed.vocab_size().unwrap(), 3);
        boxed.clear_cache();
    }
}
