//! Built-in greedy tokenizer over a [`VocabularyTrie`]
//!
//! Encoding consumes, at each offset, the longest vocabulary entry that
//! matches the remaining input. Vocabularies that contain every single byte
//! (as RWKV "world" vocabularies do) can tokenize any input.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use super::{Tokenizer, VocabularyTrie, TOKEN_NOT_FOUND};
use crate::buffer::ArrayView;
use crate::config::{BackendKind, TokenizerConfig};
use crate::{Decoding, Encoding, EncodingBatch, Error, Result};

#[derive(Debug, Default)]
struct TrieVocab {
    id_to_token: HashMap<u32, Vec<u8>>,
    token_to_id: HashMap<Vec<u8>, u32>,
}

/// Greedy longest-prefix tokenizer.
///
/// Cheap to clone; clones share the vocabulary and trie.
#[derive(Clone)]
pub struct TrieTokenizer {
    vocab: Arc<TrieVocab>,
    trie: Arc<VocabularyTrie>,
    unk: Decoding,
    pad_id: u32,
}

impl TrieTokenizer {
    /// Build from `(id, token bytes)` pairs.
    pub fn from_vocab<B: Into<Vec<u8>>>(entries: impl IntoIterator<Item = (u32, B)>) -> Self {
        let id_to_token: HashMap<u32, Vec<u8>> =
            entries.into_iter().map(|(id, b)| (id, b.into())).collect();

        // Smallest id wins for duplicate texts, matching the trie.
        let mut sorted: Vec<(u32, &[u8])> = id_to_token
            .iter()
            .map(|(id, b)| (*id, b.as_slice()))
            .collect();
        sorted.sort_unstable_by_key(|&(id, _)| id);
        let mut token_to_id = HashMap::with_capacity(sorted.len());
        for &(id, bytes) in &sorted {
            token_to_id.entry(bytes.to_vec()).or_insert(id);
        }

        let trie = VocabularyTrie::new(sorted.iter().map(|&(id, b)| (b, id)));
        let uncovered = trie.uncovered_bytes().len();
        if !trie.is_empty() && uncovered > 0 {
            tracing::warn!(
                uncovered,
                "trie vocabulary lacks single-byte entries; some inputs will not tokenize"
            );
        }
        tracing::debug!(vocab_size = id_to_token.len(), "built trie tokenizer");

        Self {
            vocab: Arc::new(TrieVocab {
                id_to_token,
                token_to_id,
            }),
            trie: Arc::new(trie),
            unk: Decoding::from_static(b"<unk>"),
            pad_id: 0,
        }
    }

    /// Build from a JSON object mapping id to token text, e.g.
    /// `{"0": "a", "1": "the"}`.
    ///
    /// # Errors
    /// Returns an error if the blob is not such an object.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let map: HashMap<u32, String> = serde_json::from_slice(json)?;
        Ok(Self::from_vocab(map))
    }

    /// Apply `unk_token` and `pad_id` from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &TokenizerConfig) -> Self {
        self.unk = if config.unk_token == "<unk>" {
            Decoding::from_static(b"<unk>")
        } else {
            Decoding::from_string(config.unk_token.clone())
        };
        self.pad_id = config.pad_id;
        self
    }

    /// The prefix tree used for encoding.
    #[must_use]
    pub fn trie(&self) -> &VocabularyTrie {
        &self.trie
    }

    fn ensure_populated(&self) -> Result<()> {
        if self.vocab.id_to_token.is_empty() {
            return Err(Error::Integrity("trie tokenizer has an empty vocabulary".into()));
        }
        Ok(())
    }

    fn token_bytes(&self, id: u32) -> Option<&[u8]> {
        self.vocab.id_to_token.get(&id).map(Vec::as_slice)
    }
}

impl Tokenizer for TrieTokenizer {
    /// Special tokens are never added: the vocabulary has none.
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Encoding> {
        let bytes = text.as_bytes();
        let mut ids = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (prefix, id) = self.trie.find_longest_prefix(&bytes[offset..])?;
            ids.push(id);
            offset += prefix.len();
        }
        Ok(Encoding::from_ids(ids))
    }

    fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<EncodingBatch> {
        let encodings = texts
            .par_iter()
            .map(|text| self.encode(text, add_special_tokens))
            .collect::<Result<Vec<_>>>()?;
        Ok(EncodingBatch::new(encodings).with_pad_id(self.pad_id))
    }

    fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<Decoding> {
        let mut out = Vec::new();
        for &id in ids {
            out.extend_from_slice(self.token_bytes(id).unwrap_or(self.unk.as_bytes()));
        }
        Ok(Decoding::from_bytes(out))
    }

    fn vocab_size(&self) -> Result<usize> {
        self.ensure_populated()?;
        Ok(self.vocab.id_to_token.len())
    }

    /// Zero-copy view into the shared vocabulary storage.
    fn id_to_token(&self, id: u32) -> Result<Decoding> {
        self.ensure_populated()?;
        match self.token_bytes(id) {
            // SAFETY: `vocab` is immutable and the clone keeps it alive.
            Some(bytes) => Ok(unsafe {
                Decoding::from_raw(ArrayView::from_slice(bytes), self.vocab.clone())
            }),
            None => Ok(self.unk.clone()),
        }
    }

    fn token_to_id(&self, token: &str) -> u32 {
        self.vocab
            .token_to_id
            .get(token.as_bytes())
            .copied()
            .unwrap_or(TOKEN_NOT_FOUND)
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Trie
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Every single byte (id = byte value) plus a few words.
    fn byte_vocab(words: &[&str]) -> TrieTokenizer {
        let mut entries: Vec<(u32, Vec<u8>)> = (0..=255u8).map(|b| (u32::from(b), vec![b])).collect();
        for (i, w) in words.iter().enumerate() {
            entries.push((256 + i as u32, w.as_bytes().to_vec()));
        }
        TrieTokenizer::from_vocab(entries)
    }

    #[test]
    fn test_encode_uses_longest_match() {
        let tok = byte_vocab(&["the", "th"]);
        let enc = tok.encode("the cat", true).unwrap();
        assert_eq!(enc.ids(), &[256, u32::from(b' '), 99, 97, 116]);
        assert!(enc.type_ids().is_none());
        assert!(enc.attention_mask().is_none());
        assert!(enc.tokens().is_none());
    }

    #[test]
    fn test_decode_roundtrip() {
        let tok = byte_vocab(&["the"]);
        let enc = tok.encode("the cat", false).unwrap();
        assert!(enc.len() >= 2);
        assert_eq!(tok.decode(enc.ids(), true).unwrap(), "the cat");
    }

    #[test]
    fn test_empty_input() {
        let tok = byte_vocab(&[]);
        assert!(tok.encode("", true).unwrap().is_empty());
        assert!(tok.decode(&[], true).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_id_decodes_to_unk() {
        let tok = byte_vocab(&[]);
        assert_eq!(tok.decode(&[104, 99_999, 105], true).unwrap(), "h<unk>i");
        assert_eq!(tok.id_to_token(99_999).unwrap(), "<unk>");
    }

    #[test]
    fn test_configured_unk_and_pad() {
        let mut config = TokenizerConfig::new(BackendKind::Trie);
        config.unk_token = "?".into();
        config.pad_id = 7;
        let tok = byte_vocab(&[]).with_config(&config);
        assert_eq!(tok.decode(&[1_000_000], true).unwrap(), "?");
        let batch = tok.encode_batch(&["ab", "a"], true).unwrap();
        assert_eq!(batch.padded().input_ids.as_ref().unwrap().row(1), &[97, 7]);
    }

    #[test]
    fn test_missing_coverage_is_integrity_error() {
        let tok = TrieTokenizer::from_vocab([(0u32, "a"), (1, "b")]);
        let err = tok.encode("abc", true).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_token_to_id_not_found() {
        let tok = byte_vocab(&["the"]);
        assert_eq!(tok.token_to_id("the"), 256);
        assert_eq!(tok.token_to_id("token-not-in-vocab"), TOKEN_NOT_FOUND);
    }

    #[test]
    fn test_vocab_size() {
        assert_eq!(byte_vocab(&["the", "cat"]).vocab_size().unwrap(), 258);
    }

    #[test]
    fn test_empty_vocab_is_integrity_error() {
        let tok = TrieTokenizer::from_vocab(Vec::<(u32, Vec<u8>)>::new());
        assert!(matches!(tok.vocab_size(), Err(Error::Integrity(_))));
        assert!(matches!(tok.id_to_token(0), Err(Error::Integrity(_))));
        assert_eq!(tok.token_to_id("a"), TOKEN_NOT_FOUND);
    }

    #[test]
    fn test_id_to_token_is_zero_copy() {
        let tok = byte_vocab(&["hello"]);
        let a = tok.id_to_token(256).unwrap();
        let b = tok.id_to_token(256).unwrap();
        assert_eq!(a, "hello");
        assert_eq!(a.as_bytes().as_ptr(), b.as_bytes().as_ptr());
        // The view stays valid after the tokenizer is gone.
        drop(tok);
        assert_eq!(b, "hello");
    }

    #[test]
    fn test_from_json() {
        let tok = TrieTokenizer::from_json(br#"{"0": "a", "1": "b", "2": "ab"}"#).unwrap();
        assert_eq!(tok.encode("abba", true).unwrap().ids(), &[2, 1, 0]);
        assert!(TrieTokenizer::from_json(b"[1, 2]").is_err());
    }

    #[test]
    fn test_batch_preserves_order() {
        let tok = byte_vocab(&["the", "cat"]);
        let texts = ["the cat", "a", "", "cat the"];
        let batch = tok.encode_batch(&texts, true).unwrap();
        assert_eq!(batch.len(), texts.len());
        for (text, enc) in texts.iter().zip(&batch) {
            assert_eq!(enc, &tok.encode(text, true).unwrap());
        }
    }

    proptest! {
        #[test]
        fn prop_decode_encode_is_identity(s in "\\PC{0,64}") {
            let tok = byte_vocab(&["the", "cat", "\u{2581}", "ing"]);
            let enc = tok.encode(&s, true).unwrap();
            let dec = tok.decode(enc.ids(), true).unwrap();
            prop_assert_eq!(dec.as_bytes(), s.as_bytes());
        }
    }
}
