//! tokenbridge: one tokenization API over several engines
//!
//! Backends:
//! - [`ForeignTokenizer`]: a subword engine behind a C-style function table
//!   (the HuggingFace `tokenizers` engine by default)
//! - [`SentencePieceTokenizer`]: a SentencePiece processor
//! - [`TrieTokenizer`]: a built-in greedy longest-prefix tokenizer
//!
//! Results are zero-copy views that keep whatever memory backs them alive,
//! so they can outlive the call that produced them and move across threads.

pub mod buffer;
pub mod config;
pub mod decoding;
pub mod encoding;
pub mod error;
pub mod registry;
pub mod tokenizer;

pub use buffer::{ForeignBuffer, ForeignHandle, HandleKind, OwnedKind};
pub use config::{BackendKind, TokenizerConfig};
pub use decoding::Decoding;
pub use encoding::{Encoding, EncodingBatch, EncodingParts, PaddedBatch, PaddedBlock};
pub use error::{Error, Result};
pub use registry::{HandleKey, HandleRegistry, Lease};
#[cfg(feature = "hf")]
pub use tokenizer::ForeignTokenizer;
pub use tokenizer::{
    from_blob_byte_level_bpe, from_blob_json, from_blob_sentencepiece, from_trie_vocab, load,
    SentencePieceEngine, SentencePieceTokenizer, Tokenizer, TrieTokenizer, VocabularyTrie,
    TOKEN_NOT_FOUND,
};
