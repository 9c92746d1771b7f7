//! The foreign backend against a real in-memory `tokenizers` model.
#![cfg(feature = "hf")]

use std::thread;

use tokenbridge::tokenizer::foreign::HF_ENGINE;
use tokenbridge::{
    BackendKind, ForeignTokenizer, HandleRegistry, Tokenizer, TokenizerConfig, TOKEN_NOT_FOUND,
};

const WORD_LEVEL: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"[UNK]": 0, "hello": 1, "world": 2},
        "unk_token": "[UNK]"
    }
}"#;

fn tokenizer_in(registry: &HandleRegistry) -> ForeignTokenizer {
    unsafe { ForeignTokenizer::from_json_in(&HF_ENGINE, registry, WORD_LEVEL.as_bytes()) }
        .expect("word-level tokenizer.json should load")
}

#[test]
fn test_hello_world_roundtrip() {
    let registry = HandleRegistry::new();
    let tok = tokenizer_in(&registry);
    let enc = tok.encode("hello world", true).unwrap();
    assert_eq!(enc.ids(), &[1, 2]);
    assert_eq!(tok.decode(enc.ids(), true).unwrap(), "hello world");
}

#[test]
fn test_load_through_config() {
    let config = TokenizerConfig::from_json(r#"{"backend": "foreign", "pad_id": 0}"#).unwrap();
    let tok = tokenbridge::load(&config, WORD_LEVEL.as_bytes()).unwrap();
    assert_eq!(tok.backend(), BackendKind::Foreign);
    assert_eq!(tok.vocab_size().unwrap(), 3);
    assert_eq!(tok.token_to_id("token-not-in-vocab"), TOKEN_NOT_FOUND);
}

#[test]
fn test_every_allocation_is_released() {
    let registry = HandleRegistry::new();
    let tok = tokenizer_in(&registry);
    {
        let enc = tok.encode("world", true).unwrap();
        let batch = tok.encode_batch(&["hello", "hello world"], true).unwrap();
        let texts = tok.decode_batch(&[&[1], &[2, 1]], true).unwrap();
        let token = tok.id_to_token(1).unwrap();
        assert!(registry.len() > 1);
        assert_eq!(enc.ids(), &[2]);
        assert_eq!(batch[1].ids(), &[1, 2]);
        assert_eq!(texts[1], "world hello");
        assert_eq!(token, "hello");
    }
    // Only the tokenizer itself is left.
    assert_eq!(registry.len(), 1);
    drop(tok);
    assert!(registry.is_empty());
}

#[test]
fn test_batch_padding_over_engine_rows() {
    let registry = HandleRegistry::new();
    let tok = tokenizer_in(&registry).with_pad_id(7);
    let batch = tok
        .encode_batch(&["hello world hello", "world", "hello hello"], true)
        .unwrap();
    let padded = batch.padded();
    assert_eq!(padded.max_len, 3);
    assert_eq!(
        padded.input_ids.as_ref().unwrap().as_slice(),
        &[1, 2, 1, 2, 7, 7, 1, 1, 7]
    );
    assert_eq!(
        padded.attention_mask.as_ref().unwrap().as_slice(),
        &[1, 1, 1, 1, 0, 0, 1, 1, 0]
    );
    assert_eq!(
        padded.token_type_ids.as_ref().unwrap().as_slice(),
        &[0; 9]
    );
}

#[test]
fn test_batch_rows_outlive_batch_and_tokenizer() {
    let registry = HandleRegistry::new();
    let tok = tokenizer_in(&registry);
    let row = {
        let batch = tok.encode_batch(&["world", "hello world"], true).unwrap();
        batch.into_encodings().swap_remove(1)
    };
    drop(tok);
    let ids = thread::spawn(move || row.ids().to_vec()).join().unwrap();
    assert_eq!(ids, vec![1, 2]);
    assert!(registry.is_empty());
}

#[test]
fn test_concurrent_encode_on_shared_handle() {
    let registry = HandleRegistry::new();
    let tok = tokenizer_in(&registry);
    thread::scope(|s| {
        for t in 0..8 {
            let tok = tok.clone();
            s.spawn(move || {
                for i in 0..50 {
                    let text = if (t + i) % 2 == 0 { "hello world" } else { "world" };
                    let enc = tok.encode(text, true).unwrap();
                    assert_eq!(enc.len(), text.split(' ').count());
                }
            });
        }
    });
    assert_eq!(registry.len(), 1);
}
