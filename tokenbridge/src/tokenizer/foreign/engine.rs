//! Function table implemented over the HuggingFace `tokenizers` crate.
//!
//! Every allocation handed out is an exported `Vec` (see [`ForeignBuffer`])
//! or a boxed engine object, and comes back through the matching `free_*`
//! entry. Failures and panics never cross the boundary: they are recorded
//! per thread and reported as a null return.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};

use serde_json::json;
use tokenizers::{Encoding as HfEncoding, Tokenizer as HfTokenizer};

use super::{EmplaceFn, EngineApi, ReserveFn, SubArrayFn};
use crate::buffer::{ForeignBuffer, RawArray};
use crate::tokenizer::TOKEN_NOT_FOUND;

/// The `tokenizers`-backed engine.
pub static HF_ENGINE: EngineApi = EngineApi {
    new_from_str,
    new_from_byte_level_bpe,
    encode,
    encoding_ids,
    encoding_type_ids,
    encoding_special_tokens_mask,
    encoding_attention_mask,
    encoding_tokens,
    encode_batch,
    decode,
    decode_batch,
    vocab_size,
    id_to_token,
    token_to_id,
    free_tokenizer,
    free_encoding,
    free_encodings,
    free_string,
    free_strings,
    free_strings_shallow,
    take_last_error,
};

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

type EngineResult<T> = std::result::Result<T, String>;

/// Run `f`; on error or panic record the message and return `fallback`.
fn guarded<T>(fallback: T, f: impl FnOnce() -> EngineResult<T>) -> T {
    let message = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => return value,
        Ok(Err(message)) => message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "engine panicked".to_string()),
    };
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
    fallback
}

fn export_vec<T>(v: Vec<T>) -> ForeignBuffer {
    let mut v = ManuallyDrop::new(v);
    ForeignBuffer {
        ptr: v.as_mut_ptr().cast_const().cast(),
        capacity: v.capacity(),
        len: v.len(),
        type_size: std::mem::size_of::<T>(),
    }
}

fn export_string(s: String) -> ForeignBuffer {
    export_vec(s.into_bytes())
}

/// # Safety
/// `buf` must come from [`export_vec`] with element type `T`.
unsafe fn reclaim_vec<T>(buf: ForeignBuffer) -> Vec<T> {
    Vec::from_raw_parts(buf.ptr.cast::<T>().cast_mut(), buf.len, buf.capacity)
}

unsafe fn bytes_arg<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len)
    }
}

unsafe fn str_arg<'a>(ptr: *const u8, len: usize) -> EngineResult<&'a str> {
    std::str::from_utf8(bytes_arg(ptr, len)).map_err(|e| format!("input is not UTF-8: {e}"))
}

unsafe fn tokenizer_arg<'a>(handle: *const c_void) -> EngineResult<&'a HfTokenizer> {
    handle
        .cast::<HfTokenizer>()
        .as_ref()
        .ok_or_else(|| "null tokenizer handle".to_string())
}

/// Assemble a `tokenizer.json` for a byte-level BPE model from the pieces
/// GPT-2 style checkpoints ship.
fn byte_level_bpe_json(vocab: &str, merges: &str, added_tokens: &str) -> EngineResult<String> {
    let mut vocab: HashMap<String, u32> =
        serde_json::from_str(vocab).map_err(|e| format!("invalid vocab.json: {e}"))?;
    if !added_tokens.trim().is_empty() {
        let added: HashMap<String, u32> = serde_json::from_str(added_tokens)
            .map_err(|e| format!("invalid added_tokens.json: {e}"))?;
        vocab.extend(added);
    }
    let merges = merges
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with("#version"))
        .map(|line| match line.split(' ').collect::<Vec<_>>().as_slice() {
            [left, right] => Ok(format!("{left} {right}")),
            _ => Err(format!("invalid merges.txt line: {line:?}")),
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let byte_level = json!({
        "type": "ByteLevel",
        "add_prefix_space": false,
        "trim_offsets": false,
        "use_regex": false,
    });
    Ok(json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": byte_level.clone(),
        "post_processor": null,
        "decoder": byte_level,
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges,
        },
    })
    .to_string())
}

fn boxed_tokenizer(tokenizer: HfTokenizer) -> *mut c_void {
    Box::into_raw(Box::new(tokenizer)).cast()
}

unsafe extern "C" fn new_from_str(json: *const u8, len: usize) -> *mut c_void {
    guarded(std::ptr::null_mut(), || {
        let tokenizer = HfTokenizer::from_bytes(bytes_arg(json, len))
            .map_err(|e| format!("invalid tokenizer.json: {e}"))?;
        Ok(boxed_tokenizer(tokenizer))
    })
}

unsafe extern "C" fn new_from_byte_level_bpe(
    vocab: *const u8,
    vocab_len: usize,
    merges: *const u8,
    merges_len: usize,
    added_tokens: *const u8,
    added_tokens_len: usize,
) -> *mut c_void {
    guarded(std::ptr::null_mut(), || {
        let json = byte_level_bpe_json(
            str_arg(vocab, vocab_len)?,
            str_arg(merges, merges_len)?,
            str_arg(added_tokens, added_tokens_len)?,
        )?;
        let tokenizer = HfTokenizer::from_bytes(json.as_bytes())
            .map_err(|e| format!("invalid byte-level BPE model: {e}"))?;
        Ok(boxed_tokenizer(tokenizer))
    })
}

unsafe extern "C" fn encode(
    handle: *const c_void,
    text: *const u8,
    len: usize,
    add_special_tokens: i32,
) -> *mut c_void {
    guarded(std::ptr::null_mut(), || {
        let encoding = tokenizer_arg(handle)?
            .encode(str_arg(text, len)?, add_special_tokens != 0)
            .map_err(|e| e.to_string())?;
        Ok(Box::into_raw(Box::new(encoding)).cast())
    })
}

unsafe fn encoding_arg<'a>(encoding: *const c_void) -> Option<&'a HfEncoding> {
    encoding.cast::<HfEncoding>().as_ref()
}

unsafe extern "C" fn encoding_ids(encoding: *const c_void) -> RawArray {
    encoding_arg(encoding).map_or(RawArray::EMPTY, |e| RawArray::from_slice(e.get_ids()))
}

unsafe extern "C" fn encoding_type_ids(encoding: *const c_void) -> RawArray {
    encoding_arg(encoding).map_or(RawArray::EMPTY, |e| RawArray::from_slice(e.get_type_ids()))
}

unsafe extern "C" fn encoding_special_tokens_mask(encoding: *const c_void) -> RawArray {
    encoding_arg(encoding).map_or(RawArray::EMPTY, |e| RawArray::from_slice(e.get_special_tokens_mask()))
}

unsafe extern "C" fn encoding_attention_mask(encoding: *const c_void) -> RawArray {
    encoding_arg(encoding).map_or(RawArray::EMPTY, |e| RawArray::from_slice(e.get_attention_mask()))
}

unsafe extern "C" fn encoding_tokens(
    encoding: *const c_void,
    reserve: ReserveFn,
    args: *mut c_void,
    emplace: EmplaceFn,
) {
    let Some(encoding) = encoding_arg(encoding) else {
        return;
    };
    let tokens = encoding.get_tokens();
    reserve(tokens.len(), args);
    for token in tokens {
        emplace(args, token.as_ptr().cast(), token.len());
    }
}

unsafe extern "C" fn encode_batch(
    handle: *const c_void,
    inputs: *const c_void,
    count: usize,
    add_special_tokens: i32,
    nth: SubArrayFn,
) -> ForeignBuffer {
    guarded(ForeignBuffer::NULL, || {
        let tokenizer = tokenizer_arg(handle)?;
        let texts = (0..count)
            .map(|i| {
                let array = nth(inputs, i);
                str_arg(array.ptr.cast(), array.len)
            })
            .collect::<EngineResult<Vec<&str>>>()?;
        let encodings = tokenizer
            .encode_batch(texts, add_special_tokens != 0)
            .map_err(|e| e.to_string())?;
        Ok(export_vec(encodings))
    })
}

unsafe extern "C" fn decode(
    handle: *const c_void,
    ids: *const u32,
    len: usize,
    skip_special_tokens: i32,
) -> ForeignBuffer {
    guarded(ForeignBuffer::NULL, || {
        let ids = if ids.is_null() || len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(ids, len)
        };
        let text = tokenizer_arg(handle)?
            .decode(ids, skip_special_tokens != 0)
            .map_err(|e| e.to_string())?;
        Ok(export_string(text))
    })
}

unsafe extern "C" fn decode_batch(
    handle: *const c_void,
    inputs: *const c_void,
    count: usize,
    skip_special_tokens: i32,
    nth: SubArrayFn,
) -> ForeignBuffer {
    guarded(ForeignBuffer::NULL, || {
        let tokenizer = tokenizer_arg(handle)?;
        let sequences: Vec<&[u32]> = (0..count)
            .map(|i| {
                let array = nth(inputs, i);
                array.typed::<u32>().as_slice()
            })
            .collect();
        let texts = tokenizer
            .decode_batch(&sequences, skip_special_tokens != 0)
            .map_err(|e| e.to_string())?;
        Ok(export_vec(
            texts.into_iter().map(export_string).collect::<Vec<_>>(),
        ))
    })
}

unsafe extern "C" fn vocab_size(handle: *const c_void) -> usize {
    guarded(0, || Ok(tokenizer_arg(handle)?.get_vocab_size(true)))
}

/// Null when `id` is not in the vocabulary.
unsafe extern "C" fn id_to_token(handle: *const c_void, id: u32) -> ForeignBuffer {
    guarded(ForeignBuffer::NULL, || {
        Ok(tokenizer_arg(handle)?
            .id_to_token(id)
            .map_or(ForeignBuffer::NULL, export_string))
    })
}

unsafe extern "C" fn token_to_id(handle: *const c_void, token: *const u8, len: usize) -> u32 {
    guarded(TOKEN_NOT_FOUND, || {
        Ok(tokenizer_arg(handle)?
            .token_to_id(str_arg(token, len)?)
            .unwrap_or(TOKEN_NOT_FOUND))
    })
}

unsafe extern "C" fn free_tokenizer(handle: *mut c_void) {
    if !handle.is_null() {
        drop(Box::from_raw(handle.cast::<HfTokenizer>()));
    }
}

unsafe extern "C" fn free_encoding(encoding: *mut c_void) {
    if !encoding.is_null() {
        drop(Box::from_raw(encoding.cast::<HfEncoding>()));
    }
}

unsafe extern "C" fn free_encodings(encodings: ForeignBuffer) {
    if !encodings.is_null() {
        drop(reclaim_vec::<HfEncoding>(encodings));
    }
}

unsafe extern "C" fn free_string(text: ForeignBuffer) {
    if !text.is_null() {
        drop(reclaim_vec::<u8>(text));
    }
}

unsafe extern "C" fn free_strings(texts: ForeignBuffer) {
    if texts.is_null() {
        return;
    }
    for text in reclaim_vec::<ForeignBuffer>(texts) {
        free_string(text);
    }
}

/// Frees the outer array only; the strings now belong to the caller.
unsafe extern "C" fn free_strings_shallow(texts: ForeignBuffer) {
    if !texts.is_null() {
        drop(reclaim_vec::<ForeignBuffer>(texts));
    }
}

/// Null when the current thread has no recorded failure.
unsafe extern "C" fn take_last_error() -> ForeignBuffer {
    LAST_ERROR
        .with(|slot| slot.borrow_mut().take())
        .map_or(ForeignBuffer::NULL, export_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_error() -> Option<String> {
        let buf = unsafe { take_last_error() };
        if buf.is_null() {
            return None;
        }
        let msg = String::from_utf8(unsafe { buf.as_slice::<u8>() }.to_vec()).unwrap();
        unsafe { free_string(buf) };
        Some(msg)
    }

    #[test]
    fn test_invalid_json_records_error() {
        let json = b"{not json";
        let handle = unsafe { new_from_str(json.as_ptr(), json.len()) };
        assert!(handle.is_null());
        let msg = last_error().unwrap();
        assert!(msg.contains("tokenizer.json"), "{msg}");
        // Taking the error clears it.
        assert!(last_error().is_none());
    }

    #[test]
    fn test_null_handle_is_reported_not_dereferenced() {
        assert_eq!(unsafe { vocab_size(std::ptr::null()) }, 0);
        assert_eq!(last_error().as_deref(), Some("null tokenizer handle"));
        let ids = unsafe { encoding_ids(std::ptr::null()) };
        assert_eq!(ids.len, 0);
    }

    #[test]
    fn test_byte_level_bpe_json_rejects_bad_merges() {
        let err = byte_level_bpe_json(r#"{"a": 0}"#, "a b c", "").unwrap_err();
        assert!(err.contains("merges.txt"));
        let err = byte_level_bpe_json("[]", "", "").unwrap_err();
        assert!(err.contains("vocab.json"));
    }

    #[test]
    fn test_byte_level_bpe_json_merges_added_tokens() {
        let json =
            byte_level_bpe_json(r#"{"a": 0}"#, "#version: 0.2\n", r#"{"<s>": 5}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["model"]["vocab"]["<s>"], 5);
        assert_eq!(value["model"]["merges"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_exported_strings_roundtrip_through_free() {
        let outer = export_vec(vec![export_string("a".into()), export_string("bc".into())]);
        assert_eq!(outer.type_size, std::mem::size_of::<ForeignBuffer>());
        let inner: Vec<ForeignBuffer> = unsafe { outer.as_slice::<ForeignBuffer>() }.to_vec();
        assert_eq!(unsafe { inner[1].as_slice::<u8>() }, b"bc");
        unsafe { free_strings(outer) };
    }
}
