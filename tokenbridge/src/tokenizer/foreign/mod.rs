//! Adapter for a subword engine reached through a C-style function table
//!
//! The engine allocates everything it returns. Each allocation is wrapped in
//! an owning [`ForeignHandle`] carrying the engine's matching free routine,
//! registered in a [`HandleRegistry`] through a [`Lease`], and read through
//! zero-copy views. Batch rows are parented views into the batch array and
//! share its lease.

mod engine;

use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use engine::HF_ENGINE;

use super::Tokenizer;
use crate::buffer::{ArrayView, ForeignBuffer, ForeignHandle, OwnedKind, RawArray, ReleaseFn};
use crate::config::BackendKind;
use crate::encoding::{Owner, RawEncoding};
use crate::registry::{HandleKey, HandleRegistry, Lease};
use crate::{Decoding, Encoding, EncodingBatch, Error, Result};

/// Caller-side allocator: make room for `len` elements in the container
/// behind `args`.
pub type ReserveFn = unsafe extern "C" fn(len: usize, args: *mut c_void) -> *mut c_void;

/// Caller-side allocator: append the `(ptr, len)` element to the container
/// behind `args`.
pub type EmplaceFn = unsafe extern "C" fn(args: *mut c_void, ptr: *const c_void, len: usize);

/// Resolve sub-array `index` of the caller's batch input at `base`.
pub type SubArrayFn = unsafe extern "C" fn(base: *const c_void, index: usize) -> RawArray;

/// Entry points of a subword engine.
///
/// Tokenizer and encoding handles are opaque pointers. Arrays and strings
/// come back as [`ForeignBuffer`]s that must be returned through the
/// matching `free_*` entry. A null return means failure; the reason is
/// available from `take_last_error` on the same thread.
#[repr(C)]
pub struct EngineApi {
    pub new_from_str: unsafe extern "C" fn(json: *const u8, len: usize) -> *mut c_void,
    pub new_from_byte_level_bpe: unsafe extern "C" fn(
        vocab: *const u8,
        vocab_len: usize,
        merges: *const u8,
        merges_len: usize,
        added_tokens: *const u8,
        added_tokens_len: usize,
    ) -> *mut c_void,
    pub encode: unsafe extern "C" fn(
        tokenizer: *const c_void,
        text: *const u8,
        len: usize,
        add_special_tokens: i32,
    ) -> *mut c_void,
    pub encoding_ids: unsafe extern "C" fn(encoding: *const c_void) -> RawArray,
    pub encoding_type_ids: unsafe extern "C" fn(encoding: *const c_void) -> RawArray,
    pub encoding_special_tokens_mask: unsafe extern "C" fn(encoding: *const c_void) -> RawArray,
    pub encoding_attention_mask: unsafe extern "C" fn(encoding: *const c_void) -> RawArray,
    pub encoding_tokens: unsafe extern "C" fn(
        encoding: *const c_void,
        reserve: ReserveFn,
        args: *mut c_void,
        emplace: EmplaceFn,
    ),
    /// Element `i` of the result is an encoding handle at
    /// `ptr + i * type_size`.
    pub encode_batch: unsafe extern "C" fn(
        tokenizer: *const c_void,
        inputs: *const c_void,
        count: usize,
        add_special_tokens: i32,
        nth: SubArrayFn,
    ) -> ForeignBuffer,
    pub decode: unsafe extern "C" fn(
        tokenizer: *const c_void,
        ids: *const u32,
        len: usize,
        skip_special_tokens: i32,
    ) -> ForeignBuffer,
    /// Array of string buffers.
    pub decode_batch: unsafe extern "C" fn(
        tokenizer: *const c_void,
        inputs: *const c_void,
        count: usize,
        skip_special_tokens: i32,
        nth: SubArrayFn,
    ) -> ForeignBuffer,
    pub vocab_size: unsafe extern "C" fn(tokenizer: *const c_void) -> usize,
    /// Null buffer when the id is not in the vocabulary.
    pub id_to_token: unsafe extern "C" fn(tokenizer: *const c_void, id: u32) -> ForeignBuffer,
    /// `u32::MAX` when the token is not in the vocabulary.
    pub token_to_id:
        unsafe extern "C" fn(tokenizer: *const c_void, token: *const u8, len: usize) -> u32,
    pub free_tokenizer: unsafe extern "C" fn(tokenizer: *mut c_void),
    pub free_encoding: unsafe extern "C" fn(encoding: *mut c_void),
    pub free_encodings: unsafe extern "C" fn(encodings: ForeignBuffer),
    pub free_string: unsafe extern "C" fn(text: ForeignBuffer),
    /// Frees the array and every string in it.
    pub free_strings: unsafe extern "C" fn(texts: ForeignBuffer),
    /// Frees the array only.
    pub free_strings_shallow: unsafe extern "C" fn(texts: ForeignBuffer),
    pub take_last_error: unsafe extern "C" fn() -> ForeignBuffer,
}

unsafe extern "C" fn reserve_views(len: usize, args: *mut c_void) -> *mut c_void {
    let views = &mut *args.cast::<Vec<ArrayView<u8>>>();
    views.reserve(len);
    args
}

unsafe extern "C" fn emplace_view(args: *mut c_void, ptr: *const c_void, len: usize) {
    let views = &mut *args.cast::<Vec<ArrayView<u8>>>();
    views.push(ArrayView::from_raw(ptr.cast(), len));
}

unsafe extern "C" fn nth_array(base: *const c_void, index: usize) -> RawArray {
    *base.cast::<RawArray>().add(index)
}

/// Registry shares held by one row of a batch: the row's own parented
/// record plus the batch array it points into.
struct BatchRow {
    _row: Lease,
    _batch: Arc<Lease>,
}

/// Tokenizer backed by an [`EngineApi`].
///
/// Cheap to clone; clones share the engine's tokenizer handle.
#[derive(Clone)]
pub struct ForeignTokenizer {
    api: &'static EngineApi,
    registry: HandleRegistry,
    tokenizer: Arc<Lease>,
    pad_id: u32,
}

impl ForeignTokenizer {
    /// Build from a serialized `tokenizer.json` on the `tokenizers` engine.
    ///
    /// # Errors
    /// Returns [`Error::Foreign`] with the engine's message if it rejects
    /// the blob.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        // SAFETY: HF_ENGINE upholds the `EngineApi` contract.
        unsafe { Self::from_json_in(&HF_ENGINE, HandleRegistry::global(), json) }
    }

    /// Load a `tokenizer.json` from disk.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file cannot be read, or
    /// [`Error::Foreign`] if the engine rejects its contents.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Build a byte-level BPE tokenizer from `vocab.json`, `merges.txt` and
    /// `added_tokens.json` contents. Pass `""` when there are no added tokens.
    ///
    /// # Errors
    /// Returns [`Error::Foreign`] if any of the inputs is malformed.
    pub fn from_byte_level_bpe(vocab: &str, merges: &str, added_tokens: &str) -> Result<Self> {
        // SAFETY: HF_ENGINE upholds the `EngineApi` contract.
        unsafe {
            Self::from_byte_level_bpe_in(
                &HF_ENGINE,
                HandleRegistry::global(),
                vocab,
                merges,
                added_tokens,
            )
        }
    }

    /// [`Self::from_json`] on an explicit engine and registry.
    ///
    /// # Safety
    /// Every entry of `api` must behave as [`EngineApi`] documents.
    ///
    /// # Errors
    /// Returns [`Error::Foreign`] if the engine rejects the blob.
    pub unsafe fn from_json_in(
        api: &'static EngineApi,
        registry: &HandleRegistry,
        json: &[u8],
    ) -> Result<Self> {
        let raw = (api.new_from_str)(json.as_ptr(), json.len());
        Self::adopt(api, registry, raw, "new_from_str")
    }

    /// [`Self::from_byte_level_bpe`] on an explicit engine and registry.
    ///
    /// # Safety
    /// Every entry of `api` must behave as [`EngineApi`] documents.
    ///
    /// # Errors
    /// Returns [`Error::Foreign`] if any of the inputs is malformed.
    pub unsafe fn from_byte_level_bpe_in(
        api: &'static EngineApi,
        registry: &HandleRegistry,
        vocab: &str,
        merges: &str,
        added_tokens: &str,
    ) -> Result<Self> {
        let raw = (api.new_from_byte_level_bpe)(
            vocab.as_ptr(),
            vocab.len(),
            merges.as_ptr(),
            merges.len(),
            added_tokens.as_ptr(),
            added_tokens.len(),
        );
        Self::adopt(api, registry, raw, "new_from_byte_level_bpe")
    }

    unsafe fn adopt(
        api: &'static EngineApi,
        registry: &HandleRegistry,
        raw: *mut c_void,
        call: &str,
    ) -> Result<Self> {
        if raw.is_null() {
            return Err(engine_error(api, call));
        }
        let handle = ForeignHandle::owning(
            ForeignBuffer::opaque(raw),
            OwnedKind::Tokenizer,
            release_object(api.free_tokenizer),
        );
        let tokenizer = Arc::new(Lease::new(registry, handle));
        tracing::debug!(
            address = tokenizer.key().address(),
            "foreign tokenizer created"
        );
        Ok(Self {
            api,
            registry: registry.clone(),
            tokenizer,
            pad_id: 0,
        })
    }

    #[must_use]
    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    /// Registry this tokenizer's allocations are recorded in.
    #[must_use]
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Registry key of the engine's tokenizer handle.
    #[must_use]
    pub fn handle_key(&self) -> HandleKey {
        self.tokenizer.key()
    }

    fn raw(&self) -> *const c_void {
        self.tokenizer.handle().buffer().ptr
    }

    /// Wrap an engine string and register it.
    fn adopt_string(&self, buf: ForeignBuffer) -> Decoding {
        if buf.capacity == 0 {
            // Empty strings share one dangling address; nothing to keep alive.
            unsafe { (self.api.free_string)(buf) };
            return Decoding::from_static(b"");
        }
        // SAFETY: the engine handed over sole ownership of `buf`.
        let handle = unsafe {
            ForeignHandle::owning(buf, OwnedKind::String, release_buffer(self.api.free_string))
        };
        Decoding::from_lease(Arc::new(Lease::new(&self.registry, handle)))
    }

    /// Read every field of an encoding through the accessor entries.
    ///
    /// # Safety
    /// `encoding` must be a live encoding handle of this engine.
    unsafe fn read_encoding(&self, encoding: *const c_void) -> RawEncoding {
        let mut tokens: Vec<ArrayView<u8>> = Vec::new();
        (self.api.encoding_tokens)(
            encoding,
            reserve_views,
            std::ptr::addr_of_mut!(tokens).cast(),
            emplace_view,
        );
        RawEncoding {
            ids: (self.api.encoding_ids)(encoding).typed(),
            type_ids: Some((self.api.encoding_type_ids)(encoding).typed()),
            tokens: Some(tokens),
            special_tokens_mask: Some((self.api.encoding_special_tokens_mask)(encoding).typed()),
            attention_mask: Some((self.api.encoding_attention_mask)(encoding).typed()),
        }
    }
}

/// Pending error message on this thread, if the engine recorded one.
fn last_engine_message(api: &EngineApi) -> Option<String> {
    let buf = unsafe { (api.take_last_error)() };
    if buf.is_null() {
        return None;
    }
    let message = String::from_utf8_lossy(unsafe { buf.as_slice::<u8>() }).into_owned();
    unsafe { (api.free_string)(buf) };
    Some(message)
}

fn engine_error(api: &EngineApi, call: &str) -> Error {
    match last_engine_message(api) {
        Some(message) => {
            tracing::debug!(call, %message, "engine call failed");
            Error::Foreign(format!("{call}: {message}"))
        }
        None => Error::Foreign(format!("{call} failed")),
    }
}

fn release_buffer(free: unsafe extern "C" fn(ForeignBuffer)) -> ReleaseFn {
    Box::new(move |buf| unsafe { free(buf) })
}

fn release_object(free: unsafe extern "C" fn(*mut c_void)) -> ReleaseFn {
    Box::new(move |buf| unsafe { free(buf.ptr.cast_mut()) })
}

impl Tokenizer for ForeignTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding> {
        let raw = unsafe {
            (self.api.encode)(
                self.raw(),
                text.as_ptr(),
                text.len(),
                i32::from(add_special_tokens),
            )
        };
        if raw.is_null() {
            return Err(engine_error(self.api, "encode"));
        }
        // SAFETY: the engine handed over sole ownership of `raw`.
        let handle = unsafe {
            ForeignHandle::owning(
                ForeignBuffer::opaque(raw),
                OwnedKind::Encoding,
                release_object(self.api.free_encoding),
            )
        };
        let owner: Owner = Arc::new(Lease::new(&self.registry, handle));
        // SAFETY: the lease keeps the encoding alive as long as the views.
        Ok(unsafe { Encoding::from_raw(self.read_encoding(raw), owner) })
    }

    fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<EncodingBatch> {
        if texts.is_empty() {
            return Ok(EncodingBatch::default().with_pad_id(self.pad_id));
        }
        let inputs: Vec<RawArray> = texts
            .iter()
            .map(|text| RawArray::from_slice(text.as_bytes()))
            .collect();
        let buf = unsafe {
            (self.api.encode_batch)(
                self.raw(),
                inputs.as_ptr().cast(),
                inputs.len(),
                i32::from(add_special_tokens),
                nth_array,
            )
        };
        if buf.is_null() {
            return Err(engine_error(self.api, "encode_batch"));
        }
        // SAFETY: the engine handed over sole ownership of `buf`.
        let array = unsafe {
            ForeignHandle::owning(
                buf,
                OwnedKind::EncodingArray,
                release_buffer(self.api.free_encodings),
            )
        };
        let batch = Arc::new(Lease::new(&self.registry, array));
        if buf.len != texts.len() {
            return Err(Error::Integrity(format!(
                "engine returned {} encodings for {} inputs",
                buf.len,
                texts.len()
            )));
        }

        let encodings = (0..buf.len)
            .map(|i| {
                let row = ForeignHandle::parented(buf.element(i), batch.handle());
                // SAFETY: element `i` is an encoding kept alive by the array.
                let raw = unsafe { self.read_encoding(row.buffer().ptr) };
                let owner: Owner = Arc::new(BatchRow {
                    _row: Lease::new(&self.registry, row),
                    _batch: Arc::clone(&batch),
                });
                // SAFETY: `owner` pins the array the views point into.
                unsafe { Encoding::from_raw(raw, owner) }
            })
            .collect();
        Ok(EncodingBatch::new(encodings).with_pad_id(self.pad_id))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<Decoding> {
        let buf = unsafe {
            (self.api.decode)(
                self.raw(),
                ids.as_ptr(),
                ids.len(),
                i32::from(skip_special_tokens),
            )
        };
        if buf.is_null() {
            return Err(engine_error(self.api, "decode"));
        }
        Ok(self.adopt_string(buf))
    }

    fn decode_batch(&self, ids_batch: &[&[u32]], skip_special_tokens: bool) -> Result<Vec<Decoding>> {
        if ids_batch.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<RawArray> = ids_batch.iter().map(|ids| RawArray::from_slice(ids)).collect();
        let outer = unsafe {
            (self.api.decode_batch)(
                self.raw(),
                inputs.as_ptr().cast(),
                inputs.len(),
                i32::from(skip_special_tokens),
                nth_array,
            )
        };
        if outer.is_null() {
            return Err(engine_error(self.api, "decode_batch"));
        }
        // Each string gets its own owner before the outer array goes.
        let strings: Vec<ForeignBuffer> = unsafe { outer.as_slice::<ForeignBuffer>() }.to_vec();
        unsafe { (self.api.free_strings_shallow)(outer) };
        let decoded: Vec<Decoding> = strings.into_iter().map(|s| self.adopt_string(s)).collect();
        if decoded.len() != ids_batch.len() {
            return Err(Error::Integrity(format!(
                "engine returned {} strings for {} inputs",
                decoded.len(),
                ids_batch.len()
            )));
        }
        Ok(decoded)
    }

    fn vocab_size(&self) -> Result<usize> {
        match unsafe { (self.api.vocab_size)(self.raw()) } {
            0 => match last_engine_message(self.api) {
                Some(message) => Err(Error::Foreign(format!("vocab_size: {message}"))),
                None => Err(Error::Integrity("engine reports an empty vocabulary".into())),
            },
            n => Ok(n),
        }
    }

    /// Empty text when `id` is not in the vocabulary.
    fn id_to_token(&self, id: u32) -> Result<Decoding> {
        let buf = unsafe { (self.api.id_to_token)(self.raw(), id) };
        if buf.is_null() {
            return Ok(Decoding::from_static(b""));
        }
        Ok(self.adopt_string(buf))
    }

    fn token_to_id(&self, token: &str) -> u32 {
        unsafe { (self.api.token_to_id)(self.raw(), token.as_ptr(), token.len()) }
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Foreign
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

impl fmt::Debug for ForeignTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignTokenizer")
            .field("handle", &self.tokenizer.key())
            .field("pad_id", &self.pad_id)
            .finish_non_exhaustive()
    }
}
