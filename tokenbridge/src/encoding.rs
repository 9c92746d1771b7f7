//! Encoding results and padded batch blocks
//!
//! An [`Encoding`] is a set of zero-copy views (ids, type ids, token texts,
//! masks) plus one strong [`Owner`] reference to whatever backs them. The
//! owner is either a local payload allocated by this crate or a registry
//! lease on engine memory. Each row carved out of an engine batch has its own
//! owner, and every such owner holds a share of the batch's lease.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::ops::Index;
use std::sync::{Arc, OnceLock};

use crate::buffer::ArrayView;

/// Strong reference keeping the memory behind a set of views alive.
pub type Owner = Arc<dyn Any + Send + Sync>;

/// Value short rows are padded with when no pad id is configured.
pub const DEFAULT_PAD_ID: u32 = 0;

/// Owned fields for an encoding built inside this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodingParts {
    pub ids: Vec<u32>,
    pub type_ids: Option<Vec<u32>>,
    pub tokens: Option<Vec<String>>,
    pub special_tokens_mask: Option<Vec<u32>>,
    pub attention_mask: Option<Vec<u32>>,
}

/// Views into memory owned elsewhere, as read back from an engine.
#[derive(Debug, Clone)]
pub struct RawEncoding {
    pub ids: ArrayView<u32>,
    pub type_ids: Option<ArrayView<u32>>,
    pub tokens: Option<Vec<ArrayView<u8>>>,
    pub special_tokens_mask: Option<ArrayView<u32>>,
    pub attention_mask: Option<ArrayView<u32>>,
}

/// Result of encoding one text.
#[derive(Clone)]
pub struct Encoding {
    raw: RawEncoding,
    owner: Owner,
}

fn view_opt(v: Option<&Vec<u32>>) -> Option<ArrayView<u32>> {
    v.map(|v| ArrayView::from_slice(v))
}

impl Encoding {
    /// Encoding carrying only ids, as the trie and SentencePiece backends
    /// produce.
    #[must_use]
    pub fn from_ids(ids: Vec<u32>) -> Self {
        Self::from_parts(EncodingParts {
            ids,
            ..EncodingParts::default()
        })
    }

    #[must_use]
    pub fn from_parts(parts: EncodingParts) -> Self {
        let parts = Arc::new(parts);
        let raw = RawEncoding {
            ids: ArrayView::from_slice(&parts.ids),
            type_ids: view_opt(parts.type_ids.as_ref()),
            tokens: parts
                .tokens
                .as_ref()
                .map(|t| t.iter().map(|s| ArrayView::from_slice(s.as_bytes())).collect()),
            special_tokens_mask: view_opt(parts.special_tokens_mask.as_ref()),
            attention_mask: view_opt(parts.attention_mask.as_ref()),
        };
        Self { raw, owner: parts }
    }

    /// Wrap views into engine memory.
    ///
    /// # Safety
    /// Every view in `raw` must point into memory that `owner` keeps alive and
    /// unchanged for as long as `owner` lives.
    #[must_use]
    pub unsafe fn from_raw(raw: RawEncoding, owner: Owner) -> Self {
        Self { raw, owner }
    }

    #[must_use]
    pub fn ids(&self) -> &[u32] {
        // SAFETY (all accessors): `owner` outlives `&self`.
        unsafe { self.raw.ids.as_slice() }
    }

    #[must_use]
    pub fn type_ids(&self) -> Option<&[u32]> {
        self.raw.type_ids.as_ref().map(|v| unsafe { v.as_slice() })
    }

    /// Token texts. Borrowed when the engine handed back valid UTF-8.
    #[must_use]
    pub fn tokens(&self) -> Option<Vec<Cow<'_, str>>> {
        self.raw.tokens.as_ref().map(|tokens| {
            tokens
                .iter()
                .map(|t| String::from_utf8_lossy(unsafe { t.as_slice() }))
                .collect()
        })
    }

    #[must_use]
    pub fn special_tokens_mask(&self) -> Option<&[u32]> {
        self.raw
            .special_tokens_mask
            .as_ref()
            .map(|v| unsafe { v.as_slice() })
    }

    #[must_use]
    pub fn attention_mask(&self) -> Option<&[u32]> {
        self.raw
            .attention_mask
            .as_ref()
            .map(|v| unsafe { v.as_slice() })
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.ids.is_empty()
    }
    /// Longest of the fields present in this encoding.
    fn row_len(&self) -> usize {
        [
            Some(self.ids()),
            self.type_ids(),
            self.attention_mask(),
        ]
        .into_iter()
        .flatten()
        .map(<[u32]>::len)
        .max()
        .unwrap_or(0)
    }
}

impl PartialEq for Encoding {
    fn eq(&self, other: &Self) -> bool {
        self.ids() == other.ids()
            && self.type_ids() == other.type_ids()
            && self.tokens() == other.tokens()
            && self.special_tokens_mask() == other.special_tokens_mask()
            && self.attention_mask() == other.attention_mask()
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoding")
            .field("ids", &self.ids())
            .field("type_ids", &self.type_ids())
            .field("tokens", &self.tokens())
            .field("special_tokens_mask", &self.special_tokens_mask())
            .field("attention_mask", &self.attention_mask())
            .finish()
    }
}

/// Row-major `rows x cols` block of right-padded values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBlock {
    data: Vec<u32>,
    rows: usize,
    cols: usize,
}

impl PaddedBlock {
    fn build<'a>(
        rows: impl ExactSizeIterator<Item = Option<&'a [u32]>>,
        cols: usize,
        pad: u32,
    ) -> Self {
        let n = rows.len();
        let mut data = vec![pad; n * cols];
        for (i, row) in rows.enumerate() {
            if let Some(row) = row {
                data[i * cols..i * cols + row.len()].copy_from_slice(row);
            }
        }
        Self {
            data,
            rows: n,
            cols,
        }
    }

    /// `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    /// # Panics
    /// Panics if `i >= rows`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[u32] {
        assert!(i < self.rows, "row {i} out of {}", self.rows);
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<u32> {
        if row < self.rows && col < self.cols {
            Some(self.data[row * self.cols + col])
        } else {
            None
        }
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u32> {
        self.data
    }
}

/// Rectangular form of a batch, ready for a numeric layer.
///
/// A block is present only if at least one row carries that field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub max_len: usize,
    pub input_ids: Option<PaddedBlock>,
    pub attention_mask: Option<PaddedBlock>,
    pub token_type_ids: Option<PaddedBlock>,
}

impl PaddedBatch {
    fn from_encodings(encodings: &[Encoding], pad_id: u32) -> Self {
        let max_len = encodings.iter().map(Encoding::row_len).max().unwrap_or(0);

        let block = |field: fn(&Encoding) -> Option<&[u32]>, pad: u32| {
            if encodings.iter().any(|e| field(e).is_some()) {
                Some(PaddedBlock::build(encodings.iter().map(field), max_len, pad))
            } else {
                None
            }
        };

        Self {
            max_len,
            input_ids: block(|e| Some(e.ids()), pad_id),
            attention_mask: block(Encoding::attention_mask, 0),
            token_type_ids: block(Encoding::type_ids, 0),
        }
    }
}

/// Ordered encodings plus a lazily built padded block.
///
/// The block is computed at most once, on first [`padded`](Self::padded).
/// Every mutable access to the rows discards it so it can never go stale.
#[derive(Debug, Clone, Default)]
pub struct EncodingBatch {
    encodings: Vec<Encoding>,
    pad_id: u32,
    padded: OnceLock<PaddedBatch>,
}

impl EncodingBatch {
    #[must_use]
    pub fn new(encodings: Vec<Encoding>) -> Self {
        Self {
            encodings,
            pad_id: DEFAULT_PAD_ID,
            padded: OnceLock::new(),
        }
    }

    /// Use `pad_id` for padding the id block.
    #[must_use]
    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self.padded.take();
        self
    }

    #[must_use]
    pub fn encodings(&self) -> &[Encoding] {
        &self.encodings
    }

    /// Mutable rows. Discards any padded block already built.
    pub fn encodings_mut(&mut self) -> &mut Vec<Encoding> {
        self.padded.take();
        &mut self.encodings
    }

    pub fn push(&mut self, encoding: Encoding) {
        self.encodings_mut().push(encoding);
    }

    #[must_use]
    pub fn get(&self, i: usize) -> Option<&Encoding> {
        self.encodings.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Encoding> {
        self.encodings.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    #[must_use]
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Padded rectangular block, built on first call.
    pub fn padded(&self) -> &PaddedBatch {
        self.padded
            .get_or_init(|| PaddedBatch::from_encodings(&self.encodings, self.pad_id))
    }

    /// Whether the padded block has been built and is still current.
    #[must_use]
    pub fn is_padded(&self) -> bool {
        self.padded.get().is_some()
    }

    #[must_use]
    pub fn into_encodings(self) -> Vec<Encoding> {
        self.encodings
    }
}

impl From<Vec<Encoding>> for EncodingBatch {
    fn from(encodings: Vec<Encoding>) -> Self {
        Self::new(encodings)
    }
}

impl FromIterator<Encoding> for EncodingBatch {
    fn from_iter<I: IntoIterator<Item = Encoding>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Index<usize> for EncodingBatch {
    type Output = Encoding;

    fn index(&self, i: usize) -> &Encoding {
        &self.encodings[i]
    }
}

impl<'a> IntoIterator for &'a EncodingBatch {
    type Item = &'a Encoding;
    type IntoIter = std::slice::Iter<'a, Encoding>;

    fn into_iter(self) -> Self::IntoIter {
        self.encodings.iter()
    }
}

impl IntoIterator for EncodingBatch {
    type Item = Encoding;
    type IntoIter = std::vec::IntoIter<Encoding>;

    fn into_iter(self) -> Self::IntoIter {
        self.encodings.into_iter()
    }
}
