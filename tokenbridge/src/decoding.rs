//! Decoded text views

use std::borrow::Cow;
use std::fmt;
use std::str::Utf8Error;
use std::sync::Arc;

use crate::buffer::ArrayView;
use crate::encoding::Owner;
use crate::registry::Lease;

/// Decoded text plus whatever keeps its bytes alive.
///
/// The bytes may live in a string the engine allocated (held through a
/// registry lease), in a buffer this crate allocated, in a tokenizer's shared
/// vocabulary storage, or in static memory (no owner at all).
#[derive(Clone)]
pub struct Decoding {
    text: ArrayView<u8>,
    owner: Option<Owner>,
}

impl Decoding {
    /// Take ownership of a freshly built byte buffer.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let bytes = Arc::new(bytes);
        Self {
            text: ArrayView::from_slice(bytes.as_slice()),
            owner: Some(bytes),
        }
    }

    #[must_use]
    pub fn from_string(text: String) -> Self {
        Self::from_bytes(text.into_bytes())
    }

    /// Text that needs no release.
    #[must_use]
    pub fn from_static(text: &'static [u8]) -> Self {
        Self {
            text: ArrayView::from_slice(text),
            owner: None,
        }
    }

    /// View over a registered string allocation.
    #[must_use]
    pub fn from_lease(lease: Arc<Lease>) -> Self {
        // SAFETY: the lease pins the allocation for as long as `owner` lives.
        let text = unsafe { lease.handle().buffer().as_slice::<u8>() };
        Self {
            text: ArrayView::from_slice(text),
            owner: Some(lease),
        }
    }

    /// View into memory kept alive by `owner`.
    ///
    /// # Safety
    /// `text` must point into memory that `owner` keeps alive and unchanged.
    #[must_use]
    pub unsafe fn from_raw(text: ArrayView<u8>, owner: Owner) -> Self {
        Self {
            text,
            owner: Some(owner),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `owner` (or static storage) outlives `&self`.
        unsafe { self.text.as_slice() }
    }

    /// Borrow as UTF-8.
    ///
    /// # Errors
    /// Returns an error if the bytes are not valid UTF-8 (byte-level
    /// vocabularies can split a code point across tokens).
    pub fn to_str(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    #[must_use]
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether something has to be kept alive for this view.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}

impl AsRef<[u8]> for Decoding {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq<str> for Decoding {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for Decoding {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Display for Decoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for Decoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Decoding").field(&self.to_string_lossy()).finish()
    }
}
