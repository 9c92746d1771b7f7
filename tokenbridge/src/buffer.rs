//! Foreign allocations and the handles that own them
//!
//! A [`ForeignBuffer`] is a plain `{ptr, capacity, len, type_size}` descriptor
//! for memory some other allocator produced. It carries no ownership.
//! Ownership is expressed by wrapping it in a [`ForeignHandle`], which is
//! either *owning* (its drop runs the allocator's free routine exactly once)
//! or *parented* (a sub-range of another handle's allocation that keeps its
//! parent alive and never frees anything itself).

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Descriptor of an array allocated on the other side of the engine boundary.
///
/// Layout matches the engine's exported `Vec` so it can be passed by value
/// through `extern "C"` functions.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ForeignBuffer {
    pub ptr: *const c_void,
    pub capacity: usize,
    pub len: usize,
    pub type_size: usize,
}

// SAFETY: a descriptor is just an address and three integers; dereferencing
// it always goes through an `unsafe` accessor.
unsafe impl Send for ForeignBuffer {}
unsafe impl Sync for ForeignBuffer {}

impl ForeignBuffer {
    /// A descriptor that points at nothing.
    pub const NULL: Self = Self {
        ptr: std::ptr::null(),
        capacity: 0,
        len: 0,
        type_size: 0,
    };

    /// Descriptor for a single opaque engine object (a tokenizer or an
    /// encoding) known only by its pointer.
    #[must_use]
    pub fn opaque(ptr: *const c_void) -> Self {
        Self {
            ptr,
            capacity: 1,
            len: 1,
            type_size: 0,
        }
    }

    /// Address used as the buffer's identity.
    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr as usize
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Descriptor of element `index`, for arrays whose elements are
    /// themselves engine objects addressed by pointer.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    #[must_use]
    pub fn element(&self, index: usize) -> ForeignBuffer {
        assert!(index < self.len, "element {index} out of {}", self.len);
        ForeignBuffer {
            ptr: self.ptr.cast::<u8>().wrapping_add(index * self.type_size).cast(),
            capacity: 1,
            len: 1,
            type_size: self.type_size,
        }
    }

    /// View the buffer as a slice of `T`.
    ///
    /// # Safety
    /// The buffer must hold `len` initialised values of `T`, and the memory
    /// must outlive `'a`.
    #[must_use]
    pub unsafe fn as_slice<'a, T>(&self) -> &'a [T] {
        debug_assert!(self.is_null() || self.type_size == std::mem::size_of::<T>());
        if self.is_null() || self.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr.cast::<T>(), self.len)
        }
    }
}

impl fmt::Debug for ForeignBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignBuffer")
            .field("ptr", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("type_size", &self.type_size)
            .finish()
    }
}

/// Borrowed `(ptr, len)` pair returned by engine accessors.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawArray {
    pub ptr: *const c_void,
    pub len: usize,
}

impl RawArray {
    pub const EMPTY: Self = Self {
        ptr: std::ptr::null(),
        len: 0,
    };

    #[must_use]
    pub fn from_slice<T>(values: &[T]) -> Self {
        Self {
            ptr: values.as_ptr().cast(),
            len: values.len(),
        }
    }

    /// Reinterpret as a typed view.
    ///
    /// # Safety
    /// `ptr` must address `len` values of `T`, which must stay alive for as
    /// long as the view is read.
    #[must_use]
    pub unsafe fn typed<T>(self) -> ArrayView<T> {
        ArrayView::from_raw(self.ptr.cast::<T>(), self.len)
    }
}

/// Non-owning view into memory kept alive by something else.
///
/// The view itself never dereferences; readers go through
/// [`ArrayView::as_slice`], whose caller must hold the owner.
pub struct ArrayView<T> {
    ptr: *const T,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for ArrayView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArrayView<T> {}

// SAFETY: the view is an address and a length; access is gated by `unsafe`
// and the owner it is paired with is itself `Send + Sync`.
unsafe impl<T: Sync> Send for ArrayView<T> {}
unsafe impl<T: Sync> Sync for ArrayView<T> {}

impl<T> ArrayView<T> {
    /// # Safety
    /// See [`RawArray::typed`].
    #[must_use]
    pub unsafe fn from_raw(ptr: *const T, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// View over a slice whose heap storage is pinned by an owner that
    /// outlives the view.
    #[must_use]
    pub fn from_slice(slice: &[T]) -> Self {
        Self {
            ptr: slice.as_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The memory behind the view must be alive for `'a`.
    #[must_use]
    pub unsafe fn as_slice<'a>(&self) -> &'a [T] {
        if self.ptr.is_null() || self.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr, self.len)
        }
    }
}

impl<T> fmt::Debug for ArrayView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayView({:p}, {})", self.ptr, self.len)
    }
}

/// Kind of allocation an owning handle frees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnedKind {
    String,
    Encoding,
    EncodingArray,
    Tokenizer,
}

/// Every kind of handle a registry record can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Owned(OwnedKind),
    /// A view into a parent's allocation; never freed on its own.
    Parented,
}

/// Free routine run once when the last strong reference to an owning handle
/// goes away.
pub type ReleaseFn = Box<dyn FnOnce(ForeignBuffer) + Send + Sync>;

enum Ownership {
    Owning {
        kind: OwnedKind,
        release: Option<ReleaseFn>,
    },
    Parented {
        parent: Arc<ForeignHandle>,
    },
}

/// Owner of one foreign allocation (or of a view into one).
///
/// Shared through `Arc`; whichever holder drops the last strong reference
/// triggers the free routine. Parented handles have no free routine at all,
/// so a sub-range can never be freed independently of its parent.
pub struct ForeignHandle {
    buffer: ForeignBuffer,
    ownership: Ownership,
}

impl ForeignHandle {
    /// Take ownership of `buffer`.
    ///
    /// # Safety
    /// The caller must be the sole owner of the allocation: no other
    /// `ForeignHandle` may be created for it, and `release` must be the
    /// matching free routine for its allocator.
    #[must_use]
    pub unsafe fn owning(buffer: ForeignBuffer, kind: OwnedKind, release: ReleaseFn) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            ownership: Ownership::Owning {
                kind,
                release: Some(release),
            },
        })
    }

    /// A view into `parent`'s allocation. Keeps `parent` alive.
    #[must_use]
    pub fn parented(buffer: ForeignBuffer, parent: &Arc<ForeignHandle>) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            ownership: Ownership::Parented {
                parent: Arc::clone(parent),
            },
        })
    }

    #[must_use]
    pub fn buffer(&self) -> ForeignBuffer {
        self.buffer
    }

    /// Underlying address, the handle's identity in a registry.
    #[must_use]
    pub fn address(&self) -> usize {
        self.buffer.address()
    }

    #[must_use]
    pub fn kind(&self) -> HandleKind {
        match &self.ownership {
            Ownership::Owning { kind, .. } => HandleKind::Owned(*kind),
            Ownership::Parented { .. } => HandleKind::Parented,
        }
    }

    /// Parent handle for parented views.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<ForeignHandle>> {
        match &self.ownership {
            Ownership::Owning { .. } => None,
            Ownership::Parented { parent } => Some(parent),
        }
    }
}

impl Drop for ForeignHandle {
    fn drop(&mut self) {
        match &mut self.ownership {
            Ownership::Owning { kind, release } => {
                if let Some(release) = release.take() {
                    if !self.buffer.is_null() {
                        tracing::trace!(
                            address = self.buffer.address(),
                            ?kind,
                            "freeing foreign allocation"
                        );
                        release(self.buffer);
                    }
                }
            }
            // Parent's strong ref is dropped with `self`.
            Ownership::Parented { .. } => {}
        }
    }
}

impl fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHandle")
            .field("buffer", &self.buffer)
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leak_vec(v: Vec<u32>) -> ForeignBuffer {
        let mut v = std::mem::ManuallyDrop::new(v);
        ForeignBuffer {
            ptr: v.as_mut_ptr().cast(),
            capacity: v.capacity(),
            len: v.len(),
            type_size: std::mem::size_of::<u32>(),
        }
    }

    fn counting_release(counter: &Arc<AtomicUsize>) -> ReleaseFn {
        let counter = Arc::clone(counter);
        Box::new(move |buf: ForeignBuffer| {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(unsafe { Vec::from_raw_parts(buf.ptr as *mut u32, buf.len, buf.capacity) });
        })
    }

    #[test]
    fn test_owning_handle_frees_once_on_last_drop() {
        let freed = Arc::new(AtomicUsize::new(0));
        let handle = unsafe {
            ForeignHandle::owning(leak_vec(vec![1, 2, 3]), OwnedKind::Encoding, counting_release(&freed))
        };
        let other = Arc::clone(&handle);
        drop(handle);
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        assert_eq!(unsafe { other.buffer().as_slice::<u32>() }, &[1, 2, 3]);
        drop(other);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parented_handle_keeps_parent_alive() {
        let freed = Arc::new(AtomicUsize::new(0));
        let parent = unsafe {
            ForeignHandle::owning(
                leak_vec(vec![7, 8, 9]),
                OwnedKind::EncodingArray,
                counting_release(&freed),
            )
        };
        let child = ForeignHandle::parented(parent.buffer().element(2), &parent);
        assert_eq!(child.kind(), HandleKind::Parented);
        assert!(Arc::ptr_eq(child.parent().unwrap(), &parent));
        assert!(parent.parent().is_none());
        drop(parent);
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        assert_eq!(unsafe { child.buffer().as_slice::<u32>() }, &[9]);
        drop(child);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_buffer_is_not_released() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&freed);
        let handle = unsafe {
            ForeignHandle::owning(
                ForeignBuffer::NULL,
                OwnedKind::String,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        drop(handle);
        assert_eq!(freed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_view_is_empty_slice() {
        let view: ArrayView<u32> = unsafe { RawArray::EMPTY.typed() };
        assert!(view.is_empty());
        assert!(unsafe { view.as_slice() }.is_empty());
    }
}
