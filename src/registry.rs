//! Named in-memory buffer registry.
//!
//! The registry maps a textual name to a multi-dimensional complex-float buffer so that
//! the pipeline and the engine can exchange arrays without going through CFL files.
//! Each entry records how its memory must be released:
//!
//! - [`Storage::Malloc`]: memory from the C allocator, released with `free`.
//! - [`Storage::Array`]: memory from the Rust array allocator, released by dropping the box.
//! - [`Storage::Borrowed`]: caller memory, never released by the registry.
//!
//! The deallocation strategy is carried by the variant itself, so releasing an entry is
//! just dropping it. Borrowed entries hold a `&'a mut` slice, which ties the registry's
//! lifetime to the memory it borrows.
//!
//! # Example
//!
//! ```
//! use bart_bridge::registry::BufferRegistry;
//! use num_complex::Complex32;
//!
//! let mut kspace = vec![Complex32::new(1.0, 0.0); 8];
//! let mut registry = BufferRegistry::new();
//! registry.register_borrowed("meas_gadgetron", &[2, 4], &mut kspace)?;
//!
//! let mut dims = [0usize; 16];
//! let data = registry.lookup("meas_gadgetron", &mut dims)?;
//! assert_eq!(data.len(), 8);
//! assert_eq!(&dims[..3], &[2, 4, 0]);
//!
//! registry.release_all();
//! registry.release_all(); // no-op
//! # Ok::<(), bart_bridge::error::BridgeError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use num_complex::Complex32;
use tracing::{debug, trace};

use crate::error::{BridgeError, BridgeResult};

/// Maximum number of axes a registered buffer may have.
pub const MAX_DIMS: usize = 16;

/// How an entry's memory is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Owned, released with the C allocator's `free`.
    OwnedMalloc,
    /// Owned, released through the Rust array allocator.
    OwnedArray,
    /// Not owned; the registering component keeps responsibility for the memory.
    Borrowed,
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OwnedMalloc => write!(f, "owned (malloc)"),
            Self::OwnedArray => write!(f, "owned (array)"),
            Self::Borrowed => write!(f, "borrowed"),
        }
    }
}

/// Complex-float buffer allocated with the C allocator.
///
/// Dropping the buffer calls `libc::free`. This is the storage for data produced by
/// C code (`malloc`/`calloc`) whose ownership is handed to the registry.
pub struct MallocBuffer {
    ptr: NonNull<Complex32>,
    len: usize,
}

// SAFETY: MallocBuffer uniquely owns its allocation, like Box<[Complex32]>.
unsafe impl Send for MallocBuffer {}
unsafe impl Sync for MallocBuffer {}

impl MallocBuffer {
    /// Allocate `len` zeroed elements with `calloc`.
    #[allow(unsafe_code)]
    pub fn zeroed(len: usize) -> BridgeResult<Self> {
        // calloc(0, ..) may return null; keep at least one element allocated.
        // SAFETY: calloc has no preconditions; the result is checked for null.
        let raw = unsafe { libc::calloc(len.max(1), std::mem::size_of::<Complex32>()) };
        let ptr = NonNull::new(raw.cast::<Complex32>()).ok_or_else(|| {
            BridgeError::InvalidShape(format!("calloc failed for {len} complex elements"))
        })?;
        Ok(Self { ptr, len })
    }

    /// Take ownership of `len` elements starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `malloc`, `calloc` or `realloc`, must not be freed by anyone
    /// else, and must point to at least `len` initialized elements.
    #[allow(unsafe_code)]
    pub unsafe fn from_raw(ptr: NonNull<Complex32>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Give up ownership without freeing. The caller must release the pointer with `free`.
    pub fn into_raw(self) -> (NonNull<Complex32>, usize) {
        let parts = (self.ptr, self.len);
        std::mem::forget(self);
        parts
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for MallocBuffer {
    type Target = [Complex32];

    #[allow(unsafe_code)]
    fn deref(&self) -> &[Complex32] {
        // SAFETY: ptr is valid for len elements for as long as self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for MallocBuffer {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut [Complex32] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MallocBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: ptr was produced by the C allocator (zeroed or from_raw contract).
        unsafe { libc::free(self.ptr.as_ptr().cast()) };
    }
}

impl fmt::Debug for MallocBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MallocBuffer").field("len", &self.len).finish()
    }
}

/// Backing storage of a registry entry, tagged with its release strategy.
#[derive(Debug)]
pub enum Storage<'a> {
    /// C-allocated memory owned by the registry.
    Malloc(MallocBuffer),
    /// Rust-allocated memory owned by the registry.
    Array(Box<[Complex32]>),
    /// Caller memory that outlives the registry.
    Borrowed(&'a mut [Complex32]),
}

impl Storage<'_> {
    fn as_slice(&self) -> &[Complex32] {
        match self {
            Storage::Malloc(buf) => buf,
            Storage::Array(buf) => buf,
            Storage::Borrowed(buf) => buf,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Complex32] {
        match self {
            Storage::Malloc(buf) => buf,
            Storage::Array(buf) => buf,
            Storage::Borrowed(buf) => buf,
        }
    }

    fn ownership(&self) -> Ownership {
        match self {
            Storage::Malloc(_) => Ownership::OwnedMalloc,
            Storage::Array(_) => Ownership::OwnedArray,
            Storage::Borrowed(_) => Ownership::Borrowed,
        }
    }
}

#[derive(Debug)]
struct Entry<'a> {
    shape: Vec<usize>,
    storage: Storage<'a>,
}

/// Read-only view of a registered buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferRef<'r> {
    /// Element data in engine memory order (first axis fastest).
    pub data: &'r [Complex32],
    /// Stored axis lengths.
    pub shape: &'r [usize],
    /// Release strategy of the entry.
    pub ownership: Ownership,
}

/// Diagnostic listing of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Registered name.
    pub name: String,
    /// Stored axis lengths.
    pub shape: Vec<usize>,
    /// Release strategy.
    pub ownership: Ownership,
}

impl fmt::Display for EntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} [{}]", self.name, self.shape, self.ownership)
    }
}

/// Table of named complex-float buffers for one invocation.
#[derive(Debug, Default)]
pub struct BufferRegistry<'a> {
    entries: BTreeMap<String, Entry<'a>>,
}

impl<'a> BufferRegistry<'a> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register C-allocated memory; the registry releases it with `free`.
    pub fn register_owned_malloc(
        &mut self,
        name: &str,
        shape: &[usize],
        data: MallocBuffer,
    ) -> BridgeResult<()> {
        self.insert(name, shape, Storage::Malloc(data))
    }

    /// Register Rust-allocated memory; the registry releases it by dropping the box.
    pub fn register_owned_array(
        &mut self,
        name: &str,
        shape: &[usize],
        data: Box<[Complex32]>,
    ) -> BridgeResult<()> {
        self.insert(name, shape, Storage::Array(data))
    }

    /// Register caller memory without taking ownership.
    pub fn register_borrowed(
        &mut self,
        name: &str,
        shape: &[usize],
        data: &'a mut [Complex32],
    ) -> BridgeResult<()> {
        self.insert(name, shape, Storage::Borrowed(data))
    }

    fn insert(&mut self, name: &str, shape: &[usize], storage: Storage<'a>) -> BridgeResult<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(BridgeError::InvalidCommand(format!(
                "buffer name '{name}' must be a single non-empty token"
            )));
        }
        let expected = element_count(shape)?;
        let actual = storage.as_slice().len();
        if expected != actual {
            return Err(BridgeError::InvalidShape(format!(
                "shape {shape:?} of '{name}' holds {expected} elements but {actual} were given"
            )));
        }
        // Duplicates are rejected before anything is stored; the rejected storage is
        // released here with its own strategy.
        if self.entries.contains_key(name) {
            return Err(BridgeError::DuplicateName(name.to_string()));
        }

        trace!(name, ?shape, ownership = %storage.ownership(), "registered buffer");
        self.entries.insert(
            name.to_string(),
            Entry {
                shape: shape.to_vec(),
                storage,
            },
        );
        Ok(())
    }

    /// Look up `name`, writing its shape into `dims` and zero-padding unused axes.
    ///
    /// Fails with `NotFound` for unknown names and `InvalidShape` if `dims` cannot hold
    /// every stored axis.
    pub fn lookup(&self, name: &str, dims: &mut [usize]) -> BridgeResult<&[Complex32]> {
        let entry = self.entry(name)?;
        write_dims(name, &entry.shape, dims)?;
        Ok(entry.storage.as_slice())
    }

    /// Mutable lookup, used by engines writing into an existing buffer.
    pub fn lookup_mut(&mut self, name: &str, dims: &mut [usize]) -> BridgeResult<&mut [Complex32]> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        write_dims(name, &entry.shape, dims)?;
        Ok(entry.storage.as_mut_slice())
    }

    /// Data and shape of `name` in one view.
    pub fn get(&self, name: &str) -> BridgeResult<BufferRef<'_>> {
        let entry = self.entry(name)?;
        Ok(BufferRef {
            data: entry.storage.as_slice(),
            shape: &entry.shape,
            ownership: entry.storage.ownership(),
        })
    }

    fn entry(&self, name: &str) -> BridgeResult<&Entry<'a>> {
        self.entries
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Name, shape and ownership of every live entry.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.entries
            .iter()
            .map(|(name, entry)| EntryInfo {
                name: name.clone(),
                shape: entry.shape.clone(),
                ownership: entry.storage.ownership(),
            })
            .collect()
    }

    /// Release every entry with its matching strategy and empty the table.
    ///
    /// Borrowed entries are dropped without touching their memory. Calling this on an
    /// empty registry, or repeatedly, is a no-op.
    pub fn release_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let released = self.entries.len();
        let borrowed = self
            .entries
            .values()
            .filter(|e| e.storage.ownership() == Ownership::Borrowed)
            .count();
        self.entries.clear();
        debug!(released, borrowed, "released in-memory buffers");
    }
}

/// Number of elements addressed by `shape`, validating the axis count.
pub fn element_count(shape: &[usize]) -> BridgeResult<usize> {
    if shape.len() > MAX_DIMS {
        return Err(BridgeError::InvalidShape(format!(
            "{} axes exceed the maximum of {MAX_DIMS}",
            shape.len()
        )));
    }
    shape.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d)
            .ok_or_else(|| BridgeError::InvalidShape(format!("shape {shape:?} overflows")))
    })
}

/// Convert C-style signed dimensions into a shape, rejecting negative lengths.
pub fn shape_from_dims(dims: &[i64]) -> BridgeResult<Vec<usize>> {
    if dims.len() > MAX_DIMS {
        return Err(BridgeError::InvalidShape(format!(
            "{} axes exceed the maximum of {MAX_DIMS}",
            dims.len()
        )));
    }
    dims.iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                BridgeError::InvalidShape(format!("negative dimension {d} in {dims:?}"))
            })
        })
        .collect()
}

fn write_dims(name: &str, shape: &[usize], dims: &mut [usize]) -> BridgeResult<()> {
    if shape.len() > dims.len() {
        return Err(BridgeError::InvalidShape(format!(
            "'{name}' has {} axes but only {} were requested",
            shape.len(),
            dims.len()
        )));
    }
    dims[..shape.len()].copy_from_slice(shape);
    dims[shape.len()..].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<Complex32> {
        (0..len).map(|i| Complex32::new(i as f32, -(i as f32))).collect()
    }

    #[test]
    fn borrowed_lookup_returns_original_content() {
        let mut data = ramp(24);
        let expected = data.clone();
        let mut registry = BufferRegistry::new();
        registry
            .register_borrowed("meas_gadgetron", &[2, 3, 4], &mut data)
            .unwrap();

        let mut dims = [7usize; 16];
        let found = registry.lookup("meas_gadgetron", &mut dims).unwrap();
        assert_eq!(found, expected.as_slice());
        assert_eq!(&dims[..3], &[2, 3, 4]);
        assert!(dims[3..].iter().all(|&d| d == 0));
    }

    #[test]
    fn owned_array_lookup_and_release() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("maps", &[4, 2], ramp(8).into_boxed_slice())
            .unwrap();
        let view = registry.get("maps").unwrap();
        assert_eq!(view.shape, &[4, 2]);
        assert_eq!(view.ownership, Ownership::OwnedArray);
        assert_eq!(view.data[5], Complex32::new(5.0, -5.0));

        registry.release_all();
        assert!(registry.is_empty());
        assert!(matches!(registry.get("maps"), Err(BridgeError::NotFound(_))));
    }

    #[test]
    #[allow(unsafe_code)]
    fn owned_malloc_from_c_allocator() {
        let len = 6;
        // SAFETY: allocation checked for null and fully initialized before hand-off.
        let buffer = unsafe {
            let raw = libc::malloc(len * std::mem::size_of::<Complex32>()).cast::<Complex32>();
            let ptr = NonNull::new(raw).unwrap();
            for i in 0..len {
                ptr.as_ptr().add(i).write(Complex32::new(i as f32, 1.0));
            }
            MallocBuffer::from_raw(ptr, len)
        };

        let mut registry = BufferRegistry::new();
        registry.register_owned_malloc("sens", &[3, 2], buffer).unwrap();
        let mut dims = [0usize; 4];
        let data = registry.lookup("sens", &mut dims).unwrap();
        assert_eq!(data[4], Complex32::new(4.0, 1.0));
        assert_eq!(dims, [3, 2, 0, 0]);

        registry.release_all();
        registry.release_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn zeroed_malloc_buffer_is_writable() {
        let mut buffer = MallocBuffer::zeroed(4).unwrap();
        assert!(buffer.iter().all(|c| *c == Complex32::new(0.0, 0.0)));
        buffer[2] = Complex32::new(2.0, 2.0);

        let mut registry = BufferRegistry::new();
        registry.register_owned_malloc("z", &[4], buffer).unwrap();
        let mut dims = [0usize; 1];
        registry.lookup_mut("z", &mut dims).unwrap()[3] = Complex32::new(3.0, 0.0);
        let data = registry.get("z").unwrap().data;
        assert_eq!(data[2], Complex32::new(2.0, 2.0));
        assert_eq!(data[3], Complex32::new(3.0, 0.0));
    }

    #[test]
    fn zero_length_malloc_buffer() {
        let buffer = MallocBuffer::zeroed(0).unwrap();
        assert!(buffer.is_empty());
        let mut registry = BufferRegistry::new();
        registry.register_owned_malloc("empty", &[0, 4], buffer).unwrap();
        assert_eq!(registry.get("empty").unwrap().data.len(), 0);
    }

    #[test]
    fn release_all_on_empty_registry_is_noop() {
        let mut registry = BufferRegistry::new();
        registry.release_all();
        registry.release_all();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn release_keeps_borrowed_memory_intact() {
        let mut data = ramp(4);
        {
            let mut registry = BufferRegistry::new();
            registry.register_borrowed("in", &[4], &mut data).unwrap();
            registry
                .register_owned_array("out", &[4], ramp(4).into_boxed_slice())
                .unwrap();
            registry.release_all();
            registry.release_all();
        }
        assert_eq!(data, ramp(4));
    }

    #[test]
    fn duplicate_name_is_rejected_and_original_kept() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("x", &[2], ramp(2).into_boxed_slice())
            .unwrap();
        let err = registry
            .register_owned_malloc("x", &[2], MallocBuffer::zeroed(2).unwrap())
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateName(ref n) if n == "x"));
        let view = registry.get("x").unwrap();
        assert_eq!(view.ownership, Ownership::OwnedArray);
        assert_eq!(view.data, ramp(2).as_slice());
    }

    #[test]
    fn too_many_axes_is_invalid_shape() {
        let shape = [1usize; MAX_DIMS + 1];
        let mut registry = BufferRegistry::new();
        let err = registry
            .register_owned_array("x", &shape, ramp(1).into_boxed_slice())
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape(_)));
    }

    #[test]
    fn element_count_mismatch_is_invalid_shape() {
        let mut data = ramp(5);
        let mut registry = BufferRegistry::new();
        let err = registry.register_borrowed("x", &[2, 3], &mut data).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_into_short_dims_fails() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("x", &[1, 2, 3], ramp(6).into_boxed_slice())
            .unwrap();
        let mut dims = [0usize; 2];
        assert!(matches!(
            registry.lookup("x", &mut dims),
            Err(BridgeError::InvalidShape(_))
        ));
        assert!(matches!(
            registry.lookup("missing", &mut [0usize; 16]),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn negative_dims_are_rejected() {
        assert_eq!(shape_from_dims(&[4, 1, 2]).unwrap(), vec![4, 1, 2]);
        assert!(matches!(
            shape_from_dims(&[4, -1]),
            Err(BridgeError::InvalidShape(_))
        ));
    }

    #[test]
    fn entries_are_listed_in_name_order() {
        let mut data = ramp(2);
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("b", &[1], ramp(1).into_boxed_slice())
            .unwrap();
        registry.register_borrowed("a", &[2], &mut data).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
        let listing = registry.entries();
        assert_eq!(listing[0].ownership, Ownership::Borrowed);
        assert_eq!(listing[1].to_string(), "b [1] [owned (array)]");
    }
}
