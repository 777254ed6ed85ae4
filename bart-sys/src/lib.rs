//! Low-level FFI bindings for BART's in-memory CFL API (`bart_api.h`).
//!
//! BART keeps a process-wide table of named in-memory CFL arrays. Arrays are
//! registered under a name, commands are executed through [`in_mem_bart_main`]
//! with an argv vector that refers to those names, and results are read back
//! with [`load_mem_cfl`].
//!
//! # Safety
//!
//! All functions in this crate are `unsafe` as they are direct FFI bindings.
//! For a safe wrapper, use the `FfiEngine` in the `bart_bridge` crate instead.
//!
//! # Features
//!
//! - `bart-sdk`: link against `libbart`. Without this feature the declarations
//!   are still available for type-checking but nothing is linked.

#![allow(non_camel_case_types)]
#![allow(unsafe_code)]

use std::os::raw::{c_char, c_int, c_long, c_uint, c_void};

/// Maximum number of dimensions BART accepts for an in-memory CFL.
pub const BART_DIMS: usize = 16;

/// Minimum size of the output buffer passed to [`in_mem_bart_main`].
pub const BART_OUTPUT_LEN: usize = 512;

extern "C" {
    /// Load the content of a named in-memory CFL.
    ///
    /// `dimensions` must hold `D` entries and is overwritten with the stored dims.
    pub fn load_mem_cfl(name: *const c_char, D: c_uint, dimensions: *mut c_long) -> *mut c_void;

    /// Register `malloc`-allocated memory; BART takes ownership and frees it with `free`.
    pub fn register_mem_cfl_malloc(
        name: *const c_char,
        D: c_uint,
        dimensions: *const c_long,
        ptr: *mut c_void,
    );

    /// Register `new[]`-allocated memory; BART takes ownership and frees it with `delete[]`.
    pub fn register_mem_cfl_new(
        name: *const c_char,
        D: c_uint,
        dimensions: *const c_long,
        ptr: *mut c_void,
    );

    /// Register memory without taking ownership.
    pub fn register_mem_cfl_non_managed(
        name: *const c_char,
        D: c_uint,
        dims: *const c_long,
        ptr: *mut c_void,
    );

    /// Execute the BART command in `argv[0..argc]`.
    ///
    /// `out` is either null or points to at least [`BART_OUTPUT_LEN`] bytes.
    pub fn in_mem_bart_main(argc: c_int, argv: *mut *mut c_char, out: *mut c_char) -> c_int;

    /// Deallocate every in-memory CFL. Safe to call multiple times.
    pub fn deallocate_all_mem_cfl();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(BART_DIMS, 16);
        assert!(BART_OUTPUT_LEN >= 512);
    }
}
