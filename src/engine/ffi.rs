//! BART engine through its in-memory C API.
//!
//! Registry entries are mirrored into BART's own table as non-managed arrays before each
//! command, so BART reads pipeline memory in place. After a successful command the
//! trailing output name is imported back into the registry as an owned copy.

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_long, c_uint, c_void};

use bart_sys::{BART_DIMS, BART_OUTPUT_LEN};
use num_complex::Complex32;
use tracing::{debug, error};

use super::{CommandRequest, Engine, EngineReply};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{element_count, shape_from_dims, BufferRegistry, MAX_DIMS};

/// Status reported when a command cannot be marshalled for the C side.
const MARSHAL_FAILURE: i32 = -1;

/// Engine backed by `libbart`.
#[derive(Debug, Default)]
pub struct FfiEngine {
    mirrored: HashSet<String>,
}

impl FfiEngine {
    /// Create an engine with an empty mirror table.
    pub fn new() -> Self {
        Self::default()
    }

    fn mirror(&mut self, registry: &mut BufferRegistry<'_>) -> BridgeResult<()> {
        let pending: Vec<String> = registry
            .names()
            .into_iter()
            .filter(|name| !self.mirrored.contains(*name))
            .map(String::from)
            .collect();

        for name in pending {
            let mut dims = [0usize; MAX_DIMS];
            let data = registry.lookup_mut(&name, &mut dims)?;
            let mut c_dims = [1 as c_long; BART_DIMS];
            for (c, &d) in c_dims.iter_mut().zip(&dims) {
                // lookup zero-pads unused axes; BART expects singletons there
                if d > 0 {
                    *c = c_long::try_from(d)
                        .map_err(|_| BridgeError::InvalidShape(format!("{name}: {d} too large")))?;
                }
            }
            let c_name = c_string(&name)?;
            // SAFETY: `data` stays registered until the invocation ends, and the
            // invocation calls `release` on the engine before flushing the registry.
            unsafe {
                bart_sys::register_mem_cfl_non_managed(
                    c_name.as_ptr(),
                    BART_DIMS as c_uint,
                    c_dims.as_ptr(),
                    data.as_mut_ptr().cast::<c_void>(),
                );
            }
            debug!(name = %name, "mirrored buffer into BART");
            self.mirrored.insert(name);
        }
        Ok(())
    }

    fn import(&mut self, name: &str, registry: &mut BufferRegistry<'_>) -> BridgeResult<()> {
        if registry.contains(name) {
            return Ok(());
        }
        let c_name = c_string(name)?;
        let mut c_dims = [0 as c_long; BART_DIMS];
        // SAFETY: `c_dims` holds BART_DIMS entries as the call requires.
        let ptr = unsafe {
            bart_sys::load_mem_cfl(c_name.as_ptr(), BART_DIMS as c_uint, c_dims.as_mut_ptr())
        };
        if ptr.is_null() {
            // Commands like `show` produce no array.
            return Ok(());
        }

        let signed: Vec<i64> = c_dims.iter().map(|&d| i64::from(d)).collect();
        let mut shape = shape_from_dims(&signed)?;
        while shape.len() > 1 && shape.last() == Some(&1) {
            shape.pop();
        }
        let len = element_count(&shape)?;
        // SAFETY: BART returns `len` contiguous complex floats for the loaded dims and
        // keeps them alive until `deallocate_all_mem_cfl`.
        let data = unsafe { std::slice::from_raw_parts(ptr.cast::<Complex32>(), len) };
        registry.register_owned_array(name, &shape, data.to_vec().into_boxed_slice())?;
        self.mirrored.insert(name.to_string());
        debug!(name, ?shape, "imported BART output");
        Ok(())
    }
}

fn c_string(s: &str) -> BridgeResult<CString> {
    CString::new(s).map_err(|_| BridgeError::InvalidCommand(format!("'{s}' contains a NUL byte")))
}

impl Engine for FfiEngine {
    fn name(&self) -> &str {
        "bart"
    }

    fn invoke(
        &mut self,
        request: &CommandRequest,
        registry: &mut BufferRegistry<'_>,
    ) -> EngineReply {
        if let Err(e) = self.mirror(registry) {
            error!(command = %request, error = %e, "failed to mirror buffers into BART");
            return EngineReply::failed(MARSHAL_FAILURE);
        }

        let args: Vec<CString> = match request.args().iter().map(|a| c_string(a)).collect() {
            Ok(args) => args,
            Err(e) => {
                error!(command = %request, error = %e, "invalid argument");
                return EngineReply::failed(MARSHAL_FAILURE);
            }
        };
        let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr().cast_mut()).collect();
        let mut out = vec![0u8; request.output_capacity().max(BART_OUTPUT_LEN)];

        // SAFETY: argv entries point into `args`, which outlives the call; BART does not
        // write through argv. `out` is at least BART_OUTPUT_LEN bytes.
        let status = unsafe {
            bart_sys::in_mem_bart_main(
                argv.len() as c_int,
                argv.as_mut_ptr(),
                out.as_mut_ptr().cast::<c_char>(),
            )
        };

        let end = out.iter().position(|&b| b == 0).unwrap_or(out.len());
        let reply = EngineReply {
            status,
            output: String::from_utf8_lossy(&out[..end]).into_owned(),
        }
        .bounded(request.output_capacity());

        if reply.is_success() {
            if let Err(e) = self.import(request.output_name(), registry) {
                error!(command = %request, error = %e, "could not import BART output");
                return EngineReply::failed(MARSHAL_FAILURE);
            }
        }
        reply
    }

    fn release(&mut self) {
        // SAFETY: no pointer obtained from BART is used after this point.
        unsafe { bart_sys::deallocate_all_mem_cfl() };
        self.mirrored.clear();
    }
}

impl Drop for FfiEngine {
    fn drop(&mut self) {
        if !self.mirrored.is_empty() {
            self.release();
        }
    }
}
