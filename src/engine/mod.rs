//! Engine calling contract.
//!
//! The engine is an opaque array processor driven by argv-style command vectors that
//! refer to buffers by their registry name. A call blocks until the engine returns a
//! numeric status (zero means success) and, for read-only commands, a short text
//! result written into a bounded output buffer.
//!
//! # Available Engines
//!
//! - [`mock::MockEngine`] - in-process reference engine for tests and dry runs
//! - `ffi::FfiEngine` - BART's in-memory API (feature `bart_ffi`)

use std::fmt;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::BufferRegistry;

#[cfg(feature = "bart_ffi")]
pub mod ffi;
pub mod mock;

/// Maximum number of argv entries per command.
pub const MAX_ARGS: usize = 256;

/// Smallest output buffer the engine accepts.
pub const MIN_OUTPUT_CAPACITY: usize = 512;

/// One engine invocation: argument vector plus captured-output capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    args: Vec<String>,
    output_capacity: usize,
}

impl CommandRequest {
    /// Build a request, checking the argument count.
    pub fn new(args: Vec<String>) -> BridgeResult<Self> {
        if args.is_empty() {
            return Err(BridgeError::InvalidCommand("empty command".into()));
        }
        if args.len() > MAX_ARGS {
            return Err(BridgeError::TooManyArguments {
                count: args.len(),
                limit: MAX_ARGS,
                line: args.join(" "),
            });
        }
        Ok(Self {
            args,
            output_capacity: MIN_OUTPUT_CAPACITY,
        })
    }

    /// Set the captured-output capacity; values below the engine minimum are raised.
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity.max(MIN_OUTPUT_CAPACITY);
        self
    }

    /// Full argument vector, program name first.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Engine tool name (`args[1]`), if any.
    pub fn tool(&self) -> Option<&str> {
        self.args.get(1).map(String::as_str)
    }

    /// Trailing token, which names the output buffer by convention.
    pub fn output_name(&self) -> &str {
        // args is never empty
        self.args.last().map(String::as_str).unwrap_or_default()
    }

    /// Captured-output capacity in bytes.
    pub fn output_capacity(&self) -> usize {
        self.output_capacity
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Status and captured text of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReply {
    /// Zero on success.
    pub status: i32,
    /// Text written by read-only commands.
    pub output: String,
}

impl EngineReply {
    /// Successful call without output.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Successful call with captured text.
    pub fn with_output(output: impl Into<String>) -> Self {
        Self {
            status: 0,
            output: output.into(),
        }
    }

    /// Failed call.
    pub fn failed(status: i32) -> Self {
        Self {
            status,
            output: String::new(),
        }
    }

    /// Whether the engine reported success.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Truncate the captured text to `capacity` bytes, leaving room for a terminator.
    pub fn bounded(mut self, capacity: usize) -> Self {
        let limit = capacity.saturating_sub(1);
        if self.output.len() > limit {
            let mut cut = limit;
            while !self.output.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.truncate(cut);
        }
        self
    }
}

/// An array engine invoked synchronously with argv-style commands.
pub trait Engine {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run one command against the buffers in `registry`.
    ///
    /// Results are registered back into `registry` under the names the command uses.
    fn invoke(&mut self, request: &CommandRequest, registry: &mut BufferRegistry<'_>)
        -> EngineReply;

    /// Drop any engine-side state tied to the current invocation.
    fn release(&mut self) {}
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(
        &mut self,
        request: &CommandRequest,
        registry: &mut BufferRegistry<'_>,
    ) -> EngineReply {
        (**self).invoke(request, registry)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn request_exposes_tool_and_output_name() {
        let req = CommandRequest::new(args("bart fft -u 7 input_data ksp")).unwrap();
        assert_eq!(req.tool(), Some("fft"));
        assert_eq!(req.output_name(), "ksp");
        assert_eq!(req.output_capacity(), MIN_OUTPUT_CAPACITY);
        assert_eq!(req.to_string(), "bart fft -u 7 input_data ksp");
    }

    #[test]
    fn output_capacity_never_below_minimum() {
        let req = CommandRequest::new(args("bart version"))
            .unwrap()
            .with_output_capacity(16);
        assert_eq!(req.output_capacity(), MIN_OUTPUT_CAPACITY);
        let req = req.with_output_capacity(4096);
        assert_eq!(req.output_capacity(), 4096);
    }

    #[test]
    fn argument_limits() {
        assert!(matches!(
            CommandRequest::new(Vec::new()),
            Err(BridgeError::InvalidCommand(_))
        ));
        let many = vec!["x".to_string(); MAX_ARGS + 1];
        assert!(matches!(
            CommandRequest::new(many),
            Err(BridgeError::TooManyArguments { count: 257, .. })
        ));
        assert!(CommandRequest::new(vec!["x".to_string(); MAX_ARGS]).is_ok());
    }

    #[test]
    fn reply_truncates_on_char_boundary() {
        let reply = EngineReply::with_output("é".repeat(400)).bounded(512);
        assert!(reply.output.len() <= 511);
        assert!(reply.output.chars().all(|c| c == 'é'));
        assert!(reply.is_success());
        assert!(!EngineReply::failed(2).is_success());
    }
}
