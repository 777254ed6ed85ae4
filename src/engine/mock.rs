//! Mock engine
//!
//! In-process stand-in for the array engine. It implements the handful of tools the
//! bridge itself issues (`scale`, `reshape`, `resize`) plus a few that scripts commonly
//! use for bookkeeping, so that complete stage invocations can run without the real
//! engine installed.
//!
//! # Supported Tools
//!
//! - `scale <factor> <in> <out>`
//! - `copy <in> <out>`
//! - `reshape <flags> <dim>... <in> <out>`
//! - `resize [-c] (<axis> <len>)... <in> <out>`
//! - `repmat <axis> <count> <in> <out>`
//! - `show -m <in>` (writes dimensions to the captured output)
//! - `version`
//!
//! Anything else fails with status 1, as does a missing input or an output name that
//! is already registered.

use std::collections::HashMap;

use num_complex::Complex32;
use tracing::{debug, warn};

use super::{CommandRequest, Engine, EngineReply};
use crate::registry::{element_count, BufferRegistry, MAX_DIMS};

/// Version string reported by `version`.
pub const MOCK_VERSION: &str = "v0.9.00-mock";

type ToolResult = Result<EngineReply, String>;

/// Mock engine with call recording and failure injection.
///
/// # Example
///
/// ```rust,ignore
/// let mut engine = MockEngine::new().fail_on("pics", 3);
/// let reply = engine.invoke(&request, &mut registry);
/// assert_eq!(engine.calls().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockEngine {
    calls: Vec<Vec<String>>,
    failures: HashMap<String, i32>,
    releases: usize,
}

impl MockEngine {
    /// Create a mock engine with no injected failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `tool` return `status` without touching the registry.
    pub fn fail_on(mut self, tool: &str, status: i32) -> Self {
        self.failures.insert(tool.to_string(), status);
        self
    }

    /// Argument vectors of every call so far.
    pub fn calls(&self) -> &[Vec<String>] {
        &self.calls
    }

    /// How many times `release` was called.
    pub fn release_count(&self) -> usize {
        self.releases
    }

    fn run(&self, args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
        let tool = args.get(1).map(String::as_str).unwrap_or_default();
        let rest = args.get(2..).unwrap_or_default();
        match tool {
            "scale" => scale(rest, registry),
            "copy" => copy(rest, registry),
            "reshape" => reshape(rest, registry),
            "resize" => resize(rest, registry),
            "repmat" => repmat(rest, registry),
            "show" => show(rest, registry),
            "version" => Ok(EngineReply::with_output(MOCK_VERSION)),
            "" => Err("no tool given".to_string()),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn invoke(
        &mut self,
        request: &CommandRequest,
        registry: &mut BufferRegistry<'_>,
    ) -> EngineReply {
        self.calls.push(request.args().to_vec());

        if let Some(&status) = request.tool().and_then(|tool| self.failures.get(tool)) {
            debug!(command = %request, status, "mock engine injected failure");
            return EngineReply::failed(status);
        }

        match self.run(request.args(), registry) {
            Ok(reply) => reply.bounded(request.output_capacity()),
            Err(message) => {
                warn!(command = %request, "mock engine: {message}");
                EngineReply::failed(1)
            }
        }
    }

    fn release(&mut self) {
        self.releases += 1;
    }
}

fn parse<T: std::str::FromStr>(token: &str, what: &str) -> Result<T, String> {
    token
        .parse()
        .map_err(|_| format!("invalid {what} '{token}'"))
}

/// Split `<params>... <in> <out>` into its parts.
fn in_out(args: &[String]) -> Result<(&[String], &str, &str), String> {
    match args {
        [params @ .., input, output] => Ok((params, input.as_str(), output.as_str())),
        _ => Err("expected input and output names".to_string()),
    }
}

fn load(registry: &BufferRegistry<'_>, name: &str) -> Result<(Vec<usize>, Vec<Complex32>), String> {
    let view = registry.get(name).map_err(|e| e.to_string())?;
    let mut shape = view.shape.to_vec();
    shape.resize(MAX_DIMS, 1);
    Ok((shape, view.data.to_vec()))
}

fn store(
    registry: &mut BufferRegistry<'_>,
    name: &str,
    mut shape: Vec<usize>,
    data: Vec<Complex32>,
) -> ToolResult {
    while shape.len() > 1 && shape.last() == Some(&1) {
        shape.pop();
    }
    registry
        .register_owned_array(name, &shape, data.into_boxed_slice())
        .map_err(|e| e.to_string())?;
    Ok(EngineReply::ok())
}

fn scale(args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
    let (params, input, output) = in_out(args)?;
    let [factor] = params else {
        return Err("usage: scale <factor> <input> <output>".to_string());
    };
    let factor: f32 = parse(factor, "scale factor")?;
    let (shape, data) = load(registry, input)?;
    let scaled = data.into_iter().map(|c| c * factor).collect();
    store(registry, output, shape, scaled)
}

fn copy(args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
    let ([], input, output) = in_out(args)? else {
        return Err("usage: copy <input> <output>".to_string());
    };
    let (shape, data) = load(registry, input)?;
    store(registry, output, shape, data)
}

fn reshape(args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
    let (params, input, output) = in_out(args)?;
    let Some((flags, dims)) = params.split_first() else {
        return Err("usage: reshape <flags> <dim>... <input> <output>".to_string());
    };
    let flags: u32 = parse(flags, "flags")?;
    let axes: Vec<usize> = (0..MAX_DIMS).filter(|axis| flags & (1 << axis) != 0).collect();
    if axes.len() != dims.len() {
        return Err(format!(
            "flags {flags} select {} axes but {} dims were given",
            axes.len(),
            dims.len()
        ));
    }

    let (mut shape, data) = load(registry, input)?;
    for (&axis, dim) in axes.iter().zip(dims) {
        shape[axis] = parse(dim, "dimension")?;
    }
    let count = element_count(&shape).map_err(|e| e.to_string())?;
    if count != data.len() {
        return Err(format!(
            "cannot reshape {} elements of '{input}' into {shape:?}",
            data.len()
        ));
    }
    store(registry, output, shape, data)
}

/// Column-major strides of `shape`.
fn strides(shape: &[usize]) -> Vec<usize> {
    let mut acc = 1;
    shape
        .iter()
        .map(|&d| {
            let s = acc;
            acc *= d;
            s
        })
        .collect()
}

fn resize(args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
    let (params, input, output) = in_out(args)?;
    let (centered, pairs) = match params.split_first() {
        Some((flag, rest)) if flag == "-c" => (true, rest),
        _ => (false, params),
    };
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Err("usage: resize [-c] <axis> <len>... <input> <output>".to_string());
    }

    let (in_shape, data) = load(registry, input)?;
    let mut out_shape = in_shape.clone();
    for pair in pairs.chunks(2) {
        let axis: usize = parse(&pair[0], "axis")?;
        if axis >= MAX_DIMS {
            return Err(format!("axis {axis} out of range"));
        }
        out_shape[axis] = parse(&pair[1], "length")?;
    }

    // Shift applied to every axis: centers stay aligned when -c is given.
    let shift: Vec<isize> = in_shape
        .iter()
        .zip(&out_shape)
        .map(|(&i, &o)| {
            if centered {
                (o / 2) as isize - (i / 2) as isize
            } else {
                0
            }
        })
        .collect();

    let in_strides = strides(&in_shape);
    let count = element_count(&out_shape).map_err(|e| e.to_string())?;
    let mut out = vec![Complex32::new(0.0, 0.0); count];
    let mut index = vec![0usize; MAX_DIMS];
    for value in out.iter_mut() {
        let mut src = Some(0usize);
        for axis in 0..MAX_DIMS {
            let pos = index[axis] as isize - shift[axis];
            if pos < 0 || pos as usize >= in_shape[axis] {
                src = None;
                break;
            }
            src = src.map(|s| s + pos as usize * in_strides[axis]);
        }
        if let Some(src) = src {
            *value = data[src];
        }
        // advance the column-major counter
        for axis in 0..MAX_DIMS {
            index[axis] += 1;
            if index[axis] < out_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    store(registry, output, out_shape, out)
}

fn repmat(args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
    let (params, input, output) = in_out(args)?;
    let [axis, count] = params else {
        return Err("usage: repmat <axis> <count> <input> <output>".to_string());
    };
    let axis: usize = parse(axis, "axis")?;
    let count: usize = parse(count, "count")?;
    if axis >= MAX_DIMS {
        return Err(format!("axis {axis} out of range"));
    }

    let (mut shape, data) = load(registry, input)?;
    if shape[axis] != 1 {
        return Err(format!("axis {axis} of '{input}' is not singleton"));
    }
    // Everything below `axis` is one contiguous block, repeated `count` times.
    let block: usize = shape[..axis].iter().product();
    let mut out = Vec::with_capacity(data.len() * count);
    if block > 0 {
        for outer in data.chunks(block) {
            for _ in 0..count {
                out.extend_from_slice(outer);
            }
        }
    }
    shape[axis] = count;
    store(registry, output, shape, out)
}

fn show(args: &[String], registry: &mut BufferRegistry<'_>) -> ToolResult {
    let [flag, input] = args else {
        return Err("usage: show -m <input>".to_string());
    };
    if flag != "-m" {
        return Err(format!("unsupported show option '{flag}'"));
    }
    let (shape, _) = load(registry, input)?;
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    Ok(EngineReply::with_output(format!(
        "Type: complex float\nDimensions: {MAX_DIMS}\nAXES: {}\n",
        dims.join(" ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CommandRequest;

    fn request(line: &str) -> CommandRequest {
        CommandRequest::new(line.split_whitespace().map(String::from).collect()).unwrap()
    }

    fn ramp(len: usize) -> Vec<Complex32> {
        (0..len).map(|i| Complex32::new(i as f32, 0.0)).collect()
    }

    #[test]
    fn scale_copies_with_factor() {
        let mut data = ramp(4);
        let mut registry = BufferRegistry::new();
        registry.register_borrowed("a", &[2, 2], &mut data).unwrap();

        let mut engine = MockEngine::new();
        let reply = engine.invoke(&request("bart scale 2.0 a b"), &mut registry);
        assert!(reply.is_success());
        let b = registry.get("b").unwrap();
        assert_eq!(b.shape, &[2, 2]);
        assert_eq!(b.data[3], Complex32::new(6.0, 0.0));
        assert_eq!(engine.calls().len(), 1);
    }

    #[test]
    fn copy_refuses_existing_output() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("a", &[3], ramp(3).into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();
        assert!(engine.invoke(&request("bart copy a b"), &mut registry).is_success());
        assert_eq!(registry.get("b").unwrap().data, registry.get("a").unwrap().data);
        assert_eq!(engine.invoke(&request("bart copy a b"), &mut registry).status, 1);
        assert_eq!(engine.invoke(&request("bart copy 1 a b"), &mut registry).status, 1);
    }

    #[test]
    fn reshape_checks_element_count() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("a", &[4, 3], ramp(12).into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();

        assert!(engine
            .invoke(&request("bart reshape 3 2 6 a b"), &mut registry)
            .is_success());
        assert_eq!(registry.get("b").unwrap().shape, &[2, 6]);

        assert_eq!(
            engine
                .invoke(&request("bart reshape 3 5 5 a c"), &mut registry)
                .status,
            1
        );
        assert!(!registry.contains("c"));
    }

    #[test]
    fn centered_resize_crops_middle() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("ref", &[6, 2], ramp(12).into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();
        assert!(engine
            .invoke(&request("bart resize -c 0 2 ref small"), &mut registry)
            .is_success());
        let small = registry.get("small").unwrap();
        assert_eq!(small.shape, &[2, 2]);
        // center of 6 is 3, center of 2 is 1: keeps input samples 2 and 3
        let values: Vec<f32> = small.data.iter().map(|c| c.re).collect();
        assert_eq!(values, vec![2.0, 3.0, 8.0, 9.0]);
    }

    #[test]
    fn centered_resize_zero_pads() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("a", &[2], vec![Complex32::new(1.0, 0.0); 2].into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();
        assert!(engine
            .invoke(&request("bart resize -c 0 4 a b"), &mut registry)
            .is_success());
        let values: Vec<f32> = registry.get("b").unwrap().data.iter().map(|c| c.re).collect();
        assert_eq!(values, vec![0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn repmat_replicates_along_axis() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("a", &[2, 1, 2], ramp(4).into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();
        assert!(engine
            .invoke(&request("bart repmat 1 2 a b"), &mut registry)
            .is_success());
        let b = registry.get("b").unwrap();
        assert_eq!(b.shape, &[2, 2, 2]);
        let values: Vec<f32> = b.data.iter().map(|c| c.re).collect();
        assert_eq!(values, vec![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn show_and_version_write_output() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("a", &[3, 2], ramp(6).into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();
        let reply = engine.invoke(&request("bart show -m a"), &mut registry);
        assert!(reply.output.contains("AXES: 3 2 1"));
        let reply = engine.invoke(&request("bart version"), &mut registry);
        assert_eq!(reply.output, MOCK_VERSION);
    }

    #[test]
    fn failures_leave_registry_untouched() {
        let mut registry = BufferRegistry::new();
        let mut engine = MockEngine::new().fail_on("pics", 4);
        assert_eq!(
            engine.invoke(&request("bart pics a b c"), &mut registry).status,
            4
        );
        assert_eq!(
            engine.invoke(&request("bart nlinv a b"), &mut registry).status,
            1
        );
        assert_eq!(
            engine.invoke(&request("bart scale 1.0 missing out"), &mut registry).status,
            1
        );
        assert!(registry.is_empty());
        assert_eq!(engine.calls().len(), 3);
    }

    #[test]
    fn existing_output_name_fails() {
        let mut registry = BufferRegistry::new();
        registry
            .register_owned_array("a", &[1], ramp(1).into_boxed_slice())
            .unwrap();
        let mut engine = MockEngine::new();
        assert_eq!(
            engine.invoke(&request("bart scale 1.0 a a"), &mut registry).status,
            1
        );
    }
}
