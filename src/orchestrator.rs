//! Script execution and the reconstruction stage.
//!
//! [`ScriptOrchestrator`] turns script lines into engine calls and stops at the first
//! failure. [`ReconStage`] wraps one complete invocation: workspace, input registration,
//! layout conversion, the user script, and recovery of the pipeline-shaped result.
//!
//! Cleanup is scope-driven. The registry, the engine handle and the workspace guard live
//! in one invocation value; dropping it releases the engine state, then every buffer
//! the engine may still point into, then the directory, on every exit path.

use std::fmt;

use num_complex::Complex32;
use parking_lot::{const_mutex, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::cfl;
use crate::config::BridgeConfig;
use crate::engine::{CommandRequest, Engine, EngineReply};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::BufferRegistry;
use crate::remap::{
    composite_shape, frames_reshape_command, split_frames, to_engine_layout, PipelineShape,
    MAPS_AXIS,
};
use crate::script::{substitute_parameters, tokenize, ReconParameters, Script};
use crate::workspace::{Workspace, WorkspaceGuard};

/// Registry name of the acquired data.
pub const INPUT_NAME: &str = "meas_gadgetron";
/// Registry name of the calibration data, when it differs from the acquired data.
pub const REFERENCE_NAME: &str = "meas_gadgetron_ref";
/// Calibration data resized to the acquisition matrix.
pub const REFERENCE_DATA_NAME: &str = "reference_data";
/// Acquired data in engine layout; scripts start from this name.
pub const ENGINE_INPUT_NAME: &str = "input_data";

/// Serializes stage invocations across the process.
static STAGE_LOCK: Mutex<()> = const_mutex(());

/// Progress of a script run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Nothing run yet.
    #[default]
    Idle,
    /// Script accepted, no line executed.
    Preparing,
    /// Executing the command on this source line.
    ExecutingLine(usize),
    /// Stopped at this source line.
    Failed(usize),
    /// Every line succeeded.
    Completed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Preparing => write!(f, "preparing"),
            Self::ExecutingLine(line) => write!(f, "executing line {line}"),
            Self::Failed(line) => write!(f, "failed at line {line}"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Runs command lines against an engine, fail-fast.
#[derive(Debug, Clone)]
pub struct ScriptOrchestrator {
    params: ReconParameters,
    output_capacity: usize,
    state: OrchestratorState,
}

impl ScriptOrchestrator {
    /// Orchestrator substituting `params` and capturing up to `output_capacity` bytes.
    pub fn new(params: ReconParameters, output_capacity: usize) -> Self {
        Self {
            params,
            output_capacity,
            state: OrchestratorState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Parameters used for `$name` substitution.
    pub fn parameters(&self) -> &ReconParameters {
        &self.params
    }

    /// Run one request. A non-zero engine status becomes `EngineFailure`.
    pub fn execute<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        registry: &mut BufferRegistry<'_>,
        request: &CommandRequest,
    ) -> BridgeResult<EngineReply> {
        debug!(engine = engine.name(), command = %request, "invoking engine");
        let reply = engine
            .invoke(request, registry)
            .bounded(request.output_capacity());
        if !reply.output.trim().is_empty() {
            info!(command = %request, "{}", reply.output.trim_end());
        }
        if !reply.is_success() {
            error!(command = %request, code = reply.status, "engine command failed");
            return Err(BridgeError::EngineFailure {
                command: request.to_string(),
                code: reply.status,
            });
        }
        Ok(reply)
    }

    /// Build a request from `args` with this orchestrator's capacity and run it.
    pub fn execute_args<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        registry: &mut BufferRegistry<'_>,
        args: Vec<String>,
    ) -> BridgeResult<EngineReply> {
        let request = CommandRequest::new(args)?.with_output_capacity(self.output_capacity);
        self.execute(engine, registry, &request)
    }

    /// Run every line of `script` in order.
    ///
    /// Returns the trailing token of the last executed line, which names the result
    /// buffer, or `None` for a script without command lines.
    pub fn run_script<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        registry: &mut BufferRegistry<'_>,
        script: &Script,
    ) -> BridgeResult<Option<String>> {
        self.state = OrchestratorState::Preparing;
        let mut output = None;
        for line in script.lines() {
            self.state = OrchestratorState::ExecutingLine(line.number);
            match self.run_line(engine, registry, &line.text) {
                Ok(name) => output = Some(name),
                Err(e) => {
                    self.state = OrchestratorState::Failed(line.number);
                    warn!(line = line.number, error = %e, "script aborted");
                    return Err(e);
                }
            }
        }
        self.state = OrchestratorState::Completed;
        Ok(output)
    }

    fn run_line<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        registry: &mut BufferRegistry<'_>,
        text: &str,
    ) -> BridgeResult<String> {
        let line = substitute_parameters(text, &self.params)?;
        let request = tokenize(&line, self.output_capacity)?;
        self.execute(engine, registry, &request)?;
        Ok(request.output_name().to_string())
    }
}

/// A pipeline array handed to the stage; the stage reads it in place.
#[derive(Debug)]
pub struct PipelineArray<'a> {
    /// Axis lengths in pipeline order.
    pub shape: PipelineShape,
    /// Elements, first axis fastest.
    pub data: &'a mut [Complex32],
}

/// Input of one stage invocation.
#[derive(Debug)]
pub struct StageInput<'a> {
    /// Acquired k-space.
    pub data: PipelineArray<'a>,
    /// Calibration data; `None` or a same-shaped array means there is no separate scan.
    pub reference: Option<PipelineArray<'a>>,
    /// Overrides the configured reconstruction parameters.
    pub parameters: Option<ReconParameters>,
}

/// Result of one stage invocation, in pipeline order with a singleton channel axis
/// when the script combines coils.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Axis lengths.
    pub shape: PipelineShape,
    /// Elements, first axis fastest.
    pub data: Vec<Complex32>,
    /// Series index to attach to the images.
    pub image_series: i32,
}

/// Registry, engine and workspace of a single invocation.
struct Invocation<'a, 'e, E: Engine + ?Sized> {
    registry: BufferRegistry<'a>,
    engine: &'e mut E,
    workspace: WorkspaceGuard,
}

impl<E: Engine + ?Sized> Drop for Invocation<'_, '_, E> {
    fn drop(&mut self) {
        self.engine.release();
        debug!(engine = self.engine.name(), "released engine state");
        self.registry.release_all();
        // `workspace` drops after this, removing the directory
    }
}

/// One reconstruction stage bound to an engine.
pub struct ReconStage<E: Engine> {
    config: BridgeConfig,
    engine: E,
}

impl<E: Engine> ReconStage<E> {
    /// Create a stage, validating the layout policy up front.
    pub fn new(config: BridgeConfig, engine: E) -> BridgeResult<Self> {
        config.stage.axis_map.validate()?;
        Ok(Self { config, engine })
    }

    /// Stage configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The engine, e.g. to inspect a mock after a run.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run the configured script on `input`.
    ///
    /// Only one invocation runs at a time in the whole process.
    pub fn process(&mut self, input: StageInput<'_>) -> BridgeResult<StageOutput> {
        let _serialized = STAGE_LOCK.lock();
        let stage = &self.config.stage;

        let script_file = stage.script_file();
        let script = Script::from_file(&script_file, &stage.command_prefix)?;

        let mut workspace = Workspace::begin(&stage.working_directory, stage.retain_workspace)?;
        let span = info_span!("recon_stage", workspace = workspace.id());
        let _enter = span.enter();
        if self.config.tmpfs.enabled {
            workspace.mount_tmpfs(self.config.tmpfs.size_mb)?;
        }

        let mut orchestrator = ScriptOrchestrator::new(
            input.parameters.unwrap_or(self.config.parameters),
            stage.output_capacity,
        );
        let mut invocation = Invocation {
            registry: BufferRegistry::new(),
            engine: &mut self.engine,
            workspace,
        };

        let result = run_stage(&self.config, &mut invocation, &mut orchestrator, &script, input);
        match &result {
            Ok(out) => info!(shape = %out.shape, "stage completed"),
            Err(e) if e.is_engine_failure() => {
                error!(state = %orchestrator.state(), error = %e, "stage failed");
                for entry in invocation.registry.entries() {
                    error!(buffer = %entry, "live buffer");
                }
            }
            Err(e) => error!(state = %orchestrator.state(), error = %e, "stage failed"),
        }
        result
    }
}

fn run_stage<'a, E: Engine + ?Sized>(
    config: &BridgeConfig,
    inv: &mut Invocation<'a, '_, E>,
    orchestrator: &mut ScriptOrchestrator,
    script: &Script,
    input: StageInput<'a>,
) -> BridgeResult<StageOutput> {
    let stage = &config.stage;
    let prefix = stage.command_prefix.as_str();
    let shape = input.data.shape;

    if stage.verbose {
        info!(%shape, "acquired data");
    }

    if let Some(reference) = input.reference.filter(|r| r.shape != shape) {
        if stage.verbose {
            info!(shape = %reference.shape, "reference data");
        }
        inv.registry
            .register_borrowed(REFERENCE_NAME, reference.shape.as_slice(), reference.data)?;
        let resize = vec![
            prefix.to_string(),
            "resize".to_string(),
            "-c".to_string(),
            "0".to_string(),
            shape.readout().to_string(),
            "1".to_string(),
            shape.phase1().to_string(),
            "2".to_string(),
            shape.phase2().to_string(),
            REFERENCE_NAME.to_string(),
            REFERENCE_DATA_NAME.to_string(),
        ];
        orchestrator.execute_args(&mut *inv.engine, &mut inv.registry, resize)?;
    }
    inv.registry
        .register_borrowed(INPUT_NAME, shape.as_slice(), input.data.data)?;

    let layout = to_engine_layout(&shape, &stage.axis_map)?;
    orchestrator.execute_args(
        &mut *inv.engine,
        &mut inv.registry,
        layout.command(prefix, INPUT_NAME, ENGINE_INPUT_NAME),
    )?;

    let output = orchestrator
        .run_script(&mut *inv.engine, &mut inv.registry, script)?
        .ok_or_else(|| BridgeError::InvalidCommand("script contains no command lines".into()))?;

    let engine_shape = inv.registry.get(&output)?.shape.to_vec();
    let maps_count = engine_shape.get(MAPS_AXIS).copied().unwrap_or(1);
    let reshaped = format!("{output}_reshape");
    let reshape = frames_reshape_command(&engine_shape, &layout.axes, prefix, &output, &reshaped)?;
    orchestrator.execute_args(&mut *inv.engine, &mut inv.registry, reshape)?;

    let composite = composite_shape(&engine_shape, &layout.axes)?;
    let buffer = inv.registry.get(&reshaped)?.data;
    let frames = split_frames(buffer, &composite, maps_count)?;
    debug!(%composite, maps_count, frames = frames.len(), "splitting engine output");

    let out = StageOutput {
        shape: frames.output_shape(),
        data: frames.collect_output(),
        image_series: stage.image_series,
    };

    if inv.workspace.is_retained() {
        let base = inv.workspace.path().join(&reshaped);
        cfl::write_cfl(&base, composite.as_slice(), buffer)?;
        info!(path = %base.display(), "stored engine output");
    }
    Ok(out)
}
