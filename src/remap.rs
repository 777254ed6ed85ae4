//! Dimension remapping between the pipeline and engine array conventions.
//!
//! The pipeline stores reconstruction data as 7-axis arrays in the fixed order
//! `[readout, phase1, phase2, channel, repetition, set, location]`. The engine works on
//! up to 16 axes and expects sensitivity maps on axis 4 and repetitions further out.
//!
//! The placement of each pipeline axis is an [`AxisMap`]. Targets must be strictly
//! increasing, so every remap is a pure reshape: memory order never changes, only the
//! axis boundaries do. Everything here is a pure function of its arguments.
//!
//! ```text
//!  pipeline   [ RO | E1 | E2 | CHA | N  | S  | LOC ]
//!                │    │    │    │     │    │    │
//!  engine     [ 0  | 1  | 2  | 3  |MAPS| .. | 9  | 10 | 11 | .. ]
//!                                        (N)  (S)  (LOC)
//! ```

use std::fmt;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::MAX_DIMS;

/// Number of axes in the pipeline convention.
pub const PIPELINE_DIMS: usize = 7;

/// Engine axis holding alternative solutions (sensitivity maps).
pub const MAPS_AXIS: usize = 4;

const REPETITION: usize = 4;
const SET: usize = 5;
const LOCATION: usize = 6;

/// Axis lengths in the pipeline's `[RO, E1, E2, CHA, N, S, LOC]` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineShape(pub [usize; PIPELINE_DIMS]);

impl PipelineShape {
    /// Readout samples.
    pub fn readout(&self) -> usize {
        self.0[0]
    }

    /// First phase-encoding axis.
    pub fn phase1(&self) -> usize {
        self.0[1]
    }

    /// Second phase-encoding axis.
    pub fn phase2(&self) -> usize {
        self.0[2]
    }

    /// Receive channels.
    pub fn channel(&self) -> usize {
        self.0[3]
    }

    /// Repetitions (time frames).
    pub fn repetition(&self) -> usize {
        self.0[REPETITION]
    }

    /// Sets.
    pub fn set(&self) -> usize {
        self.0[SET]
    }

    /// Locations (slices).
    pub fn location(&self) -> usize {
        self.0[LOCATION]
    }

    /// Elements in one `[RO, E1, E2, CHA]` frame.
    pub fn frame_len(&self) -> usize {
        self.0[..REPETITION].iter().product()
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.0.iter().product()
    }

    /// Whether any axis is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same shape with a different repetition count.
    pub fn with_repetition(mut self, repetition: usize) -> Self {
        self.0[REPETITION] = repetition;
        self
    }

    /// Build a pipeline shape from engine-style dims (e.g. a CFL header).
    ///
    /// Missing axes count as 1; axes past the seventh must be singleton.
    pub fn from_dims(dims: &[usize]) -> BridgeResult<Self> {
        if let Some((axis, len)) = dims
            .iter()
            .enumerate()
            .skip(PIPELINE_DIMS)
            .find(|&(_, &len)| len != 1)
        {
            return Err(BridgeError::InvalidShape(format!(
                "axis {axis} has length {len}; only {PIPELINE_DIMS} axes map to the pipeline"
            )));
        }
        let mut shape = [1usize; PIPELINE_DIMS];
        for (slot, &len) in shape.iter_mut().zip(dims) {
            *slot = len;
        }
        Ok(Self(shape))
    }

    /// Axis lengths as a slice.
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl From<[usize; PIPELINE_DIMS]> for PipelineShape {
    fn from(dims: [usize; PIPELINE_DIMS]) -> Self {
        Self(dims)
    }
}

impl fmt::Display for PipelineShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [ro, e1, e2, cha, n, s, loc] = self.0;
        write!(f, "[RO={ro} E1={e1} E2={e2} CHA={cha} N={n} S={s} LOC={loc}]")
    }
}

/// Engine axis assigned to each pipeline axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisMap([usize; PIPELINE_DIMS]);

impl Default for AxisMap {
    /// Repetitions on engine axis 9, sets on 10, locations on 11.
    fn default() -> Self {
        Self([0, 1, 2, 3, 9, 10, 11])
    }
}

impl AxisMap {
    /// Pipeline axes kept in place. Only valid for a single repetition, where the maps
    /// axis and the repetition axis coincide.
    pub(crate) const PASSTHROUGH: AxisMap = AxisMap([0, 1, 2, 3, 4, 5, 6]);

    /// Build and validate a map.
    pub fn new(targets: [usize; PIPELINE_DIMS]) -> BridgeResult<Self> {
        let map = Self(targets);
        map.validate()?;
        Ok(map)
    }

    /// Check that the map describes a pure reshape that keeps repetitions apart from
    /// the maps axis.
    pub fn validate(&self) -> BridgeResult<()> {
        self.check_reshape()?;
        if self.repetition() == MAPS_AXIS {
            return Err(BridgeError::InvalidShape(format!(
                "axis map {:?} puts repetitions on the maps axis {MAPS_AXIS}",
                self.0
            )));
        }
        Ok(())
    }

    fn check_reshape(&self) -> BridgeResult<()> {
        if self.0[..REPETITION] != [0, 1, 2, 3] {
            return Err(BridgeError::InvalidShape(format!(
                "axis map {:?} must keep readout, phase and channel axes on 0..=3",
                self.0
            )));
        }
        if self.0.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BridgeError::InvalidShape(format!(
                "axis map {:?} must be strictly increasing",
                self.0
            )));
        }
        if self.0[LOCATION] >= MAX_DIMS {
            return Err(BridgeError::InvalidShape(format!(
                "axis map {:?} exceeds {MAX_DIMS} engine axes",
                self.0
            )));
        }
        Ok(())
    }

    /// Target axis of the repetition axis.
    pub fn repetition(&self) -> usize {
        self.0[REPETITION]
    }

    /// Target axis of the set axis.
    pub fn set(&self) -> usize {
        self.0[SET]
    }

    /// Target axis of the location axis.
    pub fn location(&self) -> usize {
        self.0[LOCATION]
    }

    /// Number of engine axes touched by this map.
    pub fn engine_rank(&self) -> usize {
        self.0[LOCATION] + 1
    }

    /// Bit-mask selecting every engine axis up to the outermost target.
    pub fn flags(&self) -> u32 {
        low_bits(self.engine_rank())
    }

    /// Targets in pipeline axis order.
    pub fn targets(&self) -> &[usize; PIPELINE_DIMS] {
        &self.0
    }
}

fn low_bits(count: usize) -> u32 {
    // count <= MAX_DIMS, so this never overflows
    ((1u64 << count) - 1) as u32
}

/// Engine-side layout of a pipeline array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLayout {
    /// Engine axis lengths; unused intermediate axes are 1.
    pub dims: Vec<usize>,
    /// Map that produced `dims`; pass it back to [`from_engine_layout`].
    pub axes: AxisMap,
    /// True when the array is handed over unchanged (single repetition).
    pub passthrough: bool,
}

impl EngineLayout {
    /// Reshape flags for this layout.
    pub fn flags(&self) -> u32 {
        self.axes.flags()
    }

    /// Engine command producing `output` in this layout from the registered `input`.
    pub fn command(&self, prefix: &str, input: &str, output: &str) -> Vec<String> {
        let mut args = vec![prefix.to_string()];
        if self.passthrough {
            args.extend(["scale".to_string(), "1.0".to_string()]);
        } else {
            args.push("reshape".to_string());
            args.push(self.flags().to_string());
            args.extend(self.dims.iter().map(usize::to_string));
        }
        args.push(input.to_string());
        args.push(output.to_string());
        args
    }
}

/// Lay a pipeline shape out on engine axes according to `policy`.
///
/// A single repetition degenerates to a pass-through with the identity map.
pub fn to_engine_layout(shape: &PipelineShape, policy: &AxisMap) -> BridgeResult<EngineLayout> {
    if shape.repetition() == 1 {
        return Ok(EngineLayout {
            dims: shape.0.to_vec(),
            axes: AxisMap::PASSTHROUGH,
            passthrough: true,
        });
    }

    policy.validate()?;
    let mut dims = vec![1usize; policy.engine_rank()];
    for (&target, &len) in policy.targets().iter().zip(&shape.0) {
        dims[target] = len;
    }
    trace!(%shape, ?dims, flags = policy.flags(), "pipeline to engine layout");
    Ok(EngineLayout {
        dims,
        axes: *policy,
        passthrough: false,
    })
}

fn engine_axis(engine_shape: &[usize], axis: usize) -> usize {
    engine_shape.get(axis).copied().unwrap_or(1)
}

/// 7-axis view of an engine result, with maps and repetitions merged into axis 4.
///
/// Maps vary fastest inside the composite axis. Engine axes outside the mapped ones
/// must be singleton, otherwise data would be silently dropped.
pub fn composite_shape(engine_shape: &[usize], axes: &AxisMap) -> BridgeResult<PipelineShape> {
    axes.check_reshape()?;
    if engine_shape.len() > MAX_DIMS {
        return Err(BridgeError::InvalidShape(format!(
            "engine shape {engine_shape:?} exceeds {MAX_DIMS} axes"
        )));
    }
    let mapped = |axis: usize| axis == MAPS_AXIS || axes.targets().contains(&axis);
    if let Some((axis, len)) = engine_shape
        .iter()
        .enumerate()
        .find(|&(axis, &len)| len != 1 && !mapped(axis))
    {
        return Err(BridgeError::InvalidShape(format!(
            "engine axis {axis} of {engine_shape:?} has length {len} but maps to no pipeline axis"
        )));
    }

    let e = |axis| engine_axis(engine_shape, axis);
    let composite = if axes.repetition() == MAPS_AXIS {
        e(MAPS_AXIS)
    } else {
        e(MAPS_AXIS) * e(axes.repetition())
    };
    Ok(PipelineShape([
        e(0),
        e(1),
        e(2),
        e(3),
        composite,
        e(axes.set()),
        e(axes.location()),
    ]))
}

/// Recover the pipeline shape of an engine result holding `maps_count` solutions per
/// repetition.
pub fn from_engine_layout(
    engine_shape: &[usize],
    axes: &AxisMap,
    maps_count: usize,
) -> BridgeResult<PipelineShape> {
    let composite = composite_shape(engine_shape, axes)?;
    let repetition = divide_maps(composite.repetition(), maps_count)?;
    Ok(composite.with_repetition(repetition))
}

fn divide_maps(composite: usize, maps_count: usize) -> BridgeResult<usize> {
    if maps_count == 0 {
        return Err(BridgeError::InvalidShape("maps count must be at least 1".into()));
    }
    if composite % maps_count != 0 {
        return Err(BridgeError::InvalidShape(format!(
            "composite axis of length {composite} is not divisible by {maps_count} maps"
        )));
    }
    Ok(composite / maps_count)
}

/// Engine command reshaping `input` into its [`composite_shape`] as `output`.
pub fn frames_reshape_command(
    engine_shape: &[usize],
    axes: &AxisMap,
    prefix: &str,
    input: &str,
    output: &str,
) -> BridgeResult<Vec<String>> {
    let composite = composite_shape(engine_shape, axes)?;
    let rank = engine_shape
        .len()
        .max(axes.engine_rank())
        .clamp(PIPELINE_DIMS, MAX_DIMS);

    let mut args = vec![
        prefix.to_string(),
        "reshape".to_string(),
        low_bits(rank).to_string(),
    ];
    args.extend(
        (0..rank).map(|axis| composite.0.get(axis).copied().unwrap_or(1).to_string()),
    );
    args.push(input.to_string());
    args.push(output.to_string());
    Ok(args)
}

/// Lazy selection of the first map of every repetition group.
///
/// Obtained from [`split_frames`]. The split borrows the composite buffer and can be
/// iterated any number of times.
#[derive(Debug, Clone, Copy)]
pub struct FrameSplit<'a> {
    buffer: &'a [Complex32],
    shape: PipelineShape,
    maps_count: usize,
}

/// Split a composite buffer into `[RO, E1, E2, CHA]` chunks, one per
/// `(location, set, repetition)` with the first of every `maps_count` maps selected.
pub fn split_frames<'a>(
    buffer: &'a [Complex32],
    shape: &PipelineShape,
    maps_count: usize,
) -> BridgeResult<FrameSplit<'a>> {
    divide_maps(shape.repetition(), maps_count)?;
    if buffer.len() != shape.len() {
        return Err(BridgeError::InvalidShape(format!(
            "buffer holds {} elements but shape {shape} needs {}",
            buffer.len(),
            shape.len()
        )));
    }
    Ok(FrameSplit {
        buffer,
        shape: *shape,
        maps_count,
    })
}

impl<'a> FrameSplit<'a> {
    /// Shape of the concatenated chunks.
    pub fn output_shape(&self) -> PipelineShape {
        self.shape
            .with_repetition(self.shape.repetition() / self.maps_count)
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        let out = self.output_shape();
        out.repetition() * out.set() * out.location()
    }

    /// Whether there are no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the chunks from the start.
    pub fn iter(&self) -> Frames<'a> {
        Frames {
            split: *self,
            next: 0,
            end: self.len(),
        }
    }

    /// Concatenate all chunks into the final pipeline buffer.
    pub fn collect_output(&self) -> Vec<Complex32> {
        let mut out = Vec::with_capacity(self.output_shape().len());
        for chunk in self.iter() {
            out.extend_from_slice(chunk);
        }
        out
    }

    fn chunk(&self, index: usize) -> &'a [Complex32] {
        let frame = self.shape.frame_len();
        let steps = self.shape.repetition() / self.maps_count;
        let sets = self.shape.set();

        let step = index % steps;
        let set = (index / steps) % sets;
        let location = index / (steps * sets);
        let repetition = step * self.maps_count;

        let offset = ((location * sets + set) * self.shape.repetition() + repetition) * frame;
        &self.buffer[offset..offset + frame]
    }
}

impl<'a> IntoIterator for &FrameSplit<'a> {
    type Item = &'a [Complex32];
    type IntoIter = Frames<'a>;

    fn into_iter(self) -> Frames<'a> {
        self.iter()
    }
}

/// Iterator over the chunks of a [`FrameSplit`].
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    split: FrameSplit<'a>,
    next: usize,
    end: usize,
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [Complex32];

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let chunk = self.split.chunk(self.next);
        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Frames<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<Complex32> {
        (0..len).map(|i| Complex32::new(i as f32, 0.0)).collect()
    }

    #[test]
    fn single_repetition_is_passthrough() {
        let shape = PipelineShape([64, 32, 1, 4, 1, 2, 3]);
        let layout = to_engine_layout(&shape, &AxisMap::default()).unwrap();
        assert!(layout.passthrough);
        assert_eq!(layout.dims, vec![64, 32, 1, 4, 1, 2, 3]);
        assert_eq!(
            layout.command("bart", "meas_gadgetron", "input_data"),
            ["bart", "scale", "1.0", "meas_gadgetron", "input_data"]
        );
    }

    #[test]
    fn repetitions_move_to_engine_time_axis() {
        let shape = PipelineShape([64, 32, 1, 4, 5, 1, 1]);
        let layout = to_engine_layout(&shape, &AxisMap::default()).unwrap();
        assert!(!layout.passthrough);
        assert_eq!(layout.dims, vec![64, 32, 1, 4, 1, 1, 1, 1, 1, 5, 1, 1]);
        assert_eq!(layout.flags(), 4095);
        let args = layout.command("bart", "in", "out");
        assert_eq!(args[1], "reshape");
        assert_eq!(args[2], "4095");
        assert_eq!(args.len(), 3 + 12 + 2);
    }

    #[test]
    fn round_trip_recovers_pipeline_shape() {
        let policies = [
            AxisMap::default(),
            AxisMap::new([0, 1, 2, 3, 5, 6, 7]).unwrap(),
        ];
        let shapes = [
            PipelineShape([128, 128, 1, 8, 4, 1, 1]),
            PipelineShape([16, 8, 4, 2, 3, 2, 5]),
            PipelineShape([16, 8, 1, 1, 1, 1, 1]),
        ];
        for policy in &policies {
            for shape in &shapes {
                let layout = to_engine_layout(shape, policy).unwrap();
                let back = from_engine_layout(&layout.dims, &layout.axes, 1).unwrap();
                assert_eq!(&back, shape, "policy {policy:?}");
            }
        }
    }

    #[test]
    fn maps_are_divided_out_of_composite_axis() {
        // engine result: 2 maps, 4 repetitions on axis 9
        let engine = [8, 8, 1, 1, 2, 1, 1, 1, 1, 4];
        let composite = composite_shape(&engine, &AxisMap::default()).unwrap();
        assert_eq!(composite, PipelineShape([8, 8, 1, 1, 8, 1, 1]));
        let out = from_engine_layout(&engine, &AxisMap::default(), 2).unwrap();
        assert_eq!(out.repetition(), 4);
    }

    #[test]
    fn non_dividing_maps_count_fails() {
        let engine = [8, 8, 1, 1, 3];
        for maps in [0, 2] {
            assert!(matches!(
                from_engine_layout(&engine, &AxisMap::PASSTHROUGH, maps),
                Err(BridgeError::InvalidShape(_))
            ));
        }
    }

    #[test]
    fn unmapped_engine_axis_is_rejected() {
        // axis 6 is neither maps nor a target of the default map
        let engine = [8, 8, 1, 1, 1, 1, 2, 1, 1, 4];
        assert!(matches!(
            composite_shape(&engine, &AxisMap::default()),
            Err(BridgeError::InvalidShape(_))
        ));
    }

    #[test]
    fn invalid_axis_maps_are_rejected() {
        for targets in [
            [0, 1, 2, 3, 9, 7, 8],
            [1, 0, 2, 3, 4, 5, 6],
            [0, 1, 2, 3, 9, 10, 16],
            [0, 1, 2, 3, 4, 5, 6],
            [0, 1, 2, 3, 4, 9, 10],
        ] {
            assert!(AxisMap::new(targets).is_err(), "{targets:?}");
        }
    }

    #[test]
    fn repetitions_on_the_maps_axis_are_rejected() {
        let err = AxisMap::new([0, 1, 2, 3, 4, 9, 10]).unwrap_err();
        assert!(err.to_string().contains("maps axis"), "{err}");
        let shape = PipelineShape([2, 1, 1, 1, 3, 1, 1]);
        let policy: AxisMap = serde_json::from_str("[0, 1, 2, 3, 4, 9, 10]").unwrap();
        assert!(matches!(
            to_engine_layout(&shape, &policy),
            Err(BridgeError::InvalidShape(_))
        ));
        // a single repetition never consults the policy
        let single = to_engine_layout(&shape.with_repetition(1), &policy).unwrap();
        assert!(single.passthrough);
    }

    #[test]
    fn frames_reshape_command_merges_maps_and_time() {
        let engine = [8, 8, 1, 1, 2, 1, 1, 1, 1, 4];
        let args =
            frames_reshape_command(&engine, &AxisMap::default(), "bart", "out", "out_reshape")
                .unwrap();
        assert_eq!(
            args,
            [
                "bart", "reshape", "4095", "8", "8", "1", "1", "8", "1", "1", "1", "1", "1",
                "1", "1", "out", "out_reshape"
            ]
        );
    }

    #[test]
    fn split_with_one_map_is_identity() {
        let shape = PipelineShape([2, 3, 1, 2, 3, 2, 2]);
        let data = ramp(shape.len());
        let split = split_frames(&data, &shape, 1).unwrap();
        assert_eq!(split.len(), 12);
        let joined: Vec<Complex32> = split.iter().flatten().copied().collect();
        assert_eq!(joined, data);
        assert_eq!(split.collect_output(), data);
        assert_eq!(split.output_shape(), shape);
    }

    #[test]
    fn split_selects_first_map_of_each_group() {
        let shape = PipelineShape([128, 128, 1, 8, 4, 1, 1]);
        let data = ramp(shape.len());
        let split = split_frames(&data, &shape, 2).unwrap();
        assert_eq!(split.output_shape().repetition(), 2);
        assert_eq!(split.len(), 2);

        let frame = shape.frame_len();
        let chunks: Vec<_> = split.iter().collect();
        assert_eq!(chunks[0], &data[..frame]);
        assert_eq!(chunks[1], &data[2 * frame..3 * frame]);
        assert_eq!(split.collect_output().len(), split.output_shape().len());
    }

    #[test]
    fn split_is_restartable() {
        let shape = PipelineShape([2, 1, 1, 1, 4, 3, 1]);
        let data = ramp(shape.len());
        let split = split_frames(&data, &shape, 2).unwrap();
        let mut first = split.iter();
        assert_eq!(first.len(), 6);
        first.next();
        let resumed = first.clone();
        assert_eq!(resumed.count(), 5);
        assert_eq!(split.iter().count(), 6);
        // (set 1, step 0) starts at repetition 0 of set 1
        assert_eq!(split.iter().nth(2).unwrap()[0], Complex32::new(8.0, 0.0));
    }

    #[test]
    fn split_rejects_bad_inputs() {
        let shape = PipelineShape([2, 2, 1, 1, 3, 1, 1]);
        let data = ramp(shape.len());
        assert!(matches!(
            split_frames(&data, &shape, 2),
            Err(BridgeError::InvalidShape(_))
        ));
        assert!(matches!(
            split_frames(&data, &shape, 0),
            Err(BridgeError::InvalidShape(_))
        ));
        assert!(matches!(
            split_frames(&data[1..], &shape, 1),
            Err(BridgeError::InvalidShape(_))
        ));
    }

    #[test]
    fn pipeline_shape_from_cfl_dims() {
        let mut dims = vec![1usize; 16];
        dims[0] = 32;
        dims[4] = 3;
        let shape = PipelineShape::from_dims(&dims).unwrap();
        assert_eq!(shape, PipelineShape([32, 1, 1, 1, 3, 1, 1]));
        dims[8] = 2;
        assert!(PipelineShape::from_dims(&dims).is_err());
    }
}
