//! Command script parsing.
//!
//! A command script is line-oriented text. Everything after the first `#` on a line is a
//! comment; blank lines and lines that do not start with the engine's command prefix are
//! ignored. Command lines may reference reconstruction parameters as `$name`:
//!
//! ```text
//! # coil sensitivities, then a parallel-imaging reconstruction
//! bart ecalib -r $reference_lines_PE1 input_data maps
//! bart pics -S input_data maps recon     # last token names the result
//! ```
//!
//! Turning a line into an engine invocation is two steps: [`substitute_parameters`]
//! followed by [`tokenize`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{CommandRequest, MAX_ARGS};
use crate::error::{BridgeError, BridgeResult};

/// Default prefix of command lines.
pub const DEFAULT_COMMAND_PREFIX: &str = "bart";

/// Reconstruction parameters available to scripts as `$name`.
#[allow(non_snake_case)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconParameters {
    /// Reconstruction matrix size along readout.
    pub recon_matrix_x: u16,
    /// Reconstruction matrix size along phase encoding 1.
    pub recon_matrix_y: u16,
    /// Reconstruction matrix size along phase encoding 2.
    pub recon_matrix_z: u16,
    /// Field of view along x in mm.
    pub FOV_x: u16,
    /// Field of view along y in mm.
    pub FOV_y: u16,
    /// Field of view along z in mm.
    pub FOV_z: u16,
    /// Acceleration factor along phase encoding 1.
    pub acc_factor_PE1: u16,
    /// Acceleration factor along phase encoding 2.
    pub acc_factor_PE2: u16,
    /// Calibration region size along phase encoding 1.
    pub reference_lines_PE1: u16,
    /// Calibration region size along phase encoding 2.
    pub reference_lines_PE2: u16,
}

impl ReconParameters {
    /// Names accepted by [`ReconParameters::get`].
    pub const NAMES: [&'static str; 10] = [
        "recon_matrix_x",
        "recon_matrix_y",
        "recon_matrix_z",
        "FOV_x",
        "FOV_y",
        "FOV_z",
        "acc_factor_PE1",
        "acc_factor_PE2",
        "reference_lines_PE1",
        "reference_lines_PE2",
    ];

    /// Value of the parameter called `name`.
    pub fn get(&self, name: &str) -> Option<u16> {
        let value = match name {
            "recon_matrix_x" => self.recon_matrix_x,
            "recon_matrix_y" => self.recon_matrix_y,
            "recon_matrix_z" => self.recon_matrix_z,
            "FOV_x" => self.FOV_x,
            "FOV_y" => self.FOV_y,
            "FOV_z" => self.FOV_z,
            "acc_factor_PE1" => self.acc_factor_PE1,
            "acc_factor_PE2" => self.acc_factor_PE2,
            "reference_lines_PE1" => self.reference_lines_PE1,
            "reference_lines_PE2" => self.reference_lines_PE2,
            _ => return None,
        };
        Some(value)
    }
}

/// Replace every `$name` in `line` with the value of the named parameter.
///
/// A name runs from the `$` to the next whitespace. Unknown names are an error.
pub fn substitute_parameters(line: &str, params: &ReconParameters) -> BridgeResult<String> {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        let name = &after[..end];
        let value = params
            .get(name)
            .ok_or_else(|| BridgeError::UnknownParameter {
                name: name.to_string(),
                line: line.to_string(),
            })?;
        out.push_str(&value.to_string());
        rest = &after[end..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split a substituted line on whitespace into an engine request.
pub fn tokenize(line: &str, output_capacity: usize) -> BridgeResult<CommandRequest> {
    let args: Vec<String> = line.split_whitespace().map(String::from).collect();
    if args.len() > MAX_ARGS {
        return Err(BridgeError::TooManyArguments {
            count: args.len(),
            limit: MAX_ARGS,
            line: line.to_string(),
        });
    }
    Ok(CommandRequest::new(args)?.with_output_capacity(output_capacity))
}

/// One command line of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    /// 1-based line number in the source text.
    pub number: usize,
    /// Comment-stripped, trimmed text before substitution.
    pub text: String,
}

impl fmt::Display for ScriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.number, self.text)
    }
}

/// Parsed command script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    lines: Vec<ScriptLine>,
}

impl Script {
    /// Keep the command lines of `source` that start with `prefix`.
    pub fn parse(source: &str, prefix: &str) -> Self {
        let lines = source
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let text = raw.split('#').next().unwrap_or_default().trim();
                let is_command = text.split_whitespace().next() == Some(prefix);
                is_command.then(|| ScriptLine {
                    number: idx + 1,
                    text: text.to_string(),
                })
            })
            .collect();
        Self { lines }
    }

    /// Read and parse a script file.
    pub fn from_file(path: &Path, prefix: &str) -> BridgeResult<Self> {
        if !path.is_file() {
            return Err(BridgeError::ScriptNotFound(path.to_path_buf()));
        }
        let source = std::fs::read_to_string(path).map_err(|e| BridgeError::io(path, e))?;
        Ok(Self::parse(&source, prefix))
    }

    /// Command lines in order.
    pub fn lines(&self) -> &[ScriptLine] {
        &self.lines
    }

    /// Number of command lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the script has no command lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
