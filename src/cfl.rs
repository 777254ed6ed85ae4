//! CFL file interchange.
//!
//! A CFL array is a pair of files sharing a base name: `<base>.hdr` holds the axis
//! lengths as text and `<base>.cfl` the raw elements as little-endian `f32` pairs
//! (real, imaginary), first axis fastest.
//!
//! ```text
//! # Dimensions
//! 128 128 1 8 1 1 1 1 1 1 1 1 1 1 1 1
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use num_complex::Complex32;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::{element_count, MAX_DIMS};

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `data` with `shape` to `<base>.hdr` and `<base>.cfl`.
pub fn write_cfl(base: &Path, shape: &[usize], data: &[Complex32]) -> BridgeResult<()> {
    let count = element_count(shape)?;
    if count != data.len() {
        return Err(BridgeError::InvalidShape(format!(
            "shape {shape:?} holds {count} elements but {} were given",
            data.len()
        )));
    }

    let hdr = with_suffix(base, ".hdr");
    let mut dims = shape.to_vec();
    dims.resize(MAX_DIMS, 1);
    let line: Vec<String> = dims.iter().map(usize::to_string).collect();
    std::fs::write(&hdr, format!("# Dimensions\n{}\n", line.join(" ")))
        .map_err(|e| BridgeError::io(&hdr, e))?;

    let cfl = with_suffix(base, ".cfl");
    let file = File::create(&cfl).map_err(|e| BridgeError::io(&cfl, e))?;
    let mut writer = BufWriter::new(file);
    for c in data {
        writer
            .write_all(&c.re.to_le_bytes())
            .and_then(|()| writer.write_all(&c.im.to_le_bytes()))
            .map_err(|e| BridgeError::io(&cfl, e))?;
    }
    writer.flush().map_err(|e| BridgeError::io(&cfl, e))?;
    debug!(path = %cfl.display(), ?shape, "wrote CFL");
    Ok(())
}

/// Read the axis lengths stored in `<base>.hdr`, trailing singleton axes removed.
pub fn read_header(base: &Path) -> BridgeResult<Vec<usize>> {
    let hdr = with_suffix(base, ".hdr");
    let file = File::open(&hdr).map_err(|e| BridgeError::io(&hdr, e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| BridgeError::io(&hdr, e))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut shape = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<usize>().map_err(|_| {
                    BridgeError::InvalidShape(format!("bad dimension '{tok}' in {}", hdr.display()))
                })
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        if shape.len() > MAX_DIMS {
            return Err(BridgeError::InvalidShape(format!(
                "{} declares {} axes",
                hdr.display(),
                shape.len()
            )));
        }
        while shape.len() > 1 && shape.last() == Some(&1) {
            shape.pop();
        }
        return Ok(shape);
    }
    Err(BridgeError::InvalidShape(format!("{} has no dimensions line", hdr.display())))
}

/// Read `<base>.hdr` and `<base>.cfl`.
pub fn read_cfl(base: &Path) -> BridgeResult<(Vec<usize>, Vec<Complex32>)> {
    let shape = read_header(base)?;
    let count = element_count(&shape)?;

    let cfl = with_suffix(base, ".cfl");
    let mut bytes = Vec::with_capacity(count * 8);
    File::open(&cfl)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| BridgeError::io(&cfl, e))?;
    if bytes.len() != count * 8 {
        return Err(BridgeError::InvalidShape(format!(
            "{} holds {} bytes, expected {} for shape {shape:?}",
            cfl.display(),
            bytes.len(),
            count * 8
        )));
    }

    let data = bytes
        .chunks_exact(8)
        .map(|pair| {
            let re = f32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let im = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
            Complex32::new(re, im)
        })
        .collect();
    debug!(path = %cfl.display(), ?shape, "read CFL");
    Ok((shape, data))
}
