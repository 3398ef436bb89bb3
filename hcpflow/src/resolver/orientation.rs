//! Direction and spacing values derived from acquisition metadata.

use crate::dataset::FileEntry;
use crate::errors::ConfigurationError;

const ORIENTATION_KEY: &str = "ImageOrientationPatientDICOM";
const IN_PLANE_PED_KEY: &str = "InPlanePhaseEncodingDirectionDICOM";

/// Returns the readout (unwarp) direction of an anatomical image, e.g. `z-`.
///
/// The readout vector is the orientation triple opposite the in-plane
/// phase-encoding axis. Only meaningful for RAS-oriented images.
pub fn readout_dir(entry: &FileEntry) -> Result<String, ConfigurationError> {
    let orientation: Vec<f64> = entry
        .metadata
        .get(ORIENTATION_KEY)
        .and_then(serde_json::Value::as_array)
        .map(|values| values.iter().filter_map(serde_json::Value::as_f64).collect())
        .unwrap_or_default();
    if orientation.len() != 6 {
        return Err(entry.missing(ORIENTATION_KEY));
    }

    let ped = entry.require_text(IN_PLANE_PED_KEY)?;
    let vector = match ped {
        "ROW" => &orientation[3..],
        "COL" | "COLUMN" => &orientation[..3],
        other => {
            return Err(ConfigurationError::UnrecognizedPhaseEncoding {
                value: other.to_string(),
            })
        }
    };

    let (axis, component) = vector
        .iter()
        .copied()
        .enumerate()
        .fold((0, 0.0_f64), |best, (i, v)| {
            if v.abs() > best.1.abs() {
                (i, v)
            } else {
                best
            }
        });

    let mut dir = ["x", "y", "z"][axis].to_string();
    if component < 0.0 {
        dir.push('-');
    }
    Ok(dir)
}

/// Converts a voxel-axis phase-encoding direction (`j-`, `-i`, `k`) to a
/// world-axis direction (`y-`, `x-`, `z`).
pub fn ijk_to_xyz(value: &str) -> Result<String, ConfigurationError> {
    let unrecognized = || ConfigurationError::UnrecognizedPhaseEncoding {
        value: value.to_string(),
    };

    let (axis, negative) = match value.as_bytes() {
        [a] => (*a, false),
        [a, b'-'] | [b'-', a] => (*a, true),
        _ => return Err(unrecognized()),
    };
    let world = match axis {
        b'i' => 'x',
        b'j' => 'y',
        b'k' => 'z',
        _ => return Err(unrecognized()),
    };

    Ok(if negative {
        format!("{world}-")
    } else {
        world.to_string()
    })
}

/// Returns the sample spacing of an anatomical image in seconds.
///
/// Uses `DwellTime` when recorded, otherwise derives the real dwell time
/// from bandwidth, matrix size and in-plane acceleration.
pub fn sample_spacing(entry: &FileEntry) -> Result<String, ConfigurationError> {
    if let Some(dwell) = entry.number("DwellTime") {
        return Ok(format_trimmed(dwell, 12));
    }

    let bandwidth = entry.require_number("PixelBandwidth")?;
    let steps = entry.require_number("AcquisitionMatrixPE")?;
    let parallel = entry.number("ParallelReductionFactorInPlane").unwrap_or(1.0);
    let product = bandwidth * steps * parallel;
    if product <= 0.0 {
        return Err(entry.missing("PixelBandwidth"));
    }
    Ok(format!("{:.9}", 1.0 / product))
}

/// Formats with fixed decimals and strips trailing zeros.
#[must_use]
pub fn format_trimmed(value: f64, decimals: usize) -> String {
    let fixed = format!("{value:.decimals$}");
    if !fixed.contains('.') {
        return fixed;
    }
    fixed.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Formats like C's `%g`: six significant digits, trailing zeros dropped,
/// exponent notation outside `1e-4 <= |v| < 1e6`.
#[must_use]
pub fn format_general(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }

    let sci = format!("{value:.5e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if !(-4..6).contains(&exponent) {
        let mantissa = if mantissa.contains('.') {
            mantissa.trim_end_matches('0').trim_end_matches('.')
        } else {
            mantissa
        };
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }

    let decimals = usize::try_from(5 - exponent).unwrap_or(0);
    format_trimmed(value, decimals)
}
