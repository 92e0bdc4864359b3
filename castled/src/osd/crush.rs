//! CRUSH placement helpers.

use anyhow::{bail, Result};

const FIELD_HOST: &str = "host";
const FIELD_ROOT: &str = "root";
const DEFAULT_ROOT: &str = "default";

/// Parse a CRUSH location made of `k=v` pairs separated by whitespace or commas.
pub fn parse_location(location: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = vec![];
    for field in crate::config::split_list(location) {
        match field.split_once('=') {
            Some((key, val)) if !key.is_empty() && !val.is_empty() => pairs.push((key.to_string(), val.to_string())),
            _ => bail!("CRUSH location field {:?} is not in a valid format", field),
        }
    }
    Ok(pairs)
}

/// Build the location arguments of `osd crush create-or-move`, defaulting the host to the
/// given name and the root to `default`.
pub fn format_location(location: &str, host: &str) -> Result<Vec<String>> {
    let mut pairs = parse_location(location)?;
    if !pairs.iter().any(|(key, _)| key == FIELD_HOST) {
        pairs.push((FIELD_HOST.into(), host.into()));
    }
    if !pairs.iter().any(|(key, _)| key == FIELD_ROOT) {
        pairs.push((FIELD_ROOT.into(), DEFAULT_ROOT.into()));
    }
    Ok(pairs.into_iter().map(|(key, val)| format!("{}={}", key, val)).collect())
}

/// The CRUSH weight of a store of the given size: KiB over 1 TiB, rounded to four decimals.
pub fn weight(total_bytes: u64) -> f64 {
    let raw = (total_bytes / 1024) as f64 / 1_073_741_824.0;
    (raw * 10_000.0).round() / 10_000.0
}

/// A weight in the form the admin tool expects.
pub fn format_weight(weight: f64) -> String {
    format!("{:.4}", weight)
}
