//! InfluxDB line protocol, as accepted by `POST /write`
//!
//! `measurement,tag1=v1,tag2=v2 field1=1.5,field2=7i 1609459200000000000`
//!
//! Every numeric field becomes one sample keyed `measurement.field` with
//! the point's tags as metadata. String and boolean fields fail the whole
//! point; the other points of the body are still accepted.

use tempora_core::{Metadata, Metric, Result, TemporaError, Timestamp};

/// Outcome of decoding one request body
#[derive(Debug, Default)]
pub struct Decoded {
    pub metrics: Vec<Metric>,
    /// Rejected points as (line number, error)
    pub errors: Vec<(usize, TemporaError)>,
}

/// Nanoseconds per unit of a `precision` parameter
pub fn precision_multiplier(precision: &str) -> Result<i64> {
    match precision {
        "" | "ns" | "n" => Ok(1),
        "us" | "u" => Ok(1_000),
        "ms" => Ok(1_000_000),
        "s" => Ok(1_000_000_000),
        other => Err(TemporaError::Decode(format!("unknown precision: {}", other))),
    }
}

/// Decode a request body; points without a timestamp get `now`
pub fn parse_body(body: &str, precision: &str, now: Timestamp) -> Result<Decoded> {
    let multiplier = precision_multiplier(precision)?;
    let mut decoded = Decoded::default();

    for (idx, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line, multiplier, now) {
            Ok(metrics) => decoded.metrics.extend(metrics),
            Err(e) => decoded.errors.push((idx + 1, e)),
        }
    }

    Ok(decoded)
}

fn parse_line(line: &str, multiplier: i64, now: Timestamp) -> Result<Vec<Metric>> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return Err(TemporaError::Decode(format!("missing fields: {}", line)));
    }

    let mut series = parts[0].split(',');
    let measurement = series.next().unwrap_or_default();
    if measurement.is_empty() {
        return Err(TemporaError::Decode(format!("missing measurement: {}", line)));
    }

    let mut tags = Metadata::new();
    for tag in series {
        let (k, v) = tag
            .split_once('=')
            .ok_or_else(|| TemporaError::Decode(format!("malformed tag '{}'", tag)))?;
        tags.insert(k.to_string(), v.to_string());
    }

    let timestamp = match parts.get(2).map(|t| t.trim()) {
        Some(raw) if !raw.is_empty() => {
            let ts = raw
                .parse::<i64>()
                .map_err(|_| TemporaError::Decode(format!("invalid timestamp '{}'", raw)))?;
            ts.checked_mul(multiplier)
                .ok_or_else(|| TemporaError::Decode(format!("timestamp {} out of range", raw)))?
        }
        _ => now,
    };

    let mut metrics = Vec::new();
    for field in parts[1].split(',') {
        let (name, raw) = field
            .split_once('=')
            .ok_or_else(|| TemporaError::Decode(format!("malformed field '{}'", field)))?;
        let value = parse_field_value(raw)
            .map_err(|e| TemporaError::Decode(format!("field '{}': {}", name, e)))?;

        let mut metric = Metric::new(format!("{}.{}", measurement, name), value, timestamp);
        metric.metadata = tags.clone();
        metrics.push(metric);
    }

    Ok(metrics)
}

/// Numeric field value; integers carry an `i` suffix
fn parse_field_value(s: &str) -> std::result::Result<f64, String> {
    if s.starts_with('"') {
        return Err("string fields are not supported".into());
    }
    if matches!(s, "t" | "T" | "true" | "True" | "TRUE" | "f" | "F" | "false" | "False" | "FALSE") {
        return Err("boolean fields are not supported".into());
    }
    if let Some(int) = s.strip_suffix('i') {
        return int
            .parse::<i64>()
            .map(|n| n as f64)
            .map_err(|_| format!("invalid integer '{}'", s));
    }
    s.parse::<f64>()
        .map_err(|_| format!("invalid field value '{}'", s))
}
