//! Raw point packing and metadata fingerprints

use super::key_hash;
use crate::{Metadata, RawPoint};
use bytes::{Buf, BufMut, BytesMut};
use serde_json::{Map, Value};

/// Encoded size of one raw point: i64 LE nanos followed by f64 LE value
pub const POINT_SIZE: usize = 16;

/// Append one point to a buffer
pub fn pack_point(buf: &mut BytesMut, point: &RawPoint) {
    buf.reserve(POINT_SIZE);
    buf.put_i64_le(point.timestamp);
    buf.put_f64_le(point.value);
}

/// Decode every complete point in `data`; a trailing partial record is ignored
pub fn unpack_points(mut data: &[u8]) -> Vec<RawPoint> {
    let mut points = Vec::with_capacity(data.len() / POINT_SIZE);
    while data.remaining() >= POINT_SIZE {
        let timestamp = data.get_i64_le();
        let value = data.get_f64_le();
        points.push(RawPoint::new(timestamp, value));
    }
    points
}

/// Key-sorted JSON form of a metadata map
pub fn canonical_metadata(metadata: &Metadata) -> String {
    let map: Map<String, Value> = metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map).to_string()
}

/// Hash identifying one metadata variant of a metric
pub fn metadata_fingerprint(metadata: &Metadata) -> u32 {
    key_hash(&canonical_metadata(metadata))
}
