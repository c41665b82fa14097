//! Fixed-order binary records for layer configuration.
//!
//! A record is the node type name (length-prefixed UTF-8), the model version
//! token, then the layer's fields. Sizes are little-endian `u64`, flags one byte.

use crate::error::{ConvError, Result};
use std::io::{Read, Write};

/// Version written by [`write_header`]. Records with a larger version were
/// produced by a newer format and are rejected.
pub const CURRENT_MODEL_VERSION: u64 = 1;

const MAX_TYPE_NAME_LEN: usize = 256;

fn io_err(operation: &str) -> impl Fn(std::io::Error) -> ConvError + '_ {
    move |e| ConvError::serialization(operation, e.to_string())
}

pub fn write_header(w: &mut dyn Write, type_name: &str) -> Result<()> {
    write_usize(w, type_name.len())?;
    w.write_all(type_name.as_bytes()).map_err(io_err("write_header"))?;
    write_u64(w, CURRENT_MODEL_VERSION)
}

/// Read a record header, check the type name and return the model version.
pub fn read_header(r: &mut dyn Read, expected_type: &str) -> Result<u64> {
    let len = read_usize(r)?;
    if len > MAX_TYPE_NAME_LEN {
        return Err(ConvError::serialization("read_header", format!("type name length {} is implausible", len)));
    }
    let mut name = vec![0u8; len];
    r.read_exact(&mut name).map_err(io_err("read_header"))?;
    let name = String::from_utf8(name)
        .map_err(|e| ConvError::serialization("read_header", e.to_string()))?;
    if name != expected_type {
        return Err(ConvError::serialization(
            "read_header",
            format!("expected a {} record, found {}", expected_type, name),
        ));
    }

    let version = read_u64(r)?;
    if version > CURRENT_MODEL_VERSION {
        return Err(ConvError::serialization(
            "read_header",
            format!("model version {} is newer than supported version {}", version, CURRENT_MODEL_VERSION),
        ));
    }
    Ok(version)
}

pub fn write_u64(w: &mut dyn Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes()).map_err(io_err("write_u64"))
}

pub fn read_u64(r: &mut dyn Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    r.read_exact(&mut bytes).map_err(io_err("read_u64"))?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_usize(w: &mut dyn Write, value: usize) -> Result<()> {
    write_u64(w, value as u64)
}

pub fn read_usize(r: &mut dyn Read) -> Result<usize> {
    let value = read_u64(r)?;
    usize::try_from(value)
        .map_err(|_| ConvError::serialization("read_usize", format!("{} does not fit in usize", value)))
}

pub fn write_bool(w: &mut dyn Write, value: bool) -> Result<()> {
    w.write_all(&[value as u8]).map_err(io_err("write_bool"))
}

pub fn read_bool(r: &mut dyn Read) -> Result<bool> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte).map_err(io_err("read_bool"))?;
    match byte[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ConvError::serialization("read_bool", format!("invalid flag byte {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip_and_type_check() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, "MaxPooling").unwrap();
        write_usize(&mut bytes, 42).unwrap();
        write_bool(&mut bytes, true).unwrap();

        let mut r = Cursor::new(bytes.clone());
        assert_eq!(read_header(&mut r, "MaxPooling").unwrap(), CURRENT_MODEL_VERSION);
        assert_eq!(read_usize(&mut r).unwrap(), 42);
        assert!(read_bool(&mut r).unwrap());

        let err = read_header(&mut Cursor::new(bytes), "AveragePooling").unwrap_err();
        assert!(matches!(err, ConvError::Serialization { .. }));
    }

    #[test]
    fn newer_versions_and_truncation_are_rejected() {
        let mut bytes = Vec::new();
        write_usize(&mut bytes, 4).unwrap();
        bytes.extend_from_slice(b"Conv");
        write_u64(&mut bytes, CURRENT_MODEL_VERSION + 1).unwrap();
        assert!(read_header(&mut Cursor::new(bytes), "Conv").is_err());

        let mut r = Cursor::new(vec![1u8, 2, 3]);
        assert!(read_u64(&mut r).is_err());
    }
}
