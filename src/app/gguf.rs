//! GGUF header parsing and validation
//!
//! Reads the structured header of a GGUF artifact - magic, version, tensor
//! count, and the key-value metadata block - without materializing tensor
//! data. Reads are incremental with hard sanity caps on counts and string
//! lengths, so memory stays bounded regardless of artifact size; oversized
//! arrays (tokenizer vocabularies) are consumed and skipped rather than
//! loaded.
//!
//! Parsing is synchronous over any `Read`; the async entry point runs it on
//! the blocking pool since header reads are a few kilobytes of buffered I/O.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::app::models::ModelMetadata;
use crate::constants::verify as limits;
use crate::errors::{VerifyError, VerifyResult};

/// GGUF magic: the bytes `GGUF` read as a little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Header versions this reader understands
pub const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

/// Fixed-size portion of a GGUF header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    /// Format version
    pub version: u32,
    /// Number of tensors declared
    pub tensor_count: u64,
    /// Number of metadata key-value pairs declared
    pub metadata_kv_count: u64,
}

/// A metadata value from the GGUF key-value block
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    /// Array longer than the inline cap; contents consumed, not retained
    SkippedArray { len: u64 },
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    /// Try to convert the value to a u64
    ///
    /// Only non-negative integer values convert.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            Self::I8(v) if *v >= 0 => Some(*v as u64),
            Self::I16(v) if *v >= 0 => Some(*v as u64),
            Self::I32(v) if *v >= 0 => Some(*v as u64),
            Self::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Try to get the value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Raw metadata keyed by GGUF key name
pub type RawMetadata = HashMap<String, GgufValue>;

// GGUF metadata value type tags
const T_U8: u32 = 0;
const T_I8: u32 = 1;
const T_U16: u32 = 2;
const T_I16: u32 = 3;
const T_U32: u32 = 4;
const T_I32: u32 = 5;
const T_F32: u32 = 6;
const T_BOOL: u32 = 7;
const T_STRING: u32 = 8;
const T_ARRAY: u32 = 9;
const T_U64: u32 = 10;
const T_I64: u32 = 11;
const T_F64: u32 = 12;

fn invalid(reason: impl Into<String>) -> VerifyError {
    VerifyError::InvalidHeader {
        reason: reason.into(),
    }
}

fn read_exact<R: Read, const N: usize>(reader: &mut R) -> VerifyResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => invalid("truncated header"),
            _ => VerifyError::Io(e),
        })?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> VerifyResult<u32> {
    Ok(u32::from_le_bytes(read_exact::<R, 4>(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> VerifyResult<u64> {
    Ok(u64::from_le_bytes(read_exact::<R, 8>(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> VerifyResult<String> {
    let len = read_u64(reader)?;
    if len > limits::MAX_STRING_LEN {
        return Err(invalid(format!("string of {len} bytes exceeds cap")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => invalid("truncated string"),
        _ => VerifyError::Io(e),
    })?;
    String::from_utf8(buf).map_err(|_| invalid("metadata string is not UTF-8"))
}

fn read_value<R: Read>(reader: &mut R, value_type: u32) -> VerifyResult<GgufValue> {
    let value = match value_type {
        T_U8 => GgufValue::U8(read_exact::<R, 1>(reader)?[0]),
        T_I8 => GgufValue::I8(read_exact::<R, 1>(reader)?[0] as i8),
        T_U16 => GgufValue::U16(u16::from_le_bytes(read_exact::<R, 2>(reader)?)),
        T_I16 => GgufValue::I16(i16::from_le_bytes(read_exact::<R, 2>(reader)?)),
        T_U32 => GgufValue::U32(read_u32(reader)?),
        T_I32 => GgufValue::I32(i32::from_le_bytes(read_exact::<R, 4>(reader)?)),
        T_F32 => GgufValue::F32(f32::from_le_bytes(read_exact::<R, 4>(reader)?)),
        T_BOOL => GgufValue::Bool(read_exact::<R, 1>(reader)?[0] != 0),
        T_STRING => GgufValue::String(read_string(reader)?),
        T_U64 => GgufValue::U64(read_u64(reader)?),
        T_I64 => GgufValue::I64(i64::from_le_bytes(read_exact::<R, 8>(reader)?)),
        T_F64 => GgufValue::F64(f64::from_le_bytes(read_exact::<R, 8>(reader)?)),
        T_ARRAY => {
            let elem_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            if len <= limits::MAX_INLINE_ARRAY {
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_value(reader, elem_type)?);
                }
                GgufValue::Array(items)
            } else {
                // Consume without retaining; vocab arrays run to hundreds of
                // thousands of entries
                for _ in 0..len {
                    read_value(reader, elem_type)?;
                }
                GgufValue::SkippedArray { len }
            }
        }
        other => return Err(invalid(format!("unknown metadata value type {other}"))),
    };
    Ok(value)
}

/// Read and validate the fixed-size header
pub fn read_header<R: Read>(reader: &mut R) -> VerifyResult<GgufHeader> {
    let magic = read_u32(reader)?;
    if magic != GGUF_MAGIC {
        return Err(invalid(format!(
            "bad magic 0x{magic:08x}, expected 0x{GGUF_MAGIC:08x}"
        )));
    }

    let version = read_u32(reader)?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(VerifyError::UnsupportedVersion { version });
    }

    let tensor_count = read_u64(reader)?;
    if tensor_count > limits::MAX_TENSOR_COUNT {
        return Err(invalid(format!(
            "declared tensor count {tensor_count} exceeds cap"
        )));
    }

    let metadata_kv_count = read_u64(reader)?;
    if metadata_kv_count > limits::MAX_METADATA_KV {
        return Err(invalid(format!(
            "declared metadata count {metadata_kv_count} exceeds cap"
        )));
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Read the header and the full key-value metadata block
pub fn read_raw_metadata<R: Read>(reader: &mut R) -> VerifyResult<(GgufHeader, RawMetadata)> {
    let header = read_header(reader)?;
    let mut raw = RawMetadata::with_capacity(header.metadata_kv_count.min(1024) as usize);

    for _ in 0..header.metadata_kv_count {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;
        let value = read_value(reader, value_type)?;
        raw.insert(key, value);
    }

    Ok((header, raw))
}

/// Map a GGUF `general.file_type` tag to a quantization label
pub fn file_type_name(file_type: u64) -> Option<&'static str> {
    let name = match file_type {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        19 => "IQ2_XXS",
        20 => "IQ2_XS",
        24 => "IQ1_S",
        25 => "IQ4_NL",
        30 => "BF16",
        _ => return None,
    };
    Some(name)
}

/// Extract the model metadata the engine cares about from raw key-values
pub fn extract_model_metadata(raw: &RawMetadata) -> ModelMetadata {
    let architecture = raw
        .get("general.architecture")
        .and_then(GgufValue::as_str)
        .map(str::to_string);

    let arch_key = |suffix: &str| -> Option<u64> {
        let arch = architecture.as_deref()?;
        raw.get(&format!("{arch}.{suffix}")).and_then(GgufValue::as_u64)
    };

    ModelMetadata {
        parameter_count: raw
            .get("general.parameter_count")
            .and_then(GgufValue::as_u64),
        context_length: arch_key("context_length"),
        embedding_length: arch_key("embedding_length"),
        head_count: arch_key("attention.head_count"),
        block_count: arch_key("block_count"),
        quantization: raw
            .get("general.file_type")
            .and_then(GgufValue::as_u64)
            .and_then(file_type_name)
            .map(str::to_string),
        architecture,
    }
}

/// Validate the header of an artifact on disk and extract its metadata
///
/// Runs the synchronous parser on the blocking pool; the read touches only
/// the header region of the file.
pub async fn read_file_metadata(path: &Path) -> VerifyResult<ModelMetadata> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> VerifyResult<ModelMetadata> {
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::new(file);
        let (_, raw) = read_raw_metadata(&mut reader)?;
        Ok(extract_model_metadata(&raw))
    })
    .await
    .map_err(|e| invalid(format!("header parse task failed: {e}")))?
}
