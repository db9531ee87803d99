//! Wire-bytes-to-tree-events direction of the transcoder.
//!
//! Simplification versus `protobuf_interop.cpp`'s reader (documented as a
//! deliberate scope cut, not an oversight): repeated fields are assumed to
//! appear as a contiguous run of same-numbered entries in the wire stream,
//! which is what [`super::writer::ProtobufWriter`] always produces. A wire
//! blob with a repeated field's occurrences split apart by other fields is
//! rejected with [`TranscoderError::MalformedWire`] rather than silently
//! reordered.

use std::sync::Arc;

use anyhow::Result;
use bytes::Buf;

use super::schema::{FieldSchema, MessageSchema, ScalarType};
use super::{TranscoderError, TreeConsumer};

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_varint(&mut self, path: &str) -> Result<u64> {
        let mut slice = &self.data[self.pos..];
        let before = slice.remaining();
        let value = prost::encoding::decode_varint(&mut slice)
            .map_err(|e| TranscoderError::MalformedWire { path: path.to_string(), reason: e.to_string() })?;
        self.pos += before - slice.remaining();
        Ok(value)
    }

    fn read_fixed64(&mut self, path: &str) -> Result<[u8; 8]> {
        if self.remaining() < 8 {
            return Err(TranscoderError::MalformedWire { path: path.to_string(), reason: "truncated fixed64".into() }.into());
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(buf)
    }

    fn read_fixed32(&mut self, path: &str) -> Result<[u8; 4]> {
        if self.remaining() < 4 {
            return Err(TranscoderError::MalformedWire { path: path.to_string(), reason: "truncated fixed32".into() }.into());
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(buf)
    }

    fn read_length_delimited(&mut self, path: &str) -> Result<&'a [u8]> {
        let len = self.read_varint(path)? as usize;
        if self.remaining() < len {
            return Err(TranscoderError::MalformedWire { path: path.to_string(), reason: "truncated length-delimited field".into() }.into());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

struct RawEntry<'a> {
    field: FieldSchema,
    payload: WirePayload<'a>,
}

enum WirePayload<'a> {
    Varint(u64),
    Fixed64([u8; 8]),
    Fixed32([u8; 4]),
    LengthDelimited(&'a [u8]),
}

fn read_one_entry<'a>(cursor: &mut Cursor<'a>, schema: &MessageSchema, path: &str) -> Result<RawEntry<'a>> {
    let tag = cursor.read_varint(path)?;
    let number = (tag >> 3) as u32;
    let wire_type = (tag & 0x7) as u32;

    let field = schema
        .field_by_number(number)
        .cloned()
        .ok_or_else(|| TranscoderError::UnknownTag { path: path.to_string(), number, wire_type })?;

    if field.scalar.wire_type() != wire_type {
        return Err(TranscoderError::TypeMismatch { path: path.to_string(), field: field.yson_name }.into());
    }

    let payload = match wire_type {
        0 => WirePayload::Varint(cursor.read_varint(path)?),
        1 => WirePayload::Fixed64(cursor.read_fixed64(path)?),
        2 => WirePayload::LengthDelimited(cursor.read_length_delimited(path)?),
        5 => WirePayload::Fixed32(cursor.read_fixed32(path)?),
        other => {
            return Err(TranscoderError::MalformedWire { path: path.to_string(), reason: format!("unsupported wire type {}", other) }.into())
        }
    };

    Ok(RawEntry { field, payload })
}

fn emit_scalar(field: &FieldSchema, payload: WirePayload<'_>, consumer: &mut dyn TreeConsumer) -> Result<()> {
    match (field.scalar, payload) {
        (ScalarType::Int64 | ScalarType::UInt64, WirePayload::Varint(v)) => {
            if field.scalar == ScalarType::Int64 {
                consumer.on_int64(v as i64);
            } else {
                consumer.on_uint64(v);
            }
        }
        (ScalarType::SInt64, WirePayload::Varint(v)) => consumer.on_int64(zigzag_decode(v)),
        (ScalarType::Enum, WirePayload::Varint(v)) => consumer.on_int64(v as i64),
        (ScalarType::Bool, WirePayload::Varint(v)) => consumer.on_boolean(v != 0),
        (ScalarType::Double, WirePayload::Fixed64(bytes)) => consumer.on_double(f64::from_le_bytes(bytes)),
        (ScalarType::Float, WirePayload::Fixed32(bytes)) => consumer.on_double(f32::from_le_bytes(bytes) as f64),
        (ScalarType::String, WirePayload::LengthDelimited(bytes)) => {
            let s = std::str::from_utf8(bytes)
                .map_err(|_| anyhow::anyhow!("invalid utf8 in field {}", field.yson_name))?;
            consumer.on_string(s);
        }
        (ScalarType::Bytes, WirePayload::LengthDelimited(bytes)) => consumer.on_bytes(bytes),
        _ => anyhow::bail!("internal: payload/scalar mismatch for field {}", field.yson_name),
    }
    Ok(())
}

fn read_message(cursor: &mut Cursor<'_>, schema: &Arc<MessageSchema>, end: usize, path: &mut Vec<String>, consumer: &mut dyn TreeConsumer) -> Result<()> {
    consumer.on_begin_map();
    let mut seen = Vec::new();

    while cursor.pos < end {
        let path_str = format!("/{}", path.join("/"));
        let entry = read_one_entry(cursor, schema, &path_str)?;
        let field = entry.field;

        if field.repeated {
            consumer.on_keyed_item(&field.yson_name);
            consumer.on_begin_list();
            path.push(field.yson_name.clone());
            let mut index = 0usize;
            // consume this entry plus any immediately-following entries with
            // the same field number as one contiguous run.
            emit_list_item(cursor, &field, entry.payload, schema, path, &mut index, consumer)?;
            loop {
                let save = cursor.pos;
                if cursor.pos >= end {
                    break;
                }
                let peek_path = format!("/{}", path.join("/"));
                match read_one_entry(cursor, schema, &peek_path) {
                    Ok(next) if next.field.number == field.number => {
                        emit_list_item(cursor, &field, next.payload, schema, path, &mut index, consumer)?;
                    }
                    _ => {
                        cursor.pos = save;
                        break;
                    }
                }
            }
            path.pop();
            consumer.on_end_list();
            seen.push(field.number);
        } else {
            if seen.contains(&field.number) {
                return Err(TranscoderError::DuplicateField { path: path_str, field: field.yson_name }.into());
            }
            consumer.on_keyed_item(&field.yson_name);
            path.push(field.yson_name.clone());
            match entry.payload {
                WirePayload::LengthDelimited(bytes) if field.scalar == ScalarType::Message => {
                    let nested_schema = field.message.clone().expect("message field schema must carry a MessageSchema");
                    let start = bytes.as_ptr() as usize - cursor.data.as_ptr() as usize;
                    let mut nested_cursor = Cursor { data: cursor.data, pos: start };
                    read_message(&mut nested_cursor, &nested_schema, start + bytes.len(), path, consumer)?;
                }
                payload => emit_scalar(&field, payload, consumer)?,
            }
            path.pop();
            seen.push(field.number);
        }
    }

    if cursor.pos != end {
        return Err(TranscoderError::MalformedWire { path: format!("/{}", path.join("/")), reason: "field overran message boundary".into() }.into());
    }

    for field in &schema.fields {
        if field.required && !seen.contains(&field.number) {
            return Err(TranscoderError::MissingRequiredField { path: format!("/{}", path.join("/")), field: field.yson_name.clone() }.into());
        }
    }

    consumer.on_end_map();
    Ok(())
}

fn emit_list_item(
    cursor: &mut Cursor<'_>,
    field: &FieldSchema,
    payload: WirePayload<'_>,
    schema: &MessageSchema,
    path: &mut Vec<String>,
    index: &mut usize,
    consumer: &mut dyn TreeConsumer,
) -> Result<()> {
    let _ = schema;
    consumer.on_list_item();
    path.push(index.to_string());
    match payload {
        WirePayload::LengthDelimited(bytes) if field.scalar == ScalarType::Message => {
            let nested_schema = field.message.clone().expect("message field schema must carry a MessageSchema");
            let start = bytes.as_ptr() as usize - cursor.data.as_ptr() as usize;
            let mut nested_cursor = Cursor { data: cursor.data, pos: start };
            read_message(&mut nested_cursor, &nested_schema, start + bytes.len(), path, consumer)?;
        }
        payload => emit_scalar(field, payload, consumer)?,
    }
    path.pop();
    *index += 1;
    Ok(())
}

/// Parse `data` against `schema`, emitting tree events to
/// `consumer` in wire order.
pub fn read_tree(data: &[u8], schema: &Arc<MessageSchema>, consumer: &mut dyn TreeConsumer) -> Result<()> {
    let mut cursor = Cursor::new(data);
    let mut path = Vec::new();
    read_message(&mut cursor, schema, data.len(), &mut path, consumer)
}
