//! Tree-consumer-to-wire-bytes direction of the transcoder. Each nested
//! message is serialised into its own `Vec<u8>` body first; the parent only
//! ever appends that finished body once, preceded by its length varint —
//! the "two-pass, no heap-resize for the body" scheme `protobuf_interop.cpp`
//! uses its coded-stream two-pass writer for.

use std::sync::Arc;

use anyhow::Result;
use bytes::BufMut;

use super::schema::{FieldSchema, MessageSchema, ScalarType};
use super::{TranscoderError, TreeConsumer};

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn encode_tag(number: u32, wire_type: u32, buf: &mut Vec<u8>) {
    prost::encoding::encode_varint(((number as u64) << 3) | wire_type as u64, buf);
}

enum Frame {
    Message { schema: Arc<MessageSchema>, buf: Vec<u8>, seen: Vec<u32>, pending: Option<FieldSchema> },
    List { field: FieldSchema, index: usize },
}

/// Serialises tree events into wire bytes matching `schema`. Implements
/// [`TreeConsumer`] so any tree producer can drive it directly.
pub struct ProtobufWriter {
    root: Arc<MessageSchema>,
    started: bool,
    stack: Vec<Frame>,
    path: Vec<String>,
    output: Option<Vec<u8>>,
    error: Option<anyhow::Error>,
}

impl ProtobufWriter {
    pub fn new(root: Arc<MessageSchema>) -> Self {
        ProtobufWriter { root, started: false, stack: Vec::new(), path: Vec::new(), output: None, error: None }
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.output.ok_or_else(|| anyhow::anyhow!("writer finished without closing the root map"))
    }

    fn path_string(&self) -> String {
        if self.path.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.path.join("/"))
        }
    }

    fn fail(&mut self, err: TranscoderError) {
        if self.error.is_none() {
            self.error = Some(err.into());
        }
    }

    /// Returns the currently pending field and a mutable reference to the
    /// buffer that scalar bytes for it should be appended to.
    fn current_target(&mut self) -> Option<(FieldSchema, &mut Vec<u8>)> {
        let in_list = matches!(self.stack.last(), Some(Frame::List { .. }));
        if in_list {
            let field = match self.stack.last() {
                Some(Frame::List { field, .. }) => field.clone(),
                _ => unreachable!(),
            };
            let message_idx = self.stack.len() - 2;
            match &mut self.stack[message_idx] {
                Frame::Message { buf, .. } => Some((field, buf)),
                Frame::List { .. } => None,
            }
        } else {
            match self.stack.last_mut() {
                Some(Frame::Message { pending: Some(field), buf, .. }) => {
                    let field = field.clone();
                    Some((field, buf))
                }
                _ => None,
            }
        }
    }

    fn write_scalar(&mut self, write: impl FnOnce(&FieldSchema, &mut Vec<u8>)) {
        let in_list = matches!(self.stack.last(), Some(Frame::List { .. }));
        let field = match self.current_target() {
            Some((field, _)) => field,
            None => {
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        };
        if field.repeated && !in_list {
            self.fail(TranscoderError::ExpectedList { path: self.path_string(), field: field.yson_name.clone() });
            return;
        }
        let (_, buf) = self.current_target().unwrap();
        write(&field, buf);
        if !field.repeated {
            self.mark_seen_and_clear_pending();
        }
    }

    fn mark_seen_and_clear_pending(&mut self) {
        if let Some(Frame::Message { seen, pending, .. }) = self.stack.last_mut() {
            if let Some(field) = pending.take() {
                seen.push(field.number);
            }
        }
    }
}

impl TreeConsumer for ProtobufWriter {
    fn on_begin_map(&mut self) {
        if self.stack.is_empty() {
            if self.started {
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
            self.started = true;
            let schema = self.root.clone();
            self.stack.push(Frame::Message { schema, buf: Vec::new(), seen: Vec::new(), pending: None });
            return;
        }

        let schema = match self.stack.last() {
            Some(Frame::Message { pending: Some(field), .. }) | Some(Frame::List { field, .. }) => {
                let field = field.clone();
                if field.scalar != ScalarType::Message {
                    self.fail(TranscoderError::TypeMismatch { path: self.path_string(), field: field.yson_name });
                    return;
                }
                field.message.clone().unwrap()
            }
            _ => {
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        };
        self.stack.push(Frame::Message { schema, buf: Vec::new(), seen: Vec::new(), pending: None });
    }

    fn on_end_map(&mut self) {
        let (schema, buf, seen) = match self.stack.pop() {
            Some(Frame::Message { schema, buf, seen, .. }) => (schema, buf, seen),
            other => {
                if let Some(f) = other {
                    self.stack.push(f);
                }
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        };

        for field in &schema.fields {
            if field.required && !seen.contains(&field.number) {
                self.fail(TranscoderError::MissingRequiredField { path: self.path_string(), field: field.yson_name.clone() });
                return;
            }
        }

        if self.stack.is_empty() {
            self.output = Some(buf);
            return;
        }

        // Nested message: patch the length prefix into the parent's buffer
        // in one append — the body above was built exactly once.
        let in_list = matches!(self.stack.last(), Some(Frame::List { .. }));
        let field = match self.current_target() {
            Some((field, _)) => field,
            None => {
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        };
        let (_, parent_buf) = self.current_target().unwrap();
        encode_tag(field.number, ScalarType::Message.wire_type(), parent_buf);
        prost::encoding::encode_varint(buf.len() as u64, parent_buf);
        parent_buf.put_slice(&buf);

        if !in_list {
            self.mark_seen_and_clear_pending();
        } else if let Some(Frame::List { index, .. }) = self.stack.last_mut() {
            *index += 1;
            self.path.pop();
        }
    }

    fn on_keyed_item(&mut self, key: &str) {
        let (schema_fields, already_pending) = match self.stack.last() {
            Some(Frame::Message { schema, pending, .. }) => (schema.fields.clone(), pending.is_some()),
            _ => {
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        };
        if already_pending {
            self.fail(TranscoderError::NoOpenFrame);
            return;
        }
        let field = match schema_fields.iter().find(|f| f.yson_name == key) {
            Some(field) => field.clone(),
            None => {
                self.fail(TranscoderError::UnknownField { path: self.path_string(), key: key.to_string() });
                return;
            }
        };
        if let Some(Frame::Message { seen, .. }) = self.stack.last() {
            if !field.repeated && seen.contains(&field.number) {
                self.fail(TranscoderError::DuplicateField { path: self.path_string(), field: field.yson_name });
                return;
            }
        }
        self.path.push(key.to_string());
        if let Some(Frame::Message { pending, .. }) = self.stack.last_mut() {
            *pending = Some(field);
        }
    }

    fn on_begin_list(&mut self) {
        let field = match self.stack.last() {
            Some(Frame::Message { pending: Some(field), .. }) => field.clone(),
            _ => {
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        };
        if !field.repeated {
            self.fail(TranscoderError::UnexpectedList { path: self.path_string(), field: field.yson_name });
            return;
        }
        self.stack.push(Frame::List { field, index: 0 });
    }

    fn on_end_list(&mut self) {
        match self.stack.pop() {
            Some(Frame::List { .. }) => {}
            other => {
                if let Some(f) = other {
                    self.stack.push(f);
                }
                self.fail(TranscoderError::NoOpenFrame);
                return;
            }
        }
        self.mark_seen_and_clear_pending();
    }

    fn on_list_item(&mut self) {
        if let Some(Frame::List { index, .. }) = self.stack.last() {
            self.path.push(index.to_string());
        } else {
            self.fail(TranscoderError::NoOpenFrame);
        }
    }

    fn on_int64(&mut self, value: i64) {
        self.write_scalar(|field, buf| {
            encode_tag(field.number, field.scalar.wire_type(), buf);
            match field.scalar {
                ScalarType::SInt64 => prost::encoding::encode_varint(zigzag_encode(value), buf),
                _ => prost::encoding::encode_varint(value as u64, buf),
            }
        });
        self.pop_list_item_path();
    }

    fn on_uint64(&mut self, value: u64) {
        self.write_scalar(|field, buf| {
            encode_tag(field.number, field.scalar.wire_type(), buf);
            prost::encoding::encode_varint(value, buf);
        });
        self.pop_list_item_path();
    }

    fn on_double(&mut self, value: f64) {
        self.write_scalar(|field, buf| {
            if field.scalar == ScalarType::Float {
                encode_tag(field.number, 5, buf);
                buf.put_f32_le(value as f32);
            } else {
                encode_tag(field.number, 1, buf);
                buf.put_f64_le(value);
            }
        });
        self.pop_list_item_path();
    }

    fn on_boolean(&mut self, value: bool) {
        self.write_scalar(|field, buf| {
            encode_tag(field.number, field.scalar.wire_type(), buf);
            prost::encoding::encode_varint(if value { 1 } else { 0 }, buf);
        });
        self.pop_list_item_path();
    }

    fn on_string(&mut self, value: &str) {
        self.write_scalar(|field, buf| {
            encode_tag(field.number, 2, buf);
            prost::encoding::encode_varint(value.len() as u64, buf);
            buf.put_slice(value.as_bytes());
        });
        self.pop_list_item_path();
    }

    fn on_bytes(&mut self, value: &[u8]) {
        self.write_scalar(|field, buf| {
            encode_tag(field.number, 2, buf);
            prost::encoding::encode_varint(value.len() as u64, buf);
            buf.put_slice(value);
        });
        self.pop_list_item_path();
    }
}

impl ProtobufWriter {
    fn pop_list_item_path(&mut self) {
        if matches!(self.stack.last(), Some(Frame::List { .. })) {
            self.path.pop();
            if let Some(Frame::List { index, .. }) = self.stack.last_mut() {
                *index += 1;
            }
        } else {
            self.path.pop();
        }
    }
}
