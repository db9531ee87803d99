//! The reflective schema the writer/reader validate tree events against —
//! a hand-rolled stand-in for the descriptor pool `protobuf_interop.cpp`
//! walks through `google::protobuf::Descriptor`.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int64,
    UInt64,
    SInt64,
    Bool,
    Double,
    Float,
    String,
    Bytes,
    Message,
    Enum,
}

impl ScalarType {
    pub(crate) fn wire_type(self) -> u32 {
        match self {
            ScalarType::Int64 | ScalarType::UInt64 | ScalarType::SInt64 | ScalarType::Bool | ScalarType::Enum => 0,
            ScalarType::Double => 1,
            ScalarType::String | ScalarType::Bytes | ScalarType::Message => 2,
            ScalarType::Float => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub number: u32,
    pub yson_name: String,
    pub scalar: ScalarType,
    pub required: bool,
    pub repeated: bool,
    pub message: Option<Arc<MessageSchema>>,
}

impl FieldSchema {
    pub fn scalar(number: u32, yson_name: &str, scalar: ScalarType, required: bool, repeated: bool) -> Self {
        FieldSchema { number, yson_name: yson_name.to_string(), scalar, required, repeated, message: None }
    }

    pub fn message(number: u32, yson_name: &str, schema: Arc<MessageSchema>, required: bool, repeated: bool) -> Self {
        FieldSchema {
            number,
            yson_name: yson_name.to_string(),
            scalar: ScalarType::Message,
            required,
            repeated,
            message: Some(schema),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl MessageSchema {
    pub fn new(name: &str, fields: Vec<FieldSchema>) -> Self {
        MessageSchema { name: name.to_string(), fields }
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.yson_name == name)
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.number == number)
    }
}
