//! Payload decoding.
//!
//! The wire format of a topic is fixed by configuration, so dispatch is a
//! closed enum with one decode path per variant rather than runtime type
//! sniffing. Decoders are constructed per consumer instance and injected; the
//! schema-backed formats resolve their schema through a [`SchemaProvider`]
//! seam so a registry outage can be told apart from a malformed record.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use apache_avro::{from_avro_datum, Schema};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::kafka::transport::TransportRecord;

/// Field name used for keyless plaintext records, matching the source
/// pipeline's convention.
const DEFAULT_KEY: &str = "message";

const KEY_ATTRIBUTE: &str = "kafka_key";
const TOPIC_ATTRIBUTE: &str = "kafka_topic";
const PARTITION_ATTRIBUTE: &str = "kafka_partition";

/// Wire format of a topic's payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Freeform JSON.
    Json,
    /// JSON with a registry-backed schema.
    JsonSchema,
    /// Avro binary datum with a registry-backed schema.
    Avro,
    /// Raw UTF-8 text.
    Plaintext,
}

impl FromStr for MessageFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-schema" | "json_schema" => Ok(Self::JsonSchema),
            "avro" => Ok(Self::Avro),
            "plaintext" | "plain-text" => Ok(Self::Plaintext),
            other => Err(format!("unknown message format '{other}'")),
        }
    }
}

impl MessageFormat {
    fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::JsonSchema => "json-schema",
            Self::Avro => "avro",
            Self::Plaintext => "plaintext",
        }
    }

    fn needs_schema(&self) -> bool {
        matches!(self, Self::JsonSchema | Self::Avro)
    }
}

/// What to do with the record key of structured payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Drop the key.
    Discard,
    /// Merge the key into the payload under `kafka_key`.
    IncludeAsField,
    /// Carry the key as event metadata.
    IncludeAsMetadata,
}

impl FromStr for KeyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "include_as_field" => Ok(Self::IncludeAsField),
            "include_as_metadata" => Ok(Self::IncludeAsMetadata),
            other => Err(format!("unknown key mode '{other}'")),
        }
    }
}

/// A decoded record ready for the downstream buffer.
#[derive(Debug)]
pub struct IngestEvent {
    data: Value,
    attributes: HashMap<String, String>,
}

impl IngestEvent {
    pub fn new(data: Value, attributes: HashMap<String, String>) -> Self {
        Self { data, attributes }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }
}

#[derive(Debug, Error)]
#[error("schema lookup for topic '{topic}' failed: {message}")]
pub struct SchemaLookupError {
    pub topic: String,
    pub message: String,
}

/// Resolves the schema document registered for a topic. Lookup failures are
/// assumed transient (registry outage) and handled with a longer backoff than
/// a malformed record.
pub trait SchemaProvider: Send + Sync {
    fn schema_for(&self, topic: &str) -> Result<String, SchemaLookupError>;
}

/// Serves one fixed schema document for every topic; used when the schema is
/// supplied directly through configuration.
pub struct StaticSchemaProvider {
    schema: String,
}

impl StaticSchemaProvider {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }
}

impl SchemaProvider for StaticSchemaProvider {
    fn schema_for(&self, _topic: &str) -> Result<String, SchemaLookupError> {
        Ok(self.schema.clone())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed {format} payload at {partition}/{offset}: {message}")]
    Malformed {
        format: &'static str,
        partition: String,
        offset: i64,
        message: String,
    },
    #[error(transparent)]
    SchemaLookup(#[from] SchemaLookupError),
}

impl DecodeError {
    /// True when the failure came from the external schema registry rather
    /// than the record itself.
    pub fn is_schema_lookup(&self) -> bool {
        matches!(self, Self::SchemaLookup(_))
    }
}

/// Per-instance decoder for one configured format.
pub struct EventDecoder {
    format: MessageFormat,
    key_mode: KeyMode,
    schemas: Option<Arc<dyn SchemaProvider>>,
    /// Parsed Avro schemas by topic, so the schema document is not re-parsed
    /// per record.
    parsed: Mutex<HashMap<String, Schema>>,
}

impl EventDecoder {
    pub fn new(
        format: MessageFormat,
        key_mode: KeyMode,
        schemas: Option<Arc<dyn SchemaProvider>>,
    ) -> Self {
        Self {
            format,
            key_mode,
            schemas,
            parsed: Mutex::new(HashMap::new()),
        }
    }

    pub fn decode(&self, record: &TransportRecord) -> Result<IngestEvent, DecodeError> {
        let payload = record.payload.as_deref().unwrap_or_default();
        let value = match self.format {
            MessageFormat::Json => self.decode_json(record, payload)?,
            MessageFormat::JsonSchema => {
                // The registry must know the topic even though the payload
                // itself is plain JSON; an unavailable registry backs the
                // whole batch off.
                self.lookup_schema(record.partition.topic())?;
                self.decode_json(record, payload)?
            }
            MessageFormat::Avro => self.decode_avro(record, payload)?,
            MessageFormat::Plaintext => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| self.malformed(record, e.to_string()))?;
                let key = record.key.clone().unwrap_or_else(|| DEFAULT_KEY.to_string());
                let mut data = Map::new();
                data.insert(key, Value::String(text));
                Value::Object(data)
            }
        };

        let mut attributes = HashMap::from([
            (
                TOPIC_ATTRIBUTE.to_string(),
                record.partition.topic().to_string(),
            ),
            (
                PARTITION_ATTRIBUTE.to_string(),
                record.partition.partition_number().to_string(),
            ),
        ]);
        if self.key_mode == KeyMode::IncludeAsMetadata {
            if let Some(key) = &record.key {
                attributes.insert(KEY_ATTRIBUTE.to_string(), key.clone());
            }
        }

        Ok(IngestEvent::new(value, attributes))
    }

    fn decode_json(&self, record: &TransportRecord, payload: &[u8]) -> Result<Value, DecodeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| self.malformed(record, e.to_string()))?;
        Ok(self.shape_structured(record, value))
    }

    fn decode_avro(&self, record: &TransportRecord, payload: &[u8]) -> Result<Value, DecodeError> {
        let schema = self.avro_schema(record)?;
        let mut reader = payload;
        let datum = from_avro_datum(&schema, &mut reader, None)
            .map_err(|e| self.malformed(record, e.to_string()))?;
        Ok(self.shape_structured(record, avro_to_json(datum)))
    }

    /// Non-object payloads get nested under the record key so the event is
    /// always a map; objects optionally absorb the key as a field.
    fn shape_structured(&self, record: &TransportRecord, value: Value) -> Value {
        match value {
            Value::Object(mut data) => {
                if self.key_mode == KeyMode::IncludeAsField {
                    if let Some(key) = &record.key {
                        data.insert(KEY_ATTRIBUTE.to_string(), Value::String(key.clone()));
                    }
                }
                Value::Object(data)
            }
            other => {
                let key = record.key.clone().unwrap_or_else(|| DEFAULT_KEY.to_string());
                let mut data = Map::new();
                data.insert(key, other);
                Value::Object(data)
            }
        }
    }

    fn avro_schema(&self, record: &TransportRecord) -> Result<Schema, DecodeError> {
        let topic = record.partition.topic();
        {
            let parsed = self.parsed.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(schema) = parsed.get(topic) {
                return Ok(schema.clone());
            }
        }
        let document = self.lookup_schema(topic)?;
        let schema =
            Schema::parse_str(&document).map_err(|e| self.malformed(record, e.to_string()))?;
        self.parsed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), schema.clone());
        Ok(schema)
    }

    fn lookup_schema(&self, topic: &str) -> Result<String, SchemaLookupError> {
        match &self.schemas {
            Some(provider) => provider.schema_for(topic),
            None => Err(SchemaLookupError {
                topic: topic.to_string(),
                message: "no schema provider configured".to_string(),
            }),
        }
    }

    fn malformed(&self, record: &TransportRecord, message: String) -> DecodeError {
        DecodeError::Malformed {
            format: self.format.name(),
            partition: record.partition.to_string(),
            offset: record.offset,
            message,
        }
    }
}

/// Minimal Avro-to-JSON conversion covering the shapes a record payload can
/// take. Bytes render as arrays of numbers, matching what a JSON mapper does
/// with raw byte fields.
fn avro_to_json(value: apache_avro::types::Value) -> Value {
    use apache_avro::types::Value as Avro;
    match value {
        Avro::Null => Value::Null,
        Avro::Boolean(b) => Value::Bool(b),
        Avro::Int(i) => Value::from(i),
        Avro::Long(l) => Value::from(l),
        Avro::Float(f) => Value::from(f),
        Avro::Double(d) => Value::from(d),
        Avro::String(s) | Avro::Enum(_, s) => Value::String(s),
        Avro::Bytes(b) | Avro::Fixed(_, b) => {
            Value::Array(b.into_iter().map(Value::from).collect())
        }
        Avro::Union(_, inner) => avro_to_json(*inner),
        Avro::Array(items) => Value::Array(items.into_iter().map(avro_to_json).collect()),
        Avro::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, avro_to_json(v)))
                .collect(),
        ),
        Avro::Record(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, avro_to_json(v)))
                .collect(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}
