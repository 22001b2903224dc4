use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::config::{ClientConfigBuilder, ConsumerConfig};
use crate::kafka::decode::{
    EventDecoder, KeyMode, MessageFormat, SchemaProvider, StaticSchemaProvider,
};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-ingest")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    // Payload handling
    #[envconfig(default = "json")]
    pub message_format: String,

    #[envconfig(default = "discard")]
    pub kafka_key_mode: String,

    // Avro schema document for the schema-backed formats
    pub avro_schema: Option<String>,

    // Acknowledgement-driven commits
    #[envconfig(default = "false")]
    pub acknowledgments: bool,

    // Unset means groups wait for downstream indefinitely
    pub acknowledgment_timeout_secs: Option<u64>,

    // Consumer processing configuration
    #[envconfig(default = "2")]
    pub consumer_workers: usize,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_batch_size: usize,

    #[envconfig(default = "5")]
    pub commit_interval_secs: u64,

    #[envconfig(default = "12800")]
    pub buffer_capacity: usize,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<()> {
        let format = self.parsed_format()?;
        self.parsed_key_mode()?;
        if matches!(format, MessageFormat::Avro | MessageFormat::JsonSchema)
            && self.avro_schema.is_none()
        {
            bail!("message format '{}' requires AVRO_SCHEMA to be set", self.message_format);
        }
        if self.consumer_workers == 0 {
            bail!("CONSUMER_WORKERS must be at least 1");
        }
        Ok(())
    }

    pub fn parsed_format(&self) -> Result<MessageFormat> {
        MessageFormat::from_str(&self.message_format)
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid MESSAGE_FORMAT")
    }

    pub fn parsed_key_mode(&self) -> Result<KeyMode> {
        KeyMode::from_str(&self.kafka_key_mode)
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid KAFKA_KEY_MODE")
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn acknowledgment_timeout(&self) -> Option<Duration> {
        self.acknowledgment_timeout_secs.map(Duration::from_secs)
    }

    /// Per-instance decoder for the configured format.
    pub fn build_decoder(&self) -> Result<EventDecoder> {
        let schemas: Option<Arc<dyn SchemaProvider>> = self
            .avro_schema
            .as_ref()
            .map(|schema| {
                let provider: Arc<dyn SchemaProvider> =
                    Arc::new(StaticSchemaProvider::new(schema.clone()));
                provider
            });
        Ok(EventDecoder::new(
            self.parsed_format()?,
            self.parsed_key_mode()?,
            schemas,
        ))
    }

    /// Tuning for the kafka module's consumer loop.
    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new(vec![self.kafka_consumer_topic.clone()])
            .with_poll_timeout(self.poll_timeout())
            .with_max_batch_size(self.max_batch_size)
            .with_commit_interval(self.commit_interval())
            .with_auto_commit(self.kafka_consumer_auto_commit)
    }

    /// rdkafka client configuration for one consumer instance.
    pub fn build_client_config(&self) -> ClientConfig {
        ClientConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_auto_commit(self.kafka_consumer_auto_commit)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_consumer_group: "kafka-ingest".to_string(),
            kafka_consumer_topic: "events".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_tls: false,
            kafka_consumer_auto_commit: false,
            message_format: "json".to_string(),
            kafka_key_mode: "discard".to_string(),
            avro_schema: None,
            acknowledgments: true,
            acknowledgment_timeout_secs: None,
            consumer_workers: 2,
            poll_timeout_ms: 1000,
            max_batch_size: 500,
            commit_interval_secs: 5,
            buffer_capacity: 12800,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }

    #[test]
    fn default_shape_validates() {
        base_config().validate().unwrap();
    }

    #[test]
    fn schema_backed_formats_require_a_schema() {
        let mut config = base_config();
        config.message_format = "avro".to_string();
        assert!(config.validate().is_err());

        config.avro_schema = Some(r#"{"type": "string"}"#.to_string());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut config = base_config();
        config.message_format = "protobuf".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn consumer_config_carries_the_tuning() {
        let config = base_config();
        let consumer_config = config.to_consumer_config();
        assert_eq!(consumer_config.topics, vec!["events".to_string()]);
        assert_eq!(consumer_config.poll_timeout, Duration::from_secs(1));
        assert_eq!(consumer_config.commit_interval, Duration::from_secs(5));
        assert!(!consumer_config.auto_commit);
    }
}
