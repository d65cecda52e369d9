use std::net::SocketAddr;
use std::str::FromStr;

use envconfig::Envconfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub telemetry: TelemetryConfig,

    // Republish every consumed message to this topic when set
    pub relay_topic: Option<String>,

    #[envconfig(default = "0.0.0.0:9102")]
    pub metrics_bind: SocketAddr,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma-delimited host:port list

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

impl KafkaConfig {
    pub fn brokers(&self) -> Vec<String> {
        split_list(&self.kafka_hosts)
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topics: String, // Comma-delimited

    #[envconfig(default = "4")]
    pub kafka_consumer_workers: usize,

    #[envconfig(default = "on_dispatch")]
    pub kafka_consumer_commit_policy: CommitPolicy,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

#[derive(Envconfig, Clone)]
pub struct TelemetryConfig {
    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "kafka-pipeline")]
    pub otel_service_name: String,

    #[envconfig(default = "dev")]
    pub otel_service_env: String,
}

impl TelemetryConfig {
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.otel_service_name, self.otel_service_env)
    }
}

/// When a consumed record is marked as committed with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Right after the record is handed to the dispatch queue. A crash before the handler
    /// finishes loses the record.
    #[default]
    OnDispatch,
    /// Only once the handler returned successfully. A crash may redeliver the record.
    ///
    /// Records drained during `close` are handled after the broker connection has been
    /// released, so their commits fail and the group redelivers them on the next start.
    AfterHandle,
}

impl FromStr for CommitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "on_dispatch" => Ok(CommitPolicy::OnDispatch),
            "after_handle" => Ok(CommitPolicy::AfterHandle),
            _ => Err(ConfigError::UnknownCommitPolicy(s.to_string())),
        }
    }
}

/// Validated consumer construction options.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: Vec<String>,
    pub num_workers: usize,
    pub commit_policy: CommitPolicy,
    pub offset_reset: String,
    pub auto_commit_interval_ms: u32,
    pub tls: bool,
}

impl ConsumerSettings {
    pub fn new(
        brokers: Vec<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
        num_workers: usize,
    ) -> Result<Self, ConfigError> {
        let settings = Self {
            brokers: clean_list(brokers),
            group_id: group_id.into(),
            topics: clean_list(topics),
            num_workers,
            commit_policy: CommitPolicy::default(),
            offset_reset: "earliest".to_string(),
            auto_commit_interval_ms: 5000,
            tls: false,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Result<Self, ConfigError> {
        let mut settings = Self::new(
            kafka.brokers(),
            consumer.kafka_consumer_group.clone(),
            split_list(&consumer.kafka_consumer_topics),
            consumer.kafka_consumer_workers,
        )?;
        settings.commit_policy = consumer.kafka_consumer_commit_policy;
        settings.offset_reset = consumer.kafka_consumer_offset_reset.clone();
        settings.auto_commit_interval_ms = consumer.kafka_consumer_auto_commit_interval_ms;
        settings.tls = kafka.kafka_tls;
        Ok(settings)
    }

    pub fn with_commit_policy(mut self, commit_policy: CommitPolicy) -> Self {
        self.commit_policy = commit_policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.num_workers));
        }
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::EmptyBrokers);
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::EmptyGroupId);
        }
        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyTopics);
        }
        Ok(())
    }

    /// Fixed at eight slots per worker.
    pub fn queue_capacity(&self) -> usize {
        8 * self.num_workers
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
