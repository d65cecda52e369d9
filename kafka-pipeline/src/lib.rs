pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics_consts;
pub mod producer;
pub mod propagation;
pub mod telemetry;

pub use consumer::KafkaConsumer;
pub use handler::{handler_fn, HandlerError, MessageHandler};
pub use message::{DeliveryOutcome, InboundMessage, OutboundRecord, Partition};
pub use producer::KafkaProducer;
