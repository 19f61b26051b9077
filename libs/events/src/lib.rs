//! Outbound telemetry for an emulated machine: the event publisher toward
//! the orchestrator's sink, and the log sink bridge forwarding structured
//! logs as newline-delimited JSON.

pub mod logsink;
pub mod publisher;

pub mod proto {
    pub mod events {
        tonic::include_proto!("events");
    }
}

pub use logsink::{LogBridge, LogSinkHandle, LogSinkLayer, SinkAddress, SinkProtocol};
pub use publisher::EventPublisher;
