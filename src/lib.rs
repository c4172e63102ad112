//! WispMQ - Minimal MQTT v3.1.1-style publish/subscribe broker
//!
//! A small broker speaking the MQTT v3.1.1 control-packet subset needed
//! for QoS 0 publish/subscribe: exact-topic subscriptions plus a single
//! global `"#"` wildcard, with best-effort fan-out.

pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use protocol::{Packet, QoS, ReturnCode};
pub use topic::SubscriptionStore;
