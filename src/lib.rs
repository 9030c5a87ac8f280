//! IoTBroker - single-node MQTT v3.1.1 publish/subscribe broker
//!
//! The core is four tightly coupled pieces: the packet codec, the
//! reference-counted message store, the wildcard-aware subscription index
//! and the per-session QoS delivery state machine. The [`engine`] ties them
//! together behind one context object; [`broker`] runs it over TCP.

pub mod broker;
pub mod codec;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use engine::{Dispatch, Engine, EngineConfig, EngineError, EngineStats};
pub use protocol::QoS;
pub use session::ConnectionId;
