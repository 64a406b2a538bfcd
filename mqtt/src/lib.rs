//! Permission-gated MQTT operations over a single broker connection.
//!
//! This crate exposes publish / subscribe / read / query to an agent host.
//! Every operation is checked against a set of topic rules supporting the
//! MQTT `+` and `#` wildcards, and every subscribe-style call gets its own
//! bounded buffer and deadline while sharing one rumqttc session.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mcpmqtt::{ConnectionManager, Orchestrator, load_config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mcpmqtt::Result<()> {
//!     let config = load_config(None)?;
//!     let registry = Arc::new(config.registry()?);
//!
//!     let (conn, inbound) = ConnectionManager::start(&config.mqtt)?;
//!     conn.connect(config.mqtt.connect_timeout()).await?;
//!
//!     let orch = Orchestrator::new(registry, conn.clone());
//!     orch.spawn_dispatcher(inbound);
//!
//!     let cancel = CancellationToken::new();
//!     let msg = orch
//!         .read("sensors/+/temperature", Duration::from_secs(5), &cancel)
//!         .await?;
//!     println!("{}: {:?}", msg.topic, msg.payload_str());
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod acl;
pub mod client;
pub mod config;
pub mod demux;
mod error;
pub mod orchestrator;
pub mod tools;
pub mod topic;
mod types;

#[cfg(test)]
mod mock;

pub use acl::{Permission, PermissionRegistry, TopicRule};
pub use client::{Connection, ConnectionManager};
pub use config::{Config, LogLevel, LoggingConfig, MqttConfig, load_config};
pub use error::{Error, Result};
pub use orchestrator::{LogicalSubscription, Orchestrator};
pub use tools::{BrokerInfo, RESOURCE_NAMES, TOOL_NAMES, Tool, Toolbox};
pub use types::{ConnectionState, Message, PublishAck, QoS};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        Config, Connection, ConnectionManager, ConnectionState, Error, Message, Orchestrator,
        Permission, PermissionRegistry, PublishAck, QoS, Result, Toolbox, TopicRule,
    };
}
