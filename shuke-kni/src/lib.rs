pub mod bridge;
pub mod buffer;
pub mod config;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod netdev;
pub mod port;
pub mod reconfig;
pub mod shutdown;
pub mod stats;
pub mod test_util;
pub mod vif;
pub mod worker;

pub use bridge::{BridgeContext, KniBridge};
pub use config::{BridgeConfig, PortBridgeConfig};
pub use error::BridgeError;
pub use shutdown::ShutdownToken;
