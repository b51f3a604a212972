//! Startup configuration for the connection manager and server engine.
//!
//! These values are read once at construction; none of them change at
//! runtime. Callers override fields on the `Default` values as needed.

use crate::att::constants::{ATT_BREDR_DEFAULT_MTU, ATT_MAX_MTU};
use crate::connection::types::ConnectionPriority;
use crate::transport::ConnectionParameters;

/// Default per-transport connection caps.
pub const DEFAULT_MAX_LE_CONNECTIONS: usize = 7;
pub const DEFAULT_MAX_CLASSIC_CONNECTIONS: usize = 7;

/// BR/EDR link defaults applied when a classic GATT channel is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicLinkDefaults {
    pub mtu: u16,
    pub mode: u8,
    pub flush_timeout: u16,
    pub security_mode: u8,
}

impl Default for ClassicLinkDefaults {
    fn default() -> Self {
        ClassicLinkDefaults {
            mtu: ATT_BREDR_DEFAULT_MTU,
            mode: 0x00,
            flush_timeout: 0xFFFF,
            security_mode: 0x24,
        }
    }
}

/// Configuration for the connection lifecycle manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub le_enabled: bool,
    pub classic_enabled: bool,
    pub max_le_connections: usize,
    pub max_classic_connections: usize,
    /// Silent retries allowed for an LE connect attempt that fails with
    /// "connection failed to be established" (reason 0x3E).
    pub connect_retry_limit: u8,
    pub classic_defaults: ClassicLinkDefaults,
    /// Interval/latency/timeout presets per priority tier.
    pub low_power_preset: ConnectionParameters,
    pub balanced_preset: ConnectionParameters,
    pub high_priority_preset: ConnectionParameters,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            le_enabled: true,
            classic_enabled: true,
            max_le_connections: DEFAULT_MAX_LE_CONNECTIONS,
            max_classic_connections: DEFAULT_MAX_CLASSIC_CONNECTIONS,
            connect_retry_limit: 0,
            classic_defaults: ClassicLinkDefaults::default(),
            // Intervals in 1.25 ms units, supervision timeout in 10 ms units.
            low_power_preset: ConnectionParameters {
                interval_min: 0x0050, // 100 ms
                interval_max: 0x0064, // 125 ms
                latency: 2,
                supervision_timeout: 0x01F4, // 5 s
            },
            balanced_preset: ConnectionParameters {
                interval_min: 0x0018, // 30 ms
                interval_max: 0x0028, // 50 ms
                latency: 0,
                supervision_timeout: 0x01F4,
            },
            high_priority_preset: ConnectionParameters {
                interval_min: 0x0009, // 11.25 ms
                interval_max: 0x000C, // 15 ms
                latency: 0,
                supervision_timeout: 0x01F4,
            },
        }
    }
}

impl ConnectionConfig {
    /// The concrete parameter set a priority tier maps to.
    pub fn priority_preset(&self, priority: ConnectionPriority) -> ConnectionParameters {
        match priority {
            ConnectionPriority::LowPower => self.low_power_preset,
            ConnectionPriority::Balanced => self.balanced_preset,
            ConnectionPriority::High => self.high_priority_preset,
        }
    }
}

/// Configuration for the server transaction engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound the server clamps a client-proposed MTU to.
    pub max_mtu: u16,
    /// Maximum queued prepare-write fragments per connection.
    pub prepare_queue_limit: usize,
    /// Maximum tracked CCCD entries per connection.
    pub cccd_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_mtu: ATT_MAX_MTU,
            prepare_queue_limit: 64,
            cccd_capacity: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_by_tier() {
        let config = ConnectionConfig::default();
        let high = config.priority_preset(ConnectionPriority::High);
        let low = config.priority_preset(ConnectionPriority::LowPower);
        assert!(high.interval_max < low.interval_min);
        assert_eq!(config.priority_preset(ConnectionPriority::Balanced).latency, 0);
    }
}
