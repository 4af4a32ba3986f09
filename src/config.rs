// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed engine configuration (§6). Assembling a `Config` is the host application's job; this
//! crate never reads a file, an environment variable, or a CLI flag.

use crate::error::{Error, Result};
use crate::pdu::MAX_PDU_SIZE;

/// Which wire framing a [`crate::client::ClientEngine`]/[`crate::server::ServerEngine`] speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Rtu,
    Ascii,
    Tcp,
}

/// Serial line parameters, relevant to RTU/ASCII framing's silence-timing calculation (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            parity: Parity::Even,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Scheduling policy for the transaction manager's priority queues (§3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosPolicy {
    StrictPriority,
    DeadlineAware,
}

/// QoS queueing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosConfig {
    pub queue_capacity_high: usize,
    pub queue_capacity_normal: usize,
    pub policy: QosPolicy,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            queue_capacity_high: 4,
            queue_capacity_normal: 16,
            policy: QosPolicy::StrictPriority,
        }
    }
}

/// Retry/backoff configuration (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u8,
    pub backoff_base_ms: u32,
    pub backoff_max_ms: u32,
    pub jitter_pct: u8,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 2000,
            jitter_pct: 10,
        }
    }
}

/// Per-function-code response timeout overrides; `None` entries fall back to
/// `response_timeout_ms_default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub response_timeout_ms_default: u64,
    pub per_fc_timeout_overrides: [Option<u64>; 256],
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn new(default_ms: u64) -> Self {
        Self {
            response_timeout_ms_default: default_ms,
            per_fc_timeout_overrides: [None; 256],
        }
    }

    #[must_use]
    pub fn timeout_for(&self, function_code: u8) -> u64 {
        self.per_fc_timeout_overrides[usize::from(function_code)]
            .unwrap_or(self.response_timeout_ms_default)
    }
}

/// Idle/power configuration (§5 "Power/idle").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdleConfig {
    pub idle_threshold_ms: u64,
}

/// Diagnostics configuration (the compile-time trace depth is a const generic parameter on
/// [`crate::diagnostics::Diagnostics`], not part of this struct).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    pub counters_enabled: bool,
    pub trace_enabled: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            counters_enabled: true,
            trace_enabled: true,
        }
    }
}

/// Watchdog configuration (§4.3): the multiplier `K` applied to a transaction's timeout to
/// bound time spent in any single FSM sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub multiplier: u8,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { multiplier: 2 }
    }
}

/// Top-level engine configuration (§6). Construct with [`Config::new`] and call
/// [`Config::validate`] before handing it to an engine; engines validate on construction too,
/// so an invalid `Config` never reaches the first `poll()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub framing: Framing,
    pub serial: SerialParams,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub qos: QosConfig,
    pub transaction_pool_capacity: usize,
    pub rx_ring_capacity: usize,
    pub tx_ring_capacity: usize,
    pub max_pdu_size: usize,
    pub diagnostics: DiagnosticsConfig,
    pub idle: IdleConfig,
    pub watchdog: WatchdogConfig,
    /// The unit id a [`crate::server::ServerEngine`] answers to; ignored by the client (§6).
    /// RTU/ASCII also honor unit id `0` as the broadcast address regardless of this setting.
    pub server_unit_id: u8,
}

impl Config {
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            serial: SerialParams::default(),
            timeouts: TimeoutConfig::new(1000),
            retry: RetryConfig::default(),
            qos: QosConfig::default(),
            transaction_pool_capacity: 16,
            rx_ring_capacity: 256,
            tx_ring_capacity: 256,
            max_pdu_size: MAX_PDU_SIZE,
            diagnostics: DiagnosticsConfig::default(),
            idle: IdleConfig::default(),
            watchdog: WatchdogConfig::default(),
            server_unit_id: 1,
        }
    }

    /// Rejects internally-inconsistent configurations synchronously, rather than surfacing
    /// them as a confusing failure from the first `poll()` (§6).
    pub fn validate(&self) -> Result<()> {
        if self.max_pdu_size == 0 || self.max_pdu_size > MAX_PDU_SIZE {
            return Err(Error::InvalidArgument);
        }
        if self.transaction_pool_capacity == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.qos.queue_capacity_high == 0 && self.qos.queue_capacity_normal == 0 {
            return Err(Error::InvalidArgument);
        }
        if !self.rx_ring_capacity.is_power_of_two() || !self.tx_ring_capacity.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        if self.watchdog.multiplier == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}
