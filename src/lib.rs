// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![cfg_attr(not(test), warn(unsafe_code))]
#![warn(clippy::all)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::explicit_deref_methods)]
#![warn(clippy::explicit_into_iter_loop)]
#![warn(clippy::explicit_iter_loop)]
#![cfg_attr(not(test), warn(clippy::panic_in_result_fn))]
#![warn(rustdoc::broken_intra_doc_links)]
#![doc = include_str!("../README.md")]

pub mod config;
pub mod crc;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod isr;
pub mod pdu;
pub mod pool;
pub mod queue;
pub mod ring;
pub mod transaction;
pub mod transport;

pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub use config::{Config, Framing};
pub use error::{Error, OutcomeSlot, Result};
pub use pdu::{Exception, Pdu, Request, Response};
pub use transaction::{Outcome, Priority, TransactionHandle, TxnState};
pub use transport::{Clock, EventSink, Idle, IoOutcome, Transport};

pub use client::ClientEngine;

#[cfg(feature = "server")]
pub use server::ServerEngine;
