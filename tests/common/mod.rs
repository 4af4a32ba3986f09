// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A loopback [`Transport`] pair wiring a client directly to a server in memory, for black-box
//! round-trip tests against the public engine API rather than a real serial port or socket.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use modbus_engine::transport::{IoOutcome, Transport};

#[derive(Default)]
struct Pipe {
    bytes: VecDeque<u8>,
}

/// One end of an in-memory byte pipe: writes go out one queue, reads drain the other.
pub struct PipeEnd {
    outbound: Rc<RefCell<Pipe>>,
    inbound: Rc<RefCell<Pipe>>,
    pub now_ms: u64,
}

impl Transport for PipeEnd {
    fn send(&mut self, bytes: &[u8]) -> IoOutcome {
        self.outbound.borrow_mut().bytes.extend(bytes.iter().copied());
        IoOutcome::Progress(bytes.len())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> IoOutcome {
        let mut pipe = self.inbound.borrow_mut();
        if pipe.bytes.is_empty() {
            return IoOutcome::WouldBlock;
        }
        let mut n = 0;
        while n < buffer.len() {
            let Some(byte) = pipe.bytes.pop_front() else {
                break;
            };
            buffer[n] = byte;
            n += 1;
        }
        IoOutcome::Progress(n)
    }

    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

/// Builds a connected `(client_end, server_end)` pair: whatever `client_end` sends,
/// `server_end` receives, and vice versa.
#[must_use]
pub fn wired_pair() -> (PipeEnd, PipeEnd) {
    let client_to_server = Rc::new(RefCell::new(Pipe::default()));
    let server_to_client = Rc::new(RefCell::new(Pipe::default()));
    let client = PipeEnd {
        outbound: client_to_server.clone(),
        inbound: server_to_client.clone(),
        now_ms: 0,
    };
    let server = PipeEnd {
        outbound: server_to_client,
        inbound: client_to_server,
        now_ms: 0,
    };
    (client, server)
}
