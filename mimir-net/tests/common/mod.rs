#![allow(dead_code)]
//! Test harness utilities for mimir-net integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use serde_json::{json, Value};

use mimir_net::{Connector, Frame, Transport, TransportEvent};

/// In-memory stand-in for one socket: events the client will see and
/// frames it has sent.
#[derive(Default)]
pub struct FakeWire {
    pub incoming: VecDeque<TransportEvent>,
    pub sent: Vec<Frame>,
}

pub type WireHandle = Rc<RefCell<FakeWire>>;

pub struct FakeTransport {
    wire: WireHandle,
}

impl Transport for FakeTransport {
    fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.wire.borrow_mut().sent.push(frame);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.wire.borrow_mut().incoming.pop_front()
    }
}

#[derive(Default)]
pub struct ConnectorLog {
    /// URLs in attempt order.
    pub urls: Vec<String>,
    /// Attempts that fail with ConnectionRefused before any succeeds.
    pub failures_remaining: u32,
    /// One wire per successful attempt, in order.
    pub wires: Vec<WireHandle>,
}

/// Connector whose outcomes are scripted by the test.
pub struct ScriptedConnector {
    pub log: Rc<RefCell<ConnectorLog>>,
}

impl ScriptedConnector {
    pub fn new(failures_remaining: u32) -> (Self, Rc<RefCell<ConnectorLog>>) {
        let log = Rc::new(RefCell::new(ConnectorLog {
            failures_remaining,
            ..ConnectorLog::default()
        }));
        (Self { log: log.clone() }, log)
    }
}

impl Connector for ScriptedConnector {
    type Transport = FakeTransport;

    fn connect(&mut self, url: &str) -> io::Result<FakeTransport> {
        let mut log = self.log.borrow_mut();
        log.urls.push(url.to_string());
        if log.failures_remaining > 0 {
            log.failures_remaining -= 1;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted failure",
            ));
        }
        let wire: WireHandle = Rc::new(RefCell::new(FakeWire::default()));
        wire.borrow_mut().incoming.push_back(TransportEvent::Open);
        log.wires.push(wire.clone());
        Ok(FakeTransport { wire })
    }
}

/// Push an incoming text frame onto a wire.
pub fn push_text(wire: &WireHandle, batch: &Value) {
    wire.borrow_mut()
        .incoming
        .push_back(TransportEvent::Frame(Frame::Text(batch.to_string())));
}

/// Push an incoming binary frame onto a wire.
pub fn push_binary(wire: &WireHandle, frame: Vec<u8>) {
    wire.borrow_mut()
        .incoming
        .push_back(TransportEvent::Frame(Frame::Binary(frame)));
}

/// Descriptor for a plain value cell.
pub fn value_cell(writable: bool, value_type: Value, current: Value) -> Value {
    json!({
        "type": "value_cell",
        "metadata": {"value_type": value_type, "persists": true, "naming": null},
        "writable": writable,
        "current": current,
    })
}

/// Descriptor for a labelled value cell.
pub fn labelled_cell(writable: bool, value_type: Value, current: Value, label: &str) -> Value {
    json!({
        "type": "value_cell",
        "metadata": {
            "value_type": value_type,
            "persists": true,
            "naming": {"type": "EnumRow", "label": label, "description": null, "sort_key": label},
        },
        "writable": writable,
        "current": current,
    })
}

/// Descriptor for a command cell.
pub fn command_cell(label: &str) -> Value {
    json!({
        "type": "command_cell",
        "metadata": {"value_type": null, "persists": false, "naming": label},
        "writable": true,
        "current": null,
    })
}

/// Descriptor for a bulk-data cell.
pub fn bulk_cell(info_format: &str, array_format: &str) -> Value {
    json!({
        "type": "value_cell",
        "metadata": {
            "value_type": {
                "type": "BulkDataT",
                "info_format": info_format,
                "array_format": array_format,
            },
            "persists": false,
            "naming": null,
        },
        "writable": false,
    })
}

/// Descriptor for a block-typed (reference) cell.
pub fn reference_cell() -> Value {
    json!({
        "type": "value_cell",
        "metadata": {"value_type": "reference", "persists": true, "naming": null},
        "writable": false,
    })
}

/// Binary frame carrying a byte-quantized spectrum update.
pub fn spectrum_frame(id: u32, freq: f64, rate: f32, offset: f32, samples: &[i8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&freq.to_le_bytes());
    frame.extend_from_slice(&rate.to_le_bytes());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend(samples.iter().map(|&s| s as u8));
    frame
}

/// Binary frame carrying a float scope update.
pub fn scope_frame(id: u32, rate: f64, samples: &[f32]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&rate.to_le_bytes());
    for s in samples {
        frame.extend_from_slice(&s.to_le_bytes());
    }
    frame
}
