//! Test support: a mock transport that records outbound packets and lets
//! tests inject controller traffic, plus a driver that skips controller
//! bring-up entirely.

use crate::backend::{Backend, BackendError};
use crate::buffer::Buffer;
use crate::driver::{Driver, DefaultDriver};
use crate::hci::{HciSession, InitStatus};
use crate::queue::EventSink;
use crate::Host;
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) struct MockBackend {
    commands: Rc<RefCell<Vec<Vec<u8>>>>,
    data: Rc<RefCell<Vec<Vec<u8>>>>,
    sink: Rc<RefCell<Option<EventSink>>>,
}

impl Backend for MockBackend {
    fn init(&mut self, sink: EventSink) -> Result<(), BackendError> {
        *self.sink.borrow_mut() = Some(sink);
        Ok(())
    }

    fn send_command(&mut self, buffer: Buffer) -> Result<(), BackendError> {
        self.commands.borrow_mut().push(buffer.to_vec());
        Ok(())
    }

    fn send_data(&mut self, buffer: Buffer) -> Result<(), BackendError> {
        self.data.borrow_mut().push(buffer.to_vec());
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), BackendError> {
        *self.sink.borrow_mut() = None;
        Ok(())
    }
}

/// Reports the controller as initialised without sending anything.
pub(crate) struct NullDriver;

impl Driver for NullDriver {
    fn start(self: Box<Self>, hci: HciSession) {
        hci.set_init_status(InitStatus::Initialized);
    }
}

pub(crate) struct Harness {
    pub host: Host,
    pub commands: Rc<RefCell<Vec<Vec<u8>>>>,
    pub data: Rc<RefCell<Vec<Vec<u8>>>>,
    sink: Rc<RefCell<Option<EventSink>>>,
}

impl Harness {
    pub fn with_driver(driver: Box<dyn Driver>) -> Harness {
        let commands = Rc::new(RefCell::new(Vec::new()));
        let data = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::new(RefCell::new(None));
        let backend = MockBackend {
            commands: commands.clone(),
            data: data.clone(),
            sink: sink.clone(),
        };
        let host = Host::new(Box::new(backend), driver).unwrap();
        Harness {
            host,
            commands,
            data,
            sink,
        }
    }

    /// A host whose controller is "initialised" but unprobed; good enough
    /// for command-table tests.
    pub fn new() -> Harness {
        Self::with_driver(Box::new(NullDriver))
    }

    /// A host brought up through the default driver, with the controller
    /// answering the probe sequence with the given ACL capacity.
    pub fn with_controller(acl_mtu: u16, acl_max_packets: u16) -> Harness {
        use crate::hci::common::features;

        let harness = Self::with_driver(Box::new(DefaultDriver));

        // Read Buffer Size
        assert_eq!(harness.take_commands().len(), 1);
        let mut buffer_size = vec![0u8];
        buffer_size.extend_from_slice(&acl_mtu.to_le_bytes());
        buffer_size.push(64);
        buffer_size.extend_from_slice(&acl_max_packets.to_le_bytes());
        buffer_size.extend_from_slice(&0u16.to_le_bytes());
        harness.inject_event(&command_complete(0x1005, &buffer_size));

        // Read BD ADDR
        assert_eq!(harness.take_commands().len(), 1);
        harness.inject_event(&command_complete(0x1009, &[0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));

        // Read Local Supported Features
        assert_eq!(harness.take_commands().len(), 1);
        let mut local_features = vec![0u8];
        local_features.extend_from_slice(
            &(features::THREE_SLOT_PACKETS | features::FIVE_SLOT_PACKETS).to_le_bytes(),
        );
        harness.inject_event(&command_complete(0x1003, &local_features));

        // Reset
        assert_eq!(harness.take_commands().len(), 1);
        harness.inject_event(&command_complete(0x0C03, &[0]));

        harness
    }

    pub fn inject_event(&self, packet: &[u8]) {
        self.sink
            .borrow()
            .as_ref()
            .expect("backend not initialized")
            .dispatch_event(Buffer::from_slice(packet));
        self.host.handle_events();
    }

    pub fn inject_data(&self, packet: &[u8]) {
        self.sink
            .borrow()
            .as_ref()
            .expect("backend not initialized")
            .dispatch_data(Buffer::from_slice(packet));
        self.host.handle_events();
    }

    pub fn take_commands(&self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut *self.commands.borrow_mut(), Vec::new())
    }

    pub fn take_data(&self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut *self.data.borrow_mut(), Vec::new())
    }
}

/// Build a Command Complete event for `opcode`.
pub(crate) fn command_complete(opcode: u16, return_params: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x0E, (3 + return_params.len()) as u8, 1];
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.extend_from_slice(return_params);
    packet
}

/// Build a Command Status event for `opcode`.
pub(crate) fn command_status(status: u8, opcode: u16) -> Vec<u8> {
    let mut packet = vec![0x0F, 4, status, 1];
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet
}

/// Build a Connection Complete event.
pub(crate) fn connection_complete(status: u8, conn_handle: u16, address: &[u8; 6]) -> Vec<u8> {
    let mut packet = vec![0x03, 11, status];
    packet.extend_from_slice(&conn_handle.to_le_bytes());
    packet.extend_from_slice(address);
    packet.push(0x01); // ACL link
    packet.push(0x00); // encryption off
    packet
}

/// Build a Number Of Completed Packets event for one handle.
pub(crate) fn completed_packets(conn_handle: u16, completed: u16) -> Vec<u8> {
    let mut packet = vec![0x13, 5, 1];
    packet.extend_from_slice(&conn_handle.to_le_bytes());
    packet.extend_from_slice(&completed.to_le_bytes());
    packet
}

/// Frame `payload` as one inbound ACL packet.
pub(crate) fn acl_packet(conn_handle: u16, packet_boundary: u8, payload: &[u8]) -> Vec<u8> {
    let flags = conn_handle | ((packet_boundary as u16) << 12);
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.extend_from_slice(&flags.to_le_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Frame `payload` as an L2CAP PDU on `channel_id`.
pub(crate) fn l2cap_frame(channel_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&channel_id.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Frame one signalling command.
pub(crate) fn signal_cmd(code: u8, id: u8, data: &[u8]) -> Vec<u8> {
    let mut command = vec![code, id];
    command.extend_from_slice(&(data.len() as u16).to_le_bytes());
    command.extend_from_slice(data);
    command
}
