//! An embedded Bluetooth BR/EDR host stack.
//!
//! The stack drives a Bluetooth controller over HCI and exposes
//! connection-oriented L2CAP channels to applications. It is built around a
//! single cooperative driver thread: the platform [`Backend`] moves packets
//! to and from the controller and queues inbound traffic; the application
//! (or its event loop) calls [`Host::handle_events`] or
//! [`Host::wait_events`] to dispatch, and every asynchronous completion is
//! reported through callbacks from inside that dispatch.
//!
//! A [`Host`] owns the one supported controller. Applications register as
//! [`Client`]s; each client's [`HciSession`](hci::HciSession) exposes the
//! typed command set, and [`l2cap::connect`] opens data channels on top of
//! ACL links.

pub mod acl;
pub mod backend;
pub mod buffer;
pub mod driver;
pub mod hci;
pub mod l2cap;
pub mod matcher;
pub mod queue;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(unix)]
pub mod unix;

use crate::backend::Backend;
use crate::driver::Driver;
use crate::hci::device::{DeviceRef, HciDevice};
use crate::hci::error::Error;
use crate::hci::{HciSession, InitStatus};
use crate::queue::{EventQueue, EventSink, InboundPacket};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// A six-byte Bluetooth device address, in the little-endian order it
/// travels on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BluetoothDeviceAddress(pub [u8; 6]);

impl core::fmt::Display for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl core::fmt::Debug for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

impl From<[u8; 6]> for BluetoothDeviceAddress {
    fn from(bytes: [u8; 6]) -> Self {
        BluetoothDeviceAddress(bytes)
    }
}

/// The 24-bit class-of-device field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassOfDevice(pub [u8; 3]);

/// A 128-bit link key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LinkKey(pub [u8; 16]);

impl core::fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        // Keys stay out of logs
        write!(f, "LinkKey(..)")
    }
}

/// Outcome of a fanned-out event callback: `Consumed` stops the walk over
/// the remaining clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Consumed,
    Propagate,
}

/// The stack instance. Owns the controller, the backend and the inbound
/// queue; only one controller is supported.
pub struct Host {
    dev: DeviceRef,
    events: Arc<EventQueue>,
    // The driver runs under a client of its own, like any application
    _driver_client: Client,
}

impl Host {
    /// Bring the stack up: initialise the backend, then hand the driver a
    /// session to run the controller init sequence. Clients learn the
    /// outcome through `HciSession::on_initialized`.
    pub fn new(mut backend: Box<dyn Backend>, driver: Box<dyn Driver>) -> Result<Host, Error> {
        let events = Arc::new(EventQueue::new());
        backend.init(EventSink::new(events.clone()))?;

        let dev: DeviceRef = Rc::new(RefCell::new(HciDevice::new(backend)));
        dev.borrow_mut().init_status = InitStatus::Initializing;

        let driver_slot = dev
            .borrow_mut()
            .add_client()
            .ok_or(Error::ResourceExhausted)?;
        let driver_client = Client {
            session: HciSession::new(dev.clone(), driver_slot),
        };
        driver.start(driver_client.session.clone());

        Ok(Host {
            dev,
            events,
            _driver_client: driver_client,
        })
    }

    /// Register an application client.
    pub fn client(&self) -> Result<Client, Error> {
        let slot = self
            .dev
            .borrow_mut()
            .add_client()
            .ok_or(Error::ResourceExhausted)?;
        Ok(Client {
            session: HciSession::new(self.dev.clone(), slot),
        })
    }

    /// Drain and dispatch everything currently queued; returns the number
    /// of packets handled. Non-blocking.
    pub fn handle_events(&self) -> usize {
        self.dispatch(self.events.drain(false))
    }

    /// Block until at least one inbound packet is queued, then drain.
    pub fn wait_events(&self) -> usize {
        self.dispatch(self.events.drain(true))
    }

    fn dispatch(&self, packets: Vec<InboundPacket>) -> usize {
        let count = packets.len();
        for packet in packets {
            match packet {
                InboundPacket::Event(buffer) => hci::device::dispatch_event(&self.dev, buffer),
                InboundPacket::Data(buffer) => hci::device::dispatch_data(&self.dev, buffer),
            }
        }
        count
    }

    /// Shut the transport down.
    pub fn teardown(self) {
        self.dev.borrow_mut().backend_deinit();
    }

    #[cfg(test)]
    pub(crate) fn device(&self) -> &DeviceRef {
        &self.dev
    }
}

/// An application's registration with the stack. Dropping it unregisters
/// the client and its callbacks.
pub struct Client {
    session: HciSession,
}

impl Client {
    /// This client's session: the typed HCI command interface.
    pub fn hci(&self) -> &HciSession {
        &self.session
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.session
            .dev
            .borrow_mut()
            .remove_client(self.session.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DefaultDriver;
    use crate::testing::{command_complete, Harness};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn default_driver_probes_and_reports() {
        let harness = Harness::with_controller(339, 10);
        {
            let device = harness.host.device().borrow();
            assert_eq!(device.init_status, hci::InitStatus::Initialized);
            assert_eq!(device.acl_mtu, 339);
            assert_eq!(device.acl_max_packets, 10);
            assert_eq!(device.acl_available_packets, 10);
            assert_eq!(device.address.0, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        }

        let client = harness.host.client().unwrap();
        assert_eq!(client.hci().acl_mtu(), 339);
        assert_ne!(client.hci().supported_features(), 0);
    }

    #[test]
    fn failed_probe_reports_failure_to_clients() {
        let harness = Harness::with_driver(Box::new(DefaultDriver));
        let client = harness.host.client().unwrap();

        let seen = Rc::new(RefCell::new(None));
        let record = seen.clone();
        client
            .hci()
            .on_initialized(move |_, success| *record.borrow_mut() = Some(success));
        assert_eq!(*seen.borrow(), None);

        // Read Buffer Size fails; the driver gives up
        harness.take_commands();
        harness.inject_event(&command_complete(0x1005, &[0x03]));

        assert_eq!(*seen.borrow(), Some(false));
        assert_eq!(
            harness.host.device().borrow().init_status,
            hci::InitStatus::Failed
        );
    }

    #[test]
    fn client_slots_are_bounded_and_reusable() {
        let harness = Harness::new();

        // The driver holds one of the four slots
        let first = harness.host.client().unwrap();
        let _second = harness.host.client().unwrap();
        let _third = harness.host.client().unwrap();
        match harness.host.client() {
            Err(hci::error::Error::ResourceExhausted) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other.err()),
        }

        drop(first);
        assert!(harness.host.client().is_ok());
    }

    #[test]
    fn addresses_display_most_significant_first() {
        let address = BluetoothDeviceAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(address.to_string(), "66:55:44:33:22:11");
    }
}
