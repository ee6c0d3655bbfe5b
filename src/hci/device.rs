//! The device core: pending commands, event dispatch, flow control.
//!
//! Exactly one controller is supported. The device is created by
//! [`Host::new`](crate::Host::new) and shared behind `Rc<RefCell<_>>` by
//! every handle; all of it runs on the driver thread. The one discipline
//! that matters here: no borrow of the cell is ever held while a stored
//! callback runs, because callbacks are free to re-enter the stack and
//! issue new commands.

use crate::acl::Acl;
use crate::backend::Backend;
use crate::buffer::Buffer;
use crate::hci::common::{
    read_le16, read_u8, write_le16, ConnectionHandle, CMD_HDR_LEN, REPLY_POS_DATA,
    REPLY_POS_STATUS,
};
use crate::hci::error::Error;
use crate::hci::events::{self, code, InquiryResponse, StoredLinkKey};
use crate::hci::opcodes::{HciCommand, OpCodePair};
use crate::hci::{ConnectionRequestCb, HciSession, InitializedCb, InquiryCb, VendorEventCb};
use crate::matcher::DataMatcher;
use crate::{BluetoothDeviceAddress, Propagation};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub(crate) type DeviceRef = Rc<RefCell<HciDevice>>;

pub(crate) const MAX_PENDING_COMMANDS: usize = 8;
/// The driver registers a client of its own to run the init sequence, so
/// this must be at least 2.
pub(crate) const MAX_CLIENTS: usize = 4;
pub(crate) const MAX_ACL_LINKS: usize = 4;

const HANDLER_SLOTS: usize = events::EVENT_LAST as usize + 1;

/// Initialisation state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Uninitialized,
    Initializing,
    Initialized,
    Failed,
}

/// A command completion or a registered event waiter.
pub(crate) enum PendingAction {
    /// One-shot: consumed by the matching packet.
    Complete(Box<dyn FnOnce(&HciSession, &[u8])>),
    /// Persistent: stays registered until it returns `Consumed`.
    Watch(Box<dyn FnMut(&HciSession, &[u8]) -> Propagation>),
}

pub(crate) type StatusCb = Box<dyn FnOnce(&HciSession, u8)>;

/// One slot of the pending table. Commands awaiting Command Complete carry
/// an empty matcher and match by opcode; event waiters carry a compiled
/// matcher and a zero opcode.
pub(crate) struct PendingCommand {
    pub(crate) opcode: u16,
    pub(crate) matcher: DataMatcher,
    pub(crate) client: usize,
    pub(crate) action: Option<PendingAction>,
    pub(crate) on_status: Option<StatusCb>,
}

pub(crate) type EventHandlerFn = fn(&DeviceRef, &[u8], Option<usize>);

/// An installed handler for one event code; at most one per code, with
/// vendor-specific events sharing slot zero.
#[derive(Clone, Copy)]
pub(crate) struct EventHandler {
    pub(crate) func: EventHandlerFn,
    pub(crate) client: Option<usize>,
}

/// Per-client callback registrations, fanned out in registration order.
#[derive(Default)]
pub(crate) struct ClientSlot {
    pub(crate) initialized_cb: Option<InitializedCb>,
    pub(crate) inquiry_cb: Option<InquiryCb>,
    pub(crate) connection_request_cb: Option<ConnectionRequestCb>,
    pub(crate) link_key_request_cb: Option<AddressEventCb>,
    pub(crate) pin_code_request_cb: Option<AddressEventCb>,
    pub(crate) vendor_event_cb: Option<VendorEventCb>,
}

pub(crate) type AddressEventCb = Box<dyn FnMut(&HciSession, &BluetoothDeviceAddress) -> Propagation>;

pub(crate) struct HciDevice {
    backend: Box<dyn Backend>,
    pub(crate) init_status: InitStatus,
    pub(crate) address: BluetoothDeviceAddress,
    pub(crate) supported_features: u64,
    pub(crate) acl_mtu: u16,
    pub(crate) sco_mtu: u8,
    pub(crate) acl_max_packets: u16,
    pub(crate) sco_max_packets: u16,
    pub(crate) acl_available_packets: u16,
    pub(crate) num_hci_command_packets: u8,
    pending: [Option<PendingCommand>; MAX_PENDING_COMMANDS],
    num_pending: usize,
    event_handlers: [Option<EventHandler>; HANDLER_SLOTS],
    pub(crate) clients: [Option<ClientSlot>; MAX_CLIENTS],
    pub(crate) acls: [Option<Acl>; MAX_ACL_LINKS],
    outgoing_acl: VecDeque<Buffer>,
    pub(crate) inquiry_responses: Vec<InquiryResponse>,
    pub(crate) stored_keys: Vec<StoredLinkKey>,
    next_channel_id: u16,
    last_signal_id: u8,
}

impl HciDevice {
    pub(crate) fn new(backend: Box<dyn Backend>) -> HciDevice {
        HciDevice {
            backend,
            init_status: InitStatus::Uninitialized,
            address: BluetoothDeviceAddress::default(),
            supported_features: 0,
            acl_mtu: 0,
            sco_mtu: 0,
            acl_max_packets: 0,
            sco_max_packets: 0,
            acl_available_packets: 0,
            num_hci_command_packets: 1,
            pending: Default::default(),
            num_pending: 0,
            event_handlers: [None; HANDLER_SLOTS],
            clients: Default::default(),
            acls: Default::default(),
            outgoing_acl: VecDeque::new(),
            inquiry_responses: Vec::new(),
            stored_keys: Vec::new(),
            next_channel_id: 0x0040,
            last_signal_id: 0,
        }
    }

    // ---- clients ----

    pub(crate) fn add_client(&mut self) -> Option<usize> {
        for (index, slot) in self.clients.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ClientSlot::default());
                return Some(index);
            }
        }
        None
    }

    pub(crate) fn remove_client(&mut self, index: usize) {
        self.clients[index] = None;
    }

    // ---- event handlers ----

    pub(crate) fn install_event_handler(&mut self, event_code: u8, handler: Option<EventHandler>) {
        let slot = match events::handler_slot(event_code) {
            Some(slot) => slot,
            None => return,
        };
        if let (Some(new), Some(existing)) = (&handler, &self.event_handlers[slot]) {
            // A second client subscribing to the same broadcast installs the
            // same dispatcher; that is not worth a warning
            if new.func == existing.func && new.client == existing.client {
                return;
            }
            log::warn!("handler already installed for event {:02x}", event_code);
        }
        self.event_handlers[slot] = handler;
    }

    fn handler_for(&self, event_code: u8) -> Option<EventHandler> {
        events::handler_slot(event_code).and_then(|slot| self.event_handlers[slot])
    }

    // ---- pending command table ----

    fn command_alloc(opcode: u16, len: u16) -> Buffer {
        let mut buffer = Buffer::alloc_contiguous(len);
        if let Some(data) = buffer.contiguous_data_mut(CMD_HDR_LEN) {
            write_le16(opcode, data);
            data[2] = (len - CMD_HDR_LEN) as u8;
        }
        buffer
    }

    fn free_slot(&mut self) -> Result<usize, Error> {
        if self.num_pending >= MAX_PENDING_COMMANDS {
            return Err(Error::ResourceExhausted);
        }
        for (index, slot) in self.pending.iter().enumerate() {
            if slot.is_none() {
                return Ok(index);
            }
        }
        Err(Error::ResourceExhausted)
    }

    fn check_duplicate_opcode(&self, opcode: u16) -> Result<(), Error> {
        for slot in self.pending.iter().flatten() {
            // Without deeper matching on the reply payload, two identical
            // opcodes in flight could not be told apart; refuse the second.
            if slot.matcher.is_empty() && slot.opcode == opcode {
                return Err(Error::NotAllowed);
            }
        }
        Ok(())
    }

    /// Claim a slot for a synchronous command (one awaiting Command
    /// Complete) and hand back its packet for parameter filling.
    pub(crate) fn add_pending_command(
        &mut self,
        client: usize,
        command: HciCommand,
        len: u16,
        action: PendingAction,
    ) -> Result<Buffer, Error> {
        let opcode = command.as_opcode();
        self.check_duplicate_opcode(opcode)?;
        let index = self.free_slot()?;
        self.pending[index] = Some(PendingCommand {
            opcode,
            matcher: DataMatcher::new(),
            client,
            action: Some(action),
            on_status: None,
        });
        self.num_pending += 1;
        Ok(Self::command_alloc(opcode, len))
    }

    /// Claim a slot for an asynchronous command: `on_status` fires on
    /// Command Status and is responsible for registering the follow-up
    /// event waiter.
    pub(crate) fn add_pending_async_command(
        &mut self,
        client: usize,
        command: HciCommand,
        len: u16,
        on_status: StatusCb,
    ) -> Result<Buffer, Error> {
        let opcode = command.as_opcode();
        self.check_duplicate_opcode(opcode)?;
        let index = self.free_slot()?;
        self.pending[index] = Some(PendingCommand {
            opcode,
            matcher: DataMatcher::new(),
            client,
            action: None,
            on_status: Some(on_status),
        });
        self.num_pending += 1;
        Ok(Self::command_alloc(opcode, len))
    }

    /// Build a command packet that expects no reply at all.
    pub(crate) fn add_command_no_reply(&mut self, command: HciCommand, len: u16) -> Buffer {
        Self::command_alloc(command.as_opcode(), len)
    }

    /// Register an event waiter keyed by a compiled matcher.
    pub(crate) fn add_event_waiter(
        &mut self,
        client: usize,
        matcher: DataMatcher,
        action: PendingAction,
    ) -> Result<(), Error> {
        for slot in self.pending.iter().flatten() {
            if slot.matcher.is_same(&matcher) {
                return Err(Error::NotAllowed);
            }
        }
        let index = self.free_slot()?;
        self.pending[index] = Some(PendingCommand {
            opcode: 0,
            matcher,
            client,
            action: Some(action),
            on_status: None,
        });
        self.num_pending += 1;
        Ok(())
    }

    /// Drop the waiter compiled from `matcher`, if this client owns one.
    pub(crate) fn remove_event_waiter(&mut self, matcher: &DataMatcher, client: usize) -> bool {
        for slot in self.pending.iter_mut() {
            let matches = slot
                .as_ref()
                .map_or(false, |pc| pc.client == client && pc.matcher.is_same(matcher));
            if matches {
                *slot = None;
                self.num_pending -= 1;
                return true;
            }
        }
        false
    }

    fn take_pending_by_opcode(&mut self, opcode: u16) -> Option<PendingCommand> {
        for slot in self.pending.iter_mut() {
            let matches = slot
                .as_ref()
                .map_or(false, |pc| pc.matcher.is_empty() && pc.opcode == opcode);
            if matches {
                self.num_pending -= 1;
                return slot.take();
            }
        }
        None
    }

    pub(crate) fn remove_pending_by_opcode(&mut self, opcode: u16) {
        let _ = self.take_pending_by_opcode(opcode);
    }

    fn take_matching_waiter(&mut self, packet: &[u8]) -> Option<(usize, PendingCommand)> {
        for (index, slot) in self.pending.iter_mut().enumerate() {
            let matches = slot
                .as_ref()
                .map_or(false, |pc| !pc.matcher.is_empty() && pc.matcher.compare(packet));
            if matches {
                self.num_pending -= 1;
                return slot.take().map(|pc| (index, pc));
            }
        }
        None
    }

    fn restore_waiter(&mut self, index: usize, waiter: PendingCommand) {
        if self.pending[index].is_none() {
            self.pending[index] = Some(waiter);
            self.num_pending += 1;
        } else if let Ok(free) = self.free_slot() {
            self.pending[free] = Some(waiter);
            self.num_pending += 1;
        } else {
            log::warn!("no slot left to keep event waiter registered");
        }
    }

    // ---- transport ----

    pub(crate) fn send_command(&mut self, buffer: Buffer) -> Result<(), Error> {
        self.backend.send_command(buffer).map_err(Error::Backend)
    }

    pub(crate) fn backend_deinit(&mut self) {
        if let Err(err) = self.backend.deinit() {
            log::warn!("backend deinit failed: {}", err);
        }
    }

    // ---- ACL registry and flow control ----

    pub(crate) fn register_acl(&mut self, acl: Acl) -> Result<usize, Error> {
        for (index, slot) in self.acls.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(acl);
                return Ok(index);
            }
        }
        Err(Error::ResourceExhausted)
    }

    pub(crate) fn find_acl_by_handle(&self, conn_handle: ConnectionHandle) -> Option<usize> {
        self.acls.iter().position(|slot| {
            slot.as_ref()
                .map_or(false, |acl| acl.conn_handle == Some(conn_handle))
        })
    }

    pub(crate) fn find_acl_by_address(&self, address: &BluetoothDeviceAddress) -> Option<usize> {
        self.acls.iter().position(|slot| {
            slot.as_ref().map_or(false, |acl| acl.address == *address)
        })
    }

    /// Split a fragmented message into per-fragment packets on the outgoing
    /// queue; returns the number queued.
    pub(crate) fn queue_acl_fragments(&mut self, buffer: Buffer) -> usize {
        let fragments = buffer.into_fragments();
        let count = fragments.len();
        self.outgoing_acl.extend(fragments);
        count
    }

    pub(crate) fn outgoing_acl_len(&self) -> usize {
        self.outgoing_acl.len()
    }

    /// Drain the outgoing queue while controller credits remain.
    pub(crate) fn send_queued_data(&mut self) -> Result<usize, Error> {
        let mut sent = 0;
        while self.acl_available_packets > 0 {
            match self.outgoing_acl.pop_front() {
                Some(buffer) => {
                    self.backend.send_data(buffer).map_err(Error::Backend)?;
                    self.acl_available_packets -= 1;
                    sent += 1;
                }
                None => break,
            }
        }
        Ok(sent)
    }

    // ---- L2CAP id spaces (one controller, one signalling space) ----

    pub(crate) fn next_channel_id(&mut self) -> u16 {
        // 0x0000-0x003f is reserved
        if self.next_channel_id < 0x0040 {
            self.next_channel_id = 0x0040;
        }
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        id
    }

    pub(crate) fn next_signal_id(&mut self) -> u8 {
        if self.last_signal_id == 0xFF {
            self.last_signal_id = 0;
        }
        self.last_signal_id += 1;
        self.last_signal_id
    }

    // ---- informational snooping ----

    fn snoop_command_complete(&mut self, opcode: u16, packet: &[u8]) {
        let pair = OpCodePair::from_opcode(opcode);
        if pair.ogf != 0x04 || read_u8(packet, REPLY_POS_STATUS) != 0 {
            return;
        }
        let data = &packet[REPLY_POS_DATA.min(packet.len())..];
        match pair.ocf {
            // Read Local Supported Features
            0x03 => {
                self.supported_features = crate::hci::common::read_le64(data, 0);
            }
            // Read Buffer Size
            0x05 => {
                self.acl_mtu = read_le16(data, 0);
                self.sco_mtu = read_u8(data, 2);
                self.acl_max_packets = read_le16(data, 3);
                self.sco_max_packets = read_le16(data, 5);
                self.acl_available_packets = self.acl_max_packets;
            }
            // Read BD ADDR
            0x09 => {
                let mut bytes = [0u8; 6];
                if data.len() >= 6 {
                    bytes.copy_from_slice(&data[..6]);
                }
                self.address = BluetoothDeviceAddress(bytes);
            }
            _ => {}
        }
    }
}

// ---- dispatch ----

/// Dispatch one inbound event packet. Runs on the driver thread, from
/// `Host::handle_events`.
pub(crate) fn dispatch_event(dev: &DeviceRef, buffer: Buffer) {
    let packet = buffer.to_vec();
    if packet.len() < 2 {
        log::warn!("runt event packet ({} bytes) dropped", packet.len());
        return;
    }
    let event_code = packet[0];
    log::debug!(
        "event {:02x}, size {}: {:02x?}",
        event_code,
        packet.len(),
        &packet[..packet.len().min(16)]
    );

    match event_code {
        code::COMMAND_COMPLETE => handle_command_complete(dev, &packet),
        code::COMMAND_STATUS => handle_command_status(dev, &packet),
        code::NUMBER_OF_COMPLETED_PACKETS => handle_completed_packets(dev, &packet),
        code::DISCONNECTION_COMPLETE => crate::acl::handle_disconnection_complete(dev, &packet),
        _ => {}
    }

    let handler = dev.borrow().handler_for(event_code);
    if let Some(handler) = handler {
        (handler.func)(dev, &packet, handler.client);
    }

    let waiter = dev.borrow_mut().take_matching_waiter(&packet);
    if let Some((index, mut waiter)) = waiter {
        let session = HciSession::new(dev.clone(), waiter.client);
        match waiter.action.take() {
            Some(PendingAction::Complete(callback)) => callback(&session, &packet),
            Some(PendingAction::Watch(mut callback)) => {
                if callback(&session, &packet) == Propagation::Propagate {
                    waiter.action = Some(PendingAction::Watch(callback));
                    dev.borrow_mut().restore_waiter(index, waiter);
                }
            }
            None => {}
        }
    }
}

/// Dispatch one inbound ACL data packet.
pub(crate) fn dispatch_data(dev: &DeviceRef, buffer: Buffer) {
    crate::acl::handle_data(dev, buffer);
}

fn handle_command_complete(dev: &DeviceRef, packet: &[u8]) {
    let payload = &packet[2..];
    let taken = {
        let mut device = dev.borrow_mut();
        device.num_hci_command_packets = read_u8(payload, 0);
        if payload.len() < 3 {
            None
        } else {
            let opcode = read_le16(payload, 1);
            device.snoop_command_complete(opcode, packet);
            device.take_pending_by_opcode(opcode)
        }
    };

    if let Some(mut pending) = taken {
        let session = HciSession::new(dev.clone(), pending.client);
        match pending.action.take() {
            Some(PendingAction::Complete(callback)) => callback(&session, packet),
            Some(PendingAction::Watch(mut callback)) => {
                let _ = callback(&session, packet);
            }
            None => {}
        }
    }
}

fn handle_command_status(dev: &DeviceRef, packet: &[u8]) {
    let payload = &packet[2..];
    let status = read_u8(payload, 0);
    let opcode = read_le16(payload, 2);
    let taken = {
        let mut device = dev.borrow_mut();
        device.num_hci_command_packets = read_u8(payload, 1);
        device.take_pending_by_opcode(opcode)
    };

    match taken {
        Some(pending) => {
            let session = HciSession::new(dev.clone(), pending.client);
            match pending.on_status {
                Some(on_status) => on_status(&session, status),
                None => log::warn!(
                    "command {:04x} reported status {:02x} with no status callback",
                    opcode,
                    status
                ),
            }
        }
        None => log::debug!("status {:02x} for unknown opcode {:04x}", status, opcode),
    }
}

fn handle_completed_packets(dev: &DeviceRef, packet: &[u8]) {
    let hooks = {
        let mut device = dev.borrow_mut();
        let mut hooks = Vec::new();
        let mut returned = 0u16;
        for (conn_handle, completed) in events::completed_packets_entries(packet) {
            returned = returned.saturating_add(completed);
            if let Some(index) = device.find_acl_by_handle(conn_handle) {
                if let Some(hook) = device.acls[index].as_ref().and_then(|acl| acl.completed_packets_cb) {
                    hooks.push((hook, index, completed));
                }
            }
        }
        device.acl_available_packets = device
            .acl_available_packets
            .saturating_add(returned)
            .min(device.acl_max_packets);
        hooks
    };

    for (hook, index, completed) in hooks {
        hook(dev, index, completed);
    }

    let result = dev.borrow_mut().send_queued_data();
    if let Err(err) = result {
        log::warn!("draining outgoing data failed: {}", err);
    }
}

/// Walk the registered clients in order, invoking the callback selected by
/// `field`; a client returning [`Propagation::Consumed`] ends the walk. The
/// callback is taken out of the slot while it runs, so it may re-enter the
/// device; it is restored afterwards unless it registered a replacement.
pub(crate) fn fan_out<T, F>(
    dev: &DeviceRef,
    field: fn(&mut ClientSlot) -> &mut Option<T>,
    mut invoke: F,
) where
    F: FnMut(&mut T, &HciSession) -> Propagation,
{
    for index in 0..MAX_CLIENTS {
        let taken = {
            let mut device = dev.borrow_mut();
            device.clients[index].as_mut().and_then(|slot| field(slot).take())
        };
        let mut callback = match taken {
            Some(callback) => callback,
            None => continue,
        };
        let session = HciSession::new(dev.clone(), index);
        let outcome = invoke(&mut callback, &session);
        {
            let mut device = dev.borrow_mut();
            if let Some(slot) = device.clients[index].as_mut() {
                let place = field(slot);
                if place.is_none() {
                    *place = Some(callback);
                }
            }
        }
        if outcome == Propagation::Consumed {
            break;
        }
    }
}

/// Record the init transition and notify every registered client. Exposed
/// to drivers through [`HciSession::set_init_status`].
pub(crate) fn set_init_status(dev: &DeviceRef, status: InitStatus) {
    dev.borrow_mut().init_status = status;
    log::debug!("controller init status: {:?}", status);

    if status == InitStatus::Initialized || status == InitStatus::Failed {
        let success = status == InitStatus::Initialized;
        fan_out(
            dev,
            |slot| &mut slot.initialized_cb,
            |callback, session| {
                callback(session, success);
                Propagation::Propagate
            },
        );
    }
}
