//! The HCI command/event pipeline and the per-client session façade.
//!
//! Every typed command here is a thin encoder over the pending-command
//! machinery in [`device`], paired with a decoder of the reply payload.
//! Completion is always reported through the supplied callback, dispatched
//! from `Host::handle_events` on the driver thread; submission errors are
//! returned inline.

pub mod common;
pub(crate) mod device;
pub mod error;
pub mod events;
pub mod opcodes;

use self::common::{
    read_le16, read_le64, read_u8, write_le16, write_le64, ConnectionHandle, CMD_HDR_LEN,
    EVENT_POS_PAYLOAD, REPLY_POS_DATA, REPLY_POS_STATUS,
};
use self::device::{DeviceRef, EventHandler, PendingAction, StatusCb};
use self::error::{Error, Status};
use self::events::{code, ConnectionRequestData, InquiryResponse, StoredLinkKey};
use self::opcodes::{
    ControllerAndBaseband as Cb, HciCommand, InformationParameters as Ip, LinkControl as Lc,
    LinkPolicy as Lp,
};
use crate::matcher::DataMatcher;
use crate::{BluetoothDeviceAddress, ClassOfDevice, LinkKey, Propagation};

pub use self::device::InitStatus;

pub(crate) type InitializedCb = Box<dyn FnMut(&HciSession, bool)>;
pub(crate) type InquiryCb = Box<dyn FnMut(&HciSession, &InquiryReply)>;
pub(crate) type ConnectionRequestCb =
    Box<dyn FnMut(&HciSession, &ConnectionRequestData) -> Propagation>;
pub(crate) type VendorEventCb = Box<dyn FnMut(&HciSession, &[u8]) -> Propagation>;

/// The reply shared by every command that only reports a status.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct ReadLocalNameReply {
    pub status: Status,
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadLocalFeaturesReply {
    pub status: Status,
    pub features: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadLocalVersionReply {
    pub status: Status,
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadBufferSizeReply {
    pub status: Status,
    pub acl_mtu: u16,
    pub sco_mtu: u8,
    pub acl_max_packets: u16,
    pub sco_max_packets: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadBdAddrReply {
    pub status: Status,
    pub address: BluetoothDeviceAddress,
}

#[derive(Debug, Clone)]
pub struct InquiryReply {
    pub status: Status,
    pub responses: Vec<InquiryResponse>,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateConnectionReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub address: BluetoothDeviceAddress,
    pub link_type: u8,
    pub encryption_mode: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthRequestedReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
}

#[derive(Debug, Clone)]
pub struct ReadRemoteNameReply {
    pub status: Status,
    pub address: BluetoothDeviceAddress,
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadRemoteFeaturesReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub features: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadRemoteVersionReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadClockOffsetReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub clock_offset: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ModeChangeReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub current_mode: u8,
    pub interval: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkKeyReqReply {
    pub status: Status,
    pub address: BluetoothDeviceAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadLinkPolicyReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub settings: u16,
}

#[derive(Debug, Clone)]
pub struct ReadStoredLinkKeyReply {
    pub status: Status,
    pub max_keys: u16,
    pub keys: Vec<StoredLinkKey>,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteStoredLinkKeyReply {
    pub status: Status,
    pub num_keys: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteStoredLinkKeyReply {
    pub status: Status,
    pub num_keys: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadValueReply {
    pub status: Status,
    pub value: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadClassOfDeviceReply {
    pub status: Status,
    pub class_of_device: ClassOfDevice,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadPageTimeoutReply {
    pub status: Status,
    pub page_timeout: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadConnTimeoutReply {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub timeout: u16,
}

#[derive(Debug, Clone)]
pub struct ReadCurrentIacLapReply {
    pub status: Status,
    pub laps: Vec<u32>,
}

/// Parameters of HCI Create Connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams {
    pub packet_type: u16,
    pub clock_offset: Option<u16>,
    pub page_scan_repetition_mode: u8,
    pub allow_role_switch: bool,
}

/// Event filter types and condition types for `set_event_filter`.
pub mod event_filter {
    pub const CLEAR: u8 = 0x00;
    pub const INQUIRY_RESULT: u8 = 0x01;
    pub const CONNECTION_SETUP: u8 = 0x02;

    pub const COND_ALL_DEVICES: u8 = 0x00;
    pub const COND_CLASS_OF_DEVICE: u8 = 0x01;
    pub const COND_ADDRESS: u8 = 0x02;
}

// ---- reply parsers ----

fn parse_status(packet: &[u8]) -> Reply {
    Reply {
        status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn reply_data(packet: &[u8]) -> &[u8] {
    &packet[REPLY_POS_DATA.min(packet.len())..]
}

fn event_payload(packet: &[u8]) -> &[u8] {
    &packet[EVENT_POS_PAYLOAD.min(packet.len())..]
}

fn parse_address(data: &[u8], offset: usize) -> BluetoothDeviceAddress {
    let mut bytes = [0u8; 6];
    if offset + 6 <= data.len() {
        bytes.copy_from_slice(&data[offset..offset + 6]);
    }
    BluetoothDeviceAddress(bytes)
}

fn parse_read_value(packet: &[u8]) -> ReadValueReply {
    ReadValueReply {
        status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
        value: read_u8(packet, REPLY_POS_DATA),
    }
}

fn parse_connection_complete(packet: &[u8]) -> CreateConnectionReply {
    let payload = event_payload(packet);
    CreateConnectionReply {
        status: Status::from(read_u8(payload, 0)),
        conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
        address: parse_address(payload, 3),
        link_type: read_u8(payload, 9),
        encryption_mode: read_u8(payload, 10),
    }
}

fn parse_auth_complete(packet: &[u8]) -> AuthRequestedReply {
    let payload = event_payload(packet);
    AuthRequestedReply {
        status: Status::from(read_u8(payload, 0)),
        conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
    }
}

fn parse_remote_name_complete(packet: &[u8]) -> ReadRemoteNameReply {
    let payload = event_payload(packet);
    ReadRemoteNameReply {
        status: Status::from(read_u8(payload, 0)),
        address: parse_address(payload, 1),
        name: c_string(&payload[7.min(payload.len())..]),
    }
}

fn parse_remote_features_complete(packet: &[u8]) -> ReadRemoteFeaturesReply {
    let payload = event_payload(packet);
    ReadRemoteFeaturesReply {
        status: Status::from(read_u8(payload, 0)),
        conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
        features: read_le64(payload, 3),
    }
}

fn parse_remote_version_complete(packet: &[u8]) -> ReadRemoteVersionReply {
    let payload = event_payload(packet);
    ReadRemoteVersionReply {
        status: Status::from(read_u8(payload, 0)),
        conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
        lmp_version: read_u8(payload, 3),
        manufacturer: read_le16(payload, 4),
        lmp_subversion: read_le16(payload, 6),
    }
}

fn parse_clock_offset_complete(packet: &[u8]) -> ReadClockOffsetReply {
    let payload = event_payload(packet);
    ReadClockOffsetReply {
        status: Status::from(read_u8(payload, 0)),
        conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
        clock_offset: read_le16(payload, 3),
    }
}

fn parse_mode_change(packet: &[u8]) -> ModeChangeReply {
    let payload = event_payload(packet);
    ModeChangeReply {
        status: Status::from(read_u8(payload, 0)),
        conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
        current_mode: read_u8(payload, 3),
        interval: read_le16(payload, 4),
    }
}

fn parse_link_key_reply(packet: &[u8]) -> LinkKeyReqReply {
    LinkKeyReqReply {
        status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
        address: parse_address(reply_data(packet), 0),
    }
}

// ---- helpers over the pending table ----

fn completion<R: 'static>(
    parse: fn(&[u8]) -> R,
    callback: impl FnOnce(&HciSession, &R) + 'static,
) -> PendingAction {
    PendingAction::Complete(Box::new(move |session, packet| {
        let reply = parse(packet);
        callback(session, &reply);
    }))
}

fn status_reply(status: u8) -> Reply {
    Reply {
        status: Status::from(status),
    }
}

fn write_clock_offset(clock_offset: Option<u16>, out: &mut [u8]) {
    match clock_offset {
        Some(offset) => write_le16(offset & 0x7FFF, out),
        None => write_le16(0, out),
    }
}

// ---- the session ----

/// A client's view of the (single) HCI device.
#[derive(Clone)]
pub struct HciSession {
    pub(crate) dev: DeviceRef,
    pub(crate) client: usize,
}

impl HciSession {
    pub(crate) fn new(dev: DeviceRef, client: usize) -> HciSession {
        HciSession { dev, client }
    }

    // -- submission plumbing --

    fn submit(
        &self,
        command: HciCommand,
        len: u16,
        action: PendingAction,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), Error> {
        let opcode = command.as_opcode();
        let mut device = self.dev.borrow_mut();
        let mut buffer = device.add_pending_command(self.client, command, len, action)?;
        if let Some(data) = buffer.contiguous_data_mut(len) {
            fill(&mut data[CMD_HDR_LEN as usize..]);
        }
        let result = device.send_command(buffer);
        if result.is_err() {
            device.remove_pending_by_opcode(opcode);
        }
        result
    }

    fn submit_async(
        &self,
        command: HciCommand,
        len: u16,
        on_status: StatusCb,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), Error> {
        let opcode = command.as_opcode();
        let mut device = self.dev.borrow_mut();
        let mut buffer = device.add_pending_async_command(self.client, command, len, on_status)?;
        if let Some(data) = buffer.contiguous_data_mut(len) {
            fill(&mut data[CMD_HDR_LEN as usize..]);
        }
        let result = device.send_command(buffer);
        if result.is_err() {
            device.remove_pending_by_opcode(opcode);
        }
        result
    }

    /// Shared shape of the connection-handle commands whose real reply
    /// arrives in a named follow-up event: Command Status first, then an
    /// event matched on the handle.
    fn connection_command<R: 'static>(
        &self,
        command: HciCommand,
        conn_handle: ConnectionHandle,
        event_code: u8,
        parse: fn(&[u8]) -> R,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &R) + 'static,
    ) -> Result<(), Error> {
        self.submit_async(
            command,
            CMD_HDR_LEN + 2,
            Box::new(move |session, status| {
                if status == 0 {
                    let mut matcher = DataMatcher::new();
                    matcher.add_rule(&[event_code], 0);
                    // one byte for the status field
                    matcher.add_rule(
                        &conn_handle.to_le_bytes(),
                        (EVENT_POS_PAYLOAD + 1) as u8,
                    );
                    let registered = session.dev.borrow_mut().add_event_waiter(
                        session.client,
                        matcher,
                        completion(parse, callback),
                    );
                    if let Err(err) = registered {
                        log::warn!("no waiter slot for event {:02x}: {}", event_code, err);
                    }
                }
                status_cb(session, &status_reply(status));
            }),
            |params| write_le16(conn_handle.raw(), params),
        )
    }

    /// Shared shape of Create/Accept/Reject Connection: the follow-up
    /// Connection Complete event is matched on the peer address.
    fn install_connection_complete_waiter(
        session: &HciSession,
        address: BluetoothDeviceAddress,
        callback: impl FnOnce(&HciSession, &CreateConnectionReply) + 'static,
    ) {
        let mut matcher = DataMatcher::new();
        matcher.add_rule(&[code::CONNECTION_COMPLETE], 0);
        // three bytes: one of status, two of connection handle
        matcher.add_rule(&address.0, (EVENT_POS_PAYLOAD + 3) as u8);
        let registered = session.dev.borrow_mut().add_event_waiter(
            session.client,
            matcher,
            completion(parse_connection_complete, callback),
        );
        if let Err(err) = registered {
            log::warn!("no waiter slot for connection complete: {}", err);
        }
    }

    // -- device state accessors --

    pub fn init_status(&self) -> InitStatus {
        self.dev.borrow().init_status
    }

    pub fn address(&self) -> BluetoothDeviceAddress {
        self.dev.borrow().address
    }

    pub fn supported_features(&self) -> u64 {
        self.dev.borrow().supported_features
    }

    pub fn acl_mtu(&self) -> u16 {
        self.dev.borrow().acl_mtu
    }

    pub fn sco_mtu(&self) -> u8 {
        self.dev.borrow().sco_mtu
    }

    pub fn acl_max_packets(&self) -> u16 {
        self.dev.borrow().acl_max_packets
    }

    pub fn sco_max_packets(&self) -> u16 {
        self.dev.borrow().sco_max_packets
    }

    /// For drivers: record the outcome of the controller init sequence.
    /// Clients are notified of the transition.
    pub fn set_init_status(&self, status: InitStatus) {
        device::set_init_status(&self.dev, status);
    }

    /// Register for the init transition. If the device already finished
    /// initialising, the callback fires immediately.
    pub fn on_initialized(&self, callback: impl FnMut(&HciSession, bool) + 'static) {
        let status = {
            let mut device = self.dev.borrow_mut();
            if let Some(slot) = device.clients[self.client].as_mut() {
                slot.initialized_cb = Some(Box::new(callback));
            }
            device.init_status
        };
        if status == InitStatus::Initialized || status == InitStatus::Failed {
            let taken = self.dev.borrow_mut().clients[self.client]
                .as_mut()
                .and_then(|slot| slot.initialized_cb.take());
            if let Some(mut callback) = taken {
                callback(self, status == InitStatus::Initialized);
                let mut device = self.dev.borrow_mut();
                if let Some(slot) = device.clients[self.client].as_mut() {
                    if slot.initialized_cb.is_none() {
                        slot.initialized_cb = Some(callback);
                    }
                }
            }
        }
    }

    // -- controller and baseband --

    pub fn nop(&self, callback: impl FnOnce(&HciSession, &Reply) + 'static) -> Result<(), Error> {
        self.submit(HciCommand::Nop, CMD_HDR_LEN, completion(parse_status, callback), |_| {})
    }

    pub fn reset(&self, callback: impl FnOnce(&HciSession, &Reply) + 'static) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::Reset),
            CMD_HDR_LEN,
            completion(parse_status, callback),
            |_| {},
        )
    }

    pub fn set_event_mask(
        &self,
        mask: u64,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::SetEventMask),
            CMD_HDR_LEN + 8,
            completion(parse_status, callback),
            |params| write_le64(mask, params),
        )
    }

    pub fn set_event_filter(
        &self,
        filter_type: u8,
        condition_type: u8,
        condition: &[u8],
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        let condition = condition.to_vec();
        let tail = if filter_type == event_filter::CLEAR {
            0
        } else {
            1 + condition.len() as u16
        };
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::SetEventFilter),
            CMD_HDR_LEN + 1 + tail,
            completion(parse_status, callback),
            move |params| {
                params[0] = filter_type;
                if tail > 0 {
                    params[1] = condition_type;
                    params[2..2 + condition.len()].copy_from_slice(&condition);
                }
            },
        )
    }

    pub fn write_local_name(
        &self,
        name: &str,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        let bytes = name.as_bytes().to_vec();
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteLocalName),
            CMD_HDR_LEN + 248,
            completion(parse_status, callback),
            move |params| {
                let len = bytes.len().min(247);
                params[..len].copy_from_slice(&bytes[..len]);
            },
        )
    }

    pub fn read_local_name(
        &self,
        callback: impl FnOnce(&HciSession, &ReadLocalNameReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadLocalNameReply {
            ReadLocalNameReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                name: c_string(reply_data(packet)),
            }
        }
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadLocalName),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn write_class_of_device(
        &self,
        class_of_device: ClassOfDevice,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteClassOfDevice),
            CMD_HDR_LEN + 3,
            completion(parse_status, callback),
            move |params| params[..3].copy_from_slice(&class_of_device.0),
        )
    }

    pub fn read_class_of_device(
        &self,
        callback: impl FnOnce(&HciSession, &ReadClassOfDeviceReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadClassOfDeviceReply {
            let data = reply_data(packet);
            let mut bytes = [0u8; 3];
            if data.len() >= 3 {
                bytes.copy_from_slice(&data[..3]);
            }
            ReadClassOfDeviceReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                class_of_device: ClassOfDevice(bytes),
            }
        }
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadClassOfDevice),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn write_page_timeout(
        &self,
        page_timeout: u16,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WritePageTimeout),
            CMD_HDR_LEN + 2,
            completion(parse_status, callback),
            move |params| write_le16(page_timeout, params),
        )
    }

    pub fn read_page_timeout(
        &self,
        callback: impl FnOnce(&HciSession, &ReadPageTimeoutReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadPageTimeoutReply {
            ReadPageTimeoutReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                page_timeout: read_le16(packet, REPLY_POS_DATA),
            }
        }
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadPageTimeout),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn write_scan_enable(
        &self,
        scan_enable: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteScanEnable),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = scan_enable,
        )
    }

    pub fn read_scan_enable(
        &self,
        callback: impl FnOnce(&HciSession, &ReadValueReply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadScanEnable),
            CMD_HDR_LEN,
            completion(parse_read_value, callback),
            |_| {},
        )
    }

    pub fn write_auth_enable(
        &self,
        auth_enable: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteAuthenticationEnable),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = auth_enable,
        )
    }

    pub fn read_auth_enable(
        &self,
        callback: impl FnOnce(&HciSession, &ReadValueReply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadAuthenticationEnable),
            CMD_HDR_LEN,
            completion(parse_read_value, callback),
            |_| {},
        )
    }

    pub fn write_pin_type(
        &self,
        pin_type: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WritePinType),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = pin_type,
        )
    }

    pub fn read_pin_type(
        &self,
        callback: impl FnOnce(&HciSession, &ReadValueReply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadPinType),
            CMD_HDR_LEN,
            completion(parse_read_value, callback),
            |_| {},
        )
    }

    pub fn write_auto_flush_timeout(
        &self,
        conn_handle: ConnectionHandle,
        timeout: u16,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteAutomaticFlushTimeout),
            CMD_HDR_LEN + 4,
            completion(parse_status, callback),
            move |params| {
                write_le16(conn_handle.raw(), params);
                write_le16(timeout, &mut params[2..]);
            },
        )
    }

    pub fn read_auto_flush_timeout(
        &self,
        conn_handle: ConnectionHandle,
        callback: impl FnOnce(&HciSession, &ReadConnTimeoutReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadConnTimeoutReply {
            let data = reply_data(packet);
            ReadConnTimeoutReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                conn_handle: ConnectionHandle::from_wire(read_le16(data, 0)),
                timeout: read_le16(data, 2),
            }
        }
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadAutomaticFlushTimeout),
            CMD_HDR_LEN + 2,
            completion(parse, callback),
            move |params| write_le16(conn_handle.raw(), params),
        )
    }

    pub fn set_controller_to_host_flow_control(
        &self,
        enable: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::SetControllerToHostFlowControl),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = enable,
        )
    }

    pub fn host_buffer_size(
        &self,
        acl_packet_len: u16,
        sco_packet_len: u8,
        acl_packets: u16,
        sco_packets: u16,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::HostBufferSize),
            CMD_HDR_LEN + 7,
            completion(parse_status, callback),
            move |params| {
                write_le16(acl_packet_len, params);
                params[2] = sco_packet_len;
                write_le16(acl_packets, &mut params[3..]);
                write_le16(sco_packets, &mut params[5..]);
            },
        )
    }

    /// Host-side credit return; fire-and-forget, the controller never
    /// replies to this one.
    pub fn host_number_of_completed_packets(
        &self,
        conn_handle: ConnectionHandle,
        num_packets: u16,
    ) -> Result<(), Error> {
        let mut device = self.dev.borrow_mut();
        let mut buffer = device.add_command_no_reply(
            HciCommand::ControllerAndBaseband(Cb::HostNumberOfCompletedPackets),
            CMD_HDR_LEN + 5,
        );
        if let Some(data) = buffer.contiguous_data_mut(CMD_HDR_LEN + 5) {
            let params = &mut data[CMD_HDR_LEN as usize..];
            params[0] = 1;
            write_le16(conn_handle.raw(), &mut params[1..]);
            write_le16(num_packets, &mut params[3..]);
        }
        device.send_command(buffer)
    }

    pub fn write_link_supervision_timeout(
        &self,
        conn_handle: ConnectionHandle,
        timeout: u16,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteLinkSupervisionTimeout),
            CMD_HDR_LEN + 4,
            completion(parse_status, callback),
            move |params| {
                write_le16(conn_handle.raw(), params);
                write_le16(timeout, &mut params[2..]);
            },
        )
    }

    pub fn read_link_supervision_timeout(
        &self,
        conn_handle: ConnectionHandle,
        callback: impl FnOnce(&HciSession, &ReadConnTimeoutReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadConnTimeoutReply {
            let data = reply_data(packet);
            ReadConnTimeoutReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                conn_handle: ConnectionHandle::from_wire(read_le16(data, 0)),
                timeout: read_le16(data, 2),
            }
        }
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadLinkSupervisionTimeout),
            CMD_HDR_LEN + 2,
            completion(parse, callback),
            move |params| write_le16(conn_handle.raw(), params),
        )
    }

    pub fn read_current_iac_lap(
        &self,
        callback: impl FnOnce(&HciSession, &ReadCurrentIacLapReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadCurrentIacLapReply {
            let data = reply_data(packet);
            let num_laps = read_u8(data, 0) as usize;
            let mut laps = Vec::with_capacity(num_laps);
            for i in 0..num_laps {
                let base = 1 + 3 * i;
                let lap = read_u8(data, base) as u32
                    | (read_u8(data, base + 1) as u32) << 8
                    | (read_u8(data, base + 2) as u32) << 16;
                laps.push(lap);
            }
            ReadCurrentIacLapReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                laps,
            }
        }
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadCurrentIacLap),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn write_current_iac_lap(
        &self,
        laps: &[u32],
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        let laps = laps.to_vec();
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteCurrentIacLap),
            CMD_HDR_LEN + 1 + 3 * laps.len() as u16,
            completion(parse_status, callback),
            move |params| {
                params[0] = laps.len() as u8;
                for (i, lap) in laps.iter().enumerate() {
                    params[1 + 3 * i] = (lap & 0xFF) as u8;
                    params[2 + 3 * i] = ((lap >> 8) & 0xFF) as u8;
                    params[3 + 3 * i] = ((lap >> 16) & 0xFF) as u8;
                }
            },
        )
    }

    pub fn write_inquiry_scan_type(
        &self,
        scan_type: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteInquiryScanType),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = scan_type,
        )
    }

    pub fn read_inquiry_scan_type(
        &self,
        callback: impl FnOnce(&HciSession, &ReadValueReply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadInquiryScanType),
            CMD_HDR_LEN,
            completion(parse_read_value, callback),
            |_| {},
        )
    }

    pub fn write_inquiry_mode(
        &self,
        inquiry_mode: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteInquiryMode),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = inquiry_mode,
        )
    }

    pub fn read_inquiry_mode(
        &self,
        callback: impl FnOnce(&HciSession, &ReadValueReply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadInquiryMode),
            CMD_HDR_LEN,
            completion(parse_read_value, callback),
            |_| {},
        )
    }

    pub fn write_page_scan_type(
        &self,
        scan_type: u8,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WritePageScanType),
            CMD_HDR_LEN + 1,
            completion(parse_status, callback),
            move |params| params[0] = scan_type,
        )
    }

    pub fn read_page_scan_type(
        &self,
        callback: impl FnOnce(&HciSession, &ReadValueReply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadPageScanType),
            CMD_HDR_LEN,
            completion(parse_read_value, callback),
            |_| {},
        )
    }

    // -- stored link keys --

    pub fn read_stored_link_key(
        &self,
        address: Option<&BluetoothDeviceAddress>,
        callback: impl FnOnce(&HciSession, &ReadStoredLinkKeyReply) + 'static,
    ) -> Result<(), Error> {
        {
            let mut device = self.dev.borrow_mut();
            device.stored_keys.clear();
            device.install_event_handler(
                code::RETURN_LINK_KEYS,
                Some(EventHandler {
                    func: return_link_keys_event,
                    client: Some(self.client),
                }),
            );
        }
        let address = address.copied();
        let result = self.submit(
            HciCommand::ControllerAndBaseband(Cb::ReadStoredLinkKey),
            CMD_HDR_LEN + 7,
            PendingAction::Complete(Box::new(move |session, packet| {
                let keys = {
                    let mut device = session.dev.borrow_mut();
                    device.install_event_handler(code::RETURN_LINK_KEYS, None);
                    std::mem::replace(&mut device.stored_keys, Vec::new())
                };
                // The reply carries a key count too, but the number of
                // records actually received is the trustworthy one.
                let reply = ReadStoredLinkKeyReply {
                    status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                    max_keys: read_le16(packet, REPLY_POS_DATA),
                    keys,
                };
                callback(session, &reply);
            })),
            move |params| {
                if let Some(address) = address {
                    params[..6].copy_from_slice(&address.0);
                }
                params[6] = if address.is_some() { 0 } else { 1 };
            },
        );
        if result.is_err() {
            let mut device = self.dev.borrow_mut();
            device.install_event_handler(code::RETURN_LINK_KEYS, None);
        }
        result
    }

    pub fn write_stored_link_key(
        &self,
        keys: &[StoredLinkKey],
        callback: impl FnOnce(&HciSession, &WriteStoredLinkKeyReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> WriteStoredLinkKeyReply {
            WriteStoredLinkKeyReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                num_keys: read_u8(packet, REPLY_POS_DATA),
            }
        }
        let keys = keys.to_vec();
        let count = keys.len() as u16;
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::WriteStoredLinkKey),
            CMD_HDR_LEN + 1 + 22 * count,
            completion(parse, callback),
            move |params| {
                params[0] = keys.len() as u8;
                let keys_base = 1 + 6 * keys.len();
                for (i, entry) in keys.iter().enumerate() {
                    params[1 + 6 * i..1 + 6 * (i + 1)].copy_from_slice(&entry.address.0);
                    params[keys_base + 16 * i..keys_base + 16 * (i + 1)]
                        .copy_from_slice(&entry.key.0);
                }
            },
        )
    }

    pub fn delete_stored_link_key(
        &self,
        address: Option<&BluetoothDeviceAddress>,
        callback: impl FnOnce(&HciSession, &DeleteStoredLinkKeyReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> DeleteStoredLinkKeyReply {
            DeleteStoredLinkKeyReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                num_keys: read_le16(packet, REPLY_POS_DATA),
            }
        }
        let address = address.copied();
        self.submit(
            HciCommand::ControllerAndBaseband(Cb::DeleteStoredLinkKey),
            CMD_HDR_LEN + 7,
            completion(parse, callback),
            move |params| {
                if let Some(address) = address {
                    params[..6].copy_from_slice(&address.0);
                }
                params[6] = if address.is_some() { 0 } else { 1 };
            },
        )
    }

    // -- inquiry --

    pub fn inquiry(
        &self,
        lap: u32,
        length: u8,
        max_responses: u8,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnMut(&HciSession, &InquiryReply) + 'static,
    ) -> Result<(), Error> {
        {
            let mut device = self.dev.borrow_mut();
            device.inquiry_responses.clear();
            if let Some(slot) = device.clients[self.client].as_mut() {
                slot.inquiry_cb = Some(Box::new(callback));
            }
        }
        let result = self.submit_async(
            HciCommand::LinkControl(Lc::Inquiry),
            CMD_HDR_LEN + 5,
            Box::new(move |session, status| {
                {
                    let mut device = session.dev.borrow_mut();
                    if status == 0 {
                        device.install_event_handler(
                            code::INQUIRY_RESULT,
                            Some(EventHandler {
                                func: inquiry_result_event,
                                client: Some(session.client),
                            }),
                        );
                        device.install_event_handler(
                            code::INQUIRY_COMPLETE,
                            Some(EventHandler {
                                func: inquiry_complete_event,
                                client: Some(session.client),
                            }),
                        );
                    } else if let Some(slot) = device.clients[session.client].as_mut() {
                        slot.inquiry_cb = None;
                    }
                }
                status_cb(session, &status_reply(status));
            }),
            move |params| {
                params[0] = (lap & 0xFF) as u8;
                params[1] = ((lap >> 8) & 0xFF) as u8;
                params[2] = ((lap >> 16) & 0xFF) as u8;
                params[3] = length;
                params[4] = max_responses;
            },
        );
        if result.is_err() {
            if let Some(slot) = self.dev.borrow_mut().clients[self.client].as_mut() {
                slot.inquiry_cb = None;
            }
        }
        result
    }

    pub fn inquiry_cancel(
        &self,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        let client = self.client;
        self.submit(
            HciCommand::LinkControl(Lc::InquiryCancel),
            CMD_HDR_LEN,
            PendingAction::Complete(Box::new(move |session, packet| {
                inquiry_teardown(&session.dev, client);
                callback(session, &parse_status(packet));
            })),
            |_| {},
        )
    }

    /// Periodic inquiry answers with a Command Complete (not a Command
    /// Status), so it rides the synchronous path; the result handlers stay
    /// installed until `exit_periodic_inquiry`.
    pub fn periodic_inquiry(
        &self,
        min_period: u16,
        max_period: u16,
        lap: u32,
        length: u8,
        max_responses: u8,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnMut(&HciSession, &InquiryReply) + 'static,
    ) -> Result<(), Error> {
        {
            let mut device = self.dev.borrow_mut();
            device.inquiry_responses.clear();
            if let Some(slot) = device.clients[self.client].as_mut() {
                slot.inquiry_cb = Some(Box::new(callback));
            }
        }
        let result = self.submit(
            HciCommand::LinkControl(Lc::PeriodicInquiryMode),
            CMD_HDR_LEN + 9,
            PendingAction::Complete(Box::new(move |session, packet| {
                let status = read_u8(packet, REPLY_POS_STATUS);
                {
                    let mut device = session.dev.borrow_mut();
                    if status == 0 {
                        device.install_event_handler(
                            code::INQUIRY_RESULT,
                            Some(EventHandler {
                                func: inquiry_result_event,
                                client: Some(session.client),
                            }),
                        );
                        device.install_event_handler(
                            code::INQUIRY_COMPLETE,
                            Some(EventHandler {
                                func: periodic_inquiry_complete_event,
                                client: Some(session.client),
                            }),
                        );
                    } else if let Some(slot) = device.clients[session.client].as_mut() {
                        slot.inquiry_cb = None;
                    }
                }
                status_cb(session, &status_reply(status));
            })),
            move |params| {
                write_le16(max_period, params);
                write_le16(min_period, &mut params[2..]);
                params[4] = (lap & 0xFF) as u8;
                params[5] = ((lap >> 8) & 0xFF) as u8;
                params[6] = ((lap >> 16) & 0xFF) as u8;
                params[7] = length;
                params[8] = max_responses;
            },
        );
        if result.is_err() {
            if let Some(slot) = self.dev.borrow_mut().clients[self.client].as_mut() {
                slot.inquiry_cb = None;
            }
        }
        result
    }

    pub fn exit_periodic_inquiry(
        &self,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        let client = self.client;
        self.submit(
            HciCommand::LinkControl(Lc::ExitPeriodicInquiryMode),
            CMD_HDR_LEN,
            PendingAction::Complete(Box::new(move |session, packet| {
                inquiry_teardown(&session.dev, client);
                callback(session, &parse_status(packet));
            })),
            |_| {},
        )
    }

    // -- connections --

    pub fn create_connection(
        &self,
        address: &BluetoothDeviceAddress,
        params: &ConnectParams,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &CreateConnectionReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        let params = *params;
        self.submit_async(
            HciCommand::LinkControl(Lc::CreateConnection),
            CMD_HDR_LEN + 13,
            Box::new(move |session, status| {
                if status == 0 {
                    Self::install_connection_complete_waiter(session, address, callback);
                }
                status_cb(session, &status_reply(status));
            }),
            move |out| {
                out[..6].copy_from_slice(&address.0);
                write_le16(params.packet_type, &mut out[6..]);
                out[8] = params.page_scan_repetition_mode;
                out[9] = 0; // reserved
                write_clock_offset(params.clock_offset, &mut out[10..]);
                out[12] = params.allow_role_switch as u8;
            },
        )
    }

    pub fn create_connection_cancel(
        &self,
        address: &BluetoothDeviceAddress,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        self.submit(
            HciCommand::LinkControl(Lc::CreateConnectionCancel),
            CMD_HDR_LEN + 6,
            completion(parse_status, callback),
            move |params| params[..6].copy_from_slice(&address.0),
        )
    }

    pub fn accept_connection(
        &self,
        address: &BluetoothDeviceAddress,
        role: u8,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &CreateConnectionReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        self.submit_async(
            HciCommand::LinkControl(Lc::AcceptConnectionRequest),
            CMD_HDR_LEN + 7,
            Box::new(move |session, status| {
                if status == 0 {
                    Self::install_connection_complete_waiter(session, address, callback);
                }
                status_cb(session, &status_reply(status));
            }),
            move |params| {
                params[..6].copy_from_slice(&address.0);
                params[6] = role;
            },
        )
    }

    pub fn reject_connection(
        &self,
        address: &BluetoothDeviceAddress,
        reason: u8,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &CreateConnectionReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        self.submit_async(
            HciCommand::LinkControl(Lc::RejectConnectionRequest),
            CMD_HDR_LEN + 7,
            Box::new(move |session, status| {
                if status == 0 {
                    Self::install_connection_complete_waiter(session, address, callback);
                }
                status_cb(session, &status_reply(status));
            }),
            move |params| {
                params[..6].copy_from_slice(&address.0);
                params[6] = reason;
            },
        )
    }

    /// Ask the controller to drop the baseband link; the link layer learns
    /// the outcome from the Disconnection Complete event.
    pub fn disconnect(
        &self,
        conn_handle: ConnectionHandle,
        reason: u8,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit_async(
            HciCommand::LinkControl(Lc::Disconnect),
            CMD_HDR_LEN + 3,
            Box::new(move |session, status| status_cb(session, &status_reply(status))),
            move |params| {
                write_le16(conn_handle.raw(), params);
                params[2] = reason;
            },
        )
    }

    pub fn auth_requested(
        &self,
        conn_handle: ConnectionHandle,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &AuthRequestedReply) + 'static,
    ) -> Result<(), Error> {
        self.connection_command(
            HciCommand::LinkControl(Lc::AuthenticationRequested),
            conn_handle,
            code::AUTH_COMPLETE,
            parse_auth_complete,
            status_cb,
            callback,
        )
    }

    pub fn read_remote_features(
        &self,
        conn_handle: ConnectionHandle,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &ReadRemoteFeaturesReply) + 'static,
    ) -> Result<(), Error> {
        self.connection_command(
            HciCommand::LinkControl(Lc::ReadRemoteSupportedFeatures),
            conn_handle,
            code::READ_REMOTE_FEATURES_COMPLETE,
            parse_remote_features_complete,
            status_cb,
            callback,
        )
    }

    pub fn read_remote_version(
        &self,
        conn_handle: ConnectionHandle,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &ReadRemoteVersionReply) + 'static,
    ) -> Result<(), Error> {
        self.connection_command(
            HciCommand::LinkControl(Lc::ReadRemoteVersionInformation),
            conn_handle,
            code::READ_REMOTE_VERSION_COMPLETE,
            parse_remote_version_complete,
            status_cb,
            callback,
        )
    }

    pub fn read_clock_offset(
        &self,
        conn_handle: ConnectionHandle,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &ReadClockOffsetReply) + 'static,
    ) -> Result<(), Error> {
        self.connection_command(
            HciCommand::LinkControl(Lc::ReadClockOffset),
            conn_handle,
            code::READ_CLOCK_OFFSET_COMPLETE,
            parse_clock_offset_complete,
            status_cb,
            callback,
        )
    }

    pub fn remote_name_request(
        &self,
        address: &BluetoothDeviceAddress,
        page_scan_repetition_mode: u8,
        clock_offset: Option<u16>,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
        callback: impl FnOnce(&HciSession, &ReadRemoteNameReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        self.submit_async(
            HciCommand::LinkControl(Lc::RemoteNameRequest),
            CMD_HDR_LEN + 10,
            Box::new(move |session, status| {
                if status == 0 {
                    let mut matcher = DataMatcher::new();
                    matcher.add_rule(&[code::REMOTE_NAME_REQ_COMPLETE], 0);
                    // one byte for the status field
                    matcher.add_rule(&address.0, (EVENT_POS_PAYLOAD + 1) as u8);
                    let registered = session.dev.borrow_mut().add_event_waiter(
                        session.client,
                        matcher,
                        completion(parse_remote_name_complete, callback),
                    );
                    if let Err(err) = registered {
                        log::warn!("no waiter slot for remote name: {}", err);
                    }
                }
                status_cb(session, &status_reply(status));
            }),
            move |params| {
                params[..6].copy_from_slice(&address.0);
                params[6] = page_scan_repetition_mode;
                params[7] = 0; // reserved
                write_clock_offset(clock_offset, &mut params[8..]);
            },
        )
    }

    // -- link keys and pin codes --

    pub fn link_key_req_reply(
        &self,
        address: &BluetoothDeviceAddress,
        key: &LinkKey,
        callback: impl FnOnce(&HciSession, &LinkKeyReqReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        let key = *key;
        self.submit(
            HciCommand::LinkControl(Lc::LinkKeyRequestReply),
            CMD_HDR_LEN + 22,
            completion(parse_link_key_reply, callback),
            move |params| {
                params[..6].copy_from_slice(&address.0);
                params[6..22].copy_from_slice(&key.0);
            },
        )
    }

    pub fn link_key_req_neg_reply(
        &self,
        address: &BluetoothDeviceAddress,
        callback: impl FnOnce(&HciSession, &LinkKeyReqReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        self.submit(
            HciCommand::LinkControl(Lc::LinkKeyRequestNegativeReply),
            CMD_HDR_LEN + 6,
            completion(parse_link_key_reply, callback),
            move |params| params[..6].copy_from_slice(&address.0),
        )
    }

    pub fn pin_code_req_reply(
        &self,
        address: &BluetoothDeviceAddress,
        pin: &[u8],
        callback: impl FnOnce(&HciSession, &LinkKeyReqReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        let pin = pin.to_vec();
        self.submit(
            HciCommand::LinkControl(Lc::PinCodeRequestReply),
            CMD_HDR_LEN + 23,
            completion(parse_link_key_reply, callback),
            move |params| {
                let len = pin.len().min(16);
                params[..6].copy_from_slice(&address.0);
                params[6] = len as u8;
                params[7..7 + len].copy_from_slice(&pin[..len]);
            },
        )
    }

    pub fn pin_code_req_neg_reply(
        &self,
        address: &BluetoothDeviceAddress,
        callback: impl FnOnce(&HciSession, &LinkKeyReqReply) + 'static,
    ) -> Result<(), Error> {
        let address = *address;
        self.submit(
            HciCommand::LinkControl(Lc::PinCodeRequestNegativeReply),
            CMD_HDR_LEN + 6,
            completion(parse_link_key_reply, callback),
            move |params| params[..6].copy_from_slice(&address.0),
        )
    }

    // -- link policy --

    pub fn sniff_mode(
        &self,
        conn_handle: ConnectionHandle,
        min_interval: u16,
        max_interval: u16,
        attempt_slots: u16,
        timeout: u16,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit_async(
            HciCommand::LinkPolicy(Lp::SniffMode),
            CMD_HDR_LEN + 10,
            Box::new(move |session, status| status_cb(session, &status_reply(status))),
            move |params| {
                write_le16(conn_handle.raw(), params);
                write_le16(max_interval, &mut params[2..]);
                write_le16(min_interval, &mut params[4..]);
                write_le16(attempt_slots, &mut params[6..]);
                write_le16(timeout, &mut params[8..]);
            },
        )
    }

    pub fn exit_sniff_mode(
        &self,
        conn_handle: ConnectionHandle,
        status_cb: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit_async(
            HciCommand::LinkPolicy(Lp::ExitSniffMode),
            CMD_HDR_LEN + 2,
            Box::new(move |session, status| status_cb(session, &status_reply(status))),
            move |params| write_le16(conn_handle.raw(), params),
        )
    }

    /// Watch for Mode Change events on one connection. The callback stays
    /// registered until it returns [`Propagation::Consumed`] or
    /// [`cancel_mode_change`](HciSession::cancel_mode_change) is called.
    pub fn on_mode_change(
        &self,
        conn_handle: ConnectionHandle,
        mut callback: impl FnMut(&HciSession, &ModeChangeReply) -> Propagation + 'static,
    ) -> Result<(), Error> {
        let matcher = mode_change_matcher(conn_handle);
        self.dev.borrow_mut().add_event_waiter(
            self.client,
            matcher,
            PendingAction::Watch(Box::new(move |session, packet| {
                let reply = parse_mode_change(packet);
                callback(session, &reply)
            })),
        )
    }

    pub fn cancel_mode_change(&self, conn_handle: ConnectionHandle) {
        let matcher = mode_change_matcher(conn_handle);
        self.dev.borrow_mut().remove_event_waiter(&matcher, self.client);
    }

    pub fn read_link_policy(
        &self,
        conn_handle: ConnectionHandle,
        callback: impl FnOnce(&HciSession, &ReadLinkPolicyReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadLinkPolicyReply {
            let data = reply_data(packet);
            ReadLinkPolicyReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                conn_handle: ConnectionHandle::from_wire(read_le16(data, 0)),
                settings: read_le16(data, 2),
            }
        }
        self.submit(
            HciCommand::LinkPolicy(Lp::ReadLinkPolicySettings),
            CMD_HDR_LEN + 2,
            completion(parse, callback),
            move |params| write_le16(conn_handle.raw(), params),
        )
    }

    pub fn write_link_policy(
        &self,
        conn_handle: ConnectionHandle,
        settings: u16,
        callback: impl FnOnce(&HciSession, &Reply) + 'static,
    ) -> Result<(), Error> {
        self.submit(
            HciCommand::LinkPolicy(Lp::WriteLinkPolicySettings),
            CMD_HDR_LEN + 4,
            completion(parse_status, callback),
            move |params| {
                write_le16(conn_handle.raw(), params);
                write_le16(settings, &mut params[2..]);
            },
        )
    }

    // -- informational --

    pub fn read_local_version(
        &self,
        callback: impl FnOnce(&HciSession, &ReadLocalVersionReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadLocalVersionReply {
            let data = reply_data(packet);
            ReadLocalVersionReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                hci_version: read_u8(data, 0),
                hci_revision: read_le16(data, 1),
                lmp_version: read_u8(data, 3),
                manufacturer: read_le16(data, 4),
                lmp_subversion: read_le16(data, 6),
            }
        }
        self.submit(
            HciCommand::InformationParameters(Ip::ReadLocalVersionInformation),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn read_local_features(
        &self,
        callback: impl FnOnce(&HciSession, &ReadLocalFeaturesReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadLocalFeaturesReply {
            ReadLocalFeaturesReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                features: read_le64(reply_data(packet), 0),
            }
        }
        self.submit(
            HciCommand::InformationParameters(Ip::ReadLocalSupportedFeatures),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn read_buffer_size(
        &self,
        callback: impl FnOnce(&HciSession, &ReadBufferSizeReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadBufferSizeReply {
            let data = reply_data(packet);
            ReadBufferSizeReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                acl_mtu: read_le16(data, 0),
                sco_mtu: read_u8(data, 2),
                acl_max_packets: read_le16(data, 3),
                sco_max_packets: read_le16(data, 5),
            }
        }
        self.submit(
            HciCommand::InformationParameters(Ip::ReadBufferSize),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    pub fn read_bd_addr(
        &self,
        callback: impl FnOnce(&HciSession, &ReadBdAddrReply) + 'static,
    ) -> Result<(), Error> {
        fn parse(packet: &[u8]) -> ReadBdAddrReply {
            ReadBdAddrReply {
                status: Status::from(read_u8(packet, REPLY_POS_STATUS)),
                address: parse_address(reply_data(packet), 0),
            }
        }
        self.submit(
            HciCommand::InformationParameters(Ip::ReadBdAddr),
            CMD_HDR_LEN,
            completion(parse, callback),
            |_| {},
        )
    }

    // -- vendor commands and broadcast subscriptions --

    /// Send a vendor-specific command; the callback receives the raw
    /// Command Complete packet.
    pub fn vendor_command(
        &self,
        ocf: u16,
        data: &[u8],
        callback: impl FnOnce(&HciSession, &[u8]) + 'static,
    ) -> Result<(), Error> {
        let data = data.to_vec();
        let len = CMD_HDR_LEN + data.len() as u16;
        self.submit(
            HciCommand::Vendor(ocf),
            len,
            PendingAction::Complete(Box::new(move |session, packet| callback(session, packet))),
            move |params| params[..data.len()].copy_from_slice(&data),
        )
    }

    /// Subscribe to vendor-specific events. The raw event packet is fanned
    /// out to clients in registration order until one consumes it.
    pub fn on_vendor_event(
        &self,
        callback: impl FnMut(&HciSession, &[u8]) -> Propagation + 'static,
    ) {
        let mut device = self.dev.borrow_mut();
        if let Some(slot) = device.clients[self.client].as_mut() {
            slot.vendor_event_cb = Some(Box::new(callback));
        }
        device.install_event_handler(
            code::VENDOR_SPECIFIC,
            Some(EventHandler {
                func: vendor_event,
                client: None,
            }),
        );
    }

    pub fn on_connection_request(
        &self,
        callback: impl FnMut(&HciSession, &ConnectionRequestData) -> Propagation + 'static,
    ) {
        let mut device = self.dev.borrow_mut();
        if let Some(slot) = device.clients[self.client].as_mut() {
            slot.connection_request_cb = Some(Box::new(callback));
        }
        device.install_event_handler(
            code::CONNECTION_REQUEST,
            Some(EventHandler {
                func: connection_request_event,
                client: None,
            }),
        );
    }

    pub fn on_link_key_request(
        &self,
        callback: impl FnMut(&HciSession, &BluetoothDeviceAddress) -> Propagation + 'static,
    ) {
        let mut device = self.dev.borrow_mut();
        if let Some(slot) = device.clients[self.client].as_mut() {
            slot.link_key_request_cb = Some(Box::new(callback));
        }
        device.install_event_handler(
            code::LINK_KEY_REQUEST,
            Some(EventHandler {
                func: link_key_request_event,
                client: None,
            }),
        );
    }

    pub fn on_pin_code_request(
        &self,
        callback: impl FnMut(&HciSession, &BluetoothDeviceAddress) -> Propagation + 'static,
    ) {
        let mut device = self.dev.borrow_mut();
        if let Some(slot) = device.clients[self.client].as_mut() {
            slot.pin_code_request_cb = Some(Box::new(callback));
        }
        device.install_event_handler(
            code::PIN_CODE_REQUEST,
            Some(EventHandler {
                func: pin_code_request_event,
                client: None,
            }),
        );
    }
}

fn mode_change_matcher(conn_handle: ConnectionHandle) -> DataMatcher {
    let mut matcher = DataMatcher::new();
    matcher.add_rule(&[code::MODE_CHANGE], 0);
    // one byte for the status field
    matcher.add_rule(&conn_handle.to_le_bytes(), (EVENT_POS_PAYLOAD + 1) as u8);
    matcher
}

// ---- installed event handlers ----

fn inquiry_result_event(dev: &DeviceRef, packet: &[u8], _client: Option<usize>) {
    let records = events::parse_inquiry_result(packet);
    let mut device = dev.borrow_mut();
    for record in records {
        // The controller may repeat devices across result events
        if !device.inquiry_responses.contains(&record) {
            device.inquiry_responses.push(record);
        }
    }
}

fn inquiry_teardown(dev: &DeviceRef, client: usize) {
    let mut device = dev.borrow_mut();
    device.install_event_handler(code::INQUIRY_RESULT, None);
    device.install_event_handler(code::INQUIRY_COMPLETE, None);
    device.inquiry_responses.clear();
    if let Some(slot) = device.clients[client].as_mut() {
        slot.inquiry_cb = None;
    }
}

fn inquiry_complete_event(dev: &DeviceRef, packet: &[u8], client: Option<usize>) {
    let client = match client {
        Some(client) => client,
        None => return,
    };
    let status = Status::from(read_u8(packet, EVENT_POS_PAYLOAD));
    let (callback, responses) = {
        let mut device = dev.borrow_mut();
        device.install_event_handler(code::INQUIRY_RESULT, None);
        device.install_event_handler(code::INQUIRY_COMPLETE, None);
        let callback = device.clients[client]
            .as_mut()
            .and_then(|slot| slot.inquiry_cb.take());
        let responses = std::mem::replace(&mut device.inquiry_responses, Vec::new());
        (callback, responses)
    };
    if let Some(mut callback) = callback {
        let session = HciSession::new(dev.clone(), client);
        let reply = InquiryReply { status, responses };
        callback(&session, &reply);
    }
}

fn periodic_inquiry_complete_event(dev: &DeviceRef, packet: &[u8], client: Option<usize>) {
    let client = match client {
        Some(client) => client,
        None => return,
    };
    let status = Status::from(read_u8(packet, EVENT_POS_PAYLOAD));
    let (callback, responses) = {
        let mut device = dev.borrow_mut();
        let callback = device.clients[client]
            .as_mut()
            .and_then(|slot| slot.inquiry_cb.take());
        let responses = std::mem::replace(&mut device.inquiry_responses, Vec::new());
        (callback, responses)
    };
    if let Some(mut callback) = callback {
        let session = HciSession::new(dev.clone(), client);
        let reply = InquiryReply { status, responses };
        callback(&session, &reply);
        // Periodic inquiries report again on the next cycle
        let mut device = dev.borrow_mut();
        if let Some(slot) = device.clients[client].as_mut() {
            if slot.inquiry_cb.is_none() {
                slot.inquiry_cb = Some(callback);
            }
        }
    }
}

fn return_link_keys_event(dev: &DeviceRef, packet: &[u8], _client: Option<usize>) {
    let mut keys = events::parse_return_link_keys(packet);
    dev.borrow_mut().stored_keys.append(&mut keys);
}

fn connection_request_event(dev: &DeviceRef, packet: &[u8], _client: Option<usize>) {
    let data = ConnectionRequestData::from_packet(packet);
    device::fan_out(
        dev,
        |slot| &mut slot.connection_request_cb,
        |callback, session| callback(session, &data),
    );
}

fn link_key_request_event(dev: &DeviceRef, packet: &[u8], _client: Option<usize>) {
    let address = parse_address(event_payload(packet), 0);
    device::fan_out(
        dev,
        |slot| &mut slot.link_key_request_cb,
        |callback, session| callback(session, &address),
    );
}

fn pin_code_request_event(dev: &DeviceRef, packet: &[u8], _client: Option<usize>) {
    let address = parse_address(event_payload(packet), 0);
    device::fan_out(
        dev,
        |slot| &mut slot.pin_code_request_cb,
        |callback, session| callback(session, &address),
    );
}

fn vendor_event(dev: &DeviceRef, packet: &[u8], _client: Option<usize>) {
    device::fan_out(
        dev,
        |slot| &mut slot.vendor_event_cb,
        |callback, session| callback(session, packet),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{command_complete, command_status, Harness};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn reset_round_trip() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let seen = Rc::new(RefCell::new(None));
        let record = seen.clone();
        client
            .hci()
            .reset(move |_, reply| *record.borrow_mut() = Some(reply.status))
            .unwrap();

        assert_eq!(harness.take_commands(), vec![vec![0x03, 0x0C, 0x00]]);

        harness.inject_event(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(*seen.borrow(), Some(Status::Success));
    }

    fn inquiry_result_packet(address: [u8; 6]) -> Vec<u8> {
        let mut packet = vec![code::INQUIRY_RESULT, 0, 1];
        packet.extend_from_slice(&address);
        packet.extend_from_slice(&[0x01, 0x00, 0x00]); // psrm, pspm, reserved
        packet.extend_from_slice(&[0x0C, 0x02, 0x5A]); // class of device
        packet.extend_from_slice(&0x4321u16.to_le_bytes());
        packet[1] = (packet.len() - 2) as u8;
        packet
    }

    #[test]
    fn inquiry_accumulates_in_order_and_dedups() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let statuses = Rc::new(RefCell::new(Vec::new()));
        let record_status = statuses.clone();
        let replies: Rc<RefCell<Vec<InquiryReply>>> = Rc::new(RefCell::new(Vec::new()));
        let record_reply = replies.clone();

        client
            .hci()
            .inquiry(
                0xAABBCC,
                4,
                9,
                move |_, reply| record_status.borrow_mut().push(reply.status),
                move |_, reply| record_reply.borrow_mut().push(reply.clone()),
            )
            .unwrap();

        assert_eq!(
            harness.take_commands(),
            vec![vec![0x01, 0x04, 0x05, 0xCC, 0xBB, 0xAA, 0x04, 0x09]]
        );

        harness.inject_event(&command_status(0, 0x0401));
        assert_eq!(*statuses.borrow(), vec![Status::Success]);

        for i in 0..50u8 {
            harness.inject_event(&inquiry_result_packet([i, 2, 3, 4, 5, 6]));
        }
        // A duplicate record must not inflate the count
        harness.inject_event(&inquiry_result_packet([0, 2, 3, 4, 5, 6]));

        assert!(replies.borrow().is_empty());
        harness.inject_event(&[code::INQUIRY_COMPLETE, 0x01, 0x00]);

        let replies = replies.borrow();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert!(reply.status.is_ok());
        assert_eq!(reply.responses.len(), 50);
        for (i, response) in reply.responses.iter().enumerate() {
            assert_eq!(response.address.0[0], i as u8, "responses out of order");
            assert_eq!(response.clock_offset, 0x4321);
        }
    }

    #[test]
    fn pending_table_fills_and_completes_in_order() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();
        let hci = client.hci();

        let order = Rc::new(RefCell::new(Vec::new()));
        macro_rules! track {
            ($tag:expr) => {{
                let order = order.clone();
                move |_: &HciSession, _: &_| order.borrow_mut().push($tag)
            }};
        }

        hci.reset(track!("reset")).unwrap();
        hci.read_local_name(track!("local_name")).unwrap();
        hci.read_page_timeout(track!("page_timeout")).unwrap();
        hci.read_scan_enable(track!("scan_enable")).unwrap();
        hci.read_auth_enable(track!("auth_enable")).unwrap();
        hci.read_pin_type(track!("pin_type")).unwrap();
        hci.read_inquiry_mode(track!("inquiry_mode")).unwrap();
        hci.read_local_version(track!("local_version")).unwrap();

        // Nine in flight is one too many
        match hci.read_page_scan_type(|_, _| {}) {
            Err(Error::ResourceExhausted) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other.err()),
        }

        let opcodes: [u16; 8] = [
            0x0C03, 0x0C14, 0x0C17, 0x0C19, 0x0C1F, 0x0C09, 0x0C44, 0x1001,
        ];
        for opcode in opcodes.iter() {
            harness.inject_event(&command_complete(*opcode, &[0]));
        }
        assert_eq!(
            *order.borrow(),
            vec![
                "reset",
                "local_name",
                "page_timeout",
                "scan_enable",
                "auth_enable",
                "pin_type",
                "inquiry_mode",
                "local_version",
            ]
        );

        // The table is free again
        assert!(hci.read_page_scan_type(|_, _| {}).is_ok());
    }

    #[test]
    fn identical_opcodes_cannot_coexist() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        client.hci().reset(|_, _| {}).unwrap();
        match client.hci().reset(|_, _| {}) {
            Err(Error::NotAllowed) => {}
            other => panic!("expected NotAllowed, got {:?}", other.err()),
        }

        harness.inject_event(&command_complete(0x0C03, &[0]));
        assert!(client.hci().reset(|_, _| {}).is_ok());
    }

    #[test]
    fn command_status_failure_reaches_status_callback() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let seen = Rc::new(RefCell::new(None));
        let record = seen.clone();
        client
            .hci()
            .inquiry(
                0x9E8B33,
                8,
                0,
                move |_, reply| *record.borrow_mut() = Some(reply.status),
                |_, _| panic!("no results expected after a failed status"),
            )
            .unwrap();
        harness.take_commands();

        harness.inject_event(&command_status(0x0C, 0x0401));
        assert_eq!(*seen.borrow(), Some(Status::CommandDisallowed));

        // The failed inquiry left no handlers behind
        harness.inject_event(&inquiry_result_packet([1, 2, 3, 4, 5, 6]));
        harness.inject_event(&[code::INQUIRY_COMPLETE, 0x01, 0x00]);
    }

    #[test]
    fn connection_handle_waiters_match_on_payload() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        client
            .hci()
            .auth_requested(
                ConnectionHandle::new(0x0042).unwrap(),
                |_, _| {},
                move |_, reply| record.borrow_mut().push(reply.conn_handle.raw()),
            )
            .unwrap();
        assert_eq!(
            harness.take_commands(),
            vec![vec![0x11, 0x04, 0x02, 0x42, 0x00]]
        );

        harness.inject_event(&command_status(0, 0x0411));

        // Same event code, different handle: not ours
        harness.inject_event(&[code::AUTH_COMPLETE, 3, 0x00, 0x43, 0x00]);
        assert!(seen.borrow().is_empty());

        harness.inject_event(&[code::AUTH_COMPLETE, 3, 0x00, 0x42, 0x00]);
        assert_eq!(*seen.borrow(), vec![0x0042]);
    }

    #[test]
    fn stored_link_keys_accumulate_across_events() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let seen: Rc<RefCell<Option<ReadStoredLinkKeyReply>>> = Rc::new(RefCell::new(None));
        let record = seen.clone();
        client
            .hci()
            .read_stored_link_key(None, move |_, reply| {
                *record.borrow_mut() = Some(reply.clone())
            })
            .unwrap();

        let sent = harness.take_commands();
        assert_eq!(sent[0][0..3], [0x0D, 0x0C, 0x07]);
        assert_eq!(sent[0][9], 1); // read-all flag

        let mut return_keys = vec![code::RETURN_LINK_KEYS, 0, 1];
        return_keys.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        return_keys.extend_from_slice(&[0xA0; 16]);
        return_keys[1] = (return_keys.len() - 2) as u8;
        harness.inject_event(&return_keys);

        let mut second = vec![code::RETURN_LINK_KEYS, 0, 1];
        second.extend_from_slice(&[6, 5, 4, 3, 2, 1]);
        second.extend_from_slice(&[0xB0; 16]);
        second[1] = (second.len() - 2) as u8;
        harness.inject_event(&second);

        let mut params = vec![0u8];
        params.extend_from_slice(&16u16.to_le_bytes());
        params.push(2);
        harness.inject_event(&command_complete(0x0C0D, &params));

        let seen = seen.borrow();
        let reply = seen.as_ref().unwrap();
        assert_eq!(reply.max_keys, 16);
        assert_eq!(reply.keys.len(), 2);
        assert_eq!(reply.keys[0].key.0, [0xA0; 16]);
        assert_eq!(reply.keys[1].address.0, [6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn late_initialized_subscription_fires_immediately() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let seen = Rc::new(RefCell::new(None));
        let record = seen.clone();
        client
            .hci()
            .on_initialized(move |_, success| *record.borrow_mut() = Some(success));
        assert_eq!(*seen.borrow(), Some(true));
    }

    #[test]
    fn broadcast_events_stop_at_consuming_client() {
        let harness = Harness::new();
        let first = harness.host.client().unwrap();
        let second = harness.host.client().unwrap();

        let walked = Rc::new(RefCell::new(Vec::new()));

        let record = walked.clone();
        first.hci().on_pin_code_request(move |_, _| {
            record.borrow_mut().push("first");
            Propagation::Consumed
        });
        let record = walked.clone();
        second.hci().on_pin_code_request(move |_, _| {
            record.borrow_mut().push("second");
            Propagation::Propagate
        });

        let mut packet = vec![code::PIN_CODE_REQUEST, 6];
        packet.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        harness.inject_event(&packet);

        assert_eq!(*walked.borrow(), vec!["first"]);
    }

    #[test]
    fn mode_change_watcher_persists_until_consumed() {
        let harness = Harness::new();
        let client = harness.host.client().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        client
            .hci()
            .on_mode_change(ConnectionHandle::new(0x0011).unwrap(), move |_, reply| {
                record.borrow_mut().push(reply.current_mode);
                if reply.current_mode == 0 {
                    Propagation::Consumed
                } else {
                    Propagation::Propagate
                }
            })
            .unwrap();

        let event = |mode: u8| {
            let mut packet = vec![code::MODE_CHANGE, 6, 0x00, 0x11, 0x00, mode];
            packet.extend_from_slice(&0x0800u16.to_le_bytes());
            packet
        };
        harness.inject_event(&event(2)); // sniff: keep watching
        harness.inject_event(&event(2));
        harness.inject_event(&event(0)); // active: done
        harness.inject_event(&event(2)); // no longer watched

        assert_eq!(*seen.borrow(), vec![2, 2, 0]);
    }
}
