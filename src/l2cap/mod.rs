//! L2CAP: channel multiplexing over ACL and the signalling state machine.
//!
//! Channels ride a shared ACL link; the link's data hook lands here, where
//! reassembled frames are demultiplexed by channel id. CID 0x0001 carries
//! the signalling protocol (connection bring-up, configuration negotiation
//! with continuation-flag fragmentation, disconnection); everything from
//! 0x0040 up is application data.

use crate::acl::{self, Acl, BROADCAST_POINT_TO_POINT};
use crate::buffer::{BufferReader, BufferWriter};
use crate::hci::common::{read_le16, read_le32, write_le16, ConnectionHandle};
use crate::hci::device::{DeviceRef, HciDevice};
use crate::hci::error::Error;
use crate::hci::{ConnectParams, HciSession};
use crate::BluetoothDeviceAddress;

pub const CID_SIGNALLING: u16 = 0x0001;
pub const CID_CONNECTIONLESS: u16 = 0x0002;

/// Well-known protocol/service multiplexer values.
pub mod psm {
    pub const SDP: u16 = 0x0001;
    pub const RFCOMM: u16 = 0x0003;
    pub const TEL_CORDLESS: u16 = 0x0005;
    pub const TCS: u16 = 0x0007;
    pub const BNEP: u16 = 0x000F;
    pub const HID_CONTROL: u16 = 0x0011;
    pub const HID_INTERRUPT: u16 = 0x0013;
    pub const UPNP: u16 = 0x0015;
    pub const AVCTP: u16 = 0x0017;
    pub const AVDTP: u16 = 0x0019;
}

pub(crate) const MAX_CHANNELS_PER_LINK: usize = 4;

pub(crate) const L2CAP_HDR_LEN: u16 = 4;
const SIGNAL_HDR_LEN: u16 = 4;
const CONFIG_REQ_HDR_LEN: u16 = 4;
const CONFIG_RSP_HDR_LEN: u16 = 6;

mod signal {
    pub const CMD_REJECT: u8 = 0x01;
    pub const CONN_REQ: u8 = 0x02;
    pub const CONN_RSP: u8 = 0x03;
    pub const CONFIG_REQ: u8 = 0x04;
    pub const CONFIG_RSP: u8 = 0x05;
    pub const DISCONN_REQ: u8 = 0x06;
    pub const DISCONN_RSP: u8 = 0x07;
    pub const ECHO_REQ: u8 = 0x08;
    pub const ECHO_RSP: u8 = 0x09;
}

pub const MTU_MIN: u16 = 48;
pub const MTU_DEFAULT: u16 = 672;

const CONFIG_FLAG_CONTINUATION: u16 = 1 << 0;

/// Configure Response result codes.
pub const CONFIG_RESULT_OK: u16 = 0;
pub const CONFIG_RESULT_UNACCEPTABLE_PARAMS: u16 = 1;
pub const CONFIG_RESULT_REJECTED: u16 = 2;
pub const CONFIG_RESULT_UNKNOWN_OPTIONS: u16 = 3;

/// Connection Response result codes.
pub const CONN_RESULT_OK: u16 = 0;
pub const CONN_RESULT_PENDING: u16 = 1;
pub const CONN_RESULT_PSM_NOT_SUPPORTED: u16 = 2;
pub const CONN_RESULT_SECURITY_BLOCK: u16 = 3;
pub const CONN_RESULT_NO_RESOURCES: u16 = 4;
/// Local marker: the peer answered with a Command Reject.
pub const CONN_RESULT_COMMAND_REJECTED: u16 = 0xFFFF;

pub const CONN_STATUS_NO_INFO: u16 = 0;

/// Command Reject reasons.
const REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
const REJECT_INVALID_CID: u16 = 0x0002;

// Configuration option types and sizes.
const OPT_MTU: u8 = 0x01;
const OPT_FLUSH_TIMEOUT: u8 = 0x02;
const OPT_QOS: u8 = 0x03;
const OPT_RETX_FLOW: u8 = 0x04;
const OPT_FRAME_CHECK_SEQ: u8 = 0x05;
const OPT_EXT_FLOW: u8 = 0x06;
const OPT_MAX_WINDOW_SIZE: u8 = 0x07;
/// Option types with this bit set are advisory; unknown hints are skipped.
const OPT_HINT: u8 = 0x80;

const OPT_MTU_LEN: u8 = 2;
const OPT_FLUSH_TIMEOUT_LEN: u8 = 2;
const OPT_QOS_LEN: u8 = 22;
const OPT_RETX_FLOW_LEN: u8 = 9;
const OPT_FRAME_CHECK_SEQ_LEN: u8 = 1;
const OPT_EXT_FLOW_LEN: u8 = 16;
const OPT_MAX_WINDOW_SIZE_LEN: u8 = 2;

/// Bits of [`ConfigureReply::rejected_mask`] / `unknown_mask`.
pub const CONFIG_MTU: u32 = 1 << 0;
pub const CONFIG_FLUSH_TIMEOUT: u32 = 1 << 1;
pub const CONFIG_QOS: u32 = 1 << 2;
pub const CONFIG_RETX_FLOW: u32 = 1 << 3;
pub const CONFIG_FRAME_CHECK_SEQ: u32 = 1 << 4;
pub const CONFIG_EXT_FLOW: u32 = 1 << 5;
pub const CONFIG_MAX_WINDOW_SIZE: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosFlow {
    pub flags: u8,
    pub service_type: u8,
    pub token_rate: u32,
    pub token_bucket_size: u32,
    pub peak_bandwidth: u32,
    pub access_latency: u32,
    pub delay_variation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetxFlow {
    pub mode: u8,
    pub tx_window_size: u8,
    pub max_transmit: u8,
    pub retx_timeout: u16,
    pub monitor_timeout: u16,
    pub max_pdu_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtFlow {
    pub identifier: u8,
    pub service_type: u8,
    pub max_sdu_size: u16,
    pub sdu_inter_time: u32,
    pub access_latency: u32,
    pub flush_timeout: u32,
}

/// The negotiable channel parameters; absent options are not sent.
#[derive(Debug, Clone, Default)]
pub struct ConfigureParams {
    pub mtu: Option<u16>,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosFlow>,
    pub retx_flow: Option<RetxFlow>,
    pub frame_check_sequence: Option<u8>,
    pub ext_flow: Option<ExtFlow>,
    pub max_window_size: Option<u16>,
}

impl ConfigureParams {
    pub fn field_mask(&self) -> u32 {
        let mut mask = 0;
        if self.mtu.is_some() {
            mask |= CONFIG_MTU;
        }
        if self.flush_timeout.is_some() {
            mask |= CONFIG_FLUSH_TIMEOUT;
        }
        if self.qos.is_some() {
            mask |= CONFIG_QOS;
        }
        if self.retx_flow.is_some() {
            mask |= CONFIG_RETX_FLOW;
        }
        if self.frame_check_sequence.is_some() {
            mask |= CONFIG_FRAME_CHECK_SEQ;
        }
        if self.ext_flow.is_some() {
            mask |= CONFIG_EXT_FLOW;
        }
        if self.max_window_size.is_some() {
            mask |= CONFIG_MAX_WINDOW_SIZE;
        }
        mask
    }

    fn merge(&mut self, other: &ConfigureParams) {
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
        if other.flush_timeout.is_some() {
            self.flush_timeout = other.flush_timeout;
        }
        if other.qos.is_some() {
            self.qos = other.qos;
        }
        if other.retx_flow.is_some() {
            self.retx_flow = other.retx_flow;
        }
        if other.frame_check_sequence.is_some() {
            self.frame_check_sequence = other.frame_check_sequence;
        }
        if other.ext_flow.is_some() {
            self.ext_flow = other.ext_flow;
        }
        if other.max_window_size.is_some() {
            self.max_window_size = other.max_window_size;
        }
    }
}

/// The merged outcome of a configuration exchange.
#[derive(Debug, Clone, Default)]
pub struct ConfigureReply {
    pub rejected_mask: u32,
    pub unknown_mask: u32,
    pub params: ConfigureParams,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionResponse {
    pub remote_cid: u16,
    pub local_cid: u16,
    pub result: u16,
    pub status: u16,
}

type ConnectCb = Box<dyn FnMut(&L2cap, &ConnectionResponse)>;
type ConfigureCb = Box<dyn FnOnce(&L2cap, &ConfigureReply)>;
type OnConfigureCb = Box<dyn FnMut(&L2cap, &ConfigureParams)>;
type DataCb = Box<dyn FnMut(&L2cap, &mut BufferReader)>;
type DisconnectedCb = Box<dyn FnMut(&L2cap)>;
type DisconnectCb = Box<dyn FnOnce(&L2cap)>;

/// A configuration exchange in progress (one direction).
#[derive(Default)]
struct ConfigureData {
    rejected_mask: u32,
    unknown_mask: u32,
    params: ConfigureParams,
    /// Response fragments still owed to the peer; sent as its null-option
    /// requests arrive.
    has_pending_packets: bool,
    start_option: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the baseband link to come up.
    WaitLink,
    WaitConnRsp,
    Open,
    WaitDisconnRsp,
}

pub(crate) struct ChannelState {
    psm: u16,
    local_cid: u16,
    remote_cid: u16,
    mtu: u16,
    remote_mtu: u16,
    phase: Phase,
    expected_response_code: u8,
    expected_response_id: u8,
    expected_response_count: u8,
    configure_req: Option<Box<ConfigureData>>,
    configure_resp: Option<Box<ConfigureData>>,
    in_configure_cb: bool,
    connect_cb: Option<ConnectCb>,
    configure_cb: Option<ConfigureCb>,
    on_configure_cb: Option<OnConfigureCb>,
    on_data_cb: Option<DataCb>,
    on_disconnected_cb: Option<DisconnectedCb>,
    disconnect_cb: Option<DisconnectCb>,
}

impl ChannelState {
    fn new(psm: u16, local_cid: u16, connect_cb: ConnectCb) -> ChannelState {
        ChannelState {
            psm,
            local_cid,
            remote_cid: 0,
            mtu: MTU_DEFAULT,
            remote_mtu: MTU_MIN,
            phase: Phase::WaitLink,
            expected_response_code: 0,
            expected_response_id: 0,
            expected_response_count: 0,
            configure_req: None,
            configure_resp: None,
            in_configure_cb: false,
            connect_cb: Some(connect_cb),
            configure_cb: None,
            on_configure_cb: None,
            on_data_cb: None,
            on_disconnected_cb: None,
            disconnect_cb: None,
        }
    }
}

/// Handle to one L2CAP channel. Cloneable; operations after the channel
/// closed report [`Error::NotAllowed`].
#[derive(Clone)]
pub struct L2cap {
    dev: DeviceRef,
    acl_index: usize,
    local_cid: u16,
}

// ---- channel lookup ----

fn channel_mut<'a>(
    device: &'a mut HciDevice,
    acl_index: usize,
    local_cid: u16,
) -> Option<&'a mut ChannelState> {
    device.acls.get_mut(acl_index)?.as_mut()?.channels.iter_mut().flatten().find(
        |channel| channel.local_cid == local_cid,
    )
}

fn channel_ref<'a>(
    device: &'a HciDevice,
    acl_index: usize,
    local_cid: u16,
) -> Option<&'a ChannelState> {
    device.acls.get(acl_index)?.as_ref()?.channels.iter().flatten().find(
        |channel| channel.local_cid == local_cid,
    )
}

fn remove_channel(device: &mut HciDevice, acl_index: usize, local_cid: u16) -> Option<ChannelState> {
    let acl = device.acls.get_mut(acl_index)?.as_mut()?;
    for slot in acl.channels.iter_mut() {
        if slot.as_ref().map_or(false, |channel| channel.local_cid == local_cid) {
            return slot.take();
        }
    }
    None
}

/// When the last channel leaves a link, the baseband connection goes too.
fn release_link_if_idle(dev: &DeviceRef, acl_index: usize) {
    let idle = {
        let device = dev.borrow();
        device
            .acls
            .get(acl_index)
            .and_then(|slot| slot.as_ref())
            .map_or(false, |link| link.channels.iter().all(Option::is_none))
    };
    if idle {
        acl::disconnect(dev, acl_index);
    }
}

// ---- message builders ----

fn create_message(
    device: &mut HciDevice,
    acl_index: usize,
    size: u16,
    channel_id: u16,
) -> Result<BufferWriter, Error> {
    let mut writer = acl::create_message(
        device,
        acl_index,
        L2CAP_HDR_LEN + size,
        BROADCAST_POINT_TO_POINT,
    )?;
    let mut header = [0u8; L2CAP_HDR_LEN as usize];
    write_le16(size, &mut header);
    write_le16(channel_id, &mut header[2..]);
    match writer.ptr_n(L2CAP_HDR_LEN) {
        Some(out) => out.copy_from_slice(&header),
        None => writer.write(&header)?,
    }
    Ok(writer)
}

fn create_cmd(
    device: &mut HciDevice,
    acl_index: usize,
    code: u8,
    id: u8,
    size: u16,
) -> Result<BufferWriter, Error> {
    let mut writer = create_message(device, acl_index, SIGNAL_HDR_LEN + size, CID_SIGNALLING)?;
    let mut header = [0u8; SIGNAL_HDR_LEN as usize];
    header[0] = code;
    header[1] = id;
    write_le16(size, &mut header[2..]);
    match writer.ptr_n(SIGNAL_HDR_LEN) {
        Some(out) => out.copy_from_slice(&header),
        None => writer.write(&header)?,
    }
    Ok(writer)
}

/// Build and send one signalling command with an explicit id (replies).
fn cmd_reply(
    device: &mut HciDevice,
    acl_index: usize,
    code: u8,
    id: u8,
    data: &[u8],
) -> Result<(), Error> {
    let mut writer = create_cmd(device, acl_index, code, id, data.len() as u16)?;
    writer.write(data)?;
    acl::send_message(device, writer.end())?;
    Ok(())
}

/// Send a fresh signalling command and record the response expectation on
/// the channel.
fn send_signal(
    device: &mut HciDevice,
    acl_index: usize,
    local_cid: u16,
    code: u8,
    payload: &[u8],
) -> Result<(), Error> {
    let id = device.next_signal_id();
    let mut writer = create_cmd(device, acl_index, code, id, payload.len() as u16)?;
    writer.write(payload)?;
    let buffer = writer.end();
    if let Some(channel) = channel_mut(device, acl_index, local_cid) {
        channel.expected_response_code = code + 1;
        channel.expected_response_id = id;
        channel.expected_response_count += 1;
    }
    acl::send_message(device, buffer)?;
    Ok(())
}

fn reject_invalid_cid(
    device: &mut HciDevice,
    acl_index: usize,
    id: u8,
    local_cid: u16,
    remote_cid: u16,
) {
    let mut payload = [0u8; 6];
    write_le16(REJECT_INVALID_CID, &mut payload);
    write_le16(local_cid, &mut payload[2..]);
    write_le16(remote_cid, &mut payload[4..]);
    if let Err(err) = cmd_reply(device, acl_index, signal::CMD_REJECT, id, &payload) {
        log::warn!("could not send command reject: {}", err);
    }
}

/// Policy hook for corrupted signalling traffic. The specification permits
/// anything from ignoring the packet to terminating the link; the current
/// policy is to drop it.
fn handle_protocol_error(_dev: &DeviceRef, _acl_index: usize, local_cid: u16) {
    log::debug!("dropping corrupted signalling packet for cid {:04x}", local_cid);
}

// ---- configuration option serialisation ----

/// Serialise options starting from `start_option`, never exceeding `cap`
/// bytes. Returns the encoded options and the first option that did not
/// fit (0 when everything did). The order is fixed — MTU, FlushTimeout,
/// QoS, RetxFlow, FrameCheckSeq, ExtFlow, MaxWindowSize — because peers
/// rely on it for fragment alignment.
fn serialize_options(params: &ConfigureParams, start_option: u8, cap: u16) -> (Vec<u8>, u8) {
    let mut out = Vec::new();
    let cap = cap as usize;

    macro_rules! emit {
        ($code:expr, $len:expr, $write:expr) => {
            if out.len() + 2 + $len as usize > cap {
                return (out, $code);
            }
            out.push($code);
            out.push($len);
            $write(&mut out);
        };
    }

    if start_option <= OPT_MTU {
        if let Some(mtu) = params.mtu {
            emit!(OPT_MTU, OPT_MTU_LEN, |out: &mut Vec<u8>| {
                out.extend_from_slice(&mtu.to_le_bytes());
            });
        }
    }
    if start_option <= OPT_FLUSH_TIMEOUT {
        if let Some(flush_timeout) = params.flush_timeout {
            emit!(OPT_FLUSH_TIMEOUT, OPT_FLUSH_TIMEOUT_LEN, |out: &mut Vec<u8>| {
                out.extend_from_slice(&flush_timeout.to_le_bytes());
            });
        }
    }
    if start_option <= OPT_QOS {
        if let Some(qos) = params.qos {
            emit!(OPT_QOS, OPT_QOS_LEN, |out: &mut Vec<u8>| {
                out.push(qos.flags);
                out.push(qos.service_type);
                out.extend_from_slice(&qos.token_rate.to_le_bytes());
                out.extend_from_slice(&qos.token_bucket_size.to_le_bytes());
                out.extend_from_slice(&qos.peak_bandwidth.to_le_bytes());
                out.extend_from_slice(&qos.access_latency.to_le_bytes());
                out.extend_from_slice(&qos.delay_variation.to_le_bytes());
            });
        }
    }
    if start_option <= OPT_RETX_FLOW {
        if let Some(retx) = params.retx_flow {
            emit!(OPT_RETX_FLOW, OPT_RETX_FLOW_LEN, |out: &mut Vec<u8>| {
                out.push(retx.mode);
                out.push(retx.tx_window_size);
                out.push(retx.max_transmit);
                out.extend_from_slice(&retx.retx_timeout.to_le_bytes());
                out.extend_from_slice(&retx.monitor_timeout.to_le_bytes());
                out.extend_from_slice(&retx.max_pdu_size.to_le_bytes());
            });
        }
    }
    if start_option <= OPT_FRAME_CHECK_SEQ {
        if let Some(fcs) = params.frame_check_sequence {
            emit!(OPT_FRAME_CHECK_SEQ, OPT_FRAME_CHECK_SEQ_LEN, |out: &mut Vec<u8>| {
                out.push(fcs);
            });
        }
    }
    if start_option <= OPT_EXT_FLOW {
        if let Some(ext) = params.ext_flow {
            emit!(OPT_EXT_FLOW, OPT_EXT_FLOW_LEN, |out: &mut Vec<u8>| {
                out.push(ext.identifier);
                out.push(ext.service_type);
                out.extend_from_slice(&ext.max_sdu_size.to_le_bytes());
                out.extend_from_slice(&ext.sdu_inter_time.to_le_bytes());
                out.extend_from_slice(&ext.access_latency.to_le_bytes());
                out.extend_from_slice(&ext.flush_timeout.to_le_bytes());
            });
        }
    }
    if start_option <= OPT_MAX_WINDOW_SIZE {
        if let Some(max_window) = params.max_window_size {
            emit!(OPT_MAX_WINDOW_SIZE, OPT_MAX_WINDOW_SIZE_LEN, |out: &mut Vec<u8>| {
                out.extend_from_slice(&max_window.to_le_bytes());
            });
        }
    }
    (out, 0)
}

enum ConfigParse {
    Parsed(ConfigureParams),
    UnknownOptions { total_size: u16 },
    Corrupted,
}

fn option_type_is_known(opt_type: u8) -> bool {
    // Hints are never critical
    if opt_type & OPT_HINT != 0 {
        return true;
    }
    matches!(opt_type & 0x7F, 0x01..=0x07)
}

fn config_parse(data: &[u8]) -> ConfigParse {
    let mut params = ConfigureParams::default();
    let mut unknown_size: u16 = 0;
    let mut pos = 0usize;

    while pos < data.len() {
        if pos + 2 > data.len() {
            return ConfigParse::Corrupted;
        }
        let opt_type = data[pos];
        let size = data[pos + 1] as usize;
        pos += 2;
        if pos + size > data.len() {
            return ConfigParse::Corrupted;
        }
        let value = &data[pos..pos + size];

        let expected = match opt_type & 0x7F {
            0x01 => OPT_MTU_LEN,
            0x02 => OPT_FLUSH_TIMEOUT_LEN,
            0x03 => OPT_QOS_LEN,
            0x04 => OPT_RETX_FLOW_LEN,
            0x05 => OPT_FRAME_CHECK_SEQ_LEN,
            0x06 => OPT_EXT_FLOW_LEN,
            0x07 => OPT_MAX_WINDOW_SIZE_LEN,
            _ => {
                log::warn!("unknown config option type {:02x}", opt_type);
                if opt_type & OPT_HINT == 0 {
                    unknown_size += 2 + size as u16;
                }
                pos += size;
                continue;
            }
        };
        if size != expected as usize {
            return ConfigParse::Corrupted;
        }

        match opt_type & 0x7F {
            0x01 => params.mtu = Some(read_le16(value, 0)),
            0x02 => params.flush_timeout = Some(read_le16(value, 0)),
            0x03 => {
                params.qos = Some(QosFlow {
                    flags: value[0],
                    service_type: value[1],
                    token_rate: read_le32(value, 2),
                    token_bucket_size: read_le32(value, 6),
                    peak_bandwidth: read_le32(value, 10),
                    access_latency: read_le32(value, 14),
                    delay_variation: read_le32(value, 18),
                })
            }
            0x04 => {
                params.retx_flow = Some(RetxFlow {
                    mode: value[0],
                    tx_window_size: value[1],
                    max_transmit: value[2],
                    retx_timeout: read_le16(value, 3),
                    monitor_timeout: read_le16(value, 5),
                    max_pdu_size: read_le16(value, 7),
                })
            }
            0x05 => params.frame_check_sequence = Some(value[0]),
            0x06 => {
                params.ext_flow = Some(ExtFlow {
                    identifier: value[0],
                    service_type: value[1],
                    max_sdu_size: read_le16(value, 2),
                    sdu_inter_time: read_le32(value, 4),
                    access_latency: read_le32(value, 8),
                    flush_timeout: read_le32(value, 12),
                })
            }
            _ => {}
        }
        pos += size;
    }

    if unknown_size > 0 {
        ConfigParse::UnknownOptions {
            total_size: unknown_size,
        }
    } else {
        ConfigParse::Parsed(params)
    }
}

// ---- configuration send engine ----

/// Emit one or more Configure Requests (`response_id` = None) or
/// Responses (`response_id` = Some) for `conf`, fragmenting to the
/// remote MTU. A response that still has options to deliver sets the
/// continuation flag on its final packet and parks the remainder in
/// `conf` until the peer's null-option request fetches it.
fn config_send(
    dev: &DeviceRef,
    acl_index: usize,
    local_cid: u16,
    conf: &mut ConfigureData,
    response_id: Option<u8>,
) -> Result<(), Error> {
    let mut device = dev.borrow_mut();

    let (remote_cid, remote_mtu) = match channel_ref(&device, acl_index, local_cid) {
        Some(channel) => (channel.remote_cid, channel.remote_mtu),
        None => return Err(Error::NotAllowed),
    };

    let is_response = response_id.is_some();
    let (code, header_size) = if is_response {
        (signal::CONFIG_RSP, CONFIG_RSP_HDR_LEN)
    } else {
        (signal::CONFIG_REQ, CONFIG_REQ_HDR_LEN)
    };
    let result_code = if conf.rejected_mask != 0 {
        CONFIG_RESULT_UNACCEPTABLE_PARAMS
    } else {
        CONFIG_RESULT_OK
    };
    let mut msg_id = match response_id {
        Some(id) => id,
        None => device.next_signal_id(),
    };
    let mut start_option = 0;
    if is_response && conf.has_pending_packets {
        start_option = conf.start_option;
        conf.has_pending_packets = false;
    }

    loop {
        let (options, next_start) = serialize_options(&conf.params, start_option, remote_mtu);
        let continuation = next_start > 0;
        let flags = if continuation {
            CONFIG_FLAG_CONTINUATION
        } else {
            0
        };

        let mut writer = create_cmd(
            &mut device,
            acl_index,
            code,
            msg_id,
            header_size + options.len() as u16,
        )?;
        let mut header = [0u8; CONFIG_RSP_HDR_LEN as usize];
        write_le16(remote_cid, &mut header);
        write_le16(flags, &mut header[2..]);
        if is_response {
            write_le16(result_code, &mut header[4..]);
        }
        writer.write(&header[..header_size as usize])?;
        writer.write(&options)?;
        acl::send_message(&mut device, writer.end())?;

        if !is_response {
            if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                channel.expected_response_code = signal::CONFIG_RSP;
                if channel.expected_response_count == 0 {
                    channel.expected_response_id = msg_id;
                }
                channel.expected_response_count += 1;
            }
            if continuation {
                msg_id = device.next_signal_id();
            }
        } else if continuation {
            // Hold the rest until the peer sends a null-option request
            conf.has_pending_packets = true;
            conf.start_option = next_start;
            break;
        }

        start_option = next_start;
        if start_option == 0 {
            break;
        }
    }
    Ok(())
}

/// Continue an inbound configuration exchange: emit the next parked
/// response fragment under the id of the null-option request driving it.
fn config_send_resp_packet(dev: &DeviceRef, acl_index: usize, local_cid: u16, id: u8) {
    let conf = {
        let mut device = dev.borrow_mut();
        channel_mut(&mut device, acl_index, local_cid).and_then(|channel| channel.configure_req.take())
    };
    if let Some(mut conf) = conf {
        if let Err(err) = config_send(dev, acl_index, local_cid, &mut conf, Some(id)) {
            log::warn!("configure response failed: {}", err);
        }
        if conf.has_pending_packets {
            let mut device = dev.borrow_mut();
            if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                channel.configure_req = Some(conf);
            }
        }
    }
}

// ---- link hooks (installed in the Acl when the channel layer creates it) ----

fn link_connected(dev: &DeviceRef, acl_index: usize, status: u8) {
    let waiting: Vec<u16> = {
        let device = dev.borrow();
        match device.acls.get(acl_index).and_then(|slot| slot.as_ref()) {
            Some(link) => link
                .channels
                .iter()
                .flatten()
                .filter(|channel| channel.phase == Phase::WaitLink)
                .map(|channel| channel.local_cid)
                .collect(),
            None => return,
        }
    };

    for local_cid in waiting {
        if status == 0 {
            let sent = {
                let mut device = dev.borrow_mut();
                connection_request(&mut device, acl_index, local_cid)
            };
            if sent.is_err() {
                notify_connect_error(dev, acl_index, local_cid, CONN_RESULT_NO_RESOURCES);
            }
        } else {
            notify_connect_error(dev, acl_index, local_cid, CONN_RESULT_NO_RESOURCES);
        }
    }

    if status != 0 {
        // The baseband link never came up; drop it if nothing is left
        let mut device = dev.borrow_mut();
        let empty = device
            .acls
            .get(acl_index)
            .and_then(|slot| slot.as_ref())
            .map_or(false, |link| link.channels.iter().all(Option::is_none));
        if empty {
            device.acls[acl_index] = None;
        }
    }
}

fn link_closed(dev: &DeviceRef, acl_index: usize, mut link: Acl, _reason: u8) {
    for slot in link.channels.iter_mut() {
        if let Some(mut channel) = slot.take() {
            let handle = L2cap {
                dev: dev.clone(),
                acl_index,
                local_cid: channel.local_cid,
            };
            match channel.phase {
                Phase::WaitLink | Phase::WaitConnRsp => {
                    if let Some(mut callback) = channel.connect_cb.take() {
                        let response = ConnectionResponse {
                            remote_cid: 0,
                            local_cid: 0,
                            result: CONN_RESULT_NO_RESOURCES,
                            status: CONN_STATUS_NO_INFO,
                        };
                        callback(&handle, &response);
                    }
                }
                Phase::Open => {
                    if let Some(mut callback) = channel.on_disconnected_cb.take() {
                        callback(&handle);
                    }
                }
                Phase::WaitDisconnRsp => {
                    if let Some(callback) = channel.disconnect_cb.take() {
                        callback(&handle);
                    }
                }
            }
        }
    }
}

fn link_data_received(dev: &DeviceRef, acl_index: usize, reader: &mut BufferReader) {
    let mut l2cap_header = [0u8; L2CAP_HDR_LEN as usize];
    if reader.read(&mut l2cap_header) != L2CAP_HDR_LEN as usize {
        log::warn!("truncated L2CAP header dropped");
        return;
    }
    let total_len = read_le16(&l2cap_header, 0);
    let channel_id = read_le16(&l2cap_header, 2);

    if channel_id == CID_SIGNALLING {
        // Multiple commands may be packed into one PDU
        let mut parsed: u16 = 0;
        while parsed < total_len {
            let mut signal_header = [0u8; SIGNAL_HDR_LEN as usize];
            if reader.read(&mut signal_header) != SIGNAL_HDR_LEN as usize {
                log::warn!("truncated signalling header dropped");
                break;
            }
            parsed += SIGNAL_HDR_LEN;
            let code = signal_header[0];
            let id = signal_header[1];
            let cmd_len = read_le16(&signal_header, 2);

            let mut command = vec![0u8; cmd_len as usize];
            if reader.read(&mut command) != cmd_len as usize {
                log::warn!("truncated signalling command dropped");
                break;
            }
            parsed += cmd_len;

            if code % 2 == 0 {
                handle_request(dev, acl_index, code, id, &command);
            } else {
                handle_response(dev, acl_index, code, id, &command);
            }
        }
    } else if channel_id == CID_CONNECTIONLESS {
        log::debug!("connectionless reception is not supported; frame dropped");
    } else {
        let (local_cid, callback) = {
            let mut device = dev.borrow_mut();
            let found = device
                .acls
                .get_mut(acl_index)
                .and_then(|slot| slot.as_mut())
                .and_then(|link| {
                    link.channels
                        .iter_mut()
                        .flatten()
                        .find(|channel| channel.local_cid == channel_id)
                });
            match found {
                Some(channel) => (channel.local_cid, channel.on_data_cb.take()),
                None => {
                    log::debug!("data for unknown channel {:04x} dropped", channel_id);
                    return;
                }
            }
        };
        if let Some(mut callback) = callback {
            let handle = L2cap {
                dev: dev.clone(),
                acl_index,
                local_cid,
            };
            callback(&handle, reader);
            let mut device = dev.borrow_mut();
            if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                if channel.on_data_cb.is_none() {
                    channel.on_data_cb = Some(callback);
                }
            }
        }
    }
}

// ---- inbound signalling: requests ----

fn handle_request(dev: &DeviceRef, acl_index: usize, code: u8, id: u8, data: &[u8]) {
    match code {
        signal::CONN_REQ => {
            // No server-side listeners: upper-layer profiles accept
            // connections elsewhere, so every inbound PSM is refused.
            let source_cid = read_le16(data, 2);
            let mut payload = [0u8; 8];
            write_le16(0, &mut payload);
            write_le16(source_cid, &mut payload[2..]);
            write_le16(CONN_RESULT_PSM_NOT_SUPPORTED, &mut payload[4..]);
            write_le16(CONN_STATUS_NO_INFO, &mut payload[6..]);
            let mut device = dev.borrow_mut();
            if let Err(err) = cmd_reply(&mut device, acl_index, signal::CONN_RSP, id, &payload) {
                log::warn!("could not refuse connection request: {}", err);
            }
        }
        signal::CONFIG_REQ => handle_configure_req(dev, acl_index, id, data),
        signal::DISCONN_REQ => handle_disconnect_req(dev, acl_index, id, data),
        signal::ECHO_REQ => {
            let mut device = dev.borrow_mut();
            if let Err(err) = cmd_reply(&mut device, acl_index, signal::ECHO_RSP, id, data) {
                log::warn!("could not answer echo request: {}", err);
            }
        }
        _ => {
            let mut payload = [0u8; 2];
            write_le16(REJECT_NOT_UNDERSTOOD, &mut payload);
            let mut device = dev.borrow_mut();
            let _ = cmd_reply(&mut device, acl_index, signal::CMD_REJECT, id, &payload);
        }
    }
}

fn handle_disconnect_req(dev: &DeviceRef, acl_index: usize, id: u8, data: &[u8]) {
    let destination_cid = read_le16(data, 0);
    let source_cid = read_le16(data, 2);

    let exists = {
        let device = dev.borrow();
        channel_ref(&device, acl_index, destination_cid).is_some()
    };
    if !exists {
        let mut device = dev.borrow_mut();
        reject_invalid_cid(&mut device, acl_index, id, destination_cid, source_cid);
        return;
    }

    let channel = {
        let mut device = dev.borrow_mut();
        let mut payload = [0u8; 4];
        write_le16(destination_cid, &mut payload);
        write_le16(source_cid, &mut payload[2..]);
        if let Err(err) = cmd_reply(&mut device, acl_index, signal::DISCONN_RSP, id, &payload) {
            log::warn!("could not acknowledge disconnection request: {}", err);
        }
        remove_channel(&mut device, acl_index, destination_cid)
    };

    if let Some(mut channel) = channel {
        if let Some(mut callback) = channel.on_disconnected_cb.take() {
            let handle = L2cap {
                dev: dev.clone(),
                acl_index,
                local_cid: destination_cid,
            };
            callback(&handle);
        }
    }
    release_link_if_idle(dev, acl_index);
}

fn handle_configure_req(dev: &DeviceRef, acl_index: usize, id: u8, data: &[u8]) {
    if data.len() < CONFIG_REQ_HDR_LEN as usize {
        return;
    }
    let destination_cid = read_le16(data, 0);
    let flags = read_le16(data, 2);
    let options = &data[CONFIG_REQ_HDR_LEN as usize..];

    let local_cid = {
        let device = dev.borrow();
        match channel_ref(&device, acl_index, destination_cid) {
            Some(channel) => channel.local_cid,
            None => {
                drop(device);
                let mut device = dev.borrow_mut();
                reject_invalid_cid(&mut device, acl_index, id, destination_cid, 0);
                return;
            }
        }
    };

    // While response fragments are parked, the peer only sends null-option
    // requests to give us ids to answer under.
    let has_pending = {
        let device = dev.borrow();
        channel_ref(&device, acl_index, local_cid)
            .and_then(|channel| channel.configure_req.as_ref())
            .map_or(false, |conf| conf.has_pending_packets)
    };
    if has_pending {
        config_send_resp_packet(dev, acl_index, local_cid, id);
        return;
    }

    match config_parse(options) {
        ConfigParse::Corrupted => handle_protocol_error(dev, acl_index, local_cid),
        ConfigParse::UnknownOptions { total_size } => {
            reply_unknown_options(dev, acl_index, local_cid, id, flags, options, total_size)
        }
        ConfigParse::Parsed(params) => {
            {
                let mut device = dev.borrow_mut();
                if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                    let conf = channel
                        .configure_req
                        .get_or_insert_with(|| Box::new(ConfigureData::default()));
                    conf.params.merge(&params);
                }
            }

            if flags & CONFIG_FLAG_CONTINUATION != 0 {
                // More fragments coming; just acknowledge this one
                let remote_cid = {
                    let device = dev.borrow();
                    channel_ref(&device, acl_index, local_cid).map(|channel| channel.remote_cid)
                };
                if let Some(remote_cid) = remote_cid {
                    let mut ack = [0u8; 6];
                    write_le16(remote_cid, &mut ack);
                    write_le16(CONFIG_FLAG_CONTINUATION, &mut ack[2..]);
                    write_le16(CONFIG_RESULT_OK, &mut ack[4..]);
                    let mut device = dev.borrow_mut();
                    let _ = cmd_reply(&mut device, acl_index, signal::CONFIG_RSP, id, &ack);
                }
                return;
            }

            // Full request assembled: let the application veto, then respond
            let (callback, snapshot) = {
                let mut device = dev.borrow_mut();
                match channel_mut(&mut device, acl_index, local_cid) {
                    Some(channel) => {
                        channel.in_configure_cb = true;
                        let snapshot = channel
                            .configure_req
                            .as_ref()
                            .map(|conf| conf.params.clone())
                            .unwrap_or_default();
                        (channel.on_configure_cb.take(), snapshot)
                    }
                    None => return,
                }
            };
            if let Some(mut callback) = callback {
                let handle = L2cap {
                    dev: dev.clone(),
                    acl_index,
                    local_cid,
                };
                callback(&handle, &snapshot);
                let mut device = dev.borrow_mut();
                if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                    if channel.on_configure_cb.is_none() {
                        channel.on_configure_cb = Some(callback);
                    }
                }
            }

            let conf = {
                let mut device = dev.borrow_mut();
                match channel_mut(&mut device, acl_index, local_cid) {
                    Some(channel) => {
                        channel.in_configure_cb = false;
                        let conf = channel.configure_req.take();
                        // Accepted parameters take effect now
                        if let Some(conf) = conf.as_ref() {
                            if conf.rejected_mask == 0 {
                                if let Some(mtu) = conf.params.mtu {
                                    channel.remote_mtu = mtu;
                                }
                            }
                        }
                        conf
                    }
                    None => return,
                }
            };
            if let Some(mut conf) = conf {
                if let Err(err) = config_send(dev, acl_index, local_cid, &mut conf, Some(id)) {
                    log::warn!("configure response failed: {}", err);
                }
                if conf.has_pending_packets {
                    let mut device = dev.borrow_mut();
                    if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                        channel.configure_req = Some(conf);
                    }
                }
            }
        }
    }
}

/// Answer a request carrying unknown non-hint options: echo exactly those
/// options back with result UnknownOptions. The application callback is
/// not involved.
fn reply_unknown_options(
    dev: &DeviceRef,
    acl_index: usize,
    local_cid: u16,
    id: u8,
    flags: u16,
    options: &[u8],
    total_size: u16,
) {
    let mut payload = Vec::with_capacity(CONFIG_RSP_HDR_LEN as usize + total_size as usize);
    let remote_cid = {
        let device = dev.borrow();
        match channel_ref(&device, acl_index, local_cid) {
            Some(channel) => channel.remote_cid,
            None => return,
        }
    };
    payload.extend_from_slice(&remote_cid.to_le_bytes());
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(&CONFIG_RESULT_UNKNOWN_OPTIONS.to_le_bytes());

    let mut pos = 0usize;
    while pos + 2 <= options.len() {
        let opt_type = options[pos];
        let size = options[pos + 1] as usize;
        let end = (pos + 2 + size).min(options.len());
        if !option_type_is_known(opt_type) {
            payload.extend_from_slice(&options[pos..end]);
        }
        pos = end;
    }

    let mut device = dev.borrow_mut();
    if let Err(err) = cmd_reply(&mut device, acl_index, signal::CONFIG_RSP, id, &payload) {
        log::warn!("could not reply to unknown options: {}", err);
    }
}

// ---- inbound signalling: responses ----

fn handle_response(dev: &DeviceRef, acl_index: usize, code: u8, id: u8, data: &[u8]) {
    let local_cid = {
        let device = dev.borrow();
        let link = match device.acls.get(acl_index).and_then(|slot| slot.as_ref()) {
            Some(link) => link,
            None => return,
        };
        let found = link.channels.iter().flatten().find(|channel| {
            channel.expected_response_count > 0
                && channel.expected_response_id == id
                && (code == channel.expected_response_code || code == signal::CMD_REJECT)
        });
        match found {
            Some(channel) => channel.local_cid,
            None => {
                log::debug!("unmatched signalling response {:02x} id {} ignored", code, id);
                return;
            }
        }
    };

    match code {
        signal::CONN_RSP => handle_conn_rsp(dev, acl_index, local_cid, data),
        signal::CONFIG_RSP => handle_config_rsp(dev, acl_index, local_cid, data),
        signal::DISCONN_RSP => handle_disconn_rsp(dev, acl_index, local_cid),
        signal::CMD_REJECT => handle_cmd_reject(dev, acl_index, local_cid),
        _ => {}
    }

    let mut device = dev.borrow_mut();
    if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
        channel.expected_response_count -= 1;
        if channel.expected_response_count > 0 {
            channel.expected_response_id = channel.expected_response_id.wrapping_add(1);
        }
    }
}

fn notify_connect_error(dev: &DeviceRef, acl_index: usize, local_cid: u16, result: u16) {
    let channel = {
        let mut device = dev.borrow_mut();
        remove_channel(&mut device, acl_index, local_cid)
    };
    if let Some(mut channel) = channel {
        if let Some(mut callback) = channel.connect_cb.take() {
            let handle = L2cap {
                dev: dev.clone(),
                acl_index,
                local_cid,
            };
            let response = ConnectionResponse {
                remote_cid: 0,
                local_cid: 0,
                result,
                status: CONN_STATUS_NO_INFO,
            };
            callback(&handle, &response);
        }
    }
    release_link_if_idle(dev, acl_index);
}

fn handle_conn_rsp(dev: &DeviceRef, acl_index: usize, local_cid: u16, data: &[u8]) {
    if data.len() < 8 {
        log::warn!("connection response too short ({} bytes)", data.len());
        return;
    }
    let result = read_le16(data, 4);

    if result > CONN_RESULT_PENDING {
        notify_connect_error(dev, acl_index, local_cid, result);
        return;
    }

    let destination_cid = read_le16(data, 0);
    let source_cid = read_le16(data, 2);
    let status = read_le16(data, 6);

    let callback = {
        let mut device = dev.borrow_mut();
        let channel = match channel_mut(&mut device, acl_index, local_cid) {
            Some(channel) => channel,
            None => return,
        };
        if source_cid != channel.local_cid {
            log::warn!(
                "connection response source cid {:04x} != {:04x}",
                source_cid,
                channel.local_cid
            );
            return;
        }
        channel.remote_cid = destination_cid;
        if result == CONN_RESULT_OK {
            channel.phase = Phase::Open;
        }
        channel.connect_cb.take()
    };

    if let Some(mut callback) = callback {
        let handle = L2cap {
            dev: dev.clone(),
            acl_index,
            local_cid,
        };
        let response = ConnectionResponse {
            remote_cid: destination_cid,
            local_cid: source_cid,
            result,
            status,
        };
        callback(&handle, &response);
        if result == CONN_RESULT_PENDING {
            // The callback fires again when the final response arrives
            let mut device = dev.borrow_mut();
            if let Some(channel) = channel_mut(&mut device, acl_index, local_cid) {
                if channel.connect_cb.is_none() {
                    channel.connect_cb = Some(callback);
                }
            }
        }
    }
}

fn handle_config_rsp(dev: &DeviceRef, acl_index: usize, local_cid: u16, data: &[u8]) {
    if data.len() < CONFIG_RSP_HDR_LEN as usize {
        log::warn!("configure response too short ({} bytes)", data.len());
        return;
    }
    let flags = read_le16(data, 2);
    let result = read_le16(data, 4);
    let options = &data[CONFIG_RSP_HDR_LEN as usize..];

    let parsed = match config_parse(options) {
        ConfigParse::Parsed(params) => params,
        // An UnknownOptions response echoes options of ours the peer does
        // not understand; types unknown to us as well carry no information
        ConfigParse::UnknownOptions { .. } => ConfigureParams::default(),
        ConfigParse::Corrupted => {
            handle_protocol_error(dev, acl_index, local_cid);
            return;
        }
    };

    let final_packet = flags & CONFIG_FLAG_CONTINUATION == 0;
    let last_expected = {
        let mut device = dev.borrow_mut();
        let channel = match channel_mut(&mut device, acl_index, local_cid) {
            Some(channel) => channel,
            None => return,
        };
        let conf = channel
            .configure_resp
            .get_or_insert_with(|| Box::new(ConfigureData::default()));
        match result {
            CONFIG_RESULT_UNACCEPTABLE_PARAMS => {
                conf.rejected_mask |= parsed.field_mask();
                conf.params.merge(&parsed);
            }
            CONFIG_RESULT_UNKNOWN_OPTIONS => {
                conf.unknown_mask |= parsed.field_mask();
            }
            CONFIG_RESULT_OK => conf.params.merge(&parsed),
            _ => {}
        }
        channel.expected_response_count == 1
    };

    if final_packet {
        let (reply, callback) = {
            let mut device = dev.borrow_mut();
            let channel = match channel_mut(&mut device, acl_index, local_cid) {
                Some(channel) => channel,
                None => return,
            };
            let conf = channel.configure_resp.take();
            let reply = match conf {
                Some(conf) => ConfigureReply {
                    rejected_mask: conf.rejected_mask,
                    unknown_mask: conf.unknown_mask,
                    params: conf.params,
                },
                None => ConfigureReply::default(),
            };
            (reply, channel.configure_cb.take())
        };
        if let Some(callback) = callback {
            let handle = L2cap {
                dev: dev.clone(),
                acl_index,
                local_cid,
            };
            callback(&handle, &reply);
        }
    } else if last_expected {
        // All our requests were answered but the responder still has more
        // options: drive it forward with null-option requests until it
        // answers with the continuation flag cleared
        let mut empty = ConfigureData::default();
        if let Err(err) = config_send(dev, acl_index, local_cid, &mut empty, None) {
            log::warn!("null-option configure request failed: {}", err);
        }
    }
}

fn handle_disconn_rsp(dev: &DeviceRef, acl_index: usize, local_cid: u16) {
    let channel = {
        let mut device = dev.borrow_mut();
        remove_channel(&mut device, acl_index, local_cid)
    };
    if let Some(mut channel) = channel {
        if let Some(callback) = channel.disconnect_cb.take() {
            let handle = L2cap {
                dev: dev.clone(),
                acl_index,
                local_cid,
            };
            callback(&handle);
        }
    }
    release_link_if_idle(dev, acl_index);
}

fn handle_cmd_reject(dev: &DeviceRef, acl_index: usize, local_cid: u16) {
    let expected = {
        let device = dev.borrow();
        match channel_ref(&device, acl_index, local_cid) {
            Some(channel) => channel.expected_response_code,
            None => return,
        }
    };
    match expected {
        signal::CONN_RSP => {
            notify_connect_error(dev, acl_index, local_cid, CONN_RESULT_COMMAND_REJECTED)
        }
        signal::CONFIG_RSP => {
            let callback = {
                let mut device = dev.borrow_mut();
                channel_mut(&mut device, acl_index, local_cid).and_then(|channel| {
                    channel.configure_resp = None;
                    channel.configure_cb.take()
                })
            };
            if let Some(callback) = callback {
                let handle = L2cap {
                    dev: dev.clone(),
                    acl_index,
                    local_cid,
                };
                let reply = ConfigureReply {
                    rejected_mask: u32::MAX,
                    unknown_mask: 0,
                    params: ConfigureParams::default(),
                };
                callback(&handle, &reply);
            }
        }
        signal::DISCONN_RSP => handle_disconn_rsp(dev, acl_index, local_cid),
        _ => {}
    }
}

// ---- channel bring-up ----

fn connection_request(
    device: &mut HciDevice,
    acl_index: usize,
    local_cid: u16,
) -> Result<(), Error> {
    let psm = match channel_mut(device, acl_index, local_cid) {
        Some(channel) => {
            channel.phase = Phase::WaitConnRsp;
            channel.psm
        }
        None => return Err(Error::NotAllowed),
    };
    let mut payload = [0u8; 4];
    write_le16(psm, &mut payload);
    write_le16(local_cid, &mut payload[2..]);
    send_signal(device, acl_index, local_cid, signal::CONN_REQ, &payload)
}

fn default_connect_params(device: &HciDevice) -> ConnectParams {
    ConnectParams {
        packet_type: crate::hci::common::packet_types_from_features(device.supported_features),
        clock_offset: None,
        // Worst case: time between successive page scans starting <= 2.56s
        page_scan_repetition_mode: 0x01,
        allow_role_switch: true,
    }
}

/// Open an L2CAP channel to `address` on `psm`, bringing the ACL link up
/// first if needed. The callback may fire more than once when the peer
/// answers with a pending result; any result other than OK or Pending
/// closes the channel.
pub fn connect(
    hci: &HciSession,
    address: &BluetoothDeviceAddress,
    psm: u16,
    params: Option<&ConnectParams>,
    callback: impl FnMut(&L2cap, &ConnectionResponse) + 'static,
) -> Result<L2cap, Error> {
    let dev = hci.dev.clone();
    let (acl_index, local_cid, new_link, link_up, connect_params) = {
        let mut device = dev.borrow_mut();

        let (acl_index, new_link) = match device.find_acl_by_address(address) {
            Some(index) => (index, false),
            None => {
                let mut link = Acl::new(hci.client, *address);
                link.connected_cb = Some(link_connected);
                link.closed_cb = Some(link_closed);
                link.data_received_cb = Some(link_data_received);
                (device.register_acl(link)?, true)
            }
        };

        let local_cid = device.next_channel_id();
        let channel = ChannelState::new(psm, local_cid, Box::new(callback));
        let placed = device.acls[acl_index]
            .as_ref()
            .ok_or(Error::NotAllowed)?
            .channels
            .iter()
            .position(|slot| slot.is_none());
        match (placed, device.acls[acl_index].as_mut()) {
            (Some(slot), Some(link)) => link.channels[slot] = Some(channel),
            _ => {
                if new_link {
                    device.acls[acl_index] = None;
                }
                return Err(Error::ResourceExhausted);
            }
        }

        let link_up = device.acls[acl_index]
            .as_ref()
            .map_or(false, |link| link.conn_handle.is_some());
        let connect_params = params.copied().unwrap_or_else(|| default_connect_params(&device));
        (acl_index, local_cid, new_link, link_up, connect_params)
    };

    let handle = L2cap {
        dev: dev.clone(),
        acl_index,
        local_cid,
    };

    if new_link {
        acl::connect(&dev, acl_index, &connect_params);
    } else if link_up {
        let sent = {
            let mut device = dev.borrow_mut();
            connection_request(&mut device, acl_index, local_cid)
        };
        if let Err(err) = sent {
            let mut device = dev.borrow_mut();
            remove_channel(&mut device, acl_index, local_cid);
            return Err(err);
        }
    }
    // else: the link is still paging; link_connected picks this channel up

    Ok(handle)
}

impl L2cap {
    pub fn local_cid(&self) -> u16 {
        self.local_cid
    }

    pub fn remote_cid(&self) -> Option<u16> {
        let device = self.dev.borrow();
        channel_ref(&device, self.acl_index, self.local_cid).map(|channel| channel.remote_cid)
    }

    pub fn psm(&self) -> Option<u16> {
        let device = self.dev.borrow();
        channel_ref(&device, self.acl_index, self.local_cid).map(|channel| channel.psm)
    }

    /// The baseband connection handle of the underlying link.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        let device = self.dev.borrow();
        device
            .acls
            .get(self.acl_index)
            .and_then(|slot| slot.as_ref())
            .and_then(|link| link.conn_handle)
    }

    /// The payload ceiling the peer advertised for our transmissions.
    pub fn remote_mtu(&self) -> Option<u16> {
        let device = self.dev.borrow();
        channel_ref(&device, self.acl_index, self.local_cid).map(|channel| channel.remote_mtu)
    }

    pub fn mtu(&self) -> Option<u16> {
        let device = self.dev.borrow();
        channel_ref(&device, self.acl_index, self.local_cid).map(|channel| channel.mtu)
    }

    /// Negotiate channel parameters. The callback fires once, with the
    /// merged outcome of all response fragments.
    pub fn configure(
        &self,
        params: &ConfigureParams,
        callback: impl FnOnce(&L2cap, &ConfigureReply) + 'static,
    ) -> Result<(), Error> {
        {
            let mut device = self.dev.borrow_mut();
            let channel = channel_mut(&mut device, self.acl_index, self.local_cid)
                .ok_or(Error::NotAllowed)?;
            if channel.expected_response_count > 0 {
                // Still waiting on the previous exchange
                return Err(Error::NotAllowed);
            }
            channel.configure_cb = Some(Box::new(callback));
        }
        let mut conf = ConfigureData {
            params: params.clone(),
            ..ConfigureData::default()
        };
        let result = config_send(&self.dev, self.acl_index, self.local_cid, &mut conf, None);
        if result.is_err() {
            let mut device = self.dev.borrow_mut();
            if let Some(channel) = channel_mut(&mut device, self.acl_index, self.local_cid) {
                channel.configure_cb = None;
            }
        }
        result
    }

    /// Register for inbound Configure Requests. Call
    /// [`set_configure_reply`](L2cap::set_configure_reply) inside the
    /// callback to reject or correct parameters; without it, everything is
    /// accepted.
    pub fn on_configure_request(&self, callback: impl FnMut(&L2cap, &ConfigureParams) + 'static) {
        let mut device = self.dev.borrow_mut();
        if let Some(channel) = channel_mut(&mut device, self.acl_index, self.local_cid) {
            channel.on_configure_cb = Some(Box::new(callback));
        }
    }

    /// Supply the reply to the Configure Request being delivered right
    /// now. Only valid while the `on_configure_request` callback runs.
    pub fn set_configure_reply(&self, reply: &ConfigureReply) -> Result<(), Error> {
        let mut device = self.dev.borrow_mut();
        let channel = channel_mut(&mut device, self.acl_index, self.local_cid)
            .ok_or(Error::NotAllowed)?;
        if !channel.in_configure_cb {
            return Err(Error::NotAllowed);
        }
        match channel.configure_req.as_mut() {
            Some(conf) => {
                conf.rejected_mask = reply.rejected_mask;
                conf.params = reply.params.clone();
                Ok(())
            }
            None => Err(Error::NotAllowed),
        }
    }

    /// Register for data frames on this channel. The reader is positioned
    /// at the start of the payload.
    pub fn on_data(&self, callback: impl FnMut(&L2cap, &mut BufferReader) + 'static) {
        let mut device = self.dev.borrow_mut();
        if let Some(channel) = channel_mut(&mut device, self.acl_index, self.local_cid) {
            channel.on_data_cb = Some(Box::new(callback));
        }
    }

    /// Register for the peer (or the link) closing this channel.
    pub fn on_disconnected(&self, callback: impl FnMut(&L2cap) + 'static) {
        let mut device = self.dev.borrow_mut();
        if let Some(channel) = channel_mut(&mut device, self.acl_index, self.local_cid) {
            channel.on_disconnected_cb = Some(Box::new(callback));
        }
    }

    /// Send a data frame. Returns the number of ACL fragments that left
    /// immediately; the rest follow as credits return.
    pub fn send(&self, payload: &[u8]) -> Result<usize, Error> {
        let mut device = self.dev.borrow_mut();
        let remote_cid = {
            let channel = channel_mut(&mut device, self.acl_index, self.local_cid)
                .ok_or(Error::NotAllowed)?;
            if channel.phase != Phase::Open {
                return Err(Error::NotAllowed);
            }
            channel.remote_cid
        };
        let mut writer =
            create_message(&mut device, self.acl_index, payload.len() as u16, remote_cid)?;
        writer.write(payload)?;
        acl::send_message(&mut device, writer.end())
    }

    /// Close the channel; the callback fires when the peer acknowledges.
    pub fn disconnect(&self, callback: impl FnOnce(&L2cap) + 'static) -> Result<(), Error> {
        let mut device = self.dev.borrow_mut();
        let (remote_cid, local_cid) = {
            let channel = channel_mut(&mut device, self.acl_index, self.local_cid)
                .ok_or(Error::NotAllowed)?;
            if channel.phase != Phase::Open {
                return Err(Error::NotAllowed);
            }
            channel.phase = Phase::WaitDisconnRsp;
            channel.disconnect_cb = Some(Box::new(callback));
            (channel.remote_cid, channel.local_cid)
        };
        let mut payload = [0u8; 4];
        write_le16(remote_cid, &mut payload);
        write_le16(local_cid, &mut payload[2..]);
        send_signal(
            &mut device,
            self.acl_index,
            local_cid,
            signal::DISCONN_REQ,
            &payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        acl_packet, command_status, connection_complete, l2cap_frame, signal_cmd, Harness,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    const HANDLE: u16 = 0x0100;
    const PEER: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    /// Split one outbound ACL fragment into (code, id, command payload).
    fn parse_signalling(fragment: &[u8]) -> (u8, u8, Vec<u8>) {
        assert_eq!(read_le16(fragment, 6), CID_SIGNALLING, "not signalling");
        let code = fragment[8];
        let id = fragment[9];
        let len = read_le16(fragment, 10) as usize;
        (code, id, fragment[12..12 + len].to_vec())
    }

    fn inject_signal(harness: &Harness, command: &[u8]) {
        harness.inject_data(&acl_packet(HANDLE, 2, &l2cap_frame(CID_SIGNALLING, command)));
    }

    fn establish(
        harness: &Harness,
    ) -> (crate::Client, L2cap, Rc<RefCell<Vec<ConnectionResponse>>>) {
        let client = harness.host.client().unwrap();
        let address = crate::BluetoothDeviceAddress(PEER);

        let responses = Rc::new(RefCell::new(Vec::new()));
        let record = responses.clone();
        let channel = connect(client.hci(), &address, psm::SDP, None, move |_, response| {
            record.borrow_mut().push(*response)
        })
        .unwrap();

        // The ACL link is paged first
        let commands = harness.take_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][..3], [0x05, 0x04, 13]);
        assert_eq!(commands[0][3..9], PEER);
        harness.inject_event(&command_status(0, 0x0405));
        harness.inject_event(&connection_complete(0, HANDLE, &PEER));

        // Link up: the channel sends its connection request
        let data = harness.take_data();
        assert_eq!(data.len(), 1);
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!(code, signal::CONN_REQ);
        assert_eq!(id, 1);
        assert_eq!(read_le16(&payload, 0), psm::SDP);
        assert_eq!(read_le16(&payload, 2), 0x0040);

        // Peer accepts with matching CIDs
        let mut accept = Vec::new();
        accept.extend_from_slice(&0x0040u16.to_le_bytes()); // destination (theirs)
        accept.extend_from_slice(&0x0040u16.to_le_bytes()); // source (ours)
        accept.extend_from_slice(&CONN_RESULT_OK.to_le_bytes());
        accept.extend_from_slice(&CONN_STATUS_NO_INFO.to_le_bytes());
        inject_signal(harness, &signal_cmd(signal::CONN_RSP, 1, &accept));

        {
            let seen = responses.borrow();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].result, CONN_RESULT_OK);
            assert_eq!(seen[0].remote_cid, 0x0040);
            assert_eq!(seen[0].local_cid, 0x0040);
        }
        (client, channel, responses)
    }

    #[test]
    fn channel_bring_up() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);
        assert_eq!(channel.local_cid(), 0x0040);
        assert_eq!(channel.remote_cid(), Some(0x0040));
        assert_eq!(
            channel.connection_handle().map(|handle| handle.raw()),
            Some(HANDLE)
        );
    }

    #[test]
    fn connect_failure_reports_and_closes() {
        let harness = Harness::with_controller(255, 8);
        let client = harness.host.client().unwrap();
        let address = crate::BluetoothDeviceAddress(PEER);

        let responses = Rc::new(RefCell::new(Vec::new()));
        let record = responses.clone();
        let channel = connect(client.hci(), &address, psm::RFCOMM, None, move |_, response| {
            record.borrow_mut().push(*response)
        })
        .unwrap();

        harness.take_commands();
        harness.inject_event(&command_status(0, 0x0405));
        // Page timeout: the baseband link never came up
        harness.inject_event(&connection_complete(0x04, HANDLE, &PEER));

        let seen = responses.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].result, CONN_RESULT_NO_RESOURCES);
        assert!(channel.remote_cid().is_none());
    }

    fn all_options() -> ConfigureParams {
        ConfigureParams {
            mtu: Some(0x0400),
            flush_timeout: Some(0xFFFF),
            qos: Some(QosFlow {
                service_type: 1,
                token_rate: 0x1000,
                ..QosFlow::default()
            }),
            retx_flow: Some(RetxFlow {
                mode: 0,
                tx_window_size: 8,
                max_transmit: 3,
                retx_timeout: 1000,
                monitor_timeout: 1000,
                max_pdu_size: 512,
            }),
            frame_check_sequence: Some(1),
            ext_flow: Some(ExtFlow::default()),
            max_window_size: Some(32),
        }
    }

    #[test]
    fn options_serialise_in_fixed_order() {
        let (bytes, next) = serialize_options(&all_options(), 0, 1024);
        assert_eq!(next, 0);
        let mut codes = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            codes.push(bytes[pos]);
            pos += 2 + bytes[pos + 1] as usize;
        }
        assert_eq!(codes, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);

        // Capped serialisation resumes exactly where it stopped
        let (first, next) = serialize_options(&all_options(), 0, 48);
        assert_eq!(next, OPT_EXT_FLOW);
        assert_eq!(first.len(), 46);
        let (second, done) = serialize_options(&all_options(), next, 48);
        assert_eq!(done, 0);
        assert_eq!(second.len(), 22);
    }

    #[test]
    fn configure_fragments_and_drives_continuations() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let replies: Rc<RefCell<Vec<ConfigureReply>>> = Rc::new(RefCell::new(Vec::new()));
        let record = replies.clone();
        channel
            .configure(&all_options(), move |_, reply| {
                record.borrow_mut().push(reply.clone())
            })
            .unwrap();

        // The remote MTU is still the minimum (48): two request fragments
        let data = harness.take_data();
        assert_eq!(data.len(), 2);
        let (code, first_id, first) = parse_signalling(&data[0]);
        assert_eq!(code, signal::CONFIG_REQ);
        assert_eq!(first_id, 2);
        assert_eq!(read_le16(&first, 2), CONFIG_FLAG_CONTINUATION);
        assert_eq!(first.len(), 4 + 46);
        let (code, second_id, second) = parse_signalling(&data[1]);
        assert_eq!(code, signal::CONFIG_REQ);
        assert_eq!(second_id, 3);
        assert_eq!(read_le16(&second, 2), 0);
        assert_eq!(second[4], OPT_EXT_FLOW);

        // Ack of the first fragment (continuation mirrored)
        let mut ack = Vec::new();
        ack.extend_from_slice(&0x0040u16.to_le_bytes());
        ack.extend_from_slice(&CONFIG_FLAG_CONTINUATION.to_le_bytes());
        ack.extend_from_slice(&CONFIG_RESULT_OK.to_le_bytes());
        inject_signal(&harness, &signal_cmd(signal::CONFIG_RSP, first_id, &ack));
        assert!(replies.borrow().is_empty());
        assert!(harness.take_data().is_empty());

        // The peer rejects our MTU, and still has more to say
        let mut reject = Vec::new();
        reject.extend_from_slice(&0x0040u16.to_le_bytes());
        reject.extend_from_slice(&CONFIG_FLAG_CONTINUATION.to_le_bytes());
        reject.extend_from_slice(&CONFIG_RESULT_UNACCEPTABLE_PARAMS.to_le_bytes());
        reject.extend_from_slice(&[OPT_MTU, 2, 0x00, 0x02]); // corrected value
        inject_signal(&harness, &signal_cmd(signal::CONFIG_RSP, second_id, &reject));

        // That makes the requester emit a null-option request
        let data = harness.take_data();
        assert_eq!(data.len(), 1);
        let (code, null_id, null) = parse_signalling(&data[0]);
        assert_eq!(code, signal::CONFIG_REQ);
        assert_eq!(null_id, 4);
        assert_eq!(null.len(), 4, "null-option request must carry no options");
        assert_eq!(read_le16(&null, 2), 0);
        assert!(replies.borrow().is_empty());

        // Final answer: remaining result, continuation cleared
        let mut done = Vec::new();
        done.extend_from_slice(&0x0040u16.to_le_bytes());
        done.extend_from_slice(&0u16.to_le_bytes());
        done.extend_from_slice(&CONFIG_RESULT_OK.to_le_bytes());
        done.extend_from_slice(&[OPT_FRAME_CHECK_SEQ, 1, 1]);
        inject_signal(&harness, &signal_cmd(signal::CONFIG_RSP, null_id, &done));

        let replies = replies.borrow();
        assert_eq!(replies.len(), 1, "one merged reply");
        let reply = &replies[0];
        assert_eq!(reply.rejected_mask, CONFIG_MTU);
        assert_eq!(reply.unknown_mask, 0);
        assert_eq!(reply.params.mtu, Some(0x0200));
        assert_eq!(reply.params.frame_check_sequence, Some(1));
    }

    #[test]
    fn unknown_options_are_echoed_without_the_callback() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        channel.on_configure_request(|_, _| panic!("unknown options bypass the callback"));

        let mut request = Vec::new();
        request.extend_from_slice(&0x0040u16.to_le_bytes()); // our cid
        request.extend_from_slice(&0u16.to_le_bytes());
        let mut unknown = vec![0x77, 10];
        unknown.extend_from_slice(&[0xEE; 10]);
        request.extend_from_slice(&unknown);
        request.extend_from_slice(&[OPT_FLUSH_TIMEOUT, 2, 0x34, 0x12]);
        inject_signal(&harness, &signal_cmd(signal::CONFIG_REQ, 9, &request));

        let data = harness.take_data();
        assert_eq!(data.len(), 1);
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!(code, signal::CONFIG_RSP);
        assert_eq!(id, 9);
        assert_eq!(read_le16(&payload, 4), CONFIG_RESULT_UNKNOWN_OPTIONS);
        assert_eq!(&payload[6..], &unknown[..], "exactly the unknown TLVs, raw");
    }

    #[test]
    fn hinted_unknown_options_are_ignored() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        channel.on_configure_request(move |_, params| record.borrow_mut().push(params.clone()));

        let mut request = Vec::new();
        request.extend_from_slice(&0x0040u16.to_le_bytes());
        request.extend_from_slice(&0u16.to_le_bytes());
        request.extend_from_slice(&[0x85, 2, 0xAA, 0xBB]); // unknown hint
        request.extend_from_slice(&[OPT_MTU, 2, 0x00, 0x01]);
        inject_signal(&harness, &signal_cmd(signal::CONFIG_REQ, 5, &request));

        // The hint was skipped, the request accepted and the MTU applied
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].mtu, Some(0x0100));
        assert_eq!(channel.remote_mtu(), Some(0x0100));

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::CONFIG_RSP, 5));
        assert_eq!(read_le16(&payload, 4), CONFIG_RESULT_OK);
    }

    #[test]
    fn fragmented_inbound_request_is_acked_then_answered() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        channel.on_configure_request(move |_, params| record.borrow_mut().push(params.clone()));

        let mut fragment = Vec::new();
        fragment.extend_from_slice(&0x0040u16.to_le_bytes());
        fragment.extend_from_slice(&CONFIG_FLAG_CONTINUATION.to_le_bytes());
        fragment.extend_from_slice(&[OPT_MTU, 2, 0x80, 0x00]);
        inject_signal(&harness, &signal_cmd(signal::CONFIG_REQ, 6, &fragment));

        // Fragment acked with the continuation flag mirrored, callback held
        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::CONFIG_RSP, 6));
        assert_eq!(read_le16(&payload, 2), CONFIG_FLAG_CONTINUATION);
        assert_eq!(read_le16(&payload, 4), CONFIG_RESULT_OK);
        assert!(seen.borrow().is_empty());

        let mut last = Vec::new();
        last.extend_from_slice(&0x0040u16.to_le_bytes());
        last.extend_from_slice(&0u16.to_le_bytes());
        last.extend_from_slice(&[OPT_FRAME_CHECK_SEQ, 1, 0]);
        inject_signal(&harness, &signal_cmd(signal::CONFIG_REQ, 7, &last));

        // Both fragments merged into one delivered request
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].mtu, Some(0x0080));
        assert_eq!(seen.borrow()[0].frame_check_sequence, Some(0));
        assert_eq!(channel.remote_mtu(), Some(0x0080));

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::CONFIG_RSP, 7));
        assert_eq!(read_le16(&payload, 4), CONFIG_RESULT_OK);
    }

    #[test]
    fn rejected_parameters_come_from_the_application() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let reply_handle = channel.clone();
        channel.on_configure_request(move |_, _| {
            let reply = ConfigureReply {
                rejected_mask: CONFIG_MTU,
                unknown_mask: 0,
                params: ConfigureParams {
                    mtu: Some(256),
                    ..ConfigureParams::default()
                },
            };
            reply_handle.set_configure_reply(&reply).unwrap();
        });

        let mut request = Vec::new();
        request.extend_from_slice(&0x0040u16.to_le_bytes());
        request.extend_from_slice(&0u16.to_le_bytes());
        request.extend_from_slice(&[OPT_MTU, 2, 0x10, 0x00]);
        inject_signal(&harness, &signal_cmd(signal::CONFIG_REQ, 8, &request));

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::CONFIG_RSP, 8));
        assert_eq!(
            read_le16(&payload, 4),
            CONFIG_RESULT_UNACCEPTABLE_PARAMS
        );
        // The corrective value rides along
        assert_eq!(&payload[6..], &[OPT_MTU, 2, 0x00, 0x01]);
        // Rejected parameters are not applied
        assert_eq!(channel.remote_mtu(), Some(MTU_MIN));
    }

    #[test]
    fn set_configure_reply_outside_the_callback_is_refused() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        match channel.set_configure_reply(&ConfigureReply::default()) {
            Err(Error::NotAllowed) => {}
            other => panic!("expected NotAllowed, got {:?}", other.err()),
        }
    }

    #[test]
    fn unknown_destination_cid_is_rejected_with_both_cids() {
        let harness = Harness::with_controller(255, 8);
        let (_client, _channel, _responses) = establish(&harness);

        let mut request = Vec::new();
        request.extend_from_slice(&0x9999u16.to_le_bytes());
        request.extend_from_slice(&0u16.to_le_bytes());
        inject_signal(&harness, &signal_cmd(signal::CONFIG_REQ, 11, &request));

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::CMD_REJECT, 11));
        assert_eq!(read_le16(&payload, 0), REJECT_INVALID_CID);
        assert_eq!(read_le16(&payload, 2), 0x9999);
        assert_eq!(read_le16(&payload, 4), 0x0000);
    }

    #[test]
    fn responses_with_the_wrong_id_are_dropped() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let fired = Rc::new(RefCell::new(0));
        let record = fired.clone();
        let params = ConfigureParams {
            mtu: Some(512),
            ..ConfigureParams::default()
        };
        channel
            .configure(&params, move |_, _| *record.borrow_mut() += 1)
            .unwrap();
        harness.take_data();

        let mut response = Vec::new();
        response.extend_from_slice(&0x0040u16.to_le_bytes());
        response.extend_from_slice(&0u16.to_le_bytes());
        response.extend_from_slice(&CONFIG_RESULT_OK.to_le_bytes());

        // Stale id: ignored
        inject_signal(&harness, &signal_cmd(signal::CONFIG_RSP, 99, &response));
        assert_eq!(*fired.borrow(), 0);

        // Matching id: delivered
        inject_signal(&harness, &signal_cmd(signal::CONFIG_RSP, 2, &response));
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn data_frames_reach_the_channel_callback() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let received = Rc::new(RefCell::new(Vec::new()));
        let record = received.clone();
        channel.on_data(move |_, reader| {
            let mut payload = vec![0u8; reader.remaining() as usize];
            let len = reader.read(&mut payload);
            payload.truncate(len);
            record.borrow_mut().push(payload);
        });

        let payload: Vec<u8> = (0..32u8).collect();
        harness.inject_data(&acl_packet(HANDLE, 2, &l2cap_frame(0x0040, &payload)));
        assert_eq!(*received.borrow(), vec![payload]);

        // Frames for unknown channels disappear quietly
        harness.inject_data(&acl_packet(HANDLE, 2, &l2cap_frame(0x0077, &[1, 2, 3])));
        assert_eq!(received.borrow().len(), 1);
    }

    #[test]
    fn send_frames_payload_with_the_remote_cid() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let payload: Vec<u8> = (0..20u8).collect();
        let sent = channel.send(&payload).unwrap();
        assert_eq!(sent, 1);

        let data = harness.take_data();
        assert_eq!(data.len(), 1);
        let fragment = &data[0];
        assert_eq!(read_le16(fragment, 4), payload.len() as u16);
        assert_eq!(read_le16(fragment, 6), 0x0040); // remote cid
        assert_eq!(&fragment[8..], &payload[..]);
    }

    #[test]
    fn local_disconnect_completes_on_response() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let done = Rc::new(RefCell::new(false));
        let record = done.clone();
        channel.disconnect(move |_| *record.borrow_mut() = true).unwrap();

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!(code, signal::DISCONN_REQ);
        assert_eq!(read_le16(&payload, 0), 0x0040); // theirs
        assert_eq!(read_le16(&payload, 2), 0x0040); // ours
        assert!(!*done.borrow());

        let mut response = Vec::new();
        response.extend_from_slice(&0x0040u16.to_le_bytes());
        response.extend_from_slice(&0x0040u16.to_le_bytes());
        inject_signal(&harness, &signal_cmd(signal::DISCONN_RSP, id, &response));

        assert!(*done.borrow());
        // The channel is gone
        match channel.send(&[1]) {
            Err(Error::NotAllowed) => {}
            other => panic!("expected NotAllowed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn inbound_disconnect_is_acknowledged_and_closes() {
        let harness = Harness::with_controller(255, 8);
        let (_client, channel, _responses) = establish(&harness);

        let closed = Rc::new(RefCell::new(false));
        let record = closed.clone();
        channel.on_disconnected(move |_| *record.borrow_mut() = true);

        let mut request = Vec::new();
        request.extend_from_slice(&0x0040u16.to_le_bytes()); // ours
        request.extend_from_slice(&0x0040u16.to_le_bytes()); // theirs
        inject_signal(&harness, &signal_cmd(signal::DISCONN_REQ, 14, &request));

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::DISCONN_RSP, 14));
        assert_eq!(read_le16(&payload, 0), 0x0040);
        assert!(*closed.borrow());
        assert!(channel.remote_cid().is_none());
    }

    #[test]
    fn echo_requests_are_answered() {
        let harness = Harness::with_controller(255, 8);
        let (_client, _channel, _responses) = establish(&harness);

        inject_signal(&harness, &signal_cmd(signal::ECHO_REQ, 3, &[0xDE, 0xAD]));
        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::ECHO_RSP, 3));
        assert_eq!(payload, vec![0xDE, 0xAD]);
    }

    #[test]
    fn inbound_connection_requests_are_refused() {
        let harness = Harness::with_controller(255, 8);
        let (_client, _channel, _responses) = establish(&harness);

        let mut request = Vec::new();
        request.extend_from_slice(&psm::RFCOMM.to_le_bytes());
        request.extend_from_slice(&0x0070u16.to_le_bytes());
        inject_signal(&harness, &signal_cmd(signal::CONN_REQ, 6, &request));

        let data = harness.take_data();
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!((code, id), (signal::CONN_RSP, 6));
        assert_eq!(read_le16(&payload, 0), 0); // no channel allocated
        assert_eq!(read_le16(&payload, 2), 0x0070);
        assert_eq!(read_le16(&payload, 4), CONN_RESULT_PSM_NOT_SUPPORTED);
    }

    #[test]
    fn second_channel_reuses_the_link() {
        let harness = Harness::with_controller(255, 8);
        let (client, _channel, _responses) = establish(&harness);

        let address = crate::BluetoothDeviceAddress(PEER);
        let responses = Rc::new(RefCell::new(Vec::new()));
        let record = responses.clone();
        let second = connect(client.hci(), &address, psm::RFCOMM, None, move |_, response| {
            record.borrow_mut().push(*response)
        })
        .unwrap();
        assert_eq!(second.local_cid(), 0x0041);

        // No new baseband connection; the request goes straight out
        assert!(harness.take_commands().is_empty());
        let data = harness.take_data();
        assert_eq!(data.len(), 1);
        let (code, id, payload) = parse_signalling(&data[0]);
        assert_eq!(code, signal::CONN_REQ);
        assert_eq!(read_le16(&payload, 0), psm::RFCOMM);
        assert_eq!(read_le16(&payload, 2), 0x0041);

        let mut accept = Vec::new();
        accept.extend_from_slice(&0x0041u16.to_le_bytes());
        accept.extend_from_slice(&0x0041u16.to_le_bytes());
        accept.extend_from_slice(&CONN_RESULT_OK.to_le_bytes());
        accept.extend_from_slice(&CONN_STATUS_NO_INFO.to_le_bytes());
        inject_signal(&harness, &signal_cmd(signal::CONN_RSP, id, &accept));

        assert_eq!(responses.borrow().len(), 1);
        assert_eq!(second.remote_cid(), Some(0x0041));
    }
}
