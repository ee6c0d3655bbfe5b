//! HCI event codes and typed event payloads.

use crate::hci::common::{read_le16, read_u8, ConnectionHandle, EVENT_POS_PAYLOAD};
use crate::hci::error::Status;
use crate::{BluetoothDeviceAddress, ClassOfDevice, LinkKey};

/// HCI event codes.
pub mod code {
    pub const INQUIRY_COMPLETE: u8 = 0x01;
    pub const INQUIRY_RESULT: u8 = 0x02;
    pub const CONNECTION_COMPLETE: u8 = 0x03;
    pub const CONNECTION_REQUEST: u8 = 0x04;
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const AUTH_COMPLETE: u8 = 0x06;
    pub const REMOTE_NAME_REQ_COMPLETE: u8 = 0x07;
    pub const ENCRYPTION_CHANGE: u8 = 0x08;
    pub const READ_REMOTE_FEATURES_COMPLETE: u8 = 0x0B;
    pub const READ_REMOTE_VERSION_COMPLETE: u8 = 0x0C;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    pub const MODE_CHANGE: u8 = 0x14;
    pub const RETURN_LINK_KEYS: u8 = 0x15;
    pub const PIN_CODE_REQUEST: u8 = 0x16;
    pub const LINK_KEY_REQUEST: u8 = 0x17;
    pub const LINK_KEY_NOTIFICATION: u8 = 0x18;
    pub const READ_CLOCK_OFFSET_COMPLETE: u8 = 0x1C;
    pub const REMOTE_HOST_FEATURES_NOTIFY: u8 = 0x3D;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

/// The highest event code with a handler slot; vendor-specific events (0xFF)
/// share slot zero.
pub(crate) const EVENT_LAST: u8 = code::REMOTE_HOST_FEATURES_NOTIFY;

/// Map an event code to its handler-table slot.
pub(crate) fn handler_slot(event_code: u8) -> Option<usize> {
    if event_code == code::VENDOR_SPECIFIC {
        Some(0)
    } else if event_code <= EVENT_LAST {
        Some(event_code as usize)
    } else {
        None
    }
}

fn read_address(data: &[u8], offset: usize) -> BluetoothDeviceAddress {
    let mut bytes = [0u8; 6];
    if offset + 6 <= data.len() {
        bytes.copy_from_slice(&data[offset..offset + 6]);
    }
    BluetoothDeviceAddress(bytes)
}

fn read_class_of_device(data: &[u8], offset: usize) -> ClassOfDevice {
    let mut bytes = [0u8; 3];
    if offset + 3 <= data.len() {
        bytes.copy_from_slice(&data[offset..offset + 3]);
    }
    ClassOfDevice(bytes)
}

/// Connection Request event payload.
#[derive(Debug, Clone)]
pub struct ConnectionRequestData {
    pub address: BluetoothDeviceAddress,
    pub class_of_device: ClassOfDevice,
    pub link_type: u8,
}

impl ConnectionRequestData {
    pub(crate) fn from_packet(packet: &[u8]) -> ConnectionRequestData {
        let payload = &packet[EVENT_POS_PAYLOAD.min(packet.len())..];
        ConnectionRequestData {
            address: read_address(payload, 0),
            class_of_device: read_class_of_device(payload, 6),
            link_type: read_u8(payload, 9),
        }
    }
}

/// Disconnection Complete event payload.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectionCompleteData {
    pub status: Status,
    pub conn_handle: ConnectionHandle,
    pub reason: u8,
}

impl DisconnectionCompleteData {
    pub(crate) fn from_packet(packet: &[u8]) -> DisconnectionCompleteData {
        let payload = &packet[EVENT_POS_PAYLOAD.min(packet.len())..];
        DisconnectionCompleteData {
            status: Status::from(read_u8(payload, 0)),
            conn_handle: ConnectionHandle::from_wire(read_le16(payload, 1)),
            reason: read_u8(payload, 3),
        }
    }
}

/// One device record from an Inquiry Result event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryResponse {
    pub address: BluetoothDeviceAddress,
    pub page_scan_repetition_mode: u8,
    pub page_scan_period_mode: u8,
    pub class_of_device: ClassOfDevice,
    pub clock_offset: u16,
}

/// Parse an Inquiry Result event. The wire format interleaves the records:
/// all addresses first, then all page-scan modes, and so on.
pub(crate) fn parse_inquiry_result(packet: &[u8]) -> Vec<InquiryResponse> {
    let payload = &packet[EVENT_POS_PAYLOAD.min(packet.len())..];
    let num_responses = read_u8(payload, 0) as usize;
    let data = &payload[1.min(payload.len())..];

    let mut responses = Vec::with_capacity(num_responses);
    let addresses = 0;
    let psrm = addresses + 6 * num_responses;
    let pspm = psrm + num_responses;
    let reserved = pspm + num_responses;
    let cod = reserved + num_responses;
    let clock_offsets = cod + 3 * num_responses;

    for i in 0..num_responses {
        responses.push(InquiryResponse {
            address: read_address(data, addresses + 6 * i),
            page_scan_repetition_mode: read_u8(data, psrm + i),
            page_scan_period_mode: read_u8(data, pspm + i),
            class_of_device: read_class_of_device(data, cod + 3 * i),
            clock_offset: read_le16(data, clock_offsets + 2 * i),
        });
    }
    responses
}

/// One record from a Return Link Keys event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLinkKey {
    pub address: BluetoothDeviceAddress,
    pub key: LinkKey,
}

/// Parse a Return Link Keys event; addresses first, then the keys.
pub(crate) fn parse_return_link_keys(packet: &[u8]) -> Vec<StoredLinkKey> {
    let payload = &packet[EVENT_POS_PAYLOAD.min(packet.len())..];
    let num_keys = read_u8(payload, 0) as usize;
    let data = &payload[1.min(payload.len())..];

    let mut keys = Vec::with_capacity(num_keys);
    let keys_base = 6 * num_keys;
    for i in 0..num_keys {
        let mut key = [0u8; 16];
        let offset = keys_base + 16 * i;
        if offset + 16 <= data.len() {
            key.copy_from_slice(&data[offset..offset + 16]);
        }
        keys.push(StoredLinkKey {
            address: read_address(data, 6 * i),
            key: LinkKey(key),
        });
    }
    keys
}

/// Iterate the (handle, completed count) pairs of a Number Of Completed
/// Packets event: `count(1)`, all handles, then all completed counts.
pub(crate) fn completed_packets_entries(
    packet: &[u8],
) -> impl Iterator<Item = (ConnectionHandle, u16)> + '_ {
    let payload = &packet[EVENT_POS_PAYLOAD.min(packet.len())..];
    let count = read_u8(payload, 0) as usize;
    (0..count).map(move |i| {
        (
            ConnectionHandle::from_wire(read_le16(payload, 1 + 2 * i)),
            read_le16(payload, 1 + 2 * count + 2 * i),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_events_share_slot_zero() {
        assert_eq!(handler_slot(code::VENDOR_SPECIFIC), Some(0));
        assert_eq!(handler_slot(code::INQUIRY_COMPLETE), Some(1));
        assert_eq!(handler_slot(EVENT_LAST), Some(EVENT_LAST as usize));
        assert_eq!(handler_slot(EVENT_LAST + 1), None);
    }

    #[test]
    fn inquiry_result_parses_interleaved_records() {
        // Two records: addresses, psrm, pspm, reserved, cod, clock offset
        let mut packet = vec![code::INQUIRY_RESULT, 0, 2];
        packet.extend(&[1, 2, 3, 4, 5, 6]);
        packet.extend(&[11, 12, 13, 14, 15, 16]);
        packet.extend(&[0x00, 0x01]); // page scan repetition modes
        packet.extend(&[0x02, 0x03]); // page scan period modes
        packet.extend(&[0x00, 0x00]); // reserved
        packet.extend(&[0xA1, 0xA2, 0xA3, 0xB1, 0xB2, 0xB3]);
        packet.extend(&[0x34, 0x12, 0x78, 0x56]);
        packet[1] = (packet.len() - 2) as u8;

        let records = parse_inquiry_result(&packet);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, BluetoothDeviceAddress([1, 2, 3, 4, 5, 6]));
        assert_eq!(records[0].page_scan_repetition_mode, 0x00);
        assert_eq!(records[0].class_of_device, ClassOfDevice([0xA1, 0xA2, 0xA3]));
        assert_eq!(records[0].clock_offset, 0x1234);
        assert_eq!(records[1].address, BluetoothDeviceAddress([11, 12, 13, 14, 15, 16]));
        assert_eq!(records[1].page_scan_period_mode, 0x03);
        assert_eq!(records[1].clock_offset, 0x5678);
    }

    #[test]
    fn completed_packets_entries_parse() {
        // count, handles 0x0100 and 0x0123, then completed counts 3 and 1
        let packet = [
            code::NUMBER_OF_COMPLETED_PACKETS,
            9,
            2,
            0x00,
            0x01,
            0x23,
            0x01,
            3,
            0,
            1,
            0,
        ];
        let entries: Vec<_> = completed_packets_entries(&packet).collect();
        assert_eq!(
            entries,
            vec![
                (ConnectionHandle::from_wire(0x0100), 3),
                (ConnectionHandle::from_wire(0x0123), 1),
            ]
        );
    }

    #[test]
    fn return_link_keys_parse() {
        let mut packet = vec![code::RETURN_LINK_KEYS, 0, 2];
        packet.extend(&[1, 2, 3, 4, 5, 6]);
        packet.extend(&[9, 9, 9, 9, 9, 9]);
        packet.extend((0u8..16).collect::<Vec<_>>());
        packet.extend((16u8..32).collect::<Vec<_>>());
        packet[1] = (packet.len() - 2) as u8;

        let keys = parse_return_link_keys(&packet);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].address, BluetoothDeviceAddress([1, 2, 3, 4, 5, 6]));
        assert_eq!(keys[0].key.0[0], 0);
        assert_eq!(keys[1].key.0[0], 16);
    }
}
