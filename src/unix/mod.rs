//! Linux backend over a raw BlueZ HCI socket.
//!
//! Binds an `AF_BLUETOOTH` raw socket to the adapter, installs a filter
//! that passes events and ACL data, and runs a reader thread that feeds
//! inbound packets into the core's queue. Requires the adapter to be
//! down or the caller to have raw-socket privileges.

use crate::backend::{Backend, BackendError};
use crate::buffer::Buffer;
use crate::queue::EventSink;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const BTPROTO_HCI: libc::c_int = 1;

const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;

// HCI packet indicators, the first byte of every UART/socket packet
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_ACLDATA_PKT: u8 = 0x02;
const HCI_EVENT_PKT: u8 = 0x04;

// Large enough for a maximal ACL packet on any controller we care about
const READ_BUF_SIZE: usize = 1800;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[derive(Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

fn errno_error() -> BackendError {
    BackendError::Io(std::io::Error::last_os_error())
}

/// Platform transport over `/dev/hciN` via the kernel's raw HCI channel.
pub struct HciSocketBackend {
    device_id: u16,
    fd: Option<RawFd>,
    running: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl HciSocketBackend {
    pub fn new(device_id: u16) -> HciSocketBackend {
        HciSocketBackend {
            device_id,
            fd: None,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn open_socket(&self) -> Result<RawFd, BackendError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(errno_error());
        }

        let address = SockaddrHci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: self.device_id,
            hci_channel: 0, // raw channel
        };
        let bound = unsafe {
            libc::bind(
                fd,
                &address as *const SockaddrHci as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if bound < 0 {
            let err = errno_error();
            let _ = nix::unistd::close(fd);
            return Err(err);
        }

        // Pass every event and all ACL data up to the reader
        let mut filter = HciFilter::default();
        filter.type_mask = (1 << HCI_EVENT_PKT as u32) | (1 << HCI_ACLDATA_PKT as u32);
        filter.event_mask = [!0, !0];
        let set = unsafe {
            libc::setsockopt(
                fd,
                SOL_HCI,
                HCI_FILTER,
                &filter as *const HciFilter as *const libc::c_void,
                std::mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if set < 0 {
            let err = errno_error();
            let _ = nix::unistd::close(fd);
            return Err(err);
        }

        Ok(fd)
    }

    fn write_packet(&mut self, indicator: u8, buffer: &Buffer) -> Result<(), BackendError> {
        let fd = self.fd.ok_or(BackendError::NotInitialized)?;
        let mut packet = Vec::with_capacity(1 + buffer.total_size() as usize);
        packet.push(indicator);
        packet.extend_from_slice(&buffer.to_vec());
        match nix::unistd::write(fd, &packet) {
            Ok(written) if written == packet.len() => Ok(()),
            Ok(_) => Err(BackendError::Other("short write to HCI socket")),
            Err(errno) => Err(BackendError::Io(std::io::Error::from_raw_os_error(
                errno as i32,
            ))),
        }
    }
}

fn reader_loop(fd: RawFd, sink: EventSink, running: Arc<AtomicBool>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    while running.load(Ordering::Acquire) {
        let len = match nix::unistd::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(len) => len,
            Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => continue,
            Err(errno) => {
                if running.load(Ordering::Acquire) {
                    log::error!("HCI socket read failed: {}", errno);
                }
                break;
            }
        };
        if len < 2 {
            continue;
        }
        match buf[0] {
            HCI_EVENT_PKT => sink.dispatch_event(Buffer::from_slice(&buf[1..len])),
            HCI_ACLDATA_PKT => sink.dispatch_data(Buffer::from_slice(&buf[1..len])),
            HCI_COMMAND_PKT => {
                log::warn!("command packet arriving from the controller; dropped")
            }
            other => log::debug!("unhandled packet indicator {:02x}", other),
        }
    }
}

impl Backend for HciSocketBackend {
    fn init(&mut self, sink: EventSink) -> Result<(), BackendError> {
        let fd = self.open_socket()?;
        self.fd = Some(fd);
        self.running.store(true, Ordering::Release);

        let running = self.running.clone();
        self.reader = Some(thread::spawn(move || reader_loop(fd, sink, running)));
        Ok(())
    }

    fn send_command(&mut self, buffer: Buffer) -> Result<(), BackendError> {
        self.write_packet(HCI_COMMAND_PKT, &buffer)
    }

    fn send_data(&mut self, buffer: Buffer) -> Result<(), BackendError> {
        self.write_packet(HCI_ACLDATA_PKT, &buffer)
    }

    fn deinit(&mut self) -> Result<(), BackendError> {
        self.running.store(false, Ordering::Release);
        if let Some(fd) = self.fd.take() {
            // Closing the socket kicks the reader out of its read()
            if let Err(errno) = nix::unistd::close(fd) {
                log::warn!("closing HCI socket failed: {}", errno);
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }
}
