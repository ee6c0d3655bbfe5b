//! Controller initialisation drivers.
//!
//! A driver owns the chip-specific bring-up: it gets a session of its own
//! and issues whatever startup commands the controller needs, finishing
//! with [`HciSession::set_init_status`]. Chips that need firmware patching
//! or vendor commands supply their own implementation; [`DefaultDriver`]
//! covers controllers that come up with the standard sequence.

use crate::hci::{HciSession, InitStatus};

pub trait Driver {
    /// Start the init sequence. `hci` is a session registered for the
    /// driver; the sequence runs asynchronously through its callbacks.
    fn start(self: Box<Self>, hci: HciSession);
}

/// Read Buffer Size, Read BD ADDR, Read Local Features, then Reset.
pub struct DefaultDriver;

impl Driver for DefaultDriver {
    fn start(self: Box<Self>, hci: HciSession) {
        let submitted = hci.read_buffer_size(|hci, reply| {
            log::debug!("driver: buffer size, status {}", reply.status);
            if !reply.status.is_ok() {
                hci.set_init_status(InitStatus::Failed);
                return;
            }
            let next = hci.read_bd_addr(|hci, reply| {
                log::debug!("driver: bd addr, status {}", reply.status);
                if !reply.status.is_ok() {
                    hci.set_init_status(InitStatus::Failed);
                    return;
                }
                let next = hci.read_local_features(|hci, reply| {
                    log::debug!("driver: local features, status {}", reply.status);
                    if !reply.status.is_ok() {
                        hci.set_init_status(InitStatus::Failed);
                        return;
                    }
                    let next = hci.reset(|hci, reply| {
                        log::debug!("driver: reset, status {}", reply.status);
                        if reply.status.is_ok() {
                            hci.set_init_status(InitStatus::Initialized);
                        } else {
                            hci.set_init_status(InitStatus::Failed);
                        }
                    });
                    if next.is_err() {
                        hci.set_init_status(InitStatus::Failed);
                    }
                });
                if next.is_err() {
                    hci.set_init_status(InitStatus::Failed);
                }
            });
            if next.is_err() {
                hci.set_init_status(InitStatus::Failed);
            }
        });
        if submitted.is_err() {
            hci.set_init_status(InitStatus::Failed);
        }
    }
}
