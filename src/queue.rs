//! Bounded inbound packet queue between the transport and the driver thread.
//!
//! The platform transport produces packets from whatever context it owns (an
//! interrupt handler, a USB completion callback, a reader thread) and the
//! driver thread drains them from `Host::handle_events`. Signalling happens
//! under the queue mutex and the waiter re-checks emptiness before sleeping,
//! so a packet queued between the check and the wait cannot strand the
//! waiter.

use crate::buffer::Buffer;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Maximum queue depth; packets past this are dropped and counted.
pub const MAX_QUEUED_PACKETS: usize = 128;

pub enum InboundPacket {
    /// An HCI event packet.
    Event(Buffer),
    /// An ACL data packet.
    Data(Buffer),
}

struct Inner {
    packets: VecDeque<InboundPacket>,
    missed: u32,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            inner: Mutex::new(Inner {
                packets: VecDeque::new(),
                missed: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, packet: InboundPacket) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.packets.len() >= MAX_QUEUED_PACKETS {
            inner.missed += 1;
            return;
        }
        inner.packets.push_back(packet);
        self.ready.notify_one();
    }

    /// Take everything currently queued. With `wait` set, block until at
    /// least one packet is available.
    pub(crate) fn drain(&self, wait: bool) -> Vec<InboundPacket> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        while wait && inner.packets.is_empty() {
            inner = match self.ready.wait(inner) {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if inner.missed > 0 {
            log::warn!("{} inbound packets were dropped on overflow", inner.missed);
            inner.missed = 0;
        }
        inner.packets.drain(..).collect()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}

/// Handle given to the backend at init time; the inbound half of the
/// transport contract.
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
}

impl EventSink {
    pub(crate) fn new(queue: Arc<EventQueue>) -> EventSink {
        EventSink { queue }
    }

    /// Queue an HCI event packet for the driver thread.
    pub fn dispatch_event(&self, buffer: Buffer) {
        self.queue.push(InboundPacket::Event(buffer));
    }

    /// Queue an ACL data packet for the driver thread.
    pub fn dispatch_data(&self, buffer: Buffer) {
        self.queue.push(InboundPacket::Data(buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_in_order() {
        let queue = Arc::new(EventQueue::new());
        let sink = EventSink::new(queue.clone());

        sink.dispatch_event(Buffer::from_slice(&[1]));
        sink.dispatch_data(Buffer::from_slice(&[2]));
        sink.dispatch_event(Buffer::from_slice(&[3]));

        let drained = queue.drain(false);
        assert_eq!(drained.len(), 3);
        match &drained[0] {
            InboundPacket::Event(b) => assert_eq!(b.to_vec(), vec![1]),
            _ => panic!("expected event"),
        }
        match &drained[1] {
            InboundPacket::Data(b) => assert_eq!(b.to_vec(), vec![2]),
            _ => panic!("expected data"),
        }
        assert!(queue.drain(false).is_empty());
    }

    #[test]
    fn overflow_is_counted_not_grown() {
        let queue = Arc::new(EventQueue::new());
        let sink = EventSink::new(queue.clone());
        for i in 0..(MAX_QUEUED_PACKETS + 5) {
            sink.dispatch_event(Buffer::from_slice(&[i as u8]));
        }
        assert_eq!(queue.drain(false).len(), MAX_QUEUED_PACKETS);
    }

    #[test]
    fn wait_wakes_on_push() {
        let queue = Arc::new(EventQueue::new());
        let sink = EventSink::new(queue.clone());

        let producer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            sink.dispatch_event(Buffer::from_slice(&[9]));
        });

        let drained = queue.drain(true);
        assert_eq!(drained.len(), 1);
        producer.join().unwrap();
    }
}
