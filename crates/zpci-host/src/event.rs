//! Hot-plug and error notifications queued for the platform event channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::host::EventChannel;
use crate::lock;

pub const EVENT_TO_CONFIGURED: u16 = 0x0301;
pub const EVENT_RESERVED_TO_STANDBY: u16 = 0x0302;
pub const EVENT_DECONFIGURE_REQUEST: u16 = 0x0303;
pub const EVENT_CONFIGURED_TO_STANDBY_RESERVED: u16 = 0x0304;
pub const EVENT_STANDBY_TO_RESERVED: u16 = 0x0308;

pub const ERR_INVALID_ADDRESS_SPACE: u16 = 0x01;
pub const ERR_OUT_OF_RANGE: u16 = 0x02;
pub const ERR_INVALID_TRANSLATION_FORMAT: u16 = 0x03;
pub const ERR_PROTECTION: u16 = 0x04;
pub const ERR_INVALID_ENTRY: u16 = 0x07;
pub const ERR_INVALID_LENGTH: u16 = 0x08;
pub const ERR_TABLE_TYPE: u16 = 0x09;
pub const ERR_NO_MSI: u16 = 0x10;
pub const ERR_ADAPTER_RESOURCE: u16 = 0x13;
pub const ERR_MEASUREMENT_ADDRESS: u16 = 0x2a;
pub const ERR_MEASUREMENT_PROTECTION: u16 = 0x2c;

/// Size of a notification-type-2 event information block.
pub const NT2_LEN: usize = 4080;
const NT2_CCDF: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Error,
    Availability,
}

impl EventClass {
    pub const fn content_code(self) -> u8 {
        match self {
            EventClass::Error => 1,
            EventClass::Availability => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub class: EventClass,
    /// Product event code.
    pub code: u16,
    pub fh: u32,
    pub fid: u32,
    pub fault_addr: u64,
    /// Auxiliary word; for doorbell failures the vector sits in the upper half.
    pub aux: u32,
}

impl PendingEvent {
    pub fn availability(code: u16, fh: u32, fid: u32) -> Self {
        Self {
            class: EventClass::Availability,
            code,
            fh,
            fid,
            fault_addr: 0,
            aux: 0,
        }
    }

    pub fn error(code: u16, fh: u32, fid: u32, fault_addr: u64, aux: u32) -> Self {
        Self {
            class: EventClass::Error,
            code,
            fh,
            fid,
            fault_addr,
            aux,
        }
    }

    /// Serializes the event as a store-event-information notification-type-2 block.
    pub fn encode_nt2(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NT2_LEN];
        buf[0..2].copy_from_slice(&(NT2_LEN as u16).to_be_bytes());
        buf[7] = 2;
        buf[11] = self.class.content_code();

        let ccdf = &mut buf[NT2_CCDF..];
        ccdf[4..8].copy_from_slice(&self.fh.to_be_bytes());
        ccdf[8..12].copy_from_slice(&self.fid.to_be_bytes());
        if self.class == EventClass::Error {
            ccdf[12..16].copy_from_slice(&self.aux.to_be_bytes());
            ccdf[16..24].copy_from_slice(&self.fault_addr.to_be_bytes());
        }
        ccdf[30..32].copy_from_slice(&self.code.to_be_bytes());
        buf
    }
}

/// FIFO of events awaiting collection by the platform.
///
/// Guarded by its own lock so that error reporting from any path never has to take the
/// registry lock.
pub struct EventQueue {
    pending: Mutex<VecDeque<PendingEvent>>,
    channel: Arc<dyn EventChannel>,
}

impl EventQueue {
    pub fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            channel,
        }
    }

    pub fn push(&self, event: PendingEvent) {
        tracing::debug!(
            class = ?event.class,
            code = format_args!("{:#x}", event.code),
            fid = event.fid,
            fh = format_args!("{:#x}", event.fh),
            "queue zpci event"
        );
        lock(&self.pending).push_back(event);
        self.channel.condition_changed();
    }

    /// Removes the oldest event; each event is handed out exactly once.
    pub fn pop(&self) -> Option<PendingEvent> {
        lock(&self.pending).pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }
}
