//! In-memory ATT transport, for exercising bearers without a radio.
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embedded_io::ErrorKind;

use crate::bearer::AttTransport;
use crate::pdu::Pdu;
use crate::types::security::SecurityLevel;

const QUEUE_SIZE: usize = 4;

/// A pair of cross-linked in-memory transports.
///
/// `split` yields the two endpoints; frames sent on one are received on the
/// other, in order.
pub struct TransportBus<M: RawMutex, const MTU: usize> {
    a2b: Channel<M, Pdu<MTU>, QUEUE_SIZE>,
    b2a: Channel<M, Pdu<MTU>, QUEUE_SIZE>,
    closed: AtomicBool,
}

impl<M: RawMutex, const MTU: usize> TransportBus<M, MTU> {
    /// Create a new bus.
    pub const fn new() -> Self {
        Self {
            a2b: Channel::new(),
            b2a: Channel::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The two endpoints of the bus.
    pub fn split(&self) -> (MockTransport<'_, M, MTU>, MockTransport<'_, M, MTU>) {
        (
            MockTransport {
                tx: &self.a2b,
                rx: &self.b2a,
                closed: &self.closed,
                peer: BdAddr::new([0xb, 0, 0, 0, 0, 0]),
                security: Cell::new(SecurityLevel::None),
            },
            MockTransport {
                tx: &self.b2a,
                rx: &self.a2b,
                closed: &self.closed,
                peer: BdAddr::new([0xa, 0, 0, 0, 0, 0]),
                security: Cell::new(SecurityLevel::None),
            },
        )
    }

    /// Disconnect both endpoints. Receivers observe an orderly EOF.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.a2b.try_send(Pdu::from_slice(&[]));
        let _ = self.b2a.try_send(Pdu::from_slice(&[]));
    }
}

impl<M: RawMutex, const MTU: usize> Default for TransportBus<M, MTU> {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`TransportBus`].
pub struct MockTransport<'d, M: RawMutex, const MTU: usize> {
    tx: &'d Channel<M, Pdu<MTU>, QUEUE_SIZE>,
    rx: &'d Channel<M, Pdu<MTU>, QUEUE_SIZE>,
    closed: &'d AtomicBool,
    peer: BdAddr,
    security: Cell<SecurityLevel>,
}

impl<'d, M: RawMutex, const MTU: usize> MockTransport<'d, M, MTU> {
    /// Pretend the link reached the given security level.
    pub fn set_security(&self, security: SecurityLevel) {
        self.security.set(security);
    }
}

impl<'d, M: RawMutex, const MTU: usize> embedded_io::ErrorType for MockTransport<'d, M, MTU> {
    type Error = ErrorKind;
}

impl<'d, M: RawMutex, const MTU: usize> AttTransport for MockTransport<'d, M, MTU> {
    async fn send(&self, pdu: &[u8]) -> Result<(), Self::Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ErrorKind::NotConnected);
        }
        self.tx.send(Pdu::from_slice(pdu)).await;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let pdu = self.rx.receive().await;
        let frame = pdu.as_ref();
        if frame.is_empty() {
            return Ok(0);
        }
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn peer_address(&self) -> BdAddr {
        self.peer
    }

    fn security_level(&self) -> SecurityLevel {
        self.security.get()
    }
}
