//! Alternative, event-based processing of incoming GATT attribute requests.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::{self, raw::RawMutex};
use embassy_sync::signal::Signal;

use crate::att::AttErrorCode;
use crate::attribute::Characteristic;
use crate::bearer::AttTransport;
use crate::{BleHostError, Error};

use super::{GattAttrDesc, GattHandler, GattServer};

/// Represents a GATT attribute read request that needs to be replied with the attribute data.
pub struct GattReadRequest<'a, M: RawMutex, const MTU: usize>(&'a ExchangeArea<M, MTU>);

impl<'a, M: RawMutex, const MTU: usize> GattReadRequest<'a, M, MTU> {
    /// Replies to the GATT read request with the given data.
    pub fn reply_with(self, data: &[u8]) {
        self.0.buf.lock(|buf| {
            let mut buf = buf.borrow_mut();

            buf.clear();
            let len = data.len().min(buf.capacity());
            buf.extend_from_slice(&data[..len]).ok();
        });

        self.0.response.signal(());
    }
}

/// Represents a GATT attribute write request that carries the attribute data.
pub struct GattWriteRequest<'a, M: RawMutex, const MTU: usize>(&'a ExchangeArea<M, MTU>);

impl<'a, M: RawMutex, const MTU: usize> GattWriteRequest<'a, M, MTU> {
    /// Fetches the data of the write request into the provided buffer.
    ///
    /// Returns the number of bytes fetched.
    pub fn fetch(self, buf: &mut [u8]) -> usize {
        let len = self.0.buf.lock(|data| {
            let data = data.borrow();

            buf[..data.len()].copy_from_slice(&data);

            data.len()
        });

        self.0.response.signal(());

        len
    }
}

/// Represents a GATT event that needs processing.
pub enum GattEvent<'a, M: RawMutex, const MTU: usize> {
    /// A GATT read request.
    Read {
        /// The handle of the attribute being read.
        handle: u16,
        /// The offset of the read request.
        offset: u16,
        /// Identifier of the in-flight request on its bearer.
        id: u32,
        /// The read request.
        request: GattReadRequest<'a, M, MTU>,
    },
    /// A GATT write request.
    Write {
        /// The handle of the attribute being written.
        handle: u16,
        /// The offset of the write request.
        offset: u16,
        /// Identifier of the in-flight request on its bearer.
        id: u32,
        /// The write request.
        request: GattWriteRequest<'a, M, MTU>,
    },
}

/// A GATT events' connection that can be polled for events that need processing.
pub struct GattEvents<'r, M: RawMutex, const MTU: usize> {
    exchange: &'r ExchangeArea<M, MTU>,
}

impl<'r, M: RawMutex, const MTU: usize> GattEvents<'r, M, MTU> {
    pub(crate) const fn new(exchange: &'r ExchangeArea<M, MTU>) -> Self {
        Self { exchange }
    }

    /// Returns the next GATT event that needs processing.
    ///
    /// Note that this method _must_ be polled, or else the GATT server will not be able to process
    /// incoming attribute requests.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> GattEvent<'_, M, MTU> {
        let request = self.exchange.request.wait().await;

        match request {
            Request::Read { handle, offset, id } => GattEvent::Read {
                handle,
                offset,
                id,
                request: GattReadRequest(self.exchange),
            },
            Request::Write { handle, offset, id } => GattEvent::Write {
                handle,
                offset,
                id,
                request: GattWriteRequest(self.exchange),
            },
        }
    }
}

/// A GATT runner spins the internal server processing loop.
pub struct GattRunner<'m, 'r, T: AttTransport, M: RawMutex, const MAX: usize, const MTU: usize> {
    server: &'m GattServer<'r, T, M, MAX, MTU>,
}

impl<'m, 'r, T: AttTransport, M: RawMutex, const MAX: usize, const MTU: usize> GattRunner<'m, 'r, T, M, MAX, MTU> {
    pub(crate) fn new(server: &'m GattServer<'r, T, M, MAX, MTU>) -> Self {
        Self { server }
    }

    /// Runs the GATT server processing loop.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.server.process(&self.server.exchange_area).await
    }
}

/// A GATT notifier that can be used to send notifications to the connected peer.
pub struct GattNotifier<'m, 'r, T: AttTransport, M: RawMutex, const MAX: usize, const MTU: usize> {
    server: &'m GattServer<'r, T, M, MAX, MTU>,
}

impl<'m, 'r, T: AttTransport, M: RawMutex, const MAX: usize, const MTU: usize> GattNotifier<'m, 'r, T, M, MAX, MTU> {
    pub(crate) fn new(server: &'m GattServer<'r, T, M, MAX, MTU>) -> Self {
        Self { server }
    }

    /// Sends a notification to the connected peer.
    pub async fn notify(&mut self, handle: Characteristic, value: &[u8]) -> Result<(), BleHostError<T::Error>> {
        self.server.notify(handle, value).await
    }
}

enum Request {
    Read { handle: u16, offset: u16, id: u32 },
    Write { handle: u16, offset: u16, id: u32 },
}

// A work-area shared between `GattServer::process` and the GATT event processing loop.
//
// The GATT server will write incoming attribute requests to the `request` signal and buf,
// and will then wait to be signaled by the `response` signal that the processing of the
// request is complete. It would then fetch the processed data from the buffer (if applicable
// for the concrete request) and send it back to the client.
pub(crate) struct ExchangeArea<M: RawMutex, const MTU: usize> {
    request: Signal<M, Request>,
    response: Signal<M, ()>,
    buf: blocking_mutex::Mutex<M, RefCell<heapless::Vec<u8, MTU>>>,
}

impl<M: RawMutex, const MTU: usize> ExchangeArea<M, MTU> {
    pub(crate) const fn new() -> Self {
        Self {
            request: Signal::new(),
            response: Signal::new(),
            buf: blocking_mutex::Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }
}

impl<M: RawMutex, const MTU: usize> GattHandler for &ExchangeArea<M, MTU> {
    async fn read(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        self.request.signal(Request::Read {
            handle: attr.handle,
            offset: offset as u16,
            id: attr.request_id,
        });

        self.response.wait().await;

        let len = self.buf.lock(|buf| {
            let buf = buf.borrow_mut();

            let len = buf.len().min(data.len());
            data[..len].copy_from_slice(&buf[..len]);

            len
        });

        Ok(len)
    }

    async fn write(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        self.buf.lock(|buf| {
            let mut buf = buf.borrow_mut();

            buf.clear();
            let len = data.len().min(buf.capacity());
            buf.extend_from_slice(&data[..len]).ok();
        });

        self.request.signal(Request::Write {
            handle: attr.handle,
            offset: offset as u16,
            id: attr.request_id,
        });

        self.response.wait().await;

        Ok(())
    }
}
