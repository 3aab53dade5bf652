//! An async ATT/GATT protocol engine.
//!
//! The crate speaks the Attribute Protocol over an abstract sequenced-packet
//! transport ([`bearer::AttTransport`]) and exposes both GATT roles:
//!
//! - [`gatt::GattServer`] answers requests against an [`attribute::AttributeTable`]
//!   built locally, dispatching reads and writes to registered callbacks and
//!   pushing notifications and indications.
//! - [`gatt::GattClient`] mirrors the database of a peer (services, included
//!   services, characteristics, descriptors) and offers typed read, write and
//!   subscribe operations on it.
//!
//! Both roles share an [`bearer::AttBearer`], which enforces the ATT
//! one-outstanding-request rule, serializes indications, applies the
//! transaction timeout and routes inbound PDUs.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod att;
pub mod attribute;
pub mod attribute_server;
pub mod bearer;
pub mod codec;
pub mod config;
pub mod cursor;
pub mod gatt;
pub mod mock_transport;
pub mod pdu;
pub mod prelude;
pub mod types;

use att::AttErrorCode;

/// Errors surfaced to users of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The peer answered an operation with an ATT Error Response.
    ///
    /// Unlike the other variants this is not terminal for the bearer; only
    /// the individual operation failed.
    Att {
        /// The error code from the response.
        code: AttErrorCode,
        /// The attribute handle the response refers to.
        handle: u16,
    },
    /// A PDU could not be decoded. Terminal for the bearer.
    Malformed,
    /// An inbound response did not match the pending request. Terminal for
    /// the bearer.
    InvalidResponse,
    /// No response within the ATT transaction timeout. Terminal for the
    /// bearer.
    Timeout,
    /// The operation was cancelled by its owner, e.g. through
    /// [`gatt::GattClient::cancel`].
    Cancelled,
    /// The bearer is gone.
    Disconnected,
    /// A prepare-write echo did not match the sent bytes.
    ReliableWriteMismatch,
    /// A local precheck failed; on the wire this materializes as the
    /// matching ATT error response.
    PermissionDenied(AttErrorCode),
    /// Not enough buffer space.
    InsufficientSpace,
    /// A value had an unexpected shape.
    InvalidValue,
    /// No such attribute, service or characteristic.
    NotFound,
    /// The operation is not supported by the target.
    NotSupported,
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Self {
        match e {
            codec::Error::InsufficientSpace => Error::InsufficientSpace,
            codec::Error::InvalidValue => Error::Malformed,
        }
    }
}

/// Errors from operations that also involve the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleHostError<E> {
    /// The transport failed.
    Transport(E),
    /// The host protocol layer failed.
    BleHost(Error),
}

impl<E> From<Error> for BleHostError<E> {
    fn from(e: Error) -> Self {
        Self::BleHost(e)
    }
}

impl<E> From<codec::Error> for BleHostError<E> {
    fn from(e: codec::Error) -> Self {
        Self::BleHost(e.into())
    }
}
