//! ATT bearer: a framed PDU transport with request/response discipline.
//!
//! A bearer owns one connection's ATT stream. Client-initiated requests are
//! serialized so that at most one is outstanding; indications form an
//! independent stream with the same rule. Inbound PDUs are classified and
//! routed: responses to the pending request, notifications and indications
//! to the client task, everything else to the server task.
use core::cell::RefCell;

use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::with_timeout;

use crate::att::{self, AttReq, AttRsp};
use crate::codec::{Encode, Type};
use crate::config;
use crate::cursor::WriteCursor;
use crate::pdu::Pdu;
use crate::types::security::SecurityLevel;
use crate::{BleHostError, Error};

/// A sequenced-packet transport carrying ATT PDUs.
///
/// One frame is one PDU; the transport must preserve frame boundaries and
/// ordering. A receive of zero bytes signals an orderly disconnect.
pub trait AttTransport: embedded_io::ErrorType {
    /// Send one PDU frame.
    async fn send(&self, pdu: &[u8]) -> Result<(), Self::Error>;

    /// Receive one PDU frame into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Address of the remote peer.
    fn peer_address(&self) -> BdAddr;

    /// Security level of the underlying link.
    fn security_level(&self) -> SecurityLevel;
}

struct State {
    mtu: u16,
    preferred_mtu: u16,
    mtu_exchanged: bool,
    pending_request: Option<u8>,
    pending_indication: bool,
    closed: Option<Error>,
}

/// An ATT bearer over a transport.
///
/// `MTU` is the size of the bearer's PDU buffers and bounds what can ever
/// be negotiated; the effective ATT MTU starts at 23.
pub struct AttBearer<T: AttTransport, M: RawMutex, const MTU: usize> {
    transport: T,
    state: BlockingMutex<M, RefCell<State>>,
    request_lock: Mutex<M, ()>,
    responses: Channel<M, Result<Pdu<MTU>, Error>, 1>,
    indication_lock: Mutex<M, ()>,
    confirmations: Channel<M, Result<(), Error>, 1>,
    inbound: Channel<M, Pdu<MTU>, 1>,
    unsolicited: Channel<M, Pdu<MTU>, { config::BEARER_UNSOLICITED_QUEUE_SIZE }>,
    disconnected: Signal<M, Error>,
}

impl<T: AttTransport, M: RawMutex, const MTU: usize> AttBearer<T, M, MTU> {
    /// Create a bearer over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: BlockingMutex::new(RefCell::new(State {
                mtu: config::ATT_DEFAULT_MTU,
                preferred_mtu: MTU as u16,
                mtu_exchanged: false,
                pending_request: None,
                pending_indication: false,
                closed: None,
            })),
            request_lock: Mutex::new(()),
            responses: Channel::new(),
            indication_lock: Mutex::new(()),
            confirmations: Channel::new(),
            inbound: Channel::new(),
            unsolicited: Channel::new(),
            disconnected: Signal::new(),
        }
    }

    /// The effective ATT MTU.
    pub fn mtu(&self) -> u16 {
        self.state.lock(|s| s.borrow().mtu)
    }

    /// Set the MTU this side proposes in an MTU exchange.
    ///
    /// Clamped to the bearer's buffer size. Has no effect on an exchange
    /// that already happened.
    pub fn set_preferred_mtu(&self, mtu: u16) {
        let mtu = mtu.clamp(config::ATT_DEFAULT_MTU, MTU as u16);
        self.state.lock(|s| s.borrow_mut().preferred_mtu = mtu);
    }

    /// Address of the remote peer.
    pub fn peer_address(&self) -> BdAddr {
        self.transport.peer_address()
    }

    /// Security level of the underlying link.
    pub fn security_level(&self) -> SecurityLevel {
        self.transport.security_level()
    }

    /// Wait for the bearer to disconnect, returning the reason.
    pub async fn disconnected(&self) -> Error {
        if let Some(e) = self.state.lock(|s| s.borrow().closed) {
            return e;
        }
        self.disconnected.wait().await
    }

    /// Whether the bearer is still usable.
    pub fn is_connected(&self) -> bool {
        self.state.lock(|s| s.borrow().closed.is_none())
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.state.lock(|s| s.borrow().closed) {
            None => Ok(()),
            Some(_) => Err(Error::Disconnected),
        }
    }

    pub(crate) fn close(&self, reason: Error) {
        let deliver = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.closed.is_some() {
                return (false, false);
            }
            s.closed = Some(reason);
            let r = s.pending_request.take().is_some();
            let i = core::mem::take(&mut s.pending_indication);
            (r, i)
        });
        if deliver.0 {
            let _ = self.responses.try_send(Err(reason));
        }
        if deliver.1 {
            let _ = self.confirmations.try_send(Err(reason));
        }
        self.disconnected.signal(reason);
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), BleHostError<T::Error>> {
        match self.transport.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close(Error::Disconnected);
                Err(BleHostError::Transport(e))
            }
        }
    }

    /// Send a request and wait for the matching response.
    ///
    /// Requests are queued FIFO; at most one is on the wire at a time. The
    /// bearer becomes unusable if no response arrives within the ATT
    /// transaction timeout.
    pub async fn send_request(&self, req: &AttReq<'_>) -> Result<Pdu<MTU>, BleHostError<T::Error>> {
        let _guard = self.request_lock.lock().await;
        self.check_open()?;

        // An abandoned request may still own the wire slot; its response
        // must arrive and be discarded before a new request goes out.
        if self.state.lock(|s| s.borrow().pending_request.is_some()) {
            match with_timeout(config::ATT_REQUEST_TIMEOUT, self.responses.receive()).await {
                Ok(_stale) => {}
                Err(_) => {
                    self.close(Error::Timeout);
                    return Err(Error::Timeout.into());
                }
            }
            self.check_open()?;
        }
        while self.responses.try_receive().is_ok() {}

        let size = req.size();
        if size > self.mtu() as usize {
            return Err(Error::InsufficientSpace.into());
        }
        let mut buf = [0; MTU];
        req.encode(&mut buf[..size])?;

        self.state.lock(|s| s.borrow_mut().pending_request = Some(req.method()));
        self.send_frame(&buf[..size]).await?;

        match with_timeout(config::ATT_REQUEST_TIMEOUT, self.responses.receive()).await {
            Ok(rsp) => rsp.map_err(BleHostError::BleHost),
            Err(_) => {
                warn!("[bearer] request timed out, closing");
                self.close(Error::Timeout);
                Err(Error::Timeout.into())
            }
        }
    }

    /// Send a command PDU. No response is expected.
    pub async fn send_command(&self, req: &AttReq<'_>) -> Result<(), BleHostError<T::Error>> {
        debug_assert!(req.is_command());
        self.check_open()?;
        let size = req.size();
        if size > self.mtu() as usize {
            return Err(Error::InsufficientSpace.into());
        }
        let mut buf = [0; MTU];
        req.encode(&mut buf[..size])?;
        self.send_frame(&buf[..size]).await
    }

    /// Send a Handle Value Notification. Fire and forget; the value is
    /// truncated to MTU-3.
    pub async fn notify(&self, handle: u16, value: &[u8]) -> Result<(), BleHostError<T::Error>> {
        self.check_open()?;
        let mut buf = [0; MTU];
        let len = self.encode_value_push(&mut buf, att::ATT_HANDLE_VALUE_NTF, handle, value)?;
        self.send_frame(&buf[..len]).await
    }

    /// Send a Handle Value Indication and wait for the confirmation.
    ///
    /// Indications are serialized among themselves but do not block request
    /// traffic in either direction.
    pub async fn indicate(&self, handle: u16, value: &[u8]) -> Result<(), BleHostError<T::Error>> {
        let _guard = self.indication_lock.lock().await;
        self.check_open()?;

        // As for requests, an abandoned indication is still owed its
        // confirmation before the next one may go out.
        if self.state.lock(|s| s.borrow().pending_indication) {
            match with_timeout(config::ATT_REQUEST_TIMEOUT, self.confirmations.receive()).await {
                Ok(_stale) => {}
                Err(_) => {
                    self.close(Error::Timeout);
                    return Err(Error::Timeout.into());
                }
            }
            self.check_open()?;
        }
        while self.confirmations.try_receive().is_ok() {}

        let mut buf = [0; MTU];
        let len = self.encode_value_push(&mut buf, att::ATT_HANDLE_VALUE_IND, handle, value)?;
        self.state.lock(|s| s.borrow_mut().pending_indication = true);
        self.send_frame(&buf[..len]).await?;

        match with_timeout(config::ATT_REQUEST_TIMEOUT, self.confirmations.receive()).await {
            Ok(cfm) => cfm.map_err(BleHostError::BleHost),
            Err(_) => {
                warn!("[bearer] indication timed out, closing");
                self.close(Error::Timeout);
                Err(Error::Timeout.into())
            }
        }
    }

    fn encode_value_push(&self, buf: &mut [u8], opcode: u8, handle: u16, value: &[u8]) -> Result<usize, Error> {
        let mtu = self.mtu() as usize;
        let mut w = WriteCursor::new(buf);
        w.write(opcode)?;
        w.write(handle)?;
        w.append(&value[..value.len().min(mtu - 3)])?;
        Ok(w.len())
    }

    /// Send a Handle Value Confirmation for a received indication.
    pub(crate) async fn confirm(&self) -> Result<(), BleHostError<T::Error>> {
        self.check_open()?;
        self.send_frame(&[att::ATT_HANDLE_VALUE_CFM]).await
    }

    /// Send a raw, already encoded response PDU.
    pub(crate) async fn send_response(&self, rsp: &[u8]) -> Result<(), BleHostError<T::Error>> {
        self.check_open()?;
        let len = rsp.len().min(self.mtu() as usize);
        self.send_frame(&rsp[..len]).await
    }

    /// Exchange the ATT MTU with the peer. At most one exchange happens per
    /// bearer; later calls return the already negotiated value.
    pub async fn exchange_mtu(&self) -> Result<u16, BleHostError<T::Error>> {
        let (exchanged, preferred) = self.state.lock(|s| {
            let s = s.borrow();
            (s.mtu_exchanged, s.preferred_mtu)
        });
        if exchanged {
            return Ok(self.mtu());
        }

        let pdu = self.send_request(&AttReq::ExchangeMtu { mtu: preferred }).await?;
        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::ExchangeMtu { mtu } => {
                let effective = preferred.min(mtu).max(config::ATT_DEFAULT_MTU);
                self.state.lock(|s| {
                    let mut s = s.borrow_mut();
                    s.mtu = effective;
                    s.mtu_exchanged = true;
                });
                debug!("[bearer] mtu negotiated: {}", effective);
                Ok(effective)
            }
            AttRsp::Error { code, .. } => Err(Error::Att {
                code,
                handle: 0,
            }
            .into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Next inbound request or command, for the server role.
    pub(crate) async fn next_inbound(&self) -> Pdu<MTU> {
        self.inbound.receive().await
    }

    /// Next inbound notification or indication, for the client role.
    pub(crate) async fn next_unsolicited(&self) -> Pdu<MTU> {
        self.unsolicited.receive().await
    }

    fn handle_exchange_mtu_req(&self, frame: &[u8], rsp: &mut [u8]) -> Result<usize, Error> {
        let client_mtu = match AttReq::decode(frame) {
            Ok(AttReq::ExchangeMtu { mtu }) => mtu,
            _ => return Err(Error::Malformed),
        };
        let already = self.state.lock(|s| s.borrow().mtu_exchanged);
        let mut w = WriteCursor::new(rsp);
        if already {
            // One exchange per bearer.
            w.write(att::ATT_ERROR_RSP)?;
            w.write(att::ATT_EXCHANGE_MTU_REQ)?;
            w.write(0u16)?;
            w.write(att::AttErrorCode::RequestNotSupported as u8)?;
            return Ok(w.len());
        }
        let preferred = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.mtu = s.preferred_mtu.min(client_mtu).max(config::ATT_DEFAULT_MTU);
            s.mtu_exchanged = true;
            s.preferred_mtu
        });
        debug!("[bearer] mtu negotiated: {}", self.mtu());
        w.write(att::ATT_EXCHANGE_MTU_RSP)?;
        w.write(preferred)?;
        Ok(w.len())
    }

    fn take_matching_response(&self, opcode: u8, frame: &[u8]) -> Result<(), Error> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let matches = match s.pending_request {
                Some(method) => {
                    if opcode == att::ATT_ERROR_RSP {
                        frame.len() >= 2 && frame[1] == method
                    } else {
                        opcode == (method | 1)
                    }
                }
                None => false,
            };
            if matches {
                s.pending_request = None;
                Ok(())
            } else {
                Err(Error::InvalidResponse)
            }
        })
    }

    /// Receive and dispatch inbound PDUs until the bearer dies.
    ///
    /// Must run for requests, notifications and the server role to make
    /// progress. Returns the terminal error.
    pub async fn run(&self) -> Result<(), BleHostError<T::Error>> {
        loop {
            let mut buf = [0; MTU];
            let len = match self.transport.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    self.close(Error::Disconnected);
                    return Err(BleHostError::Transport(e));
                }
            };
            if len == 0 {
                debug!("[bearer] peer disconnected");
                self.close(Error::Disconnected);
                return Ok(());
            }
            let frame = &buf[..len];
            if len > self.mtu() as usize {
                warn!("[bearer] oversized pdu ({} bytes), closing", len);
                self.close(Error::Malformed);
                return Err(Error::Malformed.into());
            }
            let opcode = frame[0];
            match opcode {
                att::ATT_EXCHANGE_MTU_REQ => {
                    let mut rsp = [0; 8];
                    match self.handle_exchange_mtu_req(frame, &mut rsp) {
                        Ok(n) => self.send_response(&rsp[..n]).await?,
                        Err(e) => {
                            self.close(e);
                            return Err(e.into());
                        }
                    }
                }
                att::ATT_HANDLE_VALUE_NTF | att::ATT_HANDLE_VALUE_IND => {
                    // Delivered to the client task even while requests are
                    // in flight.
                    self.unsolicited.send(Pdu::from_slice(frame)).await;
                }
                att::ATT_HANDLE_VALUE_CFM => {
                    let pending = self.state.lock(|s| core::mem::take(&mut s.borrow_mut().pending_indication));
                    if pending {
                        let _ = self.confirmations.try_send(Ok(()));
                    } else {
                        warn!("[bearer] confirmation without indication, closing");
                        self.close(Error::InvalidResponse);
                        return Err(Error::InvalidResponse.into());
                    }
                }
                op if att::is_response_opcode(op) => match self.take_matching_response(op, frame) {
                    Ok(()) => {
                        while self.responses.try_receive().is_ok() {}
                        let _ = self.responses.try_send(Ok(Pdu::from_slice(frame)));
                    }
                    Err(e) => {
                        warn!("[bearer] unexpected response opcode {:02x}, closing", op);
                        self.close(e);
                        return Err(e.into());
                    }
                },
                _ => {
                    self.inbound.send(Pdu::from_slice(frame)).await;
                }
            }
        }
    }
}
