//! GATT server and client implementation.
use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU16, Ordering};

use bt_hci::param::BdAddr;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::{Channel, DynamicSender};
use embassy_sync::pubsub::{self, PubSubChannel, WaitResult};
use embassy_sync::signal::Signal;
use heapless::Vec;
use split::{ExchangeArea, GattEvents, GattNotifier, GattRunner};

use crate::att::{AttErrorCode, AttReq, AttRsp, AttUns};
use crate::attribute::{
    AttributeData, AttributeTable, Characteristic, CharacteristicProp, CharacteristicProps, ServiceHandle, Uuid, CCCD,
    CHARACTERISTIC_CCCD_UUID16, CHARACTERISTIC_SERVICE_CHANGED_UUID16, CHARACTERISTIC_UUID16, INCLUDE_SERVICE_UUID16,
    PRIMARY_SERVICE_UUID16, SECONDARY_SERVICE_UUID16,
};
use crate::attribute_server::{AttrHandler, AttributeServer};
use crate::bearer::{AttBearer, AttTransport};
use crate::config;
use crate::cursor::ReadCursor;
use crate::pdu::Pdu;
use crate::{BleHostError, Error};

pub mod split;

/// A descriptor for an attribute handling by a `GattHandler`
pub struct GattAttrDesc<'a> {
    /// Address of the peer on behalf of which this attribute access happens.
    pub peer: BdAddr,
    /// The attribute UUID
    pub uuid: &'a Uuid,
    /// The attribute handle
    pub handle: u16,
    /// The ATT opcode that triggered the access.
    pub opcode: u8,
    /// Identifier of the in-flight request, unique per bearer.
    ///
    /// Monotonically increasing, so a completion can be routed back to the
    /// right request even when the handler defers the work to another task.
    pub request_id: u32,
}

/// A callback trait invoked by the Gatt server on various operations
pub trait GattHandler {
    /// Read data for an attribute
    ///
    /// # Arguments
    /// - `attr`: The attribute descriptor
    /// - `offset`: The offset to read from
    /// - `data`: The buffer to write the data to
    ///
    /// Return the number of bytes read
    async fn read(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode>;

    /// Write data to an attribute
    ///
    /// # Arguments
    /// - `attr`: The attribute descriptor
    /// - `offset`: The offset to write to
    /// - `data`: The data to write
    async fn write(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode>;
}

impl<T> GattHandler for &mut T
where
    T: GattHandler,
{
    async fn read(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        (**self).read(attr, offset, data).await
    }

    async fn write(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        (**self).write(attr, offset, data).await
    }
}

// A type adapting the `GattHandler` trait to the `AttrHandler` trait
struct HandlerAdaptor<T> {
    handler: T,
    peer: BdAddr,
    opcode: u8,
    request_id: u32,
}

impl<T> AttrHandler for HandlerAdaptor<T>
where
    T: GattHandler,
{
    async fn read(&mut self, uuid: &Uuid, handle: u16, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        self.handler
            .read(
                &GattAttrDesc {
                    peer: self.peer,
                    uuid,
                    handle,
                    opcode: self.opcode,
                    request_id: self.request_id,
                },
                offset,
                data,
            )
            .await
    }

    async fn write(&mut self, uuid: &Uuid, handle: u16, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        self.handler
            .write(
                &GattAttrDesc {
                    peer: self.peer,
                    uuid,
                    handle,
                    opcode: self.opcode,
                    request_id: self.request_id,
                },
                offset,
                data,
            )
            .await
    }
}

/// A GATT server answering requests from one peer using the provided table
/// of attributes.
pub struct GattServer<'reference, T: AttTransport, M: RawMutex, const MAX: usize, const MTU: usize> {
    server: AttributeServer<'reference, M, MAX>,
    bearer: &'reference AttBearer<T, M, MTU>,
    request_id: BlockingMutex<M, Cell<u32>>,
    exchange_area: ExchangeArea<M, MTU>,
}

impl<'reference, T: AttTransport, M: RawMutex, const MAX: usize, const MTU: usize>
    GattServer<'reference, T, M, MAX, MTU>
{
    /// Creates a GATT server serving the given attribute table over a bearer.
    pub fn new(bearer: &'reference AttBearer<T, M, MTU>, table: &'reference AttributeTable<M, MAX>) -> Self {
        Self {
            server: AttributeServer::new(table, bearer.security_level()),
            bearer,
            request_id: BlockingMutex::new(Cell::new(0)),
            exchange_area: ExchangeArea::new(),
        }
    }

    /// Splits the server into its components.
    pub fn split(
        &mut self,
    ) -> (
        GattEvents<'_, M, MTU>,
        GattNotifier<'_, 'reference, T, M, MAX, MTU>,
        GattRunner<'_, 'reference, T, M, MAX, MTU>,
    ) {
        (
            GattEvents::new(&self.exchange_area),
            GattNotifier::new(self),
            GattRunner::new(self),
        )
    }

    fn next_request_id(&self) -> u32 {
        self.request_id.lock(|id| {
            let next = id.get().wrapping_add(1);
            id.set(next);
            next
        })
    }

    /// Grant or revoke application-level authorization for the peer.
    pub fn set_authorized(&self, authorized: bool) {
        self.server.set_authorized(authorized);
    }

    /// Process GATT requests with the attributes defined in the attribute table.
    ///
    /// If attributes are written or read, the supplied callback will be invoked to
    /// read or write the actual attribute data.
    pub async fn process<H>(&self, mut handler: H) -> Result<(), Error>
    where
        H: GattHandler,
    {
        loop {
            let pdu = self.bearer.next_inbound().await;
            match AttReq::decode(pdu.as_ref()) {
                Ok(att) => {
                    // The link may have been re-encrypted since the last
                    // request.
                    self.server.set_security(self.bearer.security_level());

                    let mut tx = [0; MTU];
                    let adaptor = HandlerAdaptor {
                        handler: &mut handler,
                        peer: self.bearer.peer_address(),
                        opcode: pdu.opcode().unwrap_or_default(),
                        request_id: self.next_request_id(),
                    };
                    let mtu = self.bearer.mtu() as usize;

                    match self.server.process(&att, &mut tx, mtu, adaptor).await {
                        Ok(Some(written)) => {
                            if self.bearer.send_response(&tx[..written]).await.is_err() {
                                return Err(Error::Disconnected);
                            }
                        }
                        Ok(None) => {
                            debug!("[gatt] no response sent");
                        }
                        Err(e) => {
                            warn!("[gatt] error processing attribute: {:?}", e);
                        }
                    }
                }
                Err(e) => {
                    // Commands are dropped silently; a malformed request is
                    // a protocol violation.
                    if pdu.opcode().unwrap_or_default() & 0x40 != 0 {
                        debug!("[gatt] dropping malformed command: {:?}", e);
                        continue;
                    }
                    warn!("[gatt] error decoding attribute request: {:?}", e);
                    self.bearer.close(Error::Malformed);
                    return Err(Error::Malformed);
                }
            }
        }
    }

    /// Process requests until the bearer disconnects.
    ///
    /// Like [`process`](Self::process), but terminates with the disconnect
    /// reason and discards any queued prepare writes.
    pub async fn run<H>(&self, handler: H) -> Result<(), Error>
    where
        H: GattHandler,
    {
        let result = match select(self.process(handler), self.bearer.disconnected()).await {
            Either::First(r) => r,
            Either::Second(e) => Err(e),
        };
        self.server.clear_prepare_queue();
        result
    }

    /// Notify a subscribed peer with a new value of the characteristic.
    ///
    /// If the peer has not subscribed for this characteristic, nothing is
    /// sent and `Ok` is returned.
    pub async fn notify(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), BleHostError<T::Error>> {
        let cccd_handle = characteristic.cccd_handle.ok_or(Error::NotSupported)?;

        if !self.server.should_notify(cccd_handle) {
            // No reason to fail?
            return Ok(());
        }

        self.bearer.notify(characteristic.handle, value).await
    }

    /// Indicate a new value of the characteristic to a subscribed peer and
    /// wait for its confirmation.
    ///
    /// Fails with `NotSupported` when the peer has not enabled indications
    /// for this characteristic.
    pub async fn indicate(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), BleHostError<T::Error>> {
        let cccd_handle = characteristic.cccd_handle.ok_or(Error::NotSupported)?;

        if !self.server.should_indicate(cccd_handle) {
            return Err(Error::NotSupported.into());
        }

        self.bearer.indicate(characteristic.handle, value).await
    }

    /// Activate or deactivate a service group.
    ///
    /// A change is announced to the peer with a Service Changed indication
    /// covering the group's handle range, if the peer subscribed to it.
    pub async fn set_service_active(&self, service: &ServiceHandle, active: bool) -> Result<(), BleHostError<T::Error>> {
        if self.server.table.set_active(service, active).await {
            self.service_changed(service.start(), service.end()).await?;
        }
        Ok(())
    }

    /// Send a Service Changed indication for the given handle range if the
    /// peer enabled indications on the Service Changed characteristic.
    pub async fn service_changed(&self, start: u16, end: u16) -> Result<(), BleHostError<T::Error>> {
        let sc = match self
            .server
            .table
            .characteristic_by_type(&CHARACTERISTIC_SERVICE_CHANGED_UUID16)
            .await
        {
            Ok(sc) => sc,
            Err(_) => return Ok(()),
        };
        let subscribed = sc.cccd_handle.map(|cccd| self.server.should_indicate(cccd));
        if subscribed != Some(true) {
            return Ok(());
        }
        let mut value = [0; 4];
        value[..2].copy_from_slice(&start.to_le_bytes());
        value[2..].copy_from_slice(&end.to_le_bytes());
        debug!("[gatt] service changed [{:04x}..{:04x}]", start, end);
        self.bearer.indicate(sc.handle, &value).await
    }
}

/// Notification listener for GATT client.
pub struct NotificationListener<'lst, const MTU: usize> {
    handle: u16,
    listener: pubsub::DynSubscriber<'lst, Notification<MTU>>,
    acks: DynamicSender<'lst, ()>,
    slot: &'lst AtomicU16,
    pending_ack: bool,
}

impl<'lst, const MTU: usize> NotificationListener<'lst, MTU> {
    #[allow(clippy::should_implement_trait)]
    /// Get the next value push for the subscribed characteristic.
    ///
    /// An indication returned from this method is acknowledged on the next
    /// call (or when the listener is dropped); the bearer holds back its
    /// confirmation until every subscriber of the handle has done so, so
    /// cached state invalidated in between is never observed stale.
    pub async fn next(&mut self) -> Notification<MTU> {
        if self.pending_ack {
            self.pending_ack = false;
            self.acks.send(()).await;
        }
        loop {
            if let WaitResult::Message(m) = self.listener.next_message().await {
                if m.handle == self.handle {
                    self.pending_ack = m.indicated;
                    return m;
                }
            }
        }
    }
}

impl<'lst, const MTU: usize> Drop for NotificationListener<'lst, MTU> {
    fn drop(&mut self) {
        // Releases a held or still queued indication.
        let _ = self.acks.try_send(());
        self.slot.store(0, Ordering::Relaxed);
    }
}

const MAX_NOTIF: usize = config::GATT_CLIENT_NOTIFICATION_MAX_SUBSCRIBERS;
const NOTIF_QSIZE: usize = config::GATT_CLIENT_NOTIFICATION_QUEUE_SIZE;

/// A notification payload.
#[derive(Debug, PartialEq, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Notification<const MTU: usize> {
    handle: u16,
    indicated: bool,
    data: [u8; MTU],
    len: usize,
}

impl<const MTU: usize> Notification<MTU> {
    /// Handle of the characteristic value the notification refers to.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Whether the push was a confirmed indication.
    pub fn indicated(&self) -> bool {
        self.indicated
    }
}

impl<const MTU: usize> AsRef<[u8]> for Notification<MTU> {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// A characteristic in the mirrored database of a peer.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Clone)]
pub struct RemoteCharacteristic {
    pub(crate) decl_handle: u16,
    pub(crate) handle: u16,
    pub(crate) end: u16,
    pub(crate) uuid: Uuid,
    pub(crate) props: CharacteristicProps,
    pub(crate) cccd_handle: Option<u16>,
}

impl RemoteCharacteristic {
    /// Handle of the characteristic value.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// UUID of the characteristic.
    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    /// Properties from the declaration.
    pub fn props(&self) -> CharacteristicProps {
        self.props
    }

    /// The characteristic as an operations target.
    pub fn characteristic(&self) -> Characteristic {
        Characteristic {
            handle: self.handle,
            cccd_handle: self.cccd_handle,
        }
    }
}

/// A descriptor in the mirrored database of a peer.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Clone)]
pub struct RemoteDescriptor {
    pub(crate) handle: u16,
    pub(crate) uuid: Uuid,
    pub(crate) characteristic: u16,
}

impl RemoteDescriptor {
    /// Handle of the descriptor attribute.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// UUID of the descriptor.
    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

/// An included service reference in the mirrored database of a peer.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Clone)]
pub struct RemoteInclude {
    pub(crate) handle: u16,
    pub(crate) start: u16,
    pub(crate) end: u16,
    pub(crate) uuid: Uuid,
    pub(crate) service: u16,
}

impl RemoteInclude {
    /// Handle of the include declaration.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// First handle of the included service.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last handle of the included service.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// UUID of the included service.
    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

/// A change in the peer's set of services.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Clone)]
pub enum ServiceEvent {
    /// A service appeared.
    Added(ServiceHandle),
    /// A service disappeared.
    Removed(ServiceHandle),
    /// A service kept its range and UUID but its contents were rediscovered.
    Changed(ServiceHandle),
}

struct Mirror {
    services: Vec<ServiceHandle, { config::GATT_CLIENT_MAX_SERVICES }>,
    characteristics: Vec<RemoteCharacteristic, { config::GATT_CLIENT_MAX_CHARACTERISTICS }>,
    descriptors: Vec<RemoteDescriptor, { config::GATT_CLIENT_MAX_DESCRIPTORS }>,
    includes: Vec<RemoteInclude, { config::GATT_CLIENT_MAX_INCLUDES }>,
    service_changed_handle: Option<u16>,
    ready: bool,
}

impl Mirror {
    const fn new() -> Self {
        Self {
            services: Vec::new(),
            characteristics: Vec::new(),
            descriptors: Vec::new(),
            includes: Vec::new(),
            service_changed_handle: None,
            ready: false,
        }
    }

    fn clear_range(&mut self, start: u16, end: u16) {
        self.services.retain(|s| s.end < start || s.start > end);
        self.characteristics.retain(|c| c.decl_handle < start || c.decl_handle > end);
        self.descriptors.retain(|d| d.handle < start || d.handle > end);
        self.includes.retain(|i| i.handle < start || i.handle > end);
    }

    fn sort(&mut self) {
        self.services.sort_unstable_by_key(|s| s.start);
        self.characteristics.sort_unstable_by_key(|c| c.decl_handle);
        self.descriptors.sort_unstable_by_key(|d| d.handle);
        self.includes.sort_unstable_by_key(|i| i.handle);
    }
}

/// A GATT client mirroring and operating on the database of a peer.
pub struct GattClient<'reference, T: AttTransport, M: RawMutex, const MTU: usize> {
    bearer: &'reference AttBearer<T, M, MTU>,
    mirror: RefCell<Mirror>,

    notifications: PubSubChannel<M, Notification<MTU>, NOTIF_QSIZE, MAX_NOTIF, 1>,
    // Value handle per live listener; zero marks a free slot.
    subscriptions: [AtomicU16; MAX_NOTIF],
    indication_acks: Channel<M, (), MAX_NOTIF>,
    events: Channel<M, ServiceEvent, { config::GATT_CLIENT_EVENT_QUEUE_SIZE }>,
    cancelled: BlockingMutex<M, Cell<bool>>,
    cancel: Signal<M, ()>,
}

impl<'reference, T: AttTransport, M: RawMutex, const MTU: usize> GattClient<'reference, T, M, MTU> {
    /// Creates a GATT client operating on a peer over the given bearer.
    pub fn new(bearer: &'reference AttBearer<T, M, MTU>) -> Self {
        Self {
            bearer,
            mirror: RefCell::new(Mirror::new()),
            notifications: PubSubChannel::new(),
            subscriptions: core::array::from_fn(|_| AtomicU16::new(0)),
            indication_acks: Channel::new(),
            events: Channel::new(),
            cancelled: BlockingMutex::new(Cell::new(false)),
            cancel: Signal::new(),
        }
    }

    /// Cancel every in-flight and future operation on this client.
    ///
    /// Pending operations resolve with `Cancelled`. The bearer is left
    /// untouched; only this client becomes unusable.
    pub fn cancel(&self) {
        self.cancelled.lock(|c| c.set(true));
        self.cancel.signal(());
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.lock(|c| c.get())
    }

    /// Perform a gatt request and return the response.
    async fn request(&self, req: AttReq<'_>) -> Result<Pdu<MTU>, BleHostError<T::Error>> {
        if self.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        let rsp = match select(self.bearer.send_request(&req), self.cancel.wait()).await {
            Either::First(rsp) => rsp,
            Either::Second(()) => {
                // Wake any other caller parked on the same token.
                self.cancel.signal(());
                return Err(Error::Cancelled.into());
            }
        };
        if self.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        rsp
    }

    /// Whether a full discovery has completed on this bearer.
    pub fn is_ready(&self) -> bool {
        self.mirror.borrow().ready
    }

    /// The mirrored services, in handle order.
    pub fn services(&self) -> Vec<ServiceHandle, { config::GATT_CLIENT_MAX_SERVICES }> {
        self.mirror.borrow().services.clone()
    }

    /// The mirrored characteristics of a service, in handle order.
    pub fn characteristics(
        &self,
        service: &ServiceHandle,
    ) -> Vec<RemoteCharacteristic, { config::GATT_CLIENT_MAX_CHARACTERISTICS }> {
        let mirror = self.mirror.borrow();
        let mut out = Vec::new();
        for chr in mirror
            .characteristics
            .iter()
            .filter(|c| c.decl_handle >= service.start() && c.decl_handle <= service.end())
        {
            if out.push(chr.clone()).is_err() {
                break;
            }
        }
        out
    }

    /// The mirrored descriptors of a characteristic, in handle order.
    pub fn descriptors(
        &self,
        characteristic: &RemoteCharacteristic,
    ) -> Vec<RemoteDescriptor, { config::GATT_CLIENT_MAX_DESCRIPTORS }> {
        let mirror = self.mirror.borrow();
        let mut out = Vec::new();
        for desc in mirror
            .descriptors
            .iter()
            .filter(|d| d.characteristic == characteristic.handle)
        {
            if out.push(desc.clone()).is_err() {
                break;
            }
        }
        out
    }

    /// The mirrored included services of a service, in handle order.
    pub fn includes(&self, service: &ServiceHandle) -> Vec<RemoteInclude, { config::GATT_CLIENT_MAX_INCLUDES }> {
        let mirror = self.mirror.borrow();
        let mut out = Vec::new();
        for inc in mirror.includes.iter().filter(|i| i.service == service.start()) {
            if out.push(inc.clone()).is_err() {
                break;
            }
        }
        out
    }

    /// Next service change event.
    pub async fn next_event(&self) -> ServiceEvent {
        self.events.receive().await
    }

    fn emit(&self, event: ServiceEvent) {
        if self.events.try_send(event).is_err() {
            warn!("[gatt] event queue full, dropping service event");
        }
    }

    /// Mirror the peer's database.
    ///
    /// Runs MTU exchange (once per bearer), then discovers primary and
    /// secondary services, included services, characteristics and
    /// descriptors, and finally subscribes to Service Changed indications.
    /// Emits an `Added` event per discovered service when the mirror is
    /// complete.
    pub async fn discover(&self) -> Result<(), BleHostError<T::Error>> {
        if self.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        match select(self.bearer.exchange_mtu(), self.cancel.wait()).await {
            Either::First(r) => r?,
            Either::Second(()) => {
                self.cancel.signal(());
                return Err(Error::Cancelled.into());
            }
        };

        {
            let mut mirror = self.mirror.borrow_mut();
            *mirror = Mirror::new();
        }

        self.discover_range(0x0001, 0xffff).await?;
        self.subscribe_service_changed().await?;

        let services = {
            let mut mirror = self.mirror.borrow_mut();
            mirror.ready = true;
            mirror.services.clone()
        };
        for svc in &services {
            self.emit(ServiceEvent::Added(svc.clone()));
        }
        debug!("[gatt] discovery ready, {} services", services.len());
        Ok(())
    }

    /// Discover everything within a handle range, appending to the mirror.
    async fn discover_range(&self, range_start: u16, range_end: u16) -> Result<(), BleHostError<T::Error>> {
        self.discover_services(range_start, range_end, true).await?;
        self.discover_services(range_start, range_end, false).await?;
        self.mirror.borrow_mut().sort();

        let discovered: Vec<ServiceHandle, { config::GATT_CLIENT_MAX_SERVICES }> = {
            let mirror = self.mirror.borrow();
            let mut out = Vec::new();
            for svc in mirror
                .services
                .iter()
                .filter(|s| s.start >= range_start && s.start <= range_end)
            {
                let _ = out.push(svc.clone());
            }
            out
        };

        // All of one service is mirrored before the next one starts.
        for svc in &discovered {
            self.discover_includes(svc).await?;
            self.discover_characteristics(svc).await?;
            let chars = self.characteristics(svc);
            for chr in &chars {
                self.discover_descriptors(chr).await?;
            }
        }
        self.mirror.borrow_mut().sort();
        Ok(())
    }

    /// Discover primary or secondary services with Read By Group Type paging.
    async fn discover_services(&self, range_start: u16, range_end: u16, primary: bool) -> Result<(), BleHostError<T::Error>> {
        let group_type = if primary {
            PRIMARY_SERVICE_UUID16
        } else {
            SECONDARY_SERVICE_UUID16
        };
        let mut start = range_start;
        loop {
            let data = AttReq::ReadByGroupType {
                start,
                end: range_end,
                group_type: group_type.clone(),
            };
            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::ReadByGroupType { mut it } => {
                    let mut last_end: u16 = 0;
                    while let Some(res) = it.next() {
                        let (svc_start, svc_end, value) = res?;
                        let uuid = Uuid::try_from_slice(value).map_err(|_| Error::Malformed)?;
                        last_end = svc_end;
                        self.mirror
                            .borrow_mut()
                            .services
                            .push(ServiceHandle {
                                start: svc_start,
                                end: svc_end,
                                uuid,
                                primary,
                            })
                            .map_err(|_| Error::InsufficientSpace)?;
                    }
                    if last_end >= range_end || last_end == 0xffff {
                        break;
                    }
                    start = last_end + 1;
                }
                AttRsp::Error { code, handle, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att { code, handle }.into());
                }
                _ => {
                    return Err(Error::InvalidResponse.into());
                }
            }
        }
        Ok(())
    }

    /// Discover the include declarations of a service.
    async fn discover_includes(&self, service: &ServiceHandle) -> Result<(), BleHostError<T::Error>> {
        let mut start = service.start();
        loop {
            let data = AttReq::ReadByType {
                start,
                end: service.end(),
                attribute_type: INCLUDE_SERVICE_UUID16,
            };
            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::ReadByType { mut it } => {
                    while let Some(res) = it.next() {
                        let (handle, value) = res?;
                        let mut r = ReadCursor::new(value);
                        let inc_start: u16 = r.read().map_err(|_| Error::Malformed)?;
                        let inc_end: u16 = r.read().map_err(|_| Error::Malformed)?;
                        let rest = r.remaining();
                        let uuid = if rest.is_empty() {
                            // A 128-bit included service carries no inline
                            // UUID; read the included declaration itself.
                            self.read_service_uuid(inc_start).await?
                        } else {
                            Uuid::try_from_slice(rest).map_err(|_| Error::Malformed)?
                        };
                        self.mirror
                            .borrow_mut()
                            .includes
                            .push(RemoteInclude {
                                handle,
                                start: inc_start,
                                end: inc_end,
                                uuid,
                                service: service.start(),
                            })
                            .map_err(|_| Error::InsufficientSpace)?;
                        if handle >= service.end() {
                            return Ok(());
                        }
                        start = handle + 1;
                    }
                }
                AttRsp::Error { code, handle, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att { code, handle }.into());
                }
                _ => {
                    return Err(Error::InvalidResponse.into());
                }
            }
        }
        Ok(())
    }

    /// Read the UUID of a service from its declaration attribute.
    async fn read_service_uuid(&self, handle: u16) -> Result<Uuid, BleHostError<T::Error>> {
        let pdu = self.request(AttReq::Read { handle }).await?;
        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::Read { data } => Uuid::try_from_slice(data).map_err(|_| Error::Malformed.into()),
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Discover the characteristics of a service.
    async fn discover_characteristics(&self, service: &ServiceHandle) -> Result<(), BleHostError<T::Error>> {
        let mut start = service.start();
        loop {
            let data = AttReq::ReadByType {
                start,
                end: service.end(),
                attribute_type: CHARACTERISTIC_UUID16,
            };
            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::ReadByType { mut it } => {
                    let mut last: u16 = 0;
                    while let Some(res) = it.next() {
                        let (handle, item) = res?;
                        if item.len() < 5 {
                            return Err(Error::InvalidValue.into());
                        }
                        if let AttributeData::Declaration {
                            props,
                            handle: value_handle,
                            uuid,
                        } = AttributeData::decode_declaration(item)?
                        {
                            self.mirror
                                .borrow_mut()
                                .characteristics
                                .push(RemoteCharacteristic {
                                    decl_handle: handle,
                                    handle: value_handle,
                                    end: service.end(),
                                    uuid,
                                    props,
                                    cccd_handle: None,
                                })
                                .map_err(|_| Error::InsufficientSpace)?;
                            last = handle;
                        } else {
                            return Err(Error::InvalidValue.into());
                        }
                    }
                    if last >= service.end() || last == 0 {
                        break;
                    }
                    start = last + 1;
                }
                AttRsp::Error { code, handle, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att { code, handle }.into());
                }
                _ => {
                    return Err(Error::InvalidResponse.into());
                }
            }
        }

        // A characteristic's descriptors end where the next declaration (or
        // the service) ends.
        let mut mirror = self.mirror.borrow_mut();
        mirror.characteristics.sort_unstable_by_key(|c| c.decl_handle);
        let mut next_decl = None;
        for chr in mirror
            .characteristics
            .iter_mut()
            .rev()
            .filter(|c| c.decl_handle >= service.start() && c.decl_handle <= service.end())
        {
            chr.end = match next_decl {
                Some(decl) => decl - 1,
                None => service.end(),
            };
            next_decl = Some(chr.decl_handle);
        }
        Ok(())
    }

    /// Discover the descriptors of a characteristic with Find Information.
    async fn discover_descriptors(&self, characteristic: &RemoteCharacteristic) -> Result<(), BleHostError<T::Error>> {
        let mut start = characteristic.handle + 1;
        let end = characteristic.end;
        while start <= end {
            let data = AttReq::FindInformation {
                start_handle: start,
                end_handle: end,
            };
            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::FindInformation { mut it } => {
                    let mut last: u16 = 0;
                    while let Some(res) = it.next() {
                        let (handle, uuid) = res?;
                        let mut mirror = self.mirror.borrow_mut();
                        if uuid == CHARACTERISTIC_CCCD_UUID16 {
                            for chr in mirror.characteristics.iter_mut() {
                                if chr.handle == characteristic.handle {
                                    chr.cccd_handle = Some(handle);
                                }
                            }
                        }
                        mirror
                            .descriptors
                            .push(RemoteDescriptor {
                                handle,
                                uuid,
                                characteristic: characteristic.handle,
                            })
                            .map_err(|_| Error::InsufficientSpace)?;
                        last = handle;
                    }
                    if last >= end || last == 0 {
                        break;
                    }
                    start = last + 1;
                }
                AttRsp::Error { code, handle, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att { code, handle }.into());
                }
                _ => {
                    return Err(Error::InvalidResponse.into());
                }
            }
        }
        Ok(())
    }

    /// Enable Service Changed indications if the peer exposes them.
    async fn subscribe_service_changed(&self) -> Result<(), BleHostError<T::Error>> {
        let sc = {
            let mirror = self.mirror.borrow();
            mirror
                .characteristics
                .iter()
                .find(|c| {
                    c.uuid == CHARACTERISTIC_SERVICE_CHANGED_UUID16 && c.props.any(&[CharacteristicProp::Indicate])
                })
                .cloned()
        };
        let Some(sc) = sc else {
            return Ok(());
        };
        let Some(cccd) = sc.cccd_handle else {
            return Ok(());
        };
        let data = AttReq::Write {
            handle: cccd,
            data: &u16::to_le_bytes(0x0002),
        };
        let pdu = self.request(data).await?;
        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::Write => {
                self.mirror.borrow_mut().service_changed_handle = Some(sc.handle);
                Ok(())
            }
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Discover primary services associated with a UUID, without mirroring.
    pub async fn services_by_uuid(
        &self,
        uuid: &Uuid,
    ) -> Result<Vec<ServiceHandle, { config::GATT_CLIENT_MAX_SERVICES }>, BleHostError<T::Error>> {
        let mut start: u16 = 0x0001;
        let mut result = Vec::new();

        loop {
            let data = AttReq::FindByTypeValue {
                start_handle: start,
                end_handle: 0xffff,
                att_type: PRIMARY_SERVICE_UUID16.as_short(),
                att_value: uuid.as_raw(),
            };

            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::Error { code, handle, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att { code, handle }.into());
                }
                AttRsp::FindByTypeValue { mut it } => {
                    let mut end: u16 = 0;
                    while let Some(res) = it.next() {
                        let (handle, e) = res?;
                        end = e;
                        result
                            .push(ServiceHandle {
                                start: handle,
                                end,
                                uuid: uuid.clone(),
                                primary: true,
                            })
                            .map_err(|_| Error::InsufficientSpace)?;
                    }
                    if end == 0xFFFF {
                        break;
                    }
                    start = end + 1;
                }
                _ => {
                    return Err(Error::InvalidResponse.into());
                }
            }
        }

        Ok(result)
    }

    /// Discover a characteristic in a given service using a UUID, without
    /// mirroring.
    pub async fn characteristic_by_uuid(
        &self,
        service: &ServiceHandle,
        uuid: &Uuid,
    ) -> Result<Characteristic, BleHostError<T::Error>> {
        let mut start: u16 = service.start();
        loop {
            let data = AttReq::ReadByType {
                start,
                end: service.end(),
                attribute_type: CHARACTERISTIC_UUID16,
            };
            let pdu = self.request(data).await?;

            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::ReadByType { mut it } => {
                    while let Some(Ok((_handle, item))) = it.next() {
                        if item.len() < 5 {
                            return Err(Error::InvalidValue.into());
                        }
                        if let AttributeData::Declaration {
                            props,
                            handle,
                            uuid: decl_uuid,
                        } = AttributeData::decode_declaration(item)?
                        {
                            if *uuid == decl_uuid {
                                // "notify" and "indicate" characteristic properties
                                let cccd_handle =
                                    if props.any(&[CharacteristicProp::Indicate, CharacteristicProp::Notify]) {
                                        Some(self.get_characteristic_cccd(handle).await?.0)
                                    } else {
                                        None
                                    };

                                return Ok(Characteristic { handle, cccd_handle });
                            }

                            if handle == 0xFFFF {
                                return Err(Error::NotFound.into());
                            }
                            start = handle + 1;
                        } else {
                            return Err(Error::InvalidValue.into());
                        }
                    }
                }
                AttRsp::Error { code, handle, .. } => return Err(Error::Att { code, handle }.into()),
                _ => {
                    return Err(Error::InvalidResponse.into());
                }
            }
        }
    }

    async fn get_characteristic_cccd(&self, char_handle: u16) -> Result<(u16, CCCD), BleHostError<T::Error>> {
        let data = AttReq::ReadByType {
            start: char_handle,
            end: char_handle + 1,
            attribute_type: CHARACTERISTIC_CCCD_UUID16,
        };

        let pdu = self.request(data).await?;

        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::ReadByType { mut it } => {
                if let Some(Ok((handle, item))) = it.next() {
                    Ok((
                        handle,
                        CCCD(u16::from_le_bytes(item.try_into().map_err(|_| Error::InvalidValue)?)),
                    ))
                } else {
                    Err(Error::NotFound.into())
                }
            }
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidValue.into()),
        }
    }

    /// Read a characteristic described by a handle.
    ///
    /// The number of bytes copied into the provided buffer is returned,
    /// up to MTU-1 bytes. Longer values are read with
    /// [`read_long_characteristic`](Self::read_long_characteristic).
    pub async fn read_characteristic(
        &self,
        characteristic: &Characteristic,
        dest: &mut [u8],
    ) -> Result<usize, BleHostError<T::Error>> {
        let data = AttReq::Read {
            handle: characteristic.handle,
        };

        let pdu = self.request(data).await?;

        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::Read { data } => {
                let to_copy = data.len().min(dest.len());
                dest[..to_copy].copy_from_slice(&data[..to_copy]);
                Ok(to_copy)
            }
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Read a characteristic of any length, following up with Read Blob
    /// requests until the value is exhausted or `dest` is full.
    pub async fn read_long_characteristic(
        &self,
        characteristic: &Characteristic,
        dest: &mut [u8],
    ) -> Result<usize, BleHostError<T::Error>> {
        let page = self.bearer.mtu() as usize - 1;
        let mut total = self.read_characteristic(characteristic, dest).await?;

        // A response shorter than MTU-1 means the value is complete.
        while total % page == 0 && total > 0 && total < dest.len() {
            let data = AttReq::ReadBlob {
                handle: characteristic.handle,
                offset: total as u16,
            };
            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::ReadBlob { data } => {
                    let to_copy = data.len().min(dest.len() - total);
                    dest[total..total + to_copy].copy_from_slice(&data[..to_copy]);
                    total += to_copy;
                    if data.len() < page {
                        break;
                    }
                }
                AttRsp::Error { code, .. }
                    if code == AttErrorCode::InvalidOffset || code == AttErrorCode::AttributeNotLong =>
                {
                    break;
                }
                AttRsp::Error { code, handle, .. } => return Err(Error::Att { code, handle }.into()),
                _ => return Err(Error::InvalidResponse.into()),
            }
        }
        Ok(total)
    }

    /// Write to a characteristic described by a handle.
    ///
    /// Values longer than MTU-3 are written with a reliable long write.
    pub async fn write_characteristic(
        &self,
        handle: &Characteristic,
        buf: &[u8],
    ) -> Result<(), BleHostError<T::Error>> {
        if buf.len() > self.bearer.mtu() as usize - 3 {
            return self.write_long_characteristic(handle, buf, true).await;
        }
        let data = AttReq::Write {
            handle: handle.handle,
            data: buf,
        };

        let pdu = self.request(data).await?;
        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::Write => Ok(()),
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Write to a characteristic without expecting a response.
    pub async fn write_without_response(
        &self,
        handle: &Characteristic,
        buf: &[u8],
    ) -> Result<(), BleHostError<T::Error>> {
        if self.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        self.bearer
            .send_command(&AttReq::WriteCmd {
                handle: handle.handle,
                data: buf,
            })
            .await
    }

    /// Write a long value with a Prepare Write queue and Execute Write.
    ///
    /// With `reliable`, each echoed chunk is verified byte-exact; a mismatch
    /// cancels the queue and fails with `ReliableWriteMismatch`, leaving the
    /// attribute unchanged.
    pub async fn write_long_characteristic(
        &self,
        handle: &Characteristic,
        buf: &[u8],
        reliable: bool,
    ) -> Result<(), BleHostError<T::Error>> {
        let chunk = self.bearer.mtu() as usize - 5;
        let mut offset = 0;
        while offset < buf.len() {
            let part = &buf[offset..(offset + chunk).min(buf.len())];
            let data = AttReq::PrepareWrite {
                handle: handle.handle,
                offset: offset as u16,
                value: part,
            };
            let pdu = self.request(data).await?;
            match AttRsp::decode(pdu.as_ref())? {
                AttRsp::PrepareWrite {
                    handle: echo_handle,
                    offset: echo_offset,
                    value,
                } => {
                    if reliable && (echo_handle != handle.handle || echo_offset != offset as u16 || value != part) {
                        warn!("[gatt] reliable write echo mismatch at offset {}", offset);
                        self.execute_write(false).await?;
                        return Err(Error::ReliableWriteMismatch.into());
                    }
                }
                AttRsp::Error { code, handle, .. } => return Err(Error::Att { code, handle }.into()),
                _ => return Err(Error::InvalidResponse.into()),
            }
            offset += part.len();
        }
        self.execute_write(true).await
    }

    async fn execute_write(&self, apply: bool) -> Result<(), BleHostError<T::Error>> {
        let data = AttReq::ExecuteWrite {
            flags: if apply { 0x01 } else { 0x00 },
        };
        let pdu = self.request(data).await?;
        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::ExecuteWrite => Ok(()),
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Subscribe to indication/notification of a given Characteristic
    ///
    /// A listener is returned, which has a `next()` method
    pub async fn subscribe(
        &self,
        characteristic: &Characteristic,
        indication: bool,
    ) -> Result<NotificationListener<'_, MTU>, BleHostError<T::Error>> {
        let properties = u16::to_le_bytes(if indication { 0x02 } else { 0x01 });

        let data = AttReq::Write {
            handle: characteristic.cccd_handle.ok_or(Error::NotSupported)?,
            data: &properties,
        };

        // set the CCCD
        let pdu = self.request(data).await?;

        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::Write => {
                let slot = self
                    .subscriptions
                    .iter()
                    .find(|s| s.load(Ordering::Relaxed) == 0)
                    .ok_or(Error::InsufficientSpace)?;
                let listener = self
                    .notifications
                    .dyn_subscriber()
                    .map_err(|_| Error::InsufficientSpace)?;
                slot.store(characteristic.handle, Ordering::Relaxed);
                Ok(NotificationListener {
                    listener,
                    handle: characteristic.handle,
                    acks: self.indication_acks.sender().into(),
                    slot,
                    pending_ack: false,
                })
            }
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    /// Unsubscribe from a given Characteristic
    pub async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<(), BleHostError<T::Error>> {
        let data = AttReq::Write {
            handle: characteristic.cccd_handle.ok_or(Error::NotSupported)?,
            data: &[0, 0],
        };

        // set the CCCD
        let pdu = self.request(data).await?;

        match AttRsp::decode(pdu.as_ref())? {
            AttRsp::Write => Ok(()),
            AttRsp::Error { code, handle, .. } => Err(Error::Att { code, handle }.into()),
            _ => Err(Error::InvalidResponse.into()),
        }
    }

    fn make_notification(&self, handle: u16, indicated: bool, value: &[u8]) -> Notification<MTU> {
        let mut data = [0; MTU];
        let to_copy = data.len().min(value.len());
        data[..to_copy].copy_from_slice(&value[..to_copy]);
        Notification {
            handle,
            indicated,
            data,
            len: to_copy,
        }
    }

    /// Fan a received notification out to the subscribed listeners.
    fn dispatch_notification(&self, handle: u16, value: &[u8]) {
        self.notifications
            .immediate_publisher()
            .publish_immediate(self.make_notification(handle, false, value));
    }

    /// Fan a received indication out and wait until every subscriber of the
    /// handle has returned the value.
    async fn dispatch_indication(&self, handle: u16, value: &[u8]) {
        // Acks left behind by listeners dropped since the last indication.
        while self.indication_acks.try_receive().is_ok() {}
        let expected = self
            .subscriptions
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) == handle)
            .count();
        match self.notifications.dyn_publisher() {
            Ok(publisher) => publisher.publish(self.make_notification(handle, true, value)).await,
            Err(_) => return,
        }
        for _ in 0..expected {
            self.indication_acks.receive().await;
        }
    }

    /// Invalidate and rediscover a handle range after a Service Changed
    /// indication, emitting the resulting events.
    async fn handle_service_changed(&self, start: u16, end: u16) -> Result<(), BleHostError<T::Error>> {
        debug!("[gatt] service changed [{:04x}..{:04x}], rediscovering", start, end);
        let before: Vec<ServiceHandle, { config::GATT_CLIENT_MAX_SERVICES }> = {
            let mut mirror = self.mirror.borrow_mut();
            let mut out = Vec::new();
            for svc in mirror.services.iter().filter(|s| s.end >= start && s.start <= end) {
                let _ = out.push(svc.clone());
            }
            mirror.clear_range(start, end);
            out
        };

        self.discover_range(start, end).await?;

        let after: Vec<ServiceHandle, { config::GATT_CLIENT_MAX_SERVICES }> = {
            let mirror = self.mirror.borrow();
            let mut out = Vec::new();
            for svc in mirror.services.iter().filter(|s| s.end >= start && s.start <= end) {
                let _ = out.push(svc.clone());
            }
            out
        };

        for old in &before {
            if after.iter().any(|s| s == old) {
                self.emit(ServiceEvent::Changed(old.clone()));
            } else {
                self.emit(ServiceEvent::Removed(old.clone()));
            }
        }
        for new in &after {
            if !before.iter().any(|s| s == new) {
                self.emit(ServiceEvent::Added(new.clone()));
            }
        }
        Ok(())
    }

    /// Task which handles GATT rx data (needed for notifications to work)
    pub async fn task(&self) -> Result<(), BleHostError<T::Error>> {
        loop {
            let pdu = self.bearer.next_unsolicited().await;
            match AttUns::decode(pdu.as_ref()) {
                Ok(AttUns::Notify { handle, data }) => {
                    self.dispatch_notification(handle, data);
                }
                Ok(AttUns::Indicate { handle, data }) => {
                    // The confirmation goes out only after every subscriber
                    // has returned the value.
                    self.dispatch_indication(handle, data).await;
                    self.bearer.confirm().await?;

                    let service_changed = self.mirror.borrow().service_changed_handle == Some(handle);
                    if service_changed && data.len() == 4 {
                        let start = u16::from_le_bytes([data[0], data[1]]);
                        let end = u16::from_le_bytes([data[2], data[3]]);
                        self.handle_service_changed(start, end).await?;
                    }
                }
                Err(e) => {
                    warn!("[gatt] malformed value push: {:?}", e);
                    self.bearer.close(Error::Malformed);
                    return Err(Error::Malformed.into());
                }
            }
        }
    }
}
