//! Attribute database: handle-indexed table with grouping and permissions.
use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};

use crate::att::AttErrorCode;
use crate::attribute_server::AttrHandler;
use crate::cursor::WriteCursor;
pub use crate::types::security::SecurityLevel;
pub use crate::types::uuid::Uuid;
use crate::Error;

/// UUID for generic access service
pub const GENERIC_ACCESS_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x1800u16.to_le_bytes());

/// UUID for device name characteristic
pub const CHARACTERISTIC_DEVICE_NAME_UUID16: Uuid = Uuid::Uuid16(0x2A00u16.to_le_bytes());

/// UUID for appearance characteristic
pub const CHARACTERISTIC_APPEARANCE_UUID16: Uuid = Uuid::Uuid16(0x2A01u16.to_le_bytes());

/// UUID for generic attribute service
pub const GENERIC_ATTRIBUTE_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x1801u16.to_le_bytes());

/// UUID for the service changed characteristic
pub const CHARACTERISTIC_SERVICE_CHANGED_UUID16: Uuid = Uuid::Uuid16(0x2A05u16.to_le_bytes());

/// UUID for primary service
pub const PRIMARY_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x2800u16.to_le_bytes());

/// UUID for secondary service
pub const SECONDARY_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x2801u16.to_le_bytes());

/// UUID for include service
pub const INCLUDE_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x2802u16.to_le_bytes());

/// UUID for characteristic declaration
pub const CHARACTERISTIC_UUID16: Uuid = Uuid::Uuid16(0x2803u16.to_le_bytes());

/// UUID for characteristic extended properties descriptor
pub const CHARACTERISTIC_EXTENDED_PROPERTIES_UUID16: Uuid = Uuid::Uuid16(0x2900u16.to_le_bytes());

/// UUID for characteristic user description descriptor
pub const CHARACTERISTIC_USER_DESCRIPTION_UUID16: Uuid = Uuid::Uuid16(0x2901u16.to_le_bytes());

/// UUID for characteristic notification/indication configuration
pub const CHARACTERISTIC_CCCD_UUID16: Uuid = Uuid::Uuid16(0x2902u16.to_le_bytes());

/// UUID for characteristic presentation format descriptor
pub const CHARACTERISTIC_PRESENTATION_FORMAT_UUID16: Uuid = Uuid::Uuid16(0x2904u16.to_le_bytes());

/// Characteristic properties
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CharacteristicProp {
    /// Broadcast
    Broadcast = 0x01,
    /// Read
    Read = 0x02,
    /// Write without response
    WriteWithoutResponse = 0x04,
    /// Write
    Write = 0x08,
    /// Notify
    Notify = 0x10,
    /// Indicate
    Indicate = 0x20,
    /// Authenticated writes
    AuthenticatedWrite = 0x40,
    /// Extended properties
    Extended = 0x80,
}

/// Access permissions of an attribute.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum AttributePerm {
    /// Readable.
    Read = 0x0001,
    /// Writable.
    Write = 0x0002,
    /// Readable only over an encrypted link.
    ReadEncrypted = 0x0004,
    /// Writable only over an encrypted link.
    WriteEncrypted = 0x0008,
    /// Readable only over an authenticated link.
    ReadAuthenticated = 0x0010,
    /// Writable only over an authenticated link.
    WriteAuthenticated = 0x0020,
    /// Readable only with application-level authorization.
    ReadAuthorized = 0x0040,
    /// Writable only with application-level authorization.
    WriteAuthorized = 0x0080,
}

/// Permission set of an attribute.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttributePerms(u16);

impl AttributePerms {
    const fn contains(&self, perm: AttributePerm) -> bool {
        self.0 & perm as u16 != 0
    }

    pub(crate) fn readable(&self) -> bool {
        self.contains(AttributePerm::Read)
    }

    pub(crate) fn writable(&self) -> bool {
        self.contains(AttributePerm::Write)
    }

    /// Check read access for a bearer at the given security level, mapping
    /// each missing requirement to its ATT error code.
    pub fn check_read(&self, security: SecurityLevel, authorized: bool) -> Result<(), AttErrorCode> {
        if !self.readable() {
            return Err(AttErrorCode::ReadNotPermitted);
        }
        if self.contains(AttributePerm::ReadAuthenticated) && !security.authenticated() {
            return Err(AttErrorCode::InsufficientAuthentication);
        }
        if self.contains(AttributePerm::ReadEncrypted) && !security.encrypted() {
            return Err(AttErrorCode::InsufficientEncryption);
        }
        if self.contains(AttributePerm::ReadAuthorized) && !authorized {
            return Err(AttErrorCode::InsufficientAuthorization);
        }
        Ok(())
    }

    /// Check write access, as [`check_read`](Self::check_read) for writes.
    pub fn check_write(&self, security: SecurityLevel, authorized: bool) -> Result<(), AttErrorCode> {
        if !self.writable() {
            return Err(AttErrorCode::WriteNotPermitted);
        }
        if self.contains(AttributePerm::WriteAuthenticated) && !security.authenticated() {
            return Err(AttErrorCode::InsufficientAuthentication);
        }
        if self.contains(AttributePerm::WriteEncrypted) && !security.encrypted() {
            return Err(AttErrorCode::InsufficientEncryption);
        }
        if self.contains(AttributePerm::WriteAuthorized) && !authorized {
            return Err(AttErrorCode::InsufficientAuthorization);
        }
        Ok(())
    }
}

impl<'a> From<&'a [AttributePerm]> for AttributePerms {
    fn from(perms: &'a [AttributePerm]) -> Self {
        let mut val: u16 = 0;
        for perm in perms {
            val |= *perm as u16;
        }
        AttributePerms(val)
    }
}

impl<const T: usize> From<[AttributePerm; T]> for AttributePerms {
    fn from(perms: [AttributePerm; T]) -> Self {
        let mut val: u16 = 0;
        for perm in perms {
            val |= perm as u16;
        }
        AttributePerms(val)
    }
}

/// Attribute metadata.
pub struct Attribute {
    pub(crate) uuid: Uuid,
    pub(crate) handle: u16,
    pub(crate) last_handle_in_group: u16,
    pub(crate) perms: AttributePerms,
    pub(crate) active: bool,
    pub(crate) data: AttributeData,
}

impl Attribute {
    const EMPTY: Option<Attribute> = None;

    pub(crate) const fn new(uuid: Uuid, perms: AttributePerms, data: AttributeData) -> Attribute {
        Attribute {
            uuid,
            handle: 0,
            last_handle_in_group: 0xffff,
            perms,
            active: true,
            data,
        }
    }
}

pub(crate) struct AttrDataHandler<'a, T> {
    uuid: &'a Uuid,
    handle: u16,
    handler: T,
}

impl<'a, T> AttrDataHandler<'a, T>
where
    T: AttrHandler,
{
    pub(crate) const fn new(rw: T, uuid: &'a Uuid, handle: u16) -> Self {
        AttrDataHandler {
            uuid,
            handle,
            handler: rw,
        }
    }

    pub(crate) async fn read(&mut self, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        self.handler.read(self.uuid, self.handle, offset, data).await
    }

    pub(crate) async fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        self.handler.write(self.uuid, self.handle, offset, data).await
    }
}

pub(crate) enum AttributeData {
    Service {
        uuid: Uuid,
    },
    IncludedService {
        start: u16,
        end: u16,
        uuid: Uuid,
    },
    ReadOnlyData {
        props: CharacteristicProps,
    },
    Data {
        props: CharacteristicProps,
    },
    Declaration {
        props: CharacteristicProps,
        handle: u16,
        uuid: Uuid,
    },
    /// Client characteristic configuration. The per-peer value lives in the
    /// attribute server, not in the table.
    Cccd,
}

fn serve_value(value: &[u8], offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
    if offset > value.len() {
        return Err(AttErrorCode::InvalidOffset);
    }
    let len = data.len().min(value.len() - offset);
    data[..len].copy_from_slice(&value[offset..offset + len]);
    Ok(len)
}

impl AttributeData {
    /// Whether the attribute value is served by the registered handler.
    pub(crate) fn is_value(&self) -> bool {
        matches!(self, Self::ReadOnlyData { .. } | Self::Data { .. })
    }

    pub(crate) async fn read<T>(
        &self,
        offset: usize,
        data: &mut [u8],
        read: &mut AttrDataHandler<'_, T>,
    ) -> Result<usize, AttErrorCode>
    where
        T: AttrHandler,
    {
        match self {
            Self::ReadOnlyData { .. } | Self::Data { .. } => read.read(offset, data).await,
            Self::Service { uuid } => serve_value(uuid.as_raw(), offset, data),
            Self::IncludedService { start, end, uuid } => {
                let mut tmp = [0u8; 6];
                let mut w = WriteCursor::new(&mut tmp);
                w.write(*start)?;
                w.write(*end)?;
                // The UUID is inlined only when it has a 16-bit form.
                if uuid.is_short() {
                    w.write_ref(uuid)?;
                }
                let len = w.len();
                serve_value(&tmp[..len], offset, data)
            }
            Self::Declaration { props, handle, uuid } => {
                let mut tmp = [0u8; 19];
                let mut w = WriteCursor::new(&mut tmp);
                w.write(props.0)?;
                w.write(*handle)?;
                w.append(uuid.as_raw())?;
                let len = w.len();
                serve_value(&tmp[..len], offset, data)
            }
            Self::Cccd => Err(AttErrorCode::UnlikelyError),
        }
    }

    pub(crate) async fn write<T>(
        &mut self,
        offset: usize,
        data: &[u8],
        write: &mut AttrDataHandler<'_, T>,
    ) -> Result<(), AttErrorCode>
    where
        T: AttrHandler,
    {
        match self {
            Self::Data { .. } => write.write(offset, data).await,
            _ => Err(AttErrorCode::WriteNotPermitted),
        }
    }

    pub(crate) fn decode_declaration(data: &[u8]) -> Result<Self, Error> {
        let mut r = crate::cursor::ReadCursor::new(data);
        Ok(Self::Declaration {
            props: CharacteristicProps(r.read()?),
            handle: r.read()?,
            uuid: Uuid::try_from_slice(r.remaining()).map_err(|_| Error::Malformed)?,
        })
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("uuid", &self.uuid)
            .field("handle", &self.handle)
            .field("last_handle_in_group", &self.last_handle_in_group)
            .field("readable", &self.perms.readable())
            .field("writable", &self.perms.writable())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Attribute {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", defmt::Debug2Format(self))
    }
}

/// A table of attributes.
pub struct AttributeTable<M: RawMutex, const MAX: usize> {
    inner: Mutex<M, InnerTable<MAX>>,
    handle: u16,
}

pub(crate) struct InnerTable<const MAX: usize> {
    attributes: [Option<Attribute>; MAX],
    len: usize,
}

impl<const MAX: usize> InnerTable<MAX> {
    fn push(&mut self, attribute: Attribute) {
        if self.len == MAX {
            panic!("no space for more attributes")
        }
        self.attributes[self.len].replace(attribute);
        self.len += 1;
    }

    pub(crate) fn attr_iter(&mut self) -> AttributeIterator {
        let len = self.len;

        AttributeIterator {
            attributes: &mut self.attributes[..],
            pos: 0,
            len,
        }
    }
}

impl<M: RawMutex, const MAX: usize> Default for AttributeTable<M, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const MAX: usize> AttributeTable<M, MAX> {
    /// Create a new GATT table.
    pub const fn new() -> Self {
        Self {
            handle: 1,
            inner: Mutex::new(InnerTable {
                len: 0,
                attributes: [Attribute::EMPTY; MAX],
            }),
        }
    }

    pub(crate) fn with_inner<F: FnMut(&mut InnerTable<MAX>)>(&mut self, mut f: F) {
        // `try_lock` will always succeed since we have a `&mut` ref to ourselves
        let mut table = self.inner.try_lock().unwrap();
        f(&mut table);
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, M, InnerTable<MAX>> {
        self.inner.lock().await
    }

    fn push(&mut self, mut attribute: Attribute) -> u16 {
        let handle = self.handle;
        attribute.handle = handle;
        // `try_lock` will always succeed since we have a `&mut` ref to ourselves
        self.inner.try_lock().unwrap().push(attribute);
        self.handle += 1;
        handle
    }

    /// Add a service to the attribute table (group of characteristics)
    pub fn add_service(&mut self, service: Service) -> ServiceBuilder<'_, M, MAX> {
        let declaration = if service.primary {
            PRIMARY_SERVICE_UUID16
        } else {
            SECONDARY_SERVICE_UUID16
        };
        let primary = service.primary;
        let uuid = service.uuid.clone();
        let start = self.push(Attribute::new(
            declaration,
            [AttributePerm::Read].into(),
            AttributeData::Service { uuid: service.uuid },
        ));
        ServiceBuilder {
            start,
            uuid,
            primary,
            table: self,
        }
    }

    /// Mark a service group active or inactive.
    ///
    /// Inactive services are omitted from discovery and respond to access
    /// with `AttributeNotFound`. Returns whether the state changed.
    pub async fn set_active(&self, service: &ServiceHandle, active: bool) -> bool {
        let mut table = self.lock().await;
        let mut changed = false;
        let mut it = table.attr_iter();
        while let Some(att) = it.next() {
            if att.handle >= service.start && att.handle <= service.end {
                changed |= att.active != active;
                att.active = active;
            }
        }
        changed
    }

    pub(crate) async fn find_characteristic_by_value_handle(&self, handle: u16) -> Result<Characteristic, Error> {
        let mut table = self.lock().await;
        let mut it = table.attr_iter();

        while let Some(att) = it.next() {
            if att.handle == handle {
                // If next is CCCD
                if let Some(next) = it.next() {
                    if let AttributeData::Cccd = &next.data {
                        return Ok(Characteristic {
                            handle,
                            cccd_handle: Some(next.handle),
                        });
                    } else {
                        return Ok(Characteristic {
                            handle,
                            cccd_handle: None,
                        });
                    }
                } else {
                    return Ok(Characteristic {
                        handle,
                        cccd_handle: None,
                    });
                }
            }
        }

        Err(Error::NotFound)
    }

    /// Find a characteristic by the UUID of its value attribute.
    pub async fn characteristic_by_type(&self, uuid: &Uuid) -> Result<Characteristic, Error> {
        let handle = {
            let mut table = self.lock().await;
            let mut it = table.attr_iter();
            let mut found = None;
            while let Some(att) = it.next() {
                if att.data.is_value() && &att.uuid == uuid {
                    found = Some(att.handle);
                    break;
                }
            }
            found.ok_or(Error::NotFound)?
        };
        self.find_characteristic_by_value_handle(handle).await
    }
}

/// Handle to an attribute in the attribute table.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttributeHandle {
    pub(crate) handle: u16,
}

impl From<u16> for AttributeHandle {
    fn from(handle: u16) -> Self {
        Self { handle }
    }
}

/// A service group in an attribute table or a discovered peer database.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Clone)]
pub struct ServiceHandle {
    pub(crate) start: u16,
    pub(crate) end: u16,
    pub(crate) uuid: Uuid,
    pub(crate) primary: bool,
}

impl ServiceHandle {
    /// First handle of the group (the service declaration).
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last handle of the group.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// UUID of the service.
    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    /// Whether the service is primary.
    pub fn primary(&self) -> bool {
        self.primary
    }
}

/// Builder for constructing GATT service definitions.
pub struct ServiceBuilder<'r, M: RawMutex, const MAX: usize> {
    start: u16,
    uuid: Uuid,
    primary: bool,
    table: &'r mut AttributeTable<M, MAX>,
}

impl<'r, M: RawMutex, const MAX: usize> ServiceBuilder<'r, M, MAX> {
    fn add_characteristic_internal(
        &mut self,
        uuid: Uuid,
        props: CharacteristicProps,
        perms: AttributePerms,
        data: AttributeData,
    ) -> CharacteristicBuilder<'_, M, MAX> {
        // First the characteristic declaration
        let next = self.table.handle + 1;
        self.table.push(Attribute::new(
            CHARACTERISTIC_UUID16,
            [AttributePerm::Read].into(),
            AttributeData::Declaration {
                props,
                handle: next,
                uuid: uuid.clone(),
            },
        ));

        // Then the value declaration
        self.table.push(Attribute::new(uuid, perms, data));

        // Add optional CCCD handle
        let cccd_handle = if props.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate]) {
            Some(self.table.push(Attribute::new(
                CHARACTERISTIC_CCCD_UUID16,
                [AttributePerm::Read, AttributePerm::Write].into(),
                AttributeData::Cccd,
            )))
        } else {
            None
        };

        CharacteristicBuilder {
            handle: Characteristic {
                handle: next,
                cccd_handle,
            },
            table: self.table,
        }
    }

    /// Add a characteristic to this service, with its value served by the
    /// registered attribute handler.
    pub fn add_characteristic<U: Into<Uuid>>(
        &mut self,
        uuid: U,
        props: &[CharacteristicProp],
        perms: &[AttributePerm],
    ) -> CharacteristicBuilder<'_, M, MAX> {
        let props = props.into();
        self.add_characteristic_internal(uuid.into(), props, perms.into(), AttributeData::Data { props })
    }

    /// Add a read only characteristic to this service.
    pub fn add_characteristic_ro<U: Into<Uuid>>(&mut self, uuid: U) -> CharacteristicBuilder<'_, M, MAX> {
        let props = [CharacteristicProp::Read].into();
        self.add_characteristic_internal(
            uuid.into(),
            props,
            [AttributePerm::Read].into(),
            AttributeData::ReadOnlyData { props },
        )
    }

    /// Reference another service as an included service of this one.
    pub fn add_included_service(&mut self, included: &ServiceHandle) -> AttributeHandle {
        let handle = self.table.push(Attribute::new(
            INCLUDE_SERVICE_UUID16,
            [AttributePerm::Read].into(),
            AttributeData::IncludedService {
                start: included.start,
                end: included.end,
                uuid: included.uuid.clone(),
            },
        ));
        AttributeHandle { handle }
    }

    /// Finish construction of the service and return its handle range.
    pub fn build(self) -> ServiceHandle {
        ServiceHandle {
            start: self.start,
            end: self.table.handle - 1,
            uuid: self.uuid.clone(),
            primary: self.primary,
        }
    }
}

impl<'r, M: RawMutex, const MAX: usize> Drop for ServiceBuilder<'r, M, MAX> {
    fn drop(&mut self) {
        let start = self.start;
        let last_handle = self.table.handle - 1;
        self.table.with_inner(|inner| {
            let mut it = inner.attr_iter();
            while let Some(att) = it.next() {
                if att.handle >= start {
                    att.last_handle_in_group = last_handle;
                }
            }
        });

        // Jump to next 16-aligned
        self.table.handle = self.table.handle + (0x10 - (self.table.handle % 0x10));
    }
}

/// A characteristic in the attribute table.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Characteristic {
    pub(crate) cccd_handle: Option<u16>,
    pub(crate) handle: u16,
}

impl Characteristic {
    /// Reference a characteristic by its value handle and, when known, the
    /// handle of its CCC descriptor.
    pub const fn from_raw(handle: u16, cccd_handle: Option<u16>) -> Self {
        Self { handle, cccd_handle }
    }

    /// Handle of the characteristic value attribute.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Handle of the client characteristic configuration descriptor, if any.
    pub fn cccd_handle(&self) -> Option<u16> {
        self.cccd_handle
    }
}

/// Builder for characteristics.
pub struct CharacteristicBuilder<'r, M: RawMutex, const MAX: usize> {
    handle: Characteristic,
    table: &'r mut AttributeTable<M, MAX>,
}

impl<'r, M: RawMutex, const MAX: usize> CharacteristicBuilder<'r, M, MAX> {
    fn add_descriptor_internal(&mut self, uuid: Uuid, perms: AttributePerms, data: AttributeData) -> DescriptorHandle {
        let handle = self.table.push(Attribute::new(uuid, perms, data));
        DescriptorHandle { handle }
    }

    /// Add a characteristic descriptor for this characteristic.
    pub fn add_descriptor<U: Into<Uuid>>(
        &mut self,
        uuid: U,
        props: &[CharacteristicProp],
        perms: &[AttributePerm],
    ) -> DescriptorHandle {
        let props = props.into();
        self.add_descriptor_internal(uuid.into(), perms.into(), AttributeData::Data { props })
    }

    /// Add a read only characteristic descriptor for this characteristic.
    pub fn add_descriptor_ro<U: Into<Uuid>>(&mut self, uuid: U) -> DescriptorHandle {
        let props = [CharacteristicProp::Read].into();
        self.add_descriptor_internal(
            uuid.into(),
            [AttributePerm::Read].into(),
            AttributeData::ReadOnlyData { props },
        )
    }

    /// Return the built characteristic.
    pub fn build(self) -> Characteristic {
        self.handle
    }
}

/// Characteristic descriptor handle.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug)]
pub struct DescriptorHandle {
    pub(crate) handle: u16,
}

impl DescriptorHandle {
    /// Handle of the descriptor attribute.
    pub fn handle(&self) -> u16 {
        self.handle
    }
}

/// Iterator over attributes.
pub struct AttributeIterator<'a> {
    attributes: &'a mut [Option<Attribute>],
    pos: usize,
    len: usize,
}

impl<'a> AttributeIterator<'a> {
    /// Return next attribute in iterator.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&mut Attribute> {
        if self.pos < self.len {
            let i = self.attributes[self.pos].as_mut();
            self.pos += 1;
            i
        } else {
            None
        }
    }
}

/// A GATT service.
pub struct Service {
    /// UUID of the service.
    pub uuid: Uuid,
    /// Whether the service is primary.
    pub primary: bool,
}

impl Service {
    /// Create a new primary service with a uuid.
    pub fn new<U: Into<Uuid>>(uuid: U) -> Self {
        Self {
            uuid: uuid.into(),
            primary: true,
        }
    }

    /// Create a new secondary service with a uuid.
    pub fn secondary<U: Into<Uuid>>(uuid: U) -> Self {
        Self {
            uuid: uuid.into(),
            primary: false,
        }
    }
}

/// Properties of a characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicProps(pub(crate) u8);

impl<'a> From<&'a [CharacteristicProp]> for CharacteristicProps {
    fn from(props: &'a [CharacteristicProp]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= *prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl<const T: usize> From<[CharacteristicProp; T]> for CharacteristicProps {
    fn from(props: [CharacteristicProp; T]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl CharacteristicProps {
    /// Check if any of the properties are set.
    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        for p in props {
            if (*p as u8) & self.0 != 0 {
                return true;
            }
        }
        false
    }

    /// The raw properties bitfield as it appears in the declaration.
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// CCCD flag values.
#[derive(Clone, Copy)]
pub enum CCCDFlag {
    /// Notifications enabled.
    Notify = 0x1,
    /// Indications enabled.
    Indicate = 0x2,
}

/// CCCD flag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CCCD(pub(crate) u16);

impl<const T: usize> From<[CCCDFlag; T]> for CCCD {
    fn from(props: [CCCDFlag; T]) -> Self {
        let mut val: u16 = 0;
        for prop in props {
            val |= prop as u16;
        }
        CCCD(val)
    }
}

impl CCCD {
    /// Check if any of the properties are set.
    pub fn any(&self, props: &[CCCDFlag]) -> bool {
        for p in props {
            if (*p as u16) & self.0 != 0 {
                return true;
            }
        }
        false
    }

    /// The raw 2-byte configuration value.
    pub fn raw(&self) -> u16 {
        self.0
    }
}
