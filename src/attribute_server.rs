//! Dispatch of inbound ATT requests against an attribute table.
use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::att::{self, AttErrorCode, AttReq};
use crate::attribute::{
    AttrDataHandler, Attribute, AttributeData, AttributeTable, PRIMARY_SERVICE_UUID16, SECONDARY_SERVICE_UUID16,
};
use crate::codec;
use crate::config;
use crate::cursor::WriteCursor;
use crate::types::security::SecurityLevel;
use crate::types::uuid::Uuid;

/// A callback trait for performing operations on attributes
pub trait AttrHandler {
    /// Read data for an attribute
    ///
    /// # Arguments
    /// - `uuid`: The UUID of the attribute
    /// - `handle`: The handle of the attribute
    /// - `offset`: The offset to read from
    /// - `data`: The buffer to write the data to
    ///
    /// Return the number of bytes read
    async fn read(&mut self, uuid: &Uuid, handle: u16, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode>;

    /// Write data to an attribute
    ///
    /// # Arguments
    /// - `uuid`: The UUID of the attribute
    /// - `handle`: The handle of the attribute
    /// - `offset`: The offset to write to
    /// - `data`: The data to write
    async fn write(&mut self, uuid: &Uuid, handle: u16, offset: usize, data: &[u8]) -> Result<(), AttErrorCode>;
}

impl<T> AttrHandler for &mut T
where
    T: AttrHandler,
{
    async fn read(&mut self, uuid: &Uuid, handle: u16, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        (**self).read(uuid, handle, offset, data).await
    }

    async fn write(&mut self, uuid: &Uuid, handle: u16, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        (**self).write(uuid, handle, offset, data).await
    }
}

/// Per-connection client characteristic configuration state.
///
/// CCC descriptor values are per peer; they live here rather than in the
/// shared attribute table. A zero handle marks a free slot.
pub struct NotificationTable<const ENTRIES: usize> {
    state: [(u16, u16); ENTRIES],
}

struct PrepareEntry {
    handle: u16,
    offset: u16,
    value: Vec<u8, { config::PREPARE_WRITE_DATA_SIZE }>,
}

type PrepareQueue = Vec<PrepareEntry, { config::PREPARE_WRITE_QUEUE_SIZE }>;

/// An attribute server answering ATT requests on behalf of one connection.
pub struct AttributeServer<'c, M: RawMutex, const MAX: usize> {
    pub(crate) table: &'c AttributeTable<M, MAX>,
    notification: Mutex<M, RefCell<NotificationTable<{ config::GATT_SERVER_MAX_SUBSCRIPTIONS }>>>,
    prepare_queue: Mutex<M, RefCell<PrepareQueue>>,
    security: Mutex<M, Cell<SecurityLevel>>,
    authorized: Mutex<M, Cell<bool>>,
}

impl<'c, M: RawMutex, const MAX: usize> AttributeServer<'c, M, MAX> {
    /// Create a new instance of the AttributeServer
    pub fn new(table: &'c AttributeTable<M, MAX>, security: SecurityLevel) -> AttributeServer<'c, M, MAX> {
        AttributeServer {
            table,
            notification: Mutex::new(RefCell::new(NotificationTable {
                state: [(0, 0); config::GATT_SERVER_MAX_SUBSCRIPTIONS],
            })),
            prepare_queue: Mutex::new(RefCell::new(Vec::new())),
            security: Mutex::new(Cell::new(security)),
            authorized: Mutex::new(Cell::new(false)),
        }
    }

    /// Update the link security level after e.g. an encryption change.
    pub fn set_security(&self, security: SecurityLevel) {
        self.security.lock(|s| s.set(security));
    }

    /// Grant or revoke application-level authorization for this peer.
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.lock(|a| a.set(authorized));
    }

    fn security(&self) -> SecurityLevel {
        self.security.lock(|s| s.get())
    }

    fn is_authorized(&self) -> bool {
        self.authorized.lock(|a| a.get())
    }

    pub(crate) fn should_notify(&self, cccd_handle: u16) -> bool {
        self.cccd_value(cccd_handle) & 0x01 != 0
    }

    pub(crate) fn should_indicate(&self, cccd_handle: u16) -> bool {
        self.cccd_value(cccd_handle) & 0x02 != 0
    }

    fn cccd_value(&self, cccd_handle: u16) -> u16 {
        self.notification.lock(|n| {
            let n = n.borrow();
            for entry in n.state.iter() {
                if entry.0 == cccd_handle {
                    return entry.1;
                }
            }
            0
        })
    }

    fn set_cccd(&self, cccd_handle: u16, value: u16) -> Result<(), AttErrorCode> {
        self.notification.lock(|n| {
            let mut n = n.borrow_mut();
            for entry in n.state.iter_mut() {
                if entry.0 == cccd_handle {
                    if value == 0 {
                        entry.0 = 0;
                    }
                    entry.1 = value;
                    return Ok(());
                }
            }
            if value == 0 {
                return Ok(());
            }
            for entry in n.state.iter_mut() {
                if entry.0 == 0 {
                    *entry = (cccd_handle, value);
                    return Ok(());
                }
            }
            Err(AttErrorCode::InsufficientResources)
        })
    }

    /// Read the value of an attribute, serving CCC descriptors from the
    /// per-connection state.
    async fn read_attr_value<R>(
        &self,
        att: &Attribute,
        offset: usize,
        data: &mut [u8],
        read: &mut AttrDataHandler<'_, R>,
    ) -> Result<usize, AttErrorCode>
    where
        R: AttrHandler,
    {
        if let AttributeData::Cccd = att.data {
            let value = self.cccd_value(att.handle).to_le_bytes();
            if offset > value.len() {
                return Err(AttErrorCode::InvalidOffset);
            }
            let len = data.len().min(value.len() - offset);
            data[..len].copy_from_slice(&value[offset..offset + len]);
            Ok(len)
        } else {
            att.data.read(offset, data, read).await
        }
    }

    async fn write_attr_value<T>(
        &self,
        att: &mut Attribute,
        offset: usize,
        data: &[u8],
        write: &mut AttrDataHandler<'_, T>,
    ) -> Result<(), AttErrorCode>
    where
        T: AttrHandler,
    {
        if let AttributeData::Cccd = att.data {
            if offset > 0 {
                return Err(AttErrorCode::InvalidOffset);
            }
            if data.len() != 2 {
                return Err(AttErrorCode::InvalidAttributeValueLength);
            }
            self.set_cccd(att.handle, u16::from_le_bytes([data[0], data[1]]))
        } else {
            if offset + data.len() > config::ATT_VALUE_MAX {
                return Err(AttErrorCode::InvalidAttributeValueLength);
            }
            att.data.write(offset, data, write).await
        }
    }

    async fn handle_read_by_type_req<R>(
        &self,
        buf: &mut [u8],
        start: u16,
        end: u16,
        mtu: usize,
        attribute_type: &Uuid,
        mut read: R,
    ) -> Result<usize, codec::Error>
    where
        R: AttrHandler,
    {
        let mut handle = start;
        let mut data = WriteCursor::new(buf);

        let (mut header, mut body) = data.split(2)?;
        let err = async {
            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();

            // Values are truncated to what a single element may carry.
            let vmax = (mtu - 4).min(253).min(config::ATT_VALUE_MAX);
            let mut scratch = [0; config::ATT_VALUE_MAX];
            let mut elem_vlen = None;
            let mut err = Err(AttErrorCode::AttributeNotFound);
            while let Some(att) = it.next() {
                if &att.uuid != attribute_type || att.handle < start || att.handle > end || !att.active {
                    continue;
                }
                if elem_vlen.is_none() {
                    handle = att.handle;
                    if let Err(e) = att.perms.check_read(self.security(), self.is_authorized()) {
                        return Err(e);
                    }
                } else if att.perms.check_read(self.security(), self.is_authorized()).is_err() {
                    break;
                }
                let len = self
                    .read_attr_value(
                        att,
                        0,
                        &mut scratch[..vmax],
                        &mut AttrDataHandler::new(&mut read, &att.uuid, att.handle),
                    )
                    .await;
                let len = match (len, elem_vlen.is_none()) {
                    (Ok(len), _) => len,
                    (Err(e), true) => return Err(e),
                    (Err(_), false) => break,
                };
                // All elements in one response carry equally long values.
                if *elem_vlen.get_or_insert(len) != len || body.available() < 2 + len {
                    break;
                }
                body.write(att.handle)?;
                body.append(&scratch[..len])?;
                err = Ok(len);
            }
            err
        }
        .await;

        match err {
            Ok(vlen) => {
                header.write(att::ATT_READ_BY_TYPE_RSP)?;
                header.write(2 + vlen as u8)?;
                Ok(header.len() + body.len())
            }
            Err(e) => Ok(Self::error_response(data, att::ATT_READ_BY_TYPE_REQ, handle, e)?),
        }
    }

    async fn handle_read_by_group_type_req<R>(
        &self,
        buf: &mut [u8],
        start: u16,
        end: u16,
        mtu: usize,
        group_type: &Uuid,
        mut read: R,
    ) -> Result<usize, codec::Error>
    where
        R: AttrHandler,
    {
        let mut handle = start;
        let mut data = WriteCursor::new(buf);

        let (mut header, mut body) = data.split(2)?;
        let err = async {
            if group_type != &PRIMARY_SERVICE_UUID16 && group_type != &SECONDARY_SERVICE_UUID16 {
                return Err(AttErrorCode::UnsupportedGroupType);
            }
            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();

            let vmax = (mtu - 6).min(251).min(config::ATT_VALUE_MAX);
            let mut scratch = [0; config::ATT_VALUE_MAX];
            let mut elem_vlen = None;
            let mut err = Err(AttErrorCode::AttributeNotFound);
            while let Some(att) = it.next() {
                if &att.uuid != group_type || att.handle < start || att.handle > end || !att.active {
                    continue;
                }
                if elem_vlen.is_none() {
                    handle = att.handle;
                }
                let len = self
                    .read_attr_value(
                        att,
                        0,
                        &mut scratch[..vmax],
                        &mut AttrDataHandler::new(&mut read, &att.uuid, att.handle),
                    )
                    .await;
                let len = match (len, elem_vlen.is_none()) {
                    (Ok(len), _) => len,
                    (Err(e), true) => return Err(e),
                    (Err(_), false) => break,
                };
                if *elem_vlen.get_or_insert(len) != len || body.available() < 4 + len {
                    break;
                }
                body.write(att.handle)?;
                body.write(att.last_handle_in_group)?;
                body.append(&scratch[..len])?;
                err = Ok(len);
            }
            err
        }
        .await;

        match err {
            Ok(vlen) => {
                header.write(att::ATT_READ_BY_GROUP_TYPE_RSP)?;
                header.write(4 + vlen as u8)?;
                Ok(header.len() + body.len())
            }
            Err(e) => Ok(Self::error_response(data, att::ATT_READ_BY_GROUP_TYPE_REQ, handle, e)?),
        }
    }

    async fn handle_read_req<R>(&self, buf: &mut [u8], handle: u16, mtu: usize, mut read: R) -> Result<usize, codec::Error>
    where
        R: AttrHandler,
    {
        let mut data = WriteCursor::new(buf);

        data.write(att::ATT_READ_RSP)?;

        let err = async {
            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();
            let mut err = Err(AttErrorCode::InvalidHandle);
            while let Some(att) = it.next() {
                if att.handle == handle {
                    if !att.active {
                        err = Err(AttErrorCode::AttributeNotFound);
                        break;
                    }
                    if let Err(e) = att.perms.check_read(self.security(), self.is_authorized()) {
                        err = Err(e);
                        break;
                    }
                    let cap = (mtu - 1).min(data.available());
                    err = self
                        .read_attr_value(
                            att,
                            0,
                            &mut data.write_buf()[..cap],
                            &mut AttrDataHandler::new(&mut read, &att.uuid, att.handle),
                        )
                        .await;
                    if let Ok(len) = err {
                        data.commit(len)?;
                    }
                    break;
                }
            }
            err
        }
        .await;

        match err {
            Ok(_) => Ok(data.len()),
            Err(e) => Ok(Self::error_response(data, att::ATT_READ_REQ, handle, e)?),
        }
    }

    async fn handle_read_blob<R>(
        &self,
        buf: &mut [u8],
        handle: u16,
        offset: u16,
        mtu: usize,
        mut read: R,
    ) -> Result<usize, codec::Error>
    where
        R: AttrHandler,
    {
        let mut w = WriteCursor::new(buf);
        w.write(att::ATT_READ_BLOB_RSP)?;

        let err = async {
            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();

            let mut err = Err(AttErrorCode::InvalidHandle);
            while let Some(att) = it.next() {
                if att.handle == handle {
                    if !att.active {
                        err = Err(AttErrorCode::AttributeNotFound);
                        break;
                    }
                    if let Err(e) = att.perms.check_read(self.security(), self.is_authorized()) {
                        err = Err(e);
                        break;
                    }
                    let cap = (mtu - 1).min(w.available());
                    err = self
                        .read_attr_value(
                            att,
                            offset as usize,
                            &mut w.write_buf()[..cap],
                            &mut AttrDataHandler::new(&mut read, &att.uuid, att.handle),
                        )
                        .await;
                    if let Ok(n) = &err {
                        w.commit(*n)?;
                    }
                    break;
                }
            }
            err
        }
        .await;

        match err {
            Ok(_) => Ok(w.len()),
            Err(e) => Ok(Self::error_response(w, att::ATT_READ_BLOB_REQ, handle, e)?),
        }
    }

    async fn handle_read_multiple<R>(
        &self,
        buf: &mut [u8],
        handles: &[u8],
        mtu: usize,
        mut read: R,
    ) -> Result<usize, codec::Error>
    where
        R: AttrHandler,
    {
        let mut w = WriteCursor::new(buf);
        w.write(att::ATT_READ_MULTIPLE_RSP)?;

        let mut err = Ok(());
        'outer: for pair in handles.chunks(2) {
            let handle = u16::from_le_bytes([pair[0], pair[1]]);

            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();
            let mut found = Err(AttErrorCode::InvalidHandle);
            while let Some(att) = it.next() {
                if att.handle != handle {
                    continue;
                }
                if !att.active {
                    found = Err(AttErrorCode::AttributeNotFound);
                    break;
                }
                if let Err(e) = att.perms.check_read(self.security(), self.is_authorized()) {
                    found = Err(e);
                    break;
                }
                // The set of values is truncated as a whole at MTU-1.
                let cap = mtu.saturating_sub(w.len()).min(w.available());
                found = match self
                    .read_attr_value(
                        att,
                        0,
                        &mut w.write_buf()[..cap],
                        &mut AttrDataHandler::new(&mut read, &att.uuid, att.handle),
                    )
                    .await
                {
                    Ok(n) => {
                        w.commit(n)?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                break;
            }
            match found {
                Ok(()) if w.len() >= mtu => break 'outer,
                Ok(()) => {}
                Err(e) => {
                    err = Err((handle, e));
                    break;
                }
            }
        }

        match err {
            Ok(()) => Ok(w.len()),
            Err((handle, e)) => Ok(Self::error_response(w, att::ATT_READ_MULTIPLE_REQ, handle, e)?),
        }
    }

    async fn handle_write_cmd<T>(&self, handle: u16, data: &[u8], mut handler: T) -> Result<usize, codec::Error>
    where
        T: AttrHandler,
    {
        let mut table = self.table.lock().await;
        let mut it = table.attr_iter();
        while let Some(att) = it.next() {
            if att.handle == handle {
                let uuid = att.uuid.clone();
                // Commands never get a response, not even on error.
                if !att.active {
                    trace!("[att] write cmd to inactive attribute {}", handle);
                } else if let Err(e) = att.perms.check_write(self.security(), self.is_authorized()) {
                    debug!("[att] write cmd to {} dropped: {:?}", handle, e);
                } else if let Err(e) = self
                    .write_attr_value(att, 0, data, &mut AttrDataHandler::new(&mut handler, &uuid, handle))
                    .await
                {
                    debug!("[att] write cmd to {} failed: {:?}", handle, e);
                }
                break;
            }
        }
        Ok(0)
    }

    async fn handle_write_req<T>(&self, buf: &mut [u8], handle: u16, data: &[u8], mut handler: T) -> Result<usize, codec::Error>
    where
        T: AttrHandler,
    {
        let pending = self
            .prepare_queue
            .lock(|q| q.borrow().iter().any(|entry| entry.handle == handle));

        let err = async {
            // A prepare queue holding this attribute blocks other writes
            // until executed or cancelled.
            if pending {
                return Err(AttErrorCode::UnlikelyError);
            }
            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();
            let mut err = Err(AttErrorCode::InvalidHandle);
            while let Some(att) = it.next() {
                if att.handle == handle {
                    if !att.active {
                        err = Err(AttErrorCode::AttributeNotFound);
                        break;
                    }
                    if let Err(e) = att.perms.check_write(self.security(), self.is_authorized()) {
                        err = Err(e);
                        break;
                    }
                    let uuid = att.uuid.clone();
                    err = self
                        .write_attr_value(att, 0, data, &mut AttrDataHandler::new(&mut handler, &uuid, handle))
                        .await;
                    break;
                }
            }
            err
        }
        .await;

        let mut w = WriteCursor::new(buf);
        match err {
            Ok(()) => {
                w.write(att::ATT_WRITE_RSP)?;
                Ok(w.len())
            }
            Err(e) => Ok(Self::error_response(w, att::ATT_WRITE_REQ, handle, e)?),
        }
    }

    async fn handle_find_type_value(
        &self,
        buf: &mut [u8],
        start: u16,
        end: u16,
        mtu: usize,
        attr_type: u16,
        attr_value: &[u8],
    ) -> Result<usize, codec::Error> {
        let mut w = WriteCursor::new(buf);
        let attr_type = Uuid::new_short(attr_type);
        let needle = Uuid::try_from_slice(attr_value).ok();

        w.write(att::ATT_FIND_BY_TYPE_VALUE_RSP)?;

        let mut table = self.table.lock().await;
        let mut it = table.attr_iter();

        while let Some(att) = it.next() {
            if att.handle >= start && att.handle <= end && att.active && att.uuid == attr_type {
                if let AttributeData::Service { uuid } = &att.data {
                    if Some(uuid) == needle.as_ref() {
                        if w.available() < 4 || w.len() + 4 > mtu {
                            break;
                        }
                        w.write(att.handle)?;
                        w.write(att.last_handle_in_group)?;
                    }
                }
            }
        }

        if w.len() > 1 {
            Ok(w.len())
        } else {
            Ok(Self::error_response(
                w,
                att::ATT_FIND_BY_TYPE_VALUE_REQ,
                start,
                AttErrorCode::AttributeNotFound,
            )?)
        }
    }

    async fn handle_find_information(&self, buf: &mut [u8], start: u16, end: u16, mtu: usize) -> Result<usize, codec::Error> {
        let mut w = WriteCursor::new(buf);

        let (mut header, mut body) = w.split(2)?;

        header.write(att::ATT_FIND_INFORMATION_RSP)?;
        let mut t = 0;

        let mut table = self.table.lock().await;
        let mut it = table.attr_iter();

        while let Some(att) = it.next() {
            if att.handle >= start && att.handle <= end && att.active {
                // A response carries a single format; stop at the first
                // attribute whose UUID has the other width.
                if t == 0 {
                    t = att.uuid.get_type();
                } else if t != att.uuid.get_type() {
                    break;
                }
                let elen = 2 + att.uuid.as_raw().len();
                if body.available() < elen || 2 + body.len() + elen > mtu {
                    break;
                }
                body.write(att.handle)?;
                body.append(att.uuid.as_raw())?;
            }
        }

        header.write(t)?;

        if body.len() > 2 {
            Ok(header.len() + body.len())
        } else {
            Ok(Self::error_response(
                w,
                att::ATT_FIND_INFORMATION_REQ,
                start,
                AttErrorCode::AttributeNotFound,
            )?)
        }
    }

    fn error_response(mut w: WriteCursor<'_>, opcode: u8, handle: u16, code: AttErrorCode) -> Result<usize, codec::Error> {
        w.reset();
        w.write(att::ATT_ERROR_RSP)?;
        w.write(opcode)?;
        w.write(handle)?;
        w.write(code as u8)?;
        Ok(w.len())
    }

    async fn handle_prepare_write(
        &self,
        buf: &mut [u8],
        handle: u16,
        offset: u16,
        value: &[u8],
    ) -> Result<usize, codec::Error> {
        let mut w = WriteCursor::new(buf);
        w.write(att::ATT_PREPARE_WRITE_RSP)?;
        w.write(handle)?;
        w.write(offset)?;

        let err = async {
            let mut table = self.table.lock().await;
            let mut it = table.attr_iter();

            let mut err = Err(AttErrorCode::InvalidHandle);
            while let Some(att) = it.next() {
                if att.handle == handle {
                    if !att.active {
                        err = Err(AttErrorCode::AttributeNotFound);
                        break;
                    }
                    // Each prepare re-checks permissions; execute checks again.
                    err = att
                        .perms
                        .check_write(self.security(), self.is_authorized())
                        .and_then(|()| self.enqueue_prepare(handle, offset, value));
                    if err.is_ok() {
                        w.append(value)?;
                    }
                    break;
                }
            }
            err
        }
        .await;

        match err {
            Ok(()) => Ok(w.len()),
            Err(e) => Ok(Self::error_response(w, att::ATT_PREPARE_WRITE_REQ, handle, e)?),
        }
    }

    fn enqueue_prepare(&self, handle: u16, offset: u16, value: &[u8]) -> Result<(), AttErrorCode> {
        self.prepare_queue.lock(|q| {
            let mut q = q.borrow_mut();
            let entry = PrepareEntry {
                handle,
                offset,
                value: Vec::from_slice(value).map_err(|_| AttErrorCode::InsufficientResources)?,
            };
            q.push(entry).map_err(|_| AttErrorCode::PrepareQueueFull)
        })
    }

    async fn handle_execute_write<T>(&self, buf: &mut [u8], flags: u8, mut handler: T) -> Result<usize, codec::Error>
    where
        T: AttrHandler,
    {
        let queue: PrepareQueue = self.prepare_queue.lock(|q| core::mem::take(&mut *q.borrow_mut()));

        let err = async {
            if flags == att::ATT_EXEC_WRITE_FLAG_CANCEL {
                return Ok(());
            }
            // Every entry is verified before the first write is applied.
            // Permissions may have changed since prepare time, and a failed
            // execute must leave all attributes untouched.
            {
                let mut table = self.table.lock().await;
                for entry in queue.iter() {
                    let offset = entry.offset as usize;
                    if offset >= config::ATT_VALUE_MAX {
                        return Err((entry.handle, AttErrorCode::InvalidOffset));
                    }
                    if offset + entry.value.len() > config::ATT_VALUE_MAX {
                        return Err((entry.handle, AttErrorCode::InvalidAttributeValueLength));
                    }
                    let mut it = table.attr_iter();
                    let mut valid = Err(AttErrorCode::InvalidHandle);
                    while let Some(att) = it.next() {
                        if att.handle == entry.handle {
                            valid = if !att.active {
                                Err(AttErrorCode::AttributeNotFound)
                            } else {
                                att.perms.check_write(self.security(), self.is_authorized())
                            };
                            break;
                        }
                    }
                    valid.map_err(|e| (entry.handle, e))?;
                }
            }
            // Apply in FIFO order.
            for entry in queue.iter() {
                let mut table = self.table.lock().await;
                let mut it = table.attr_iter();
                let mut applied = Err(AttErrorCode::InvalidHandle);
                while let Some(att) = it.next() {
                    if att.handle == entry.handle {
                        let uuid = att.uuid.clone();
                        applied = self
                            .write_attr_value(
                                att,
                                entry.offset as usize,
                                &entry.value,
                                &mut AttrDataHandler::new(&mut handler, &uuid, entry.handle),
                            )
                            .await;
                        break;
                    }
                }
                applied.map_err(|e| (entry.handle, e))?;
            }
            Ok(())
        }
        .await;

        let mut w = WriteCursor::new(buf);
        match err {
            Ok(()) => {
                w.write(att::ATT_EXECUTE_WRITE_RSP)?;
                Ok(w.len())
            }
            Err((handle, e)) => Ok(Self::error_response(w, att::ATT_EXECUTE_WRITE_REQ, handle, e)?),
        }
    }

    /// Discard any queued prepare writes, e.g. on disconnect.
    pub fn clear_prepare_queue(&self) {
        self.prepare_queue.lock(|q| q.borrow_mut().clear());
    }

    /// Process an event and produce a response if necessary
    pub async fn process<T>(
        &self,
        packet: &AttReq<'_>,
        rx: &mut [u8],
        mtu: usize,
        mut handler: T,
    ) -> Result<Option<usize>, codec::Error>
    where
        T: AttrHandler,
    {
        let len = match packet {
            AttReq::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                if start > end {
                    Self::error_response(
                        WriteCursor::new(rx),
                        att::ATT_READ_BY_TYPE_REQ,
                        *start,
                        AttErrorCode::InvalidHandle,
                    )?
                } else {
                    self.handle_read_by_type_req(rx, *start, *end, mtu, attribute_type, &mut handler)
                        .await?
                }
            }

            AttReq::ReadByGroupType { start, end, group_type } => {
                if start > end {
                    Self::error_response(
                        WriteCursor::new(rx),
                        att::ATT_READ_BY_GROUP_TYPE_REQ,
                        *start,
                        AttErrorCode::InvalidHandle,
                    )?
                } else {
                    self.handle_read_by_group_type_req(rx, *start, *end, mtu, group_type, &mut handler)
                        .await?
                }
            }
            AttReq::FindInformation {
                start_handle,
                end_handle,
            } => {
                if start_handle > end_handle {
                    Self::error_response(
                        WriteCursor::new(rx),
                        att::ATT_FIND_INFORMATION_REQ,
                        *start_handle,
                        AttErrorCode::InvalidHandle,
                    )?
                } else {
                    self.handle_find_information(rx, *start_handle, *end_handle, mtu).await?
                }
            }

            AttReq::Read { handle } => self.handle_read_req(rx, *handle, mtu, &mut handler).await?,

            AttReq::WriteCmd { handle, data } => self.handle_write_cmd(*handle, data, &mut handler).await?,

            // The signature is not verified here; signed writes require a
            // bonded CSRK which the security manager owns.
            AttReq::SignedWriteCmd { handle, data, .. } => self.handle_write_cmd(*handle, data, &mut handler).await?,

            AttReq::Write { handle, data } => self.handle_write_req(rx, *handle, data, &mut handler).await?,

            AttReq::ExchangeMtu { .. } => 0, // Handled by the bearer

            AttReq::FindByTypeValue {
                start_handle,
                end_handle,
                att_type,
                att_value,
            } => {
                if start_handle > end_handle {
                    Self::error_response(
                        WriteCursor::new(rx),
                        att::ATT_FIND_BY_TYPE_VALUE_REQ,
                        *start_handle,
                        AttErrorCode::InvalidHandle,
                    )?
                } else {
                    self.handle_find_type_value(rx, *start_handle, *end_handle, mtu, *att_type, att_value)
                        .await?
                }
            }

            AttReq::PrepareWrite { handle, offset, value } => {
                self.handle_prepare_write(rx, *handle, *offset, value).await?
            }

            AttReq::ExecuteWrite { flags } => self.handle_execute_write(rx, *flags, &mut handler).await?,

            AttReq::ReadBlob { handle, offset } => {
                self.handle_read_blob(rx, *handle, *offset, mtu, &mut handler).await?
            }

            AttReq::ReadMultiple { handles } => self.handle_read_multiple(rx, handles, mtu, &mut handler).await?,
        };
        if len > 0 {
            Ok(Some(len))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use heapless::Vec;

    use super::*;
    use crate::attribute::{AttributePerm, CharacteristicProp, Service, ServiceHandle};
    use crate::testutil::block_on;

    const MTU: usize = 23;

    struct Storage {
        name: Vec<u8, 64>,
        value: Vec<u8, { config::ATT_VALUE_MAX }>,
    }

    impl AttrHandler for &mut Storage {
        async fn read(&mut self, uuid: &Uuid, _handle: u16, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
            let src: &[u8] = if *uuid == Uuid::new_short(0x2a00) {
                &self.name
            } else {
                &self.value
            };
            if offset > src.len() {
                return Err(AttErrorCode::InvalidOffset);
            }
            let len = data.len().min(src.len() - offset);
            data[..len].copy_from_slice(&src[offset..offset + len]);
            Ok(len)
        }

        async fn write(&mut self, uuid: &Uuid, _handle: u16, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
            let dst: &mut Vec<u8, { config::ATT_VALUE_MAX }> = if *uuid == Uuid::new_short(0x2a00) {
                return Err(AttErrorCode::WriteNotPermitted);
            } else {
                &mut self.value
            };
            if offset > dst.len() {
                return Err(AttErrorCode::InvalidOffset);
            }
            dst.truncate(offset);
            dst.extend_from_slice(data).map_err(|_| AttErrorCode::InvalidAttributeValueLength)?;
            Ok(())
        }
    }

    struct Fixture {
        table: AttributeTable<CriticalSectionRawMutex, 32>,
        gap: ServiceHandle,
        custom: ServiceHandle,
        name_handle: u16,
        value_handle: u16,
        cccd_handle: u16,
        secure_handle: u16,
        secure_write_handle: u16,
    }

    fn fixture() -> (Fixture, Storage) {
        let mut table: AttributeTable<CriticalSectionRawMutex, 32> = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x1800u16));
        let name = svc.add_characteristic_ro(0x2a00u16).build();
        let gap = svc.build();

        let mut svc = table.add_service(Service::new(0x180fu16));
        let chr = svc
            .add_characteristic(
                0x2a19u16,
                &[CharacteristicProp::Read, CharacteristicProp::Write, CharacteristicProp::Notify],
                &[AttributePerm::Read, AttributePerm::Write],
            )
            .build();
        let secure = svc
            .add_characteristic(
                0x2a3du16,
                &[CharacteristicProp::Read],
                &[AttributePerm::Read, AttributePerm::ReadEncrypted],
            )
            .build();
        let secure_write = svc
            .add_characteristic(
                0x2a3eu16,
                &[CharacteristicProp::Write],
                &[AttributePerm::Write, AttributePerm::WriteEncrypted],
            )
            .build();
        let custom = svc.build();

        let storage = Storage {
            name: Vec::from_slice(b"Hello").unwrap(),
            value: Vec::new(),
        };
        (
            Fixture {
                table,
                gap,
                custom,
                name_handle: name.handle(),
                value_handle: chr.handle(),
                cccd_handle: chr.cccd_handle().unwrap(),
                secure_handle: secure.handle(),
                secure_write_handle: secure_write.handle(),
            },
            storage,
        )
    }

    fn process<'a>(
        server: &AttributeServer<'_, CriticalSectionRawMutex, 32>,
        storage: &mut Storage,
        req: &AttReq<'_>,
        rx: &'a mut [u8],
    ) -> Option<&'a [u8]> {
        match block_on(server.process(req, rx, MTU, &mut *storage)).unwrap() {
            Some(n) => Some(&rx[..n]),
            None => None,
        }
    }

    #[test]
    fn read_by_group_type_on_empty_db() {
        let table: AttributeTable<CriticalSectionRawMutex, 32> = AttributeTable::new();
        let server = AttributeServer::new(&table, SecurityLevel::None);
        let mut storage = Storage {
            name: Vec::new(),
            value: Vec::new(),
        };
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::ReadByGroupType {
                start: 0x0001,
                end: 0xffff,
                group_type: PRIMARY_SERVICE_UUID16,
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp, &[0x01, 0x10, 0x01, 0x00, 0x0a]);
    }

    #[test]
    fn read_by_group_type_lists_services() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::ReadByGroupType {
                start: 0x0001,
                end: 0xffff,
                group_type: PRIMARY_SERVICE_UUID16,
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_READ_BY_GROUP_TYPE_RSP);
        assert_eq!(rsp[1], 6);
        let first = &rsp[2..8];
        assert_eq!(u16::from_le_bytes([first[0], first[1]]), f.gap.start());
        assert_eq!(u16::from_le_bytes([first[2], first[3]]), f.gap.end());
        assert_eq!(&first[4..], &[0x00, 0x18]);
        let second = &rsp[8..14];
        assert_eq!(u16::from_le_bytes([second[0], second[1]]), f.custom.start());
        assert_eq!(&second[4..], &[0x0f, 0x18]);
    }

    #[test]
    fn read_device_name() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::Read { handle: f.name_handle }, &mut rx).unwrap();
        assert_eq!(rsp, &[0x0b, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn read_long_value_pages_at_mtu() {
        let (f, mut storage) = fixture();
        let value: [u8; 30] = core::array::from_fn(|i| i as u8);
        storage.value = Vec::from_slice(&value).unwrap();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);

        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::Read { handle: f.value_handle }, &mut rx).unwrap();
        assert_eq!(rsp[0], att::ATT_READ_RSP);
        assert_eq!(&rsp[1..], &value[..22]);

        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::ReadBlob {
                handle: f.value_handle,
                offset: 22,
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_READ_BLOB_RSP);
        assert_eq!(&rsp[1..], &value[22..]);
    }

    #[test]
    fn write_req_updates_value() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::Write {
                handle: f.value_handle,
                data: &[1, 2, 3],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp, &[att::ATT_WRITE_RSP]);
        assert_eq!(&storage.value[..], &[1, 2, 3]);
    }

    #[test]
    fn write_req_to_read_only_is_denied() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::Write {
                handle: f.name_handle,
                data: &[0],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp, &[0x01, 0x12, f.name_handle as u8, 0x00, 0x03]);
    }

    #[test]
    fn write_cmd_failure_is_silent() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::WriteCmd {
                handle: f.name_handle,
                data: &[0],
            },
            &mut rx,
        );
        assert!(rsp.is_none());
        assert_eq!(&storage.name[..], b"Hello");
    }

    #[test]
    fn encrypted_read_requires_encryption() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::Low);
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::Read { handle: f.secure_handle }, &mut rx).unwrap();
        assert_eq!(rsp[0], 0x01);
        assert_eq!(rsp[4], 0x0f);

        server.set_security(SecurityLevel::Medium);
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::Read { handle: f.secure_handle }, &mut rx).unwrap();
        assert_eq!(rsp[0], att::ATT_READ_RSP);
    }

    #[test]
    fn cccd_write_and_read_back() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        assert!(!server.should_notify(f.cccd_handle));

        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::Write {
                handle: f.cccd_handle,
                data: &[0x01, 0x00],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp, &[att::ATT_WRITE_RSP]);
        assert!(server.should_notify(f.cccd_handle));
        assert!(!server.should_indicate(f.cccd_handle));

        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::Read { handle: f.cccd_handle }, &mut rx).unwrap();
        assert_eq!(rsp, &[att::ATT_READ_RSP, 0x01, 0x00]);

        // An invalid length is rejected.
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::Write {
                handle: f.cccd_handle,
                data: &[0x01],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[4], 0x0d);
    }

    #[test]
    fn prepare_then_execute_applies_in_order() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);

        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.value_handle,
                offset: 0,
                value: &[0xaa, 0xbb],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp, &[att::ATT_PREPARE_WRITE_RSP, f.value_handle as u8, 0x00, 0x00, 0x00, 0xaa, 0xbb]);

        let mut rx = [0; 64];
        process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.value_handle,
                offset: 2,
                value: &[0xcc, 0xdd],
            },
            &mut rx,
        )
        .unwrap();

        // A regular write is rejected while the queue holds this handle.
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::Write {
                handle: f.value_handle,
                data: &[0],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[4], 0x0e);

        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::ExecuteWrite { flags: 0x01 }, &mut rx).unwrap();
        assert_eq!(rsp, &[att::ATT_EXECUTE_WRITE_RSP]);
        assert_eq!(&storage.value[..], &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn execute_cancel_discards_queue() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);

        let mut rx = [0; 64];
        process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.value_handle,
                offset: 0,
                value: &[0xaa],
            },
            &mut rx,
        )
        .unwrap();
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::ExecuteWrite { flags: 0x00 }, &mut rx).unwrap();
        assert_eq!(rsp, &[att::ATT_EXECUTE_WRITE_RSP]);
        assert!(storage.value.is_empty());
    }

    #[test]
    fn execute_rejects_out_of_bounds_entries() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);

        let mut rx = [0; 64];
        process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.value_handle,
                offset: (config::ATT_VALUE_MAX) as u16,
                value: &[0xaa],
            },
            &mut rx,
        )
        .unwrap();
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::ExecuteWrite { flags: 0x01 }, &mut rx).unwrap();
        assert_eq!(rsp[0], 0x01);
        assert_eq!(rsp[4], 0x07);
        assert!(storage.value.is_empty());

        // The failed execute cleared the queue.
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::ExecuteWrite { flags: 0x01 }, &mut rx).unwrap();
        assert_eq!(rsp, &[att::ATT_EXECUTE_WRITE_RSP]);
    }

    #[test]
    fn execute_failure_applies_nothing() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::Medium);

        // Both prepares pass at the current security level.
        let mut rx = [0; 64];
        process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.value_handle,
                offset: 0,
                value: &[0x01],
            },
            &mut rx,
        )
        .unwrap();
        let mut rx = [0; 64];
        process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.secure_write_handle,
                offset: 0,
                value: &[0x02],
            },
            &mut rx,
        )
        .unwrap();

        // Encryption dropped before the execute; no entry may be applied.
        server.set_security(SecurityLevel::Low);
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::ExecuteWrite { flags: 0x01 }, &mut rx).unwrap();
        assert_eq!(rsp, &[0x01, 0x18, f.secure_write_handle as u8, 0x00, 0x0f]);
        assert!(storage.value.is_empty());
    }

    #[test]
    fn prepare_queue_is_bounded() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);

        for i in 0..config::PREPARE_WRITE_QUEUE_SIZE {
            let mut rx = [0; 64];
            let rsp = process(
                &server,
                &mut storage,
                &AttReq::PrepareWrite {
                    handle: f.value_handle,
                    offset: i as u16,
                    value: &[i as u8],
                },
                &mut rx,
            )
            .unwrap();
            assert_eq!(rsp[0], att::ATT_PREPARE_WRITE_RSP);
        }
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::PrepareWrite {
                handle: f.value_handle,
                offset: 0,
                value: &[0],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[4], 0x09);
    }

    #[test]
    fn find_information_lists_descriptors() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::FindInformation {
                start_handle: f.value_handle + 1,
                end_handle: f.custom.end(),
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_FIND_INFORMATION_RSP);
        assert_eq!(rsp[1], 0x01);
        assert_eq!(u16::from_le_bytes([rsp[2], rsp[3]]), f.cccd_handle);
        assert_eq!(&rsp[4..6], &[0x02, 0x29]);
    }

    #[test]
    fn find_by_type_value_matches_service_uuid() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::FindByTypeValue {
                start_handle: 0x0001,
                end_handle: 0xffff,
                att_type: 0x2800,
                att_value: &[0x0f, 0x18],
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_FIND_BY_TYPE_VALUE_RSP);
        assert_eq!(u16::from_le_bytes([rsp[1], rsp[2]]), f.custom.start());
        assert_eq!(u16::from_le_bytes([rsp[3], rsp[4]]), f.custom.end());
    }

    #[test]
    fn inactive_service_is_hidden() {
        let (f, mut storage) = fixture();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        block_on(f.table.set_active(&f.custom, false));

        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::Read { handle: f.value_handle }, &mut rx).unwrap();
        assert_eq!(rsp, &[0x01, 0x0a, f.value_handle as u8, 0x00, 0x0a]);

        let mut rx = [0; 64];
        let rsp = process(
            &server,
            &mut storage,
            &AttReq::ReadByGroupType {
                start: f.custom.start(),
                end: 0xffff,
                group_type: PRIMARY_SERVICE_UUID16,
            },
            &mut rx,
        )
        .unwrap();
        assert_eq!(rsp[4], 0x0a);
    }

    #[test]
    fn read_multiple_concatenates_values() {
        let (f, mut storage) = fixture();
        storage.value = Vec::from_slice(&[0xaa, 0xbb]).unwrap();
        let server = AttributeServer::new(&f.table, SecurityLevel::None);
        let handles = [
            f.name_handle.to_le_bytes(),
            f.value_handle.to_le_bytes(),
        ]
        .concat();
        let mut rx = [0; 64];
        let rsp = process(&server, &mut storage, &AttReq::ReadMultiple { handles: &handles }, &mut rx).unwrap();
        assert_eq!(rsp[0], att::ATT_READ_MULTIPLE_RSP);
        assert_eq!(&rsp[1..], &[b'H', b'e', b'l', b'l', b'o', 0xaa, 0xbb]);
    }
}
