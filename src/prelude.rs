//! Convenience re-exports of the commonly used API surface.

pub use crate::att::AttErrorCode;
pub use crate::attribute::{
    AttributeHandle, AttributePerm, AttributeTable, CCCDFlag, Characteristic, CharacteristicProp, DescriptorHandle,
    Service, ServiceHandle, Uuid, CCCD,
};
pub use crate::attribute_server::AttrHandler;
pub use crate::bearer::{AttBearer, AttTransport};
pub use crate::gatt::split::{GattEvent, GattEvents, GattNotifier, GattRunner};
pub use crate::gatt::{
    GattAttrDesc, GattClient, GattHandler, GattServer, Notification, NotificationListener, RemoteCharacteristic,
    RemoteDescriptor, RemoteInclude, ServiceEvent,
};
pub use crate::types::security::SecurityLevel;
pub use crate::{BleHostError, Error};
