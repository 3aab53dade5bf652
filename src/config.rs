//! Compile-time capacities and protocol constants.

use embassy_time::Duration;

/// ATT transaction timeout. The bearer is unusable once a request or
/// indication exceeds this.
pub const ATT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ATT MTU before any Exchange MTU procedure.
pub const ATT_DEFAULT_MTU: u16 = 23;

/// Maximum length of an attribute value.
pub const ATT_VALUE_MAX: usize = 512;

/// Maximum number of queued Prepare Write entries per bearer.
///
/// 18 entries cover a Reliable Write of a maximum-length value at the
/// default MTU.
pub const PREPARE_WRITE_QUEUE_SIZE: usize = 18;

/// Maximum payload carried by a single queued Prepare Write entry.
pub const PREPARE_WRITE_DATA_SIZE: usize = 64;

/// Maximum number of concurrent subscribers per GATT client.
pub const GATT_CLIENT_NOTIFICATION_MAX_SUBSCRIBERS: usize = 4;

/// Queue depth for buffered notifications per subscriber.
pub const GATT_CLIENT_NOTIFICATION_QUEUE_SIZE: usize = 4;

/// Queue depth for unsolicited PDUs between the bearer and the client task.
pub const BEARER_UNSOLICITED_QUEUE_SIZE: usize = 4;

/// Maximum number of services mirrored by a GATT client.
pub const GATT_CLIENT_MAX_SERVICES: usize = 8;

/// Maximum number of characteristics mirrored by a GATT client.
pub const GATT_CLIENT_MAX_CHARACTERISTICS: usize = 32;

/// Maximum number of descriptors mirrored by a GATT client.
pub const GATT_CLIENT_MAX_DESCRIPTORS: usize = 32;

/// Maximum number of included services mirrored by a GATT client.
pub const GATT_CLIENT_MAX_INCLUDES: usize = 8;

/// Queue depth for client service change events.
pub const GATT_CLIENT_EVENT_QUEUE_SIZE: usize = 8;

/// Number of CCC subscriptions tracked per server connection.
pub const GATT_SERVER_MAX_SUBSCRIPTIONS: usize = 8;
