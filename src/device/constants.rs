use uuid::Uuid;

/**
 * How long (milliseconds) a connection attempt may stay in the connecting state before the link
 * is torn down.
 */
pub const CONNECT_TIMEOUT: u64 = 20000;

/**
 * How long (milliseconds) service discovery may take after the link has been established.
 * Some hosts take more than 2 seconds to start discovery on the first connection.
 */
pub const DISCOVER_TIMEOUT: u64 = 3000;

/**
 * Default length (milliseconds) of a scan window.
 */
pub const DEFAULT_SCAN_DURATION: u64 = 5000;

/**
 * Display name used for discovered peers that do not advertise a name.
 */
pub const UNKNOWN_DEVICE_NAME: &str = "UNKNOWN DEVICE";

/// Status reported by the host stack for a successful operation.
pub const GATT_SUCCESS: i32 = 0;
/// Generic failure status, used when the host stack gives no more specific status.
pub const GATT_FAILURE: i32 = 0x101;

/// Scan could not be registered with the host stack.
pub const SCAN_FAILED_APPLICATION_REGISTRATION_FAILED: i32 = 2;
/// Scan failed inside the host stack.
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;
/// The host refused to scan because the process lacks the radio permission.
pub const SCAN_FAILED_PERMISSION: i32 = 0x100;

/**
 * The UUID of the Client Characteristic Configuration descriptor, used to switch notifications on
 * and off.
 */
pub const CLIENT_CHARACTERISTIC_CONFIG: &str = "00002902-0000-1000-8000-00805f9b34fb";

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

pub fn make_client_characteristic_config_uuid() -> Uuid {
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb)
}
