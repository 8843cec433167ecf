//! Network and host helpers shared by the companion crates.
//!
//! - [`ipv4_interfaces`] lists the local IPv4 addresses usable for multicast membership
//! - [`get_os_string`] describes the host for the `X-Plex-Platform` headers
//! - [`find_process_using_port`] explains a failed bind
mod ip_utils;
mod process;

pub use ip_utils::ipv4_interfaces;
pub use process::{ProcessPortInfo, TransportProtocol, find_process_using_port};

/// Returns a string describing the operating system and its version.
///
/// # Format
/// - macOS: "macOS/15.1"
/// - Linux: "Linux/6.5.0" or "Ubuntu/22.04"
/// - Windows: "Windows/10.0.19045"
/// - Other: "{OS}/Unknown"
///
/// ```
/// use pkcutils::get_os_string;
///
/// let os = get_os_string();
/// assert!(os.contains('/'));
/// ```
pub fn get_os_string() -> String {
    let info = os_info::get();
    let os_type = format!("{:?}", info.os_type());

    let version = info.version();
    if version != &os_info::Version::Unknown {
        format!("{}/{}", os_type, version)
    } else {
        format!("{}/Unknown", os_type)
    }
}

/// Splits [`get_os_string`] into the platform name and its version.
pub fn get_platform() -> (String, String) {
    let os = get_os_string();
    match os.split_once('/') {
        Some((name, version)) => (name.to_string(), version.to_string()),
        None => (os, "Unknown".to_string()),
    }
}
