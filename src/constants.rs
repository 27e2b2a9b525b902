//! Well-known paths and protocol constants.

use std::time::Duration;

/// Directory whose entry names declare which services the image enabled.
pub const DIR_SERVICES: &str = "/etc/preinit/services";

/// Root of the kernel control surface.
pub const DIR_PROC_SYS: &str = "/proc/sys";

/// Default spec baked into the image at build time, merged under user data.
pub const PATH_DEFAULT_SPEC: &str = "/etc/preinit/vmspec.yaml";

/// Link-local instance metadata endpoint.
pub const ENDPOINT_METADATA_DEFAULT: &str = "169.254.169.254";

/// Signal sent by the "ACPI tiny power button" kernel driver.
/// It is assumed the kernel is compiled to use it.
pub const SIGPWRBTN: libc::c_int = 0x26;

/// Grace period before shutdown escalates to SIGKILL.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
