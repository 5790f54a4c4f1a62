//! Cluster instance id and hostname resolution.

use tracing::{info, warn};

use netwarden_config::is_valid_instance_id;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Pick the instance id from, in order: a valid configured id, the host's
/// machine id combined with the service port, or a random id.
///
/// Hardware ids look like `01ff` + 12 hex chars of the machine id + the port
/// as 4 hex chars. Random ids are `09ff` + 12 random hex chars + `0000`.
pub fn derive_instance_id(configured: Option<&str>, port: u16, machine_id: Option<&str>) -> String {
    if let Some(id) = configured {
        if is_valid_instance_id(id) {
            return id.to_string();
        }
        warn!(instance_id = id, "Configured cluster id is invalid, deriving one instead");
    }

    if let Some(hex) = machine_id.and_then(machine_hex) {
        return format!("01ff{hex}{port:04x}");
    }

    let random = uuid::Uuid::new_v4().simple().to_string();
    let id = format!("09ff{}0000", &random[..12]);
    warn!(instance_id = %id, "No hardware identity available, using a random cluster id");
    id
}

/// First 12 lowercase hex digits of a machine id, if it has that many.
fn machine_hex(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .take(12)
        .collect();
    (hex.len() == 12).then_some(hex)
}

/// Resolve the id for this process, reading the host machine id if needed.
pub fn resolve_instance_id(configured: Option<&str>, port: u16) -> String {
    let machine_id = MACHINE_ID_PATHS
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok());
    let id = derive_instance_id(configured, port, machine_id.as_deref());
    info!(instance_id = %id, "Cluster instance id");
    id
}

pub fn local_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}
