use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// 96 bits of OS randomness per suffix.
pub const SUFFIX_BYTES: usize = 12;

pub fn random_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `<host>-<suffix>`; unique per process lifetime.
pub fn instance_id() -> String {
    format!("{}-{}", host_label(), random_suffix())
}

pub fn connection_id() -> String {
    Uuid::new_v4().to_string()
}

fn host_label() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|raw| sanitize(&raw))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| "instance".to_string())
}

fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
