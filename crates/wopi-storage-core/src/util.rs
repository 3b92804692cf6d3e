use std::sync::LazyLock;

use uuid::Uuid;

static PROCESS_ID: LazyLock<String> = LazyLock::new(|| random_hex(8));

/// `len` random lowercase hex digits from the OS random source.
pub fn random_hex(len: usize) -> String {
    let mut out = String::with_capacity(len + 32);
    while out.len() < len {
        out.push_str(&hex::encode(Uuid::new_v4().as_bytes()));
    }
    out.truncate(len);
    out
}

/// Stable identifier of this process, sent to storage hosts as the server id.
pub fn process_identifier() -> &'static str {
    &PROCESS_ID
}
