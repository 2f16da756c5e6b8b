//! Id generation for sessions and transfer tasks.

use rand::RngCore;
use uuid::Uuid;

/// Session ids are UUID v4 strings.
pub fn session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Transfer task ids are 16 random bytes, hex-encoded.
pub fn task_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
