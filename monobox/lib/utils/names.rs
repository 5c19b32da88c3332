//! Random name generation for sandboxes and pool members.

use uuid::Uuid;

use crate::config::{POOL_SUFFIX_LEN, SANDBOX_SUFFIX_LEN};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `len` lowercase hex characters of fresh randomness.
pub fn random_suffix(len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..len.min(hex.len())].to_string()
}

/// Generates a pool member name like `py-pool-1f2e3d4c`.
pub fn member_name(pool: &str) -> String {
    format!("{pool}-{}", random_suffix(POOL_SUFFIX_LEN))
}

/// Generates a standalone sandbox name like `sandbox-0a1b2c3d4e5f`.
pub fn generated_name() -> String {
    format!("sandbox-{}", random_suffix(SANDBOX_SUFFIX_LEN))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
