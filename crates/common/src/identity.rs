//! Deterministic VM identity

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::VmId;

/// Name hashed under the DNS namespace to obtain the application namespace.
pub const NAMESPACE_NAME: &str = "forensic.vm.mesi.ninja";

static NAMESPACE: Lazy<Uuid> = Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_DNS, NAMESPACE_NAME.as_bytes()));

/// Derive the VM identifier for an image and case.
///
/// The same `(image_path, case_name)` pair always yields the same id, which is
/// what lets a relaunched console reattach to the VM it created earlier.
pub fn resolve(image_path: &str, case_name: &str) -> Result<VmId> {
    if image_path.trim().is_empty() {
        return Err(Error::InvalidIdentity("image path is empty".to_string()));
    }
    if case_name.trim().is_empty() {
        return Err(Error::InvalidIdentity("case name is empty".to_string()));
    }

    let name = format!("{}{}", image_path, case_name);
    Ok(VmId(Uuid::new_v5(&NAMESPACE, name.as_bytes())))
}
