//! Forwarding of newly stored tags to an external lookup.
//!
//! The lookup itself (for example a permit/vehicle service) lives outside this
//! crate. The scanner only hands it each tag the first time it is stored and
//! relays whatever summary comes back.

use anyhow::Result;
use async_trait::async_trait;

use crate::db::StoredTag;

const PERMIT_DIGITS: usize = 5;

#[async_trait]
pub trait TagLookup: Send + Sync + 'static {
    /// Resolves a freshly stored tag. `Ok(None)` means nothing was found.
    async fn lookup(&self, tag: &StoredTag) -> Result<Option<String>>;
}

/// Permit number encoded in the last five characters of an EPC.
pub fn permit_id(epc: &str) -> Option<u32> {
    let chars: Vec<char> = epc.trim().chars().collect();
    if chars.len() < PERMIT_DIGITS {
        return None;
    }
    let tail: String = chars[chars.len() - PERMIT_DIGITS..].iter().collect();
    if !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    tail.parse().ok()
}

/// Offline lookup that reports the permit number carried in the EPC.
pub struct PermitLookup;

#[async_trait]
impl TagLookup for PermitLookup {
    async fn lookup(&self, tag: &StoredTag) -> Result<Option<String>> {
        Ok(permit_id(&tag.epc).map(|id| format!("permit {id:05}")))
    }
}
