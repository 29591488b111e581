//! Deterministic derivation of the accounts involved in one queued
//! verification: the computation record itself plus the compute
//! environment's fixed infrastructure accounts.

use crate::round::{derive_computation_handle, StorageHandle};
use commonware_cryptography::{Hasher, Sha256};

/// The full account set for one verification request. Only the computation
/// handle varies per request; the rest are fixed per program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationAccounts {
    pub computation: StorageHandle,
    pub cluster: StorageHandle,
    pub mxe: StorageHandle,
    pub mempool: StorageHandle,
    pub executing_pool: StorageHandle,
    pub comp_def: StorageHandle,
    pub comp_def_exists: bool,
}

fn fixed_handle(program_id: &[u8; 32], label: &[u8]) -> StorageHandle {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(program_id);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    StorageHandle(out)
}

/// Derive every account handle for a verification request.
pub fn derive_verification_accounts(
    program_id: &[u8; 32],
    computation_offset: u64,
) -> VerificationAccounts {
    VerificationAccounts {
        computation: derive_computation_handle(program_id, computation_offset),
        cluster: fixed_handle(program_id, b"cluster"),
        mxe: fixed_handle(program_id, b"mxe"),
        mempool: fixed_handle(program_id, b"mempool"),
        executing_pool: fixed_handle(program_id, b"executing_pool"),
        comp_def: fixed_handle(program_id, b"comp_def/verify_pair"),
        comp_def_exists: true,
    }
}
