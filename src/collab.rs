//! Boundary to the key-management collaborator.
//!
//! Key generation, secret sharing and verification live outside this
//! crate. Replication only needs an opaque signing capability; the bytes
//! it returns are never inspected here.

pub trait Signer: Send + Sync {
    fn public_key(&self) -> String;

    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
}
