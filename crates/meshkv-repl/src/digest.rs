//! Anti-entropy fingerprints for stored envelopes.
//!
//! A digest is the SHA-1 of the canonical serialized image of an
//! envelope, or the empty byte string for a deleted entry. Replicas
//! compare digest maps during gossip to find keys that diverged; equal
//! digests mean equal envelopes because the serialized form is canonical
//! (all envelope maps are ordered).

use crate::envelope::Envelope;
use crate::error::ReplError;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use std::fmt;

/// Fingerprint of one stored envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// The digest of a deleted entry: the empty byte string.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Compute the digest of an envelope.
    ///
    /// Deleted envelopes always digest to [`Digest::empty`], so every
    /// replica agrees on the fingerprint of a tombstone regardless of
    /// what metadata the envelope carried when it died.
    pub fn of(envelope: &Envelope) -> Result<Self, ReplError> {
        if envelope.is_deleted() {
            return Ok(Self::empty());
        }
        let image = bincode::serialize(envelope)?;
        Ok(Self(Sha1::digest(&image).to_vec()))
    }

    /// Whether this is the deleted-entry digest.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
