use std::path::Path;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::error::{PoolResult, ProtocolError};

/// Per-round record handed to the verifier. Enough to rebuild the coinbase,
/// recompute the challenge and check the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBlock {
    pub part0: Vec<u8>,
    pub marker: [u8; 4],
    pub extranonce2: Vec<u8>,
    /// Coinbase part 1 with the Sigma response in its first 32 bytes.
    pub part1: Vec<u8>,
    pub nonce: u32,
    pub bits: [u8; 4],
    pub curtime: u32,
    /// Previous block hash as the daemon displays it.
    pub previous_block_hash: [u8; 32],
    pub version: u32,
}

fn prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

impl ResponseBlock {
    pub fn to_hex_fields(&self) -> [String; 9] {
        [
            prefixed(&self.part0),
            prefixed(&self.marker),
            prefixed(&self.extranonce2),
            prefixed(&self.part1),
            prefixed(&self.nonce.to_be_bytes()),
            prefixed(&self.bits),
            prefixed(&self.curtime.to_be_bytes()),
            prefixed(&self.previous_block_hash),
            prefixed(&self.version.to_be_bytes()),
        ]
    }

    pub fn sigma_response(&self) -> Option<[u8; 32]> {
        self.part1.get(..32)?.try_into().ok()
    }
}

impl Serialize for ResponseBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.to_hex_fields();
        let mut seq = serializer.serialize_seq(Some(fields.len()))?;
        for field in &fields {
            seq.serialize_element(field)?;
        }
        seq.end()
    }
}

/// Ordered response blocks, one per round. Valid once it holds exactly
/// `total_rounds` entries; written to disk at most once.
#[derive(Debug, Clone)]
pub struct ProofBundle {
    blocks: Vec<ResponseBlock>,
    total_rounds: usize,
    persisted: bool,
}

impl ProofBundle {
    pub fn new(total_rounds: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(total_rounds),
            total_rounds,
            persisted: false,
        }
    }

    pub fn push(&mut self, block: ResponseBlock) -> Result<(), ProtocolError> {
        if self.blocks.len() >= self.total_rounds {
            return Err(ProtocolError::BundleFull(self.total_rounds));
        }
        self.blocks.push(block);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn total_rounds(&self) -> usize {
        self.total_rounds
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.len() == self.total_rounds
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn blocks(&self) -> &[ResponseBlock] {
        &self.blocks
    }

    pub fn to_hex_rows(&self) -> Vec<[String; 9]> {
        self.blocks.iter().map(ResponseBlock::to_hex_fields).collect()
    }

    /// Write the completed bundle as a JSON array of rows.
    pub fn persist(&mut self, path: &Path) -> PoolResult<()> {
        if self.persisted {
            return Err(ProtocolError::AlreadyPersisted.into());
        }
        if !self.is_complete() {
            return Err(ProtocolError::BundleIncomplete {
                have: self.blocks.len(),
                need: self.total_rounds,
            }
            .into());
        }
        let json = serde_json::to_vec_pretty(&self.to_hex_rows())?;
        std::fs::write(path, json)?;
        self.persisted = true;
        tracing::info!(path = %path.display(), rounds = self.total_rounds, "proof bundle persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;

    fn block(tag: u8) -> ResponseBlock {
        ResponseBlock {
            part0: vec![0x01, tag],
            marker: [0xde, 0xad, 0xc0, 0xde],
            extranonce2: vec![tag],
            part1: vec![tag; 40],
            nonce: 0x0257_0730,
            bits: [0x1d, 0x00, 0xff, 0xff],
            curtime: 0x6337_80f7,
            previous_block_hash: [0u8; 32],
            version: 0x2000_0000,
        }
    }

    #[test]
    fn hex_fields_follow_verifier_order() {
        let f = block(7).to_hex_fields();
        assert_eq!(f[0], "0x0107");
        assert_eq!(f[1], "0xdeadc0de");
        assert_eq!(f[2], "0x07");
        assert_eq!(f[4], "0x02570730");
        assert_eq!(f[5], "0x1d00ffff");
        assert_eq!(f[6], "0x633780f7");
        assert_eq!(f[7].len(), 66);
        assert_eq!(f[8], "0x20000000");
        assert_eq!(block(7).sigma_response(), Some([7u8; 32]));
    }

    #[test]
    fn serializes_as_plain_array() {
        let json = serde_json::to_value(block(1)).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(9));
    }

    #[test]
    fn refuses_more_than_total_rounds() {
        let mut bundle = ProofBundle::new(1);
        bundle.push(block(1)).unwrap();
        assert_eq!(bundle.push(block(2)), Err(ProtocolError::BundleFull(1)));
        assert!(bundle.is_complete());
    }

    #[test]
    fn persist_requires_completion_and_happens_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let mut bundle = ProofBundle::new(2);
        bundle.push(block(1)).unwrap();

        let err = bundle.persist(&path).unwrap_err();
        assert!(matches!(
            err,
            PoolError::Protocol(ProtocolError::BundleIncomplete { have: 1, need: 2 })
        ));
        assert!(!path.exists());

        bundle.push(block(2)).unwrap();
        bundle.persist(&path).unwrap();
        let written: Vec<[String; 9]> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, bundle.to_hex_rows());

        assert!(matches!(
            bundle.persist(&path),
            Err(PoolError::Protocol(ProtocolError::AlreadyPersisted))
        ));
    }
}
