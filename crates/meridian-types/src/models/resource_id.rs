//! Compact resource ids (`rid`) issued by the service.
//!
//! A rid is padded base64 (with `-` standing in for `/`). The first four bytes
//! encode the database and the next four the collection, little-endian; the
//! high bit of byte 4 marks the id as collection-scoped.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// Decoded database/collection part of a resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub database: u32,
    pub document_collection: u32,
}

impl ResourceId {
    /// Parse a rid string, returning `None` for anything malformed.
    pub fn parse(rid: &str) -> Option<Self> {
        if rid.is_empty() || rid.len() % 4 != 0 {
            return None;
        }
        let bytes = STANDARD.decode(rid.replace('-', "/")).ok()?;
        if bytes.len() < 4 {
            return None;
        }
        let database = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut document_collection = 0;
        if bytes.len() >= 8 && bytes[4] & 0x80 != 0 {
            document_collection = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        }
        Some(Self { database, document_collection })
    }

    /// Check if the id identifies (or lives under) a collection.
    pub fn is_collection_scoped(&self) -> bool {
        self.document_collection != 0
    }

    /// Collection id unique across all databases of the account.
    pub fn unique_document_collection_id(&self) -> u64 {
        (u64::from(self.database) << 32) | u64::from(self.document_collection)
    }

    /// Re-encode the database/collection prefix.
    pub fn collection_rid(&self) -> String {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&self.database.to_le_bytes());
        bytes.extend_from_slice(&self.document_collection.to_le_bytes());
        STANDARD.encode(bytes).replace('/', "-")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encode(database: u32, collection: u32, tail: &[u8]) -> String {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&database.to_le_bytes());
        bytes.extend_from_slice(&collection.to_le_bytes());
        bytes.extend_from_slice(tail);
        STANDARD.encode(bytes).replace('/', "-")
    }

    #[test]
    fn test_parse_collection_rid() {
        let rid = encode(7, 0x0027_97FD, &[]);
        let parsed = ResourceId::parse(&rid).unwrap();
        assert_eq!(parsed.database, 7);
        assert!(parsed.is_collection_scoped());
        assert_eq!(parsed.unique_document_collection_id(), (7u64 << 32) | 0x0027_97FD);
        assert_eq!(parsed.collection_rid(), rid);
    }

    #[test]
    fn test_document_rid_shares_collection_id() {
        let collection = ResourceId::parse(&encode(7, 0x0027_97FD, &[])).unwrap();
        let document = ResourceId::parse(&encode(7, 0x0027_97FD, &[1, 0, 0, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(
            collection.unique_document_collection_id(),
            document.unique_document_collection_id()
        );
    }

    #[test]
    fn test_database_rid_is_not_collection_scoped() {
        let rid = STANDARD.encode(9u32.to_le_bytes());
        let parsed = ResourceId::parse(&rid).unwrap();
        assert!(!parsed.is_collection_scoped());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ResourceId::parse("").is_none());
        assert!(ResourceId::parse("abc").is_none());
        assert!(ResourceId::parse("!!!!").is_none());
    }
}
