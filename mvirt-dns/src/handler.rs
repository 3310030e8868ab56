//! Query answering seam.
//!
//! Workers hand every received DNS message to a [`QueryHandler`] together with
//! the catalog generation they currently hold. Matching and response building
//! live behind this trait.

use crate::catalog::Catalog;

/// DNS header size in bytes.
pub const DNS_HEADER_SIZE: usize = 12;

const FLAG_QR: u8 = 0x80;
const RCODE_REFUSED: u8 = 5;

pub trait QueryHandler: Send + Sync {
    /// Answer `query` from `catalog`, writing the reply into `response`
    /// (which arrives empty). Returns false to send nothing.
    fn answer(&self, catalog: &Catalog, query: &[u8], response: &mut Vec<u8>) -> bool;
}

/// Answers every well-formed query with REFUSED.
#[derive(Debug, Default)]
pub struct RefusingHandler;

impl QueryHandler for RefusingHandler {
    fn answer(&self, _catalog: &Catalog, query: &[u8], response: &mut Vec<u8>) -> bool {
        if query.len() < DNS_HEADER_SIZE || query[2] & FLAG_QR != 0 {
            return false;
        }
        response.extend_from_slice(&query[..DNS_HEADER_SIZE]);
        response[2] |= FLAG_QR;
        response[3] = (response[3] & 0xf0) | RCODE_REFUSED;
        response[4..DNS_HEADER_SIZE].fill(0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_queries() {
        let query = [0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 3, b'w', b'w', b'w', 0];
        let mut response = Vec::new();
        assert!(RefusingHandler.answer(&Catalog::new(), &query, &mut response));
        assert_eq!(&response[..2], &[0x12, 0x34]);
        assert_eq!(response[2], 0x81);
        assert_eq!(response[3] & 0x0f, RCODE_REFUSED);
        assert_eq!(response.len(), DNS_HEADER_SIZE);
    }

    #[test]
    fn test_ignores_responses_and_runts() {
        let mut response = Vec::new();
        let reply = [0, 0, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(!RefusingHandler.answer(&Catalog::new(), &reply, &mut response));
        assert!(!RefusingHandler.answer(&Catalog::new(), &[0; 4], &mut response));
        assert!(response.is_empty());
    }
}
