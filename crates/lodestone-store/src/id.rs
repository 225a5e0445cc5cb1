//! Client-side document id generation.
//!
//! Ids are generated locally so an optimistic cache insert and the confirmed
//! remote write agree on the document's identity without reconciliation.

use uuid::Uuid;

/// Alphabet used for generated document ids.
const AUTO_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated document ids.
const AUTO_ID_LENGTH: usize = 20;

/// Generate a new 20-character alphanumeric document id.
///
/// Uses two v4 UUIDs as the entropy source, mapping each random byte onto
/// the 62-character alphabet.
pub fn generate_document_id() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());

    bytes
        .into_iter()
        .take(AUTO_ID_LENGTH)
        .map(|b| AUTO_ID_ALPHABET[b as usize % AUTO_ID_ALPHABET.len()] as char)
        .collect()
}
