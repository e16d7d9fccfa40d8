use sha2::{Digest, Sha256};

const NULL_FRAME: [u8; 8] = u64::MAX.to_le_bytes();

/// Row fingerprint: SHA-256 hex over the values in canonical column order.
/// Each value is framed by its byte length; nulls get a reserved frame, so
/// `[None]`, `[Some("")]`, `["a", "bc"]` and `["ab", "c"]` all differ.
pub fn fingerprint<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut hasher = Sha256::new();
    for value in values {
        match value {
            None => hasher.update(NULL_FRAME),
            Some(v) => {
                hasher.update((v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())
}
