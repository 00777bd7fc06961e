use md5::{Digest, Md5};

/// Derives `key_len` bytes from a password the EVP-BytesToKey way: MD5, one
/// iteration, no salt. `D_1 = MD5(P)`, `D_i = MD5(D_{i-1} ‖ P)`, and the key
/// is the concatenation truncated to `key_len`.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut digest: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut md = Md5::new();
        if let Some(prev) = digest {
            md.update(prev);
        }
        md.update(password);
        let round: [u8; 16] = md.finalize().into();
        key.extend_from_slice(&round);
        digest = Some(round);
    }

    key.truncate(key_len);
    key
}
