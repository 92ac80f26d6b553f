
use rand::{thread_rng, Rng};

/// Characters the short connectivity credentials are drawn from
/// (the base64-url alphabet).
const RUNES_BASE64_URL: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

pub(crate) const LEN_UFRAG: usize = 4;
pub(crate) const LEN_PWD: usize = 22;

// TODO: cryptographically strong random source
pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = thread_rng();

    (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..runes.len());
            runes[idx] as char
        })
        .collect()
}

/// Generates the session password used to authenticate connectivity checks.
pub fn generate_pwd() -> String {
    generate_crypto_random_string(LEN_PWD, RUNES_BASE64_URL)
}

/// Generates the session username fragment.
pub fn generate_ufrag() -> String {
    generate_crypto_random_string(LEN_UFRAG, RUNES_BASE64_URL)
}
