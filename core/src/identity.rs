use blake3::Hasher;

use crate::item::ClipKind;

const HASH_CHUNK: usize = 64 * 1024;
const UNIQUE_PREFIX_LEN: usize = 32;

/// Captures inside the same bucket collapse to one row; identical content
/// copied in a later bucket stays distinct history.
pub const BUCKET_SECS: i64 = 60;

fn feed(hasher: &mut Hasher, data: &[u8]) {
    // streaming update, payloads may be megabytes
    for chunk in data.chunks(HASH_CHUNK) {
        hasher.update(chunk);
    }
}

/// Content-equality fingerprint over the normalized payload: the decoded
/// string for text-like kinds, raw bytes otherwise. Independent of source
/// app and capture time.
pub fn content_tag(kind: ClipKind, data: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&[0]);
    if kind.is_text_like() {
        let text = String::from_utf8_lossy(data);
        feed(&mut hasher, text.as_bytes());
    } else {
        feed(&mut hasher, data);
    }
    hasher.finalize().to_hex().to_string()
}

/// Dedup key: content+kind+app hash prefix joined with a coarse capture
/// bucket. Re-copying the same item from the same app within one bucket
/// produces the same key, so the store's replace-on-insert collapses it.
pub fn unique_id(kind: ClipKind, data: &[u8], app_path: &str, now_epoch: i64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(app_path.as_bytes());
    hasher.update(&[0]);
    feed(&mut hasher, data);
    let hex = hasher.finalize().to_hex();
    format!("{}-{}", &hex.as_str()[..UNIQUE_PREFIX_LEN], now_epoch / BUCKET_SECS)
}
