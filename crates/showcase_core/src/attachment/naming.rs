//! Attachment ref generation.
//!
//! Format: `upload-<millis>-<random>[.<ext>]`. `millis` comes from a
//! process-wide clock that never repeats a value, so two refs generated by
//! one process never collide even when the random suffix does.

use crate::model::project::AttachmentRef;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const REF_PREFIX: &str = "upload";
const RANDOM_SUFFIX_MODULUS: u128 = 1_000_000_000;

static EXTENSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]{1,10}$").expect("valid extension regex"));
static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Generates a fresh ref for an upload whose original name was `original_name`.
pub fn generate_ref(original_name: &str) -> AttachmentRef {
    let millis = next_monotonic_millis();
    let random = Uuid::new_v4().as_u128() % RANDOM_SUFFIX_MODULUS;
    let name = match normalize_extension(original_name) {
        Some(ext) => format!("{REF_PREFIX}-{millis}-{random:09}.{ext}"),
        None => format!("{REF_PREFIX}-{millis}-{random:09}"),
    };
    AttachmentRef::from_generated(name)
}

/// Derives the stored extension from an uploaded file name.
///
/// Lowercased; dropped when it is not a short alphanumeric token.
pub fn normalize_extension(original_name: &str) -> Option<String> {
    let ext = Path::new(original_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    EXTENSION_RE.is_match(&ext).then_some(ext)
}

fn next_monotonic_millis() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64);
    let mut last = LAST_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MILLIS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_ref, next_monotonic_millis, normalize_extension};

    #[test]
    fn extension_is_lowercased_and_filtered() {
        assert_eq!(normalize_extension("Photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(normalize_extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(normalize_extension("no_extension"), None);
        assert_eq!(normalize_extension("weird.p$g"), None);
        assert_eq!(normalize_extension("long.abcdefghijk"), None);
    }

    #[test]
    fn generated_ref_has_prefix_and_extension() {
        let generated = generate_ref("cover.PNG");
        assert!(generated.as_str().starts_with("upload-"));
        assert!(generated.as_str().ends_with(".png"));
    }

    #[test]
    fn monotonic_clock_never_repeats() {
        let first = next_monotonic_millis();
        let second = next_monotonic_millis();
        assert!(second > first);
    }
}
