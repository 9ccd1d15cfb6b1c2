//! User handle rules: normalization, validation, automatic allocation and
//! display fallback. Apart from [`allocate_handle`], which consults the user
//! store, everything here is pure and total; uniqueness is the store's
//! concern, this module only guarantees syntactic validity and deterministic
//! candidate generation.

use crate::repository::{RepositoryError, UserRepository};

pub const MAX_HANDLE_LENGTH: usize = 15;
pub const FALLBACK_HANDLE: &str = "numatter";
pub const FALLBACK_DISPLAY_HANDLE: &str = "@Numatter";

const CHECKSUM_LENGTH: usize = 4;
// 36^4: the checksum folds into exactly four base-36 digits.
const CHECKSUM_SPACE: u32 = 1_679_616;

/// Strips surrounding whitespace, lowercases, and drops any leading `@`s.
pub fn normalize_handle(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .trim_start_matches('@')
        .to_string()
}

/// Normalizes, strips every character outside `[a-z0-9_]`, truncates to the
/// maximum length. Used to clean a handle draft while the user is typing.
pub fn sanitize_handle_draft(value: &str) -> String {
    normalize_handle(value)
        .chars()
        .filter(|ch| is_handle_char(*ch))
        .take(MAX_HANDLE_LENGTH)
        .collect()
}

pub fn is_valid_handle(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_HANDLE_LENGTH && value.chars().all(is_handle_char)
}

/// Normalize-then-validate; `None` when the input does not survive as a
/// syntactically valid handle.
pub fn parse_handle(value: Option<&str>) -> Option<String> {
    let normalized = normalize_handle(value?);
    if is_valid_handle(&normalized) {
        Some(normalized)
    } else {
        None
    }
}

/// Ordered handle candidates derived from an opaque user id, most natural
/// first, checksum-suffixed fallback last. Every entry validates and the list
/// holds no duplicates.
pub fn auto_handle_candidates(user_id: &str) -> Vec<String> {
    let sanitized = sanitize_handle_seed(user_id);
    let seed = if sanitized.is_empty() {
        "user".to_string()
    } else {
        sanitized
    };
    let mut candidates = Vec::new();

    push_candidate(&mut candidates, head(&seed, MAX_HANDLE_LENGTH));

    if seed.len() > MAX_HANDLE_LENGTH {
        push_candidate(&mut candidates, tail(&seed, MAX_HANDLE_LENGTH));
        let tail_length = 4;
        push_candidate(
            &mut candidates,
            format!(
                "{}{}",
                head(&seed, MAX_HANDLE_LENGTH - tail_length),
                tail(&seed, tail_length)
            ),
        );
    }

    // The checksum folds the raw id, not the sanitized seed, so ids that
    // sanitize to the same seed still diverge here.
    let checksum = handle_checksum(user_id);
    push_candidate(
        &mut candidates,
        format!(
            "{}{}",
            head(&seed, MAX_HANDLE_LENGTH - checksum.len()),
            checksum
        ),
    );

    if candidates.is_empty() {
        push_candidate(&mut candidates, head(&format!("user{checksum}"), MAX_HANDLE_LENGTH));
    }

    candidates
}

/// The preferred candidate, falling back to the service default when the
/// candidate list is empty.
pub fn auto_handle_from_user_id(user_id: &str) -> String {
    auto_handle_candidates(user_id)
        .into_iter()
        .next()
        .unwrap_or_else(|| FALLBACK_HANDLE.to_string())
}

/// Picks the first candidate not already taken in the user store. `None` when
/// every candidate is taken; the caller leaves the account without a handle
/// and the display fallback covers rendering.
pub async fn allocate_handle(
    users: &dyn UserRepository,
    user_id: &str,
) -> Result<Option<String>, RepositoryError> {
    for candidate in auto_handle_candidates(user_id) {
        if users.find_user_by_handle(&candidate).await?.is_none() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// The `@`-prefixed string shown in the UI. Never fails: falls back from the
/// stored handle, to the sanitized display name, to the sanitized id, to the
/// service literal.
pub fn display_handle(handle: Option<&str>, name: Option<&str>, user_id: &str) -> String {
    if let Some(handle) = parse_handle(handle) {
        return format!("@{handle}");
    }

    let name_seed = sanitize_handle_seed(name.unwrap_or_default());
    if !name_seed.is_empty() {
        return format!("@{}", head(&name_seed, MAX_HANDLE_LENGTH));
    }

    let id_seed = sanitize_handle_seed(user_id);
    if !id_seed.is_empty() {
        return format!("@{}", head(&id_seed, MAX_HANDLE_LENGTH));
    }

    FALLBACK_DISPLAY_HANDLE.to_string()
}

fn is_handle_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_'
}

fn sanitize_handle_seed(value: &str) -> String {
    let filtered: String = value
        .to_lowercase()
        .chars()
        .filter(|ch| is_handle_char(*ch))
        .collect();
    filtered.trim_matches('_').to_string()
}

fn handle_checksum(value: &str) -> String {
    let mut sum: u32 = 0;
    for ch in value.chars() {
        sum = (sum * 31 + ch as u32) % CHECKSUM_SPACE;
    }

    let mut digits = ['0'; CHECKSUM_LENGTH];
    let mut rest = sum;
    for slot in digits.iter_mut().rev() {
        *slot = char::from_digit(rest % 36, 36).unwrap_or('0');
        rest /= 36;
    }
    digits.iter().collect()
}

fn push_candidate(candidates: &mut Vec<String>, value: String) {
    if !is_valid_handle(&value) {
        return;
    }
    if candidates.iter().any(|existing| existing == &value) {
        return;
    }
    candidates.push(value);
}

fn head(value: &str, length: usize) -> String {
    value.chars().take(length).collect()
}

fn tail(value: &str, length: usize) -> String {
    let total = value.chars().count();
    value.chars().skip(total.saturating_sub(length)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handle_is_idempotent() {
        for raw in ["  @Alice_01 ", "@@BOB", "charlie", "", " @ ", "@日本語"] {
            let once = normalize_handle(raw);
            assert_eq!(normalize_handle(&once), once);
        }
    }

    #[test]
    fn normalize_handle_strips_leading_ats_and_lowercases() {
        assert_eq!(normalize_handle("  @Alice_01 "), "alice_01");
        assert_eq!(normalize_handle("@@@Nested"), "nested");
    }

    #[test]
    fn sanitize_handle_draft_strips_and_truncates() {
        assert_eq!(sanitize_handle_draft("@Alice-01!"), "alice01");
        assert_eq!(
            sanitize_handle_draft("abcdefghijklmnopqrstuvwxyz"),
            "abcdefghijklmno"
        );
        assert_eq!(sanitize_handle_draft("   "), "");
    }

    #[test]
    fn is_valid_handle_enforces_charset_and_length() {
        assert!(is_valid_handle("a"));
        assert!(is_valid_handle("abc_123"));
        assert!(is_valid_handle("exactly15chars_"));
        assert!(!is_valid_handle(""));
        assert!(!is_valid_handle("sixteen_chars_xx"));
        assert!(!is_valid_handle("Upper"));
        assert!(!is_valid_handle("has space"));
        assert!(!is_valid_handle("héllo"));
    }

    #[test]
    fn parse_handle_normalizes_or_rejects() {
        assert_eq!(parse_handle(Some("@Alice_01")), Some("alice_01".to_string()));
        assert_eq!(parse_handle(Some("  bob  ")), Some("bob".to_string()));
        assert_eq!(parse_handle(Some("not valid!")), None);
        assert_eq!(parse_handle(None), None);
    }

    #[test]
    fn checksum_is_pinned_for_known_seed() {
        assert_eq!(handle_checksum("clx0000000000000000000001"), "bcog");
    }

    #[test]
    fn checksum_is_always_four_base36_digits() {
        for value in ["", "a", "user", "@@@", "a-very-long-identifier-string"] {
            let checksum = handle_checksum(value);
            assert_eq!(checksum.len(), 4);
            assert!(checksum.chars().all(|ch| ch.is_ascii_digit() || ch.is_ascii_lowercase()));
        }
        assert_eq!(handle_checksum(""), "0000");
    }

    #[test]
    fn candidates_for_long_seed_include_tail_hybrid_and_checksum() {
        assert_eq!(
            auto_handle_candidates("clx0000000000000000000001"),
            vec![
                "clx000000000000".to_string(),
                "000000000000001".to_string(),
                "clx000000000001".to_string(),
                "clx00000000bcog".to_string(),
            ]
        );
    }

    #[test]
    fn candidates_for_short_seed_are_seed_plus_checksum() {
        assert_eq!(
            auto_handle_candidates("user_abc"),
            vec!["user_abc".to_string(), "user_abcpq0e".to_string()]
        );
    }

    #[test]
    fn candidates_fall_back_to_user_seed_when_id_sanitizes_empty() {
        assert_eq!(
            auto_handle_candidates("@@@"),
            vec!["user".to_string(), "user1d1c".to_string()]
        );
        assert_eq!(
            auto_handle_candidates(""),
            vec!["user".to_string(), "user0000".to_string()]
        );
    }

    #[test]
    fn every_candidate_validates_for_arbitrary_seeds() {
        let seeds = [
            "clx0000000000000000000001",
            "用户身份",
            "___",
            "MiXeD-Case.Id",
            "a",
            "",
            "0123456789abcdefghijklmnopqrstuvwxyz",
        ];
        for seed in seeds {
            let candidates = auto_handle_candidates(seed);
            assert!(!candidates.is_empty(), "no candidates for {seed:?}");
            for candidate in &candidates {
                assert!(is_valid_handle(candidate), "invalid candidate {candidate:?}");
            }
            let mut deduped = candidates.clone();
            deduped.dedup();
            assert_eq!(deduped.len(), candidates.len(), "duplicates for {seed:?}");
        }
    }

    #[test]
    fn candidates_are_deterministic_across_calls() {
        for seed in ["clx0000000000000000000001", "alice", "@@@"] {
            assert_eq!(auto_handle_candidates(seed), auto_handle_candidates(seed));
        }
    }

    #[test]
    fn auto_handle_prefers_first_candidate() {
        assert_eq!(auto_handle_from_user_id("abc123"), "abc123");
        assert_eq!(auto_handle_from_user_id("@@@"), "user");
    }

    #[test]
    fn display_handle_follows_fallback_order() {
        assert_eq!(
            display_handle(Some("Alice_01"), Some("x"), "y"),
            "@alice_01"
        );
        assert_eq!(display_handle(None, Some(""), "abc123"), "@abc123");
        assert_eq!(display_handle(None, None, ""), "@Numatter");
        assert_eq!(
            display_handle(None, Some("Ada Lovelace"), "id"),
            "@adalovelace"
        );
        assert_eq!(
            display_handle(Some("not a handle!"), None, "abc123"),
            "@abc123"
        );
    }

    #[test]
    fn display_handle_truncates_seeds_to_max_length() {
        assert_eq!(
            display_handle(None, Some("abcdefghijklmnopqrstuvwxyz"), "id"),
            "@abcdefghijklmno"
        );
    }
}
