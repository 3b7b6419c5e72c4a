use std::sync::OnceLock;

use regex::Regex;

/// Length of a canonical UUID string.
pub const SESSION_ID_LEN: usize = 36;

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        )
        .expect("session id pattern is valid")
    })
}

/// `true` iff `id` is a canonical UUID: 36 characters, dashes at byte
/// positions 8, 13, 18 and 23, hex digits everywhere else.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN && session_id_pattern().is_match(id)
}

/// Extract the session id from a `.jsonl` filename.
///
/// Returns `None` when the name does not end in `.jsonl` or the stem is
/// not a canonical UUID.
pub fn session_id_from_file_name(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(".jsonl")?;
    is_valid_session_id(stem).then_some(stem)
}
