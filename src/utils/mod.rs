//! Utility helpers module

pub mod time;

/// Case-insensitive substring check without allocating lowercase copies.
/// Uses a sliding window and only compares at valid UTF-8 boundaries.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    for i in 0..=(haystack.len() - needle.len()) {
        if !haystack.is_char_boundary(i) || !haystack.is_char_boundary(i + needle.len()) {
            continue;
        }
        if haystack[i..i + needle.len()].eq_ignore_ascii_case(needle) {
            return true;
        }
    }
    false
}

/// Truncates an evidence value to `max` characters, appending `...` when
/// anything was cut. Splits on character boundaries only.
pub fn truncate_value(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max).collect();
    out.push_str("...");
    out
}

/// Extracts the lowercase file name from a Windows or POSIX path
/// (e.g. `C:\Windows\System32\cmd.exe` -> `cmd.exe`).
pub fn image_basename(path: &str) -> String {
    path.rsplit(['\\', '/'])
        .next()
        .unwrap_or(path)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_ignore_case() {
        assert!(contains_ignore_case(
            "C:\\Windows\\System32\\WHOAMI.exe",
            "whoami"
        ));
        assert!(contains_ignore_case("abc", ""));
        assert!(!contains_ignore_case("ab", "abc"));
        assert!(!contains_ignore_case("cmd.exe", "powershell"));
    }

    #[test]
    fn test_contains_ignore_case_multibyte_safe() {
        // Must not panic on non-ASCII haystacks.
        assert!(contains_ignore_case("héllo wörld cmd.exe", "cmd"));
        assert!(!contains_ignore_case("héllo", "zz"));
    }

    #[test]
    fn test_truncate_value() {
        assert_eq!(truncate_value("short", 100), "short");
        let long = "x".repeat(150);
        let truncated = truncate_value(&long, 100);
        assert_eq!(truncated.chars().count(), 103);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_image_basename() {
        assert_eq!(
            image_basename("C:\\Windows\\System32\\Cmd.EXE"),
            "cmd.exe"
        );
        assert_eq!(image_basename("/usr/bin/bash"), "bash");
        assert_eq!(image_basename("standalone.exe"), "standalone.exe");
    }
}
