//! Dot-notation field paths.
//!
//! Segments are joined with `.`; a literal `.` or `\` inside a key is
//! escaped with a backslash and an empty key is written as `\_`, so every
//! key round-trips and no field maps to the empty path. Array positions are
//! plain decimal segments and are only interpreted as indices when the value
//! being traversed is an array.

/// Join path segments into a dot-notation path.
pub fn join<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        if seg.as_ref().is_empty() {
            out.push_str("\\_");
            continue;
        }
        for c in seg.as_ref().chars() {
            if c == '.' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Append a single segment to an existing (already escaped) path.
pub fn child(parent: &str, segment: &str) -> String {
    let escaped = join(&[segment]);
    if parent.is_empty() {
        escaped
    } else {
        format!("{}.{}", parent, escaped)
    }
}

/// Split a dot-notation path back into raw segments.
pub fn split(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('_') | None => {}
                Some(next) => current.push(next),
            },
            '.' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_split_plain() {
        let path = join(&["pharmgkb", "drug", "name"]);
        assert_eq!(path, "pharmgkb.drug.name");
        assert_eq!(split(&path), vec!["pharmgkb", "drug", "name"]);
    }

    #[test]
    fn test_keys_with_dots_roundtrip() {
        let segments = vec!["ensembl.gene".to_string(), "a\\b".to_string(), "0".to_string()];
        let path = join(&segments);
        assert_eq!(path, "ensembl\\.gene.a\\\\b.0");
        assert_eq!(split(&path), segments);
    }

    #[test]
    fn test_child_escapes_segment() {
        assert_eq!(child("", "v"), "v");
        assert_eq!(child("a", "b.c"), "a.b\\.c");
    }

    #[test]
    fn test_empty_keys_have_a_distinct_path() {
        assert_eq!(join(&[""]), "\\_");
        assert_eq!(split("\\_"), vec![""]);
        assert_eq!(child("", ""), "\\_");
        assert_eq!(child("a", ""), "a.\\_");
        let segments = vec!["".to_string(), "x".to_string(), "".to_string()];
        assert_eq!(split(&join(&segments)), segments);
        // A literal `\_` key is still escaped normally.
        assert_eq!(split(&join(&["\\_"])), vec!["\\_"]);
    }

    #[test]
    fn test_empty_path() {
        assert!(split("").is_empty());
        assert_eq!(join::<&str>(&[]), "");
    }
}
