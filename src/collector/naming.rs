//! Artifact file-name rules.

/// True when `file_name` ends with one of `extensions` (case-insensitive).
pub fn is_archive(file_name: &str, extensions: &[String]) -> bool {
    let lower = file_name.to_ascii_lowercase();
    extensions.iter().any(|ext| {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        lower.len() > ext.len() + 1 && lower.ends_with(&format!(".{}", ext))
    })
}

/// Replaces any placeholder token in `file_name` with `host`.
///
/// Returns `None` when the name carries no placeholder.
pub fn normalize_name(file_name: &str, placeholder_tokens: &[String], host: &str) -> Option<String> {
    let mut name = file_name.to_string();
    for token in placeholder_tokens.iter().filter(|t| !t.is_empty()) {
        if name.contains(token.as_str()) {
            name = name.replace(token.as_str(), &sanitize_host(host));
        }
    }
    (name != file_name).then_some(name)
}

/// Host names become part of a file name; keep only portable characters.
pub fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Path of a file named `new_name` in the same directory as `path`.
///
/// Works on both `/` and `\` separated paths since remote paths are plain strings.
pub fn sibling_path(path: &str, new_name: &str) -> String {
    match path.rfind(['/', '\\']) {
        Some(idx) => format!("{}{}", &path[..=idx], new_name),
        None => new_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_archive() {
        let exts = strings(&["zip", "tar.gz", ".tgz"]);
        assert!(is_archive("azcmagent-logs-20261019.ZIP", &exts));
        assert!(is_archive("bundle.tar.gz", &exts));
        assert!(is_archive("bundle.tgz", &exts));
        assert!(!is_archive("notes.txt", &exts));
        assert!(!is_archive(".zip", &exts));
        assert!(!is_archive("archive.gz", &exts));
    }

    #[test]
    fn test_normalize_replaces_placeholder() {
        let tokens = strings(&["%COMPUTERNAME%", "UNKNOWN_HOST"]);
        assert_eq!(
            normalize_name("azcmagent-logs-1019T1200-%COMPUTERNAME%.zip", &tokens, "SRV01"),
            Some("azcmagent-logs-1019T1200-SRV01.zip".to_string())
        );
        assert_eq!(
            normalize_name("logs-UNKNOWN_HOST.zip", &tokens, "srv02.corp"),
            Some("logs-srv02.corp.zip".to_string())
        );
    }

    #[test]
    fn test_normalize_leaves_real_names_alone() {
        let tokens = strings(&["%COMPUTERNAME%"]);
        assert_eq!(normalize_name("azcmagent-logs-SRV01.zip", &tokens, "SRV01"), None);
    }

    #[test]
    fn test_sanitize_host() {
        assert_eq!(sanitize_host("srv01.corp"), "srv01.corp");
        assert_eq!(sanitize_host("fe80::1"), "fe80__1");
    }

    #[test]
    fn test_sibling_path() {
        assert_eq!(sibling_path("/tmp/x/a.zip", "b.zip"), "/tmp/x/b.zip");
        assert_eq!(sibling_path("C:\\diag\\a.zip", "b.zip"), "C:\\diag\\b.zip");
        assert_eq!(sibling_path("a.zip", "b.zip"), "b.zip");
    }
}
