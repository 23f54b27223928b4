//! Utility functions for Beacon

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Normalize a namespace prefix: ensure a leading `/` and strip trailing `/`.
///
/// # Examples
///
/// ```
/// use beacon_common::utils::normalize_namespace;
///
/// assert_eq!(normalize_namespace("server/"), "/server");
/// assert_eq!(normalize_namespace("/server/echo"), "/server/echo");
/// assert_eq!(normalize_namespace("/"), "");
/// ```
pub fn normalize_namespace(namespace: &str) -> String {
    let trimmed = namespace.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
