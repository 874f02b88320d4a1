//! Object key construction.

/// Key for a job's artifact: `<prefix>/<job_id>-<sanitized original name>`.
///
/// Derived only from the job, so every redelivery of a job writes the same object.
pub fn object_key(prefix: &str, job_id: &str, original_name: &str) -> String {
    let name = format!("{}-{}", job_id, sanitize_file_name(original_name));
    let prefix = prefix.trim_matches('/');

    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Reduce a client-supplied file name to a safe key segment.
pub fn sanitize_file_name(name: &str) -> String {
    // Drop any client-side directory part
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
