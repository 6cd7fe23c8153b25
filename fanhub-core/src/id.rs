//! Identifier helpers shared by the server and the cluster layer

/// Generate a unique node ID for this server instance
///
/// Format: `{hostname}-{suffix}`. The suffix keeps two processes on the same
/// host apart.
#[must_use]
pub fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

/// Generate a connection identity for a freshly accepted client
#[must_use]
pub fn generate_connection_id() -> String {
    format!("conn_{}", nanoid::nanoid!(12))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = generate_connection_id();
        let b = generate_connection_id();

        assert!(a.starts_with("conn_"));
        assert_eq!(a.len(), "conn_".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_id_has_suffix() {
        let id = generate_node_id();
        // nanoid's alphabet contains '-', so locate the separator by position
        assert!(id.len() > 7);
        assert_eq!(id.as_bytes()[id.len() - 7], b'-');
    }
}
