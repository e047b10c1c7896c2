use uuid::Uuid;

/// Derive a UUID-shaped identifier from an arbitrary string.
///
/// The result is a name-based (v5) UUID in the URL namespace, so the same input always yields
/// the same identifier, on any cluster.
pub fn to_uuid(input: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, input.as_bytes()).to_string()
}

/// The cross ID of a resource: an explicitly pinned value if there is one, otherwise a UUID
/// derived from `{namespace}/{name}`.
pub fn cross_id_for(namespace: &str, name: &str, explicit: Option<&str>) -> String {
    match explicit.map(str::trim) {
        Some(pinned) if !pinned.is_empty() => pinned.to_owned(),
        _ => to_uuid(&format!("{namespace}/{name}")),
    }
}
