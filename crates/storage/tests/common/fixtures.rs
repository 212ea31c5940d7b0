/// Session URL on the fixture upload server.
pub fn session_url(id: &str) -> String {
    format!("https://up.example.com/files/{id}")
}

/// Stored ledger value in the persisted JSON form.
/// `title` is base64 for "Pilot".
pub fn entry_json(size: u64, upload_id: &str) -> String {
    serde_json::json!({
        "size": size,
        "metadata": {"title": "UGlsb3Q="},
        "creationTime": "2024-05-01T10:00:00Z",
        "uploadUrl": session_url(upload_id),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_json_shape() {
        let value: serde_json::Value = serde_json::from_str(&entry_json(7, "abc")).unwrap();
        assert_eq!(value["size"], 7);
        assert_eq!(value["uploadUrl"], "https://up.example.com/files/abc");
    }
}
