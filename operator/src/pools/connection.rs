use base64::{Engine, engine::general_purpose::STANDARD};

/// Renders the `[virt-viewer]` INI handed out to display clients,
/// base64-encoded for transport.
pub fn connection_file(
    host: &str,
    port: i32,
    password: Option<&str>,
    proxy: Option<&str>,
) -> String {
    let mut ini = String::from("[virt-viewer]\ntype=spice\n");
    ini.push_str(&format!("host={}\n", host));
    ini.push_str(&format!("port={}\n", port));
    if let Some(password) = password {
        ini.push_str(&format!("password={}\n", password));
    }
    if let Some(proxy) = proxy {
        ini.push_str(&format!("proxy={}\n", proxy));
    }
    ini.push_str("delete-this-file=1\n");
    STANDARD.encode(ini)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_keys() {
        let encoded = connection_file("10.0.0.5", 5910, Some("s3cret"), Some("http://proxy"));
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(decoded.starts_with("[virt-viewer]\ntype=spice\n"));
        assert!(decoded.contains("host=10.0.0.5\n"));
        assert!(decoded.contains("port=5910\n"));
        assert!(decoded.contains("password=s3cret\n"));
        assert!(decoded.contains("proxy=http://proxy\n"));
        assert!(decoded.ends_with("delete-this-file=1\n"));
    }

    #[test]
    fn optional_keys_are_omitted() {
        let encoded = connection_file("10.0.0.5", 5910, None, None);
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(!decoded.contains("password="));
        assert!(!decoded.contains("proxy="));
    }
}
