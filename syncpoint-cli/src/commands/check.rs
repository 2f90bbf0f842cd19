//! Validate a configuration file.

use anyhow::Result;
use std::path::Path;
use syncpoint_client::ClientConfig;

/// Run the check-config command.
pub fn run(path: &Path) -> Result<ClientConfig> {
    let config = super::load_config(Some(path))?;

    println!("=== {} ===", path.display());
    println!("  server_url:            {}", config.server_url);
    println!("  control_database:      {}", config.control_database);
    println!("  handshake_database:    {}", config.handshake_database);
    println!("  session_doc_id:        {}", config.session_doc_id);
    println!("  local_database_prefix: {}", config.local_database_prefix);
    println!("  max_deferred_requests: {}", config.max_deferred_requests);
    println!("  event_capacity:        {}", config.event_capacity);
    println!();
    println!("Configuration OK");

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_file_passes() {
        let file = write(
            r#"
server_url = "https://sync.example.com"
max_deferred_requests = 8
"#,
        );
        let config = run(file.path()).unwrap();
        assert_eq!(config.server_url, "https://sync.example.com");
        assert_eq!(config.max_deferred_requests, 8);
        assert_eq!(config.control_database, "syncpoint_control");
    }

    #[test]
    fn invalid_value_fails() {
        let file = write("control_database = \"Not Valid\"\n");
        let err = run(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("control_database"));
    }

    #[test]
    fn unknown_field_fails() {
        let file = write("sever_url = \"http://typo\"\n");
        assert!(run(file.path()).is_err());
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent.toml")).is_err());
    }
}
