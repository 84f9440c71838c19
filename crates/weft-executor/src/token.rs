//! Service token discovery.
//!
//! Remote services authenticate with a pipe-delimited signed token
//! (`un=<user>|tokenid=<uuid>|expiry=<unix>|...|sig=<hex>`). The token
//! is looked up in order: environment variable, the application's
//! credentials file, then well-known token files in the home directory.

use serde::Deserialize;
use std::fs;
use std::path::Path;

const WELL_KNOWN_TOKEN_FILES: &[&str] = &[".bvbrc_token", ".patric_token", ".p3_token"];

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    token: String,
}

/// Look up a token for `service` (environment variable
/// `<SERVICE>_TOKEN`) and application `app_name`
/// (`~/.<app_name>/credentials.json`).
pub fn discover_token(service: &str, app_name: &str) -> Option<String> {
    let env_var = format!("{}_TOKEN", service.to_uppercase());
    let home = std::env::var_os("HOME").map(std::path::PathBuf::from);
    discover_token_in(
        std::env::var(&env_var).ok(),
        home.as_deref(),
        app_name,
    )
}

/// Testable core of [`discover_token`].
pub fn discover_token_in(
    env_value: Option<String>,
    home: Option<&Path>,
    app_name: &str,
) -> Option<String> {
    if let Some(token) = env_value {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }

    let home = home?;

    let credentials = home.join(format!(".{app_name}")).join("credentials.json");
    if let Ok(text) = fs::read_to_string(&credentials) {
        if let Ok(parsed) = serde_json::from_str::<CredentialsFile>(&text) {
            let token = parsed.token.trim().to_string();
            if !token.is_empty() {
                return Some(token);
            }
        }
    }

    for name in WELL_KNOWN_TOKEN_FILES {
        if let Ok(text) = fs::read_to_string(home.join(name)) {
            let token = text.trim().to_string();
            if !token.is_empty() {
                return Some(token);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_wins() {
        let token = discover_token_in(Some("un=alice|sig=ff".into()), None, "weft");
        assert_eq!(token.as_deref(), Some("un=alice|sig=ff"));
    }

    #[test]
    fn credentials_file_is_second() {
        let home = tempfile::tempdir().unwrap();
        let app_dir = home.path().join(".weft");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            app_dir.join("credentials.json"),
            r#"{"token": "un=bob|sig=aa"}"#,
        )
        .unwrap();

        let token = discover_token_in(None, Some(home.path()), "weft");
        assert_eq!(token.as_deref(), Some("un=bob|sig=aa"));
    }

    #[test]
    fn well_known_files_are_searched_in_order() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join(".patric_token"), "un=carol|sig=bb\n").unwrap();
        fs::write(home.path().join(".p3_token"), "un=dave|sig=cc\n").unwrap();

        let token = discover_token_in(None, Some(home.path()), "weft");
        assert_eq!(token.as_deref(), Some("un=carol|sig=bb"));
    }

    #[test]
    fn missing_everything_yields_none() {
        let home = tempfile::tempdir().unwrap();
        assert!(discover_token_in(None, Some(home.path()), "weft").is_none());
    }
}
