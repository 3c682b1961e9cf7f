//! The session daemon and its client-side counterparts.

pub mod client;
pub mod pty;
pub mod registry;
pub mod server;
pub mod terminal;

use anyhow::{Result, bail};
use ghostly_core::session::{MAX_NAME_LEN, valid_session_name};

/// Validate a session name at a command entry point.
pub fn ensure_valid_name(name: &str) -> Result<()> {
    if !valid_session_name(name) {
        bail!(
            "invalid session name '{name}': use alphanumeric, dash, underscore, dot (max {MAX_NAME_LEN} chars)"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_valid_name_error_mentions_rules() {
        let err = ensure_valid_name("no/slashes").unwrap_err();
        assert!(err.to_string().contains("alphanumeric"));
        assert!(ensure_valid_name("fine-name").is_ok());
    }
}
