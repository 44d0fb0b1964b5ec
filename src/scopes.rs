//! Scope validation.
//!
//! Scope checks run before every privileged action, not only at
//! connect time: a connection's grant can be narrower than what a
//! newly added action needs. Comparison is exact string match, the
//! OAuth wire format.

use crate::credentials::Connection;
use crate::error::AuthError;
use std::collections::HashSet;

/// Scopes in `required` that `granted` does not cover, in the order
/// they were required.
pub fn missing_scopes(granted: &[String], required: &[String]) -> Vec<String> {
    let granted: HashSet<&str> = granted.iter().map(String::as_str).collect();
    required
        .iter()
        .filter(|scope| !granted.contains(scope.as_str()))
        .cloned()
        .collect()
}

/// Fails with `InsufficientScopes(missing)` when the connection's grant
/// does not cover `required`. Read-only; surfacing the missing scopes
/// lets the caller start an incremental connect for them.
pub fn ensure_scopes(connection: &Connection, required: &[String]) -> Result<(), AuthError> {
    let missing = missing_scopes(&connection.granted_scopes, required);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AuthError::InsufficientScopes(missing))
    }
}

/// Union of two scope lists, preserving first-seen order.
///
/// Used when restarting authorization after `InsufficientScopes`: the
/// new request asks for everything already granted plus the new scopes,
/// so the fresh grant never narrows the old one.
pub fn union_scopes(existing: &[String], requested: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .chain(requested.iter())
        .filter(|scope| seen.insert(scope.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ConnectionKey, ConnectionStatus};

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn connection_with_scopes(granted: &[&str]) -> Connection {
        Connection {
            key: ConnectionKey::new("u1", "github", None),
            access_token: "t".to_string(),
            refresh_token: None,
            granted_scopes: scopes(granted),
            expires_at: None,
            status: ConnectionStatus::Active,
        }
    }

    #[test]
    fn test_missing_scopes() {
        assert_eq!(
            missing_scopes(&scopes(&["read"]), &scopes(&["read", "write"])),
            scopes(&["write"])
        );
        assert!(missing_scopes(&scopes(&["read", "write"]), &scopes(&["read"])).is_empty());
        assert!(missing_scopes(&scopes(&[]), &scopes(&[])).is_empty());
    }

    #[test]
    fn test_ensure_scopes_reports_missing() {
        let conn = connection_with_scopes(&["read"]);

        assert!(ensure_scopes(&conn, &scopes(&["read"])).is_ok());

        match ensure_scopes(&conn, &scopes(&["read", "write"])) {
            Err(AuthError::InsufficientScopes(missing)) => {
                assert_eq!(missing, scopes(&["write"]));
            }
            other => panic!("Expected InsufficientScopes, got {:?}", other),
        }
    }

    #[test]
    fn test_union_scopes_dedupes_and_preserves_order() {
        let merged = union_scopes(&scopes(&["repo", "read:user"]), &scopes(&["workflow", "repo"]));
        assert_eq!(merged, scopes(&["repo", "read:user", "workflow"]));
    }
}
