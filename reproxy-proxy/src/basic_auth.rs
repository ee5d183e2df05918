use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reproxy_core::rule::AuthUser;

/// Verify an `Authorization: Basic <base64>` header against a rule's configured users.
/// Walks every entry and never breaks early on a match, so the total time spent is the
/// same whether the valid credential sits first or last in the list — a short-circuiting
/// loop would let a client infer position (and therefore enumerate usernames) from timing.
pub fn verify(auth_users: &[AuthUser], authorization_header: Option<&str>) -> bool {
    let Some(header) = authorization_header else { return false };
    let Some(encoded) = header.strip_prefix("Basic ") else { return false };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else { return false };
    let Ok(decoded) = String::from_utf8(decoded) else { return false };
    let Some((user, pass)) = decoded.split_once(':') else { return false };

    let mut ok = false;
    for entry in auth_users {
        let name_matches = entry.name == user;
        let hash_matches = bcrypt::verify(pass, &entry.hash).unwrap_or(false);
        ok |= name_matches && hash_matches;
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<AuthUser> {
        vec![AuthUser { name: "alice".into(), hash: bcrypt::hash("secret", 4).unwrap() }]
    }

    fn basic_header(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    #[test]
    fn correct_credentials_pass() {
        let header = basic_header("alice", "secret");
        assert!(verify(&users(), Some(&header)));
    }

    #[test]
    fn wrong_password_fails() {
        let header = basic_header("alice", "wrong");
        assert!(!verify(&users(), Some(&header)));
    }

    #[test]
    fn unknown_user_fails() {
        let header = basic_header("bob", "secret");
        assert!(!verify(&users(), Some(&header)));
    }

    #[test]
    fn missing_header_fails() {
        assert!(!verify(&users(), None));
    }

    #[test]
    fn malformed_header_fails() {
        assert!(!verify(&users(), Some("Basic not-base64!!")));
    }

    #[test]
    fn third_of_three_entries_still_accepts() {
        let three = vec![
            AuthUser { name: "alice".into(), hash: bcrypt::hash("one", 4).unwrap() },
            AuthUser { name: "bob".into(), hash: bcrypt::hash("two", 4).unwrap() },
            AuthUser { name: "carol".into(), hash: bcrypt::hash("three", 4).unwrap() },
        ];
        let header = basic_header("carol", "three");
        assert!(verify(&three, Some(&header)));
    }
}
