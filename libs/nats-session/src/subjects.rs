//! Subject validation.
//!
//! The server owns subject matching; these checks only reject input the
//! server would refuse anyway, so the console can report it before a round
//! trip.

use crate::error::{ConsoleError, ConsoleResult};

/// How a subject is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    /// Subscribe filter: `*` and a trailing `>` are allowed as whole tokens.
    Filter,
    /// Publish or request target: no wildcards.
    Publish,
}

/// Validate `subject` for the given use.
pub fn validate(subject: &str, kind: SubjectKind) -> ConsoleResult<()> {
    let invalid = |reason| ConsoleError::InvalidSubject {
        subject: subject.to_owned(),
        reason,
    };

    if subject.is_empty() {
        return Err(invalid("is empty"));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(invalid("contains an empty token"));
        }
        let wildcard = token.contains(['*', '>']);
        if !wildcard {
            continue;
        }
        if kind == SubjectKind::Publish {
            return Err(invalid("wildcards are not allowed when publishing"));
        }
        match *token {
            "*" => {}
            ">" if i == last => {}
            ">" => return Err(invalid("'>' must be the last token")),
            _ => return Err(invalid("wildcards must be whole tokens")),
        }
    }
    Ok(())
}

/// Validate a stream or bucket name.
///
/// Names end up as subject tokens, so they may only contain letters,
/// digits, `-` and `_`.
pub fn validate_name(what: &str, name: &str) -> ConsoleResult<()> {
    if name.is_empty() {
        return Err(ConsoleError::Config(format!("{what} name is empty")));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(ConsoleError::Config(format!(
            "{what} name '{name}' contains '{c}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        for subject in ["orders", "orders.*", "orders.>", "*.created", "a.*.c.>", ">"] {
            assert!(validate(subject, SubjectKind::Filter).is_ok(), "{subject}");
        }
    }

    #[test]
    fn test_bad_filters() {
        for subject in ["", "orders.", ".orders", "a..b", "orders.>.x", "ord*", "a b"] {
            assert!(validate(subject, SubjectKind::Filter).is_err(), "{subject}");
        }
    }

    #[test]
    fn test_publish_rejects_wildcards() {
        assert!(validate("orders.created", SubjectKind::Publish).is_ok());
        let err = validate("orders.*", SubjectKind::Publish).unwrap_err();
        assert!(err.to_string().contains("wildcards"));
        assert!(validate("orders.>", SubjectKind::Publish).is_err());
    }

    #[test]
    fn test_error_names_subject() {
        let err = validate("a b", SubjectKind::Filter).unwrap_err();
        assert!(matches!(err, ConsoleError::InvalidSubject { .. }));
        assert!(err.to_string().contains("'a b'"));
    }

    #[test]
    fn test_names() {
        assert!(validate_name("bucket", "app-config_1").is_ok());
        for name in ["", "a.b", "a b", "orders*", "x>"] {
            assert!(validate_name("stream", name).is_err(), "{name}");
        }
    }
}
