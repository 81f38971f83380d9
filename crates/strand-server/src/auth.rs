//! Pluggable authorization.
//!
//! Policies come from a CSV file, one rule per line:
//!
//! ```text
//! p, root, *, produce
//! p, root, *, consume
//! ```
//!
//! A request is allowed when any rule matches its `(subject, object,
//! action)` triple; `*` in the object column matches any object. A node
//! configured without a policy file allows everything.

use std::path::Path;

use crate::error::{ServerError, ServerResult};

/// Action name for appends.
pub const ACTION_PRODUCE: &str = "produce";

/// Action name for reads.
pub const ACTION_CONSUME: &str = "consume";

/// The log object; the service has a single log, so rules use `*`.
pub const OBJECT_WILDCARD: &str = "*";

#[derive(Debug, Clone)]
struct Policy {
    subject: String,
    object: String,
    action: String,
}

/// Policy-file-backed `(subject, object, action)` check.
#[derive(Debug, Default)]
pub struct Authorizer {
    /// `None` means no policy was configured: allow everything.
    policies: Option<Vec<Policy>>,
}

impl Authorizer {
    /// An authorizer that allows every request.
    pub fn allow_all() -> Self {
        Self { policies: None }
    }

    /// Loads policies from a CSV file.
    pub fn from_policy_file(path: &Path) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut policies = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() == 4 && fields[0] == "p" {
                policies.push(Policy {
                    subject: fields[1].to_string(),
                    object: fields[2].to_string(),
                    action: fields[3].to_string(),
                });
            }
        }

        Ok(Self {
            policies: Some(policies),
        })
    }

    /// Checks whether `subject` may perform `action` on `object`.
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> ServerResult<()> {
        let Some(policies) = &self.policies else {
            return Ok(());
        };

        let allowed = policies.iter().any(|p| {
            p.subject == subject
                && p.action == action
                && (p.object == OBJECT_WILDCARD || p.object == object)
        });

        if allowed {
            Ok(())
        } else {
            Err(ServerError::PermissionDenied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn policy_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# produce/consume for root, nothing for nobody").unwrap();
        writeln!(file, "p, root, *, produce").unwrap();
        writeln!(file, "p, root, *, consume").unwrap();
        file
    }

    #[test]
    fn test_root_is_allowed() {
        let file = policy_file();
        let auth = Authorizer::from_policy_file(file.path()).unwrap();

        auth.authorize("root", OBJECT_WILDCARD, ACTION_PRODUCE).unwrap();
        auth.authorize("root", OBJECT_WILDCARD, ACTION_CONSUME).unwrap();
    }

    #[test]
    fn test_nobody_is_denied() {
        let file = policy_file();
        let auth = Authorizer::from_policy_file(file.path()).unwrap();

        let err = auth
            .authorize("nobody", OBJECT_WILDCARD, ACTION_PRODUCE)
            .unwrap_err();
        match err {
            ServerError::PermissionDenied {
                subject, action, ..
            } => {
                assert_eq!(subject, "nobody");
                assert_eq!(action, ACTION_PRODUCE);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allow_all_without_policy() {
        let auth = Authorizer::allow_all();
        auth.authorize("anyone", "anything", "whatever").unwrap();
    }
}
