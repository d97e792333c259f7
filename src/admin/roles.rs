/// Admin Role Management
use crate::error::{HoleError, HoleResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Admin role levels
///
/// Totally ordered: every permission of a lower role is held by each higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access to the back office
    Viewer,
    /// Can moderate photos and update report status
    Editor,
    /// Full access, manages users and invites
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }

    /// Check if this role meets the required level
    pub fn satisfies(&self, required: Role) -> bool {
        self >= &required
    }

    pub fn all() -> [Role; 3] {
        [Role::Viewer, Role::Editor, Role::Admin]
    }
}

impl FromStr for Role {
    type Err = HoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            _ => Err(HoleError::Validation(format!("Invalid role: {}", s))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail with 403 unless `actual` meets `required`
pub fn require_role(actual: Role, required: Role) -> HoleResult<()> {
    if actual.satisfies(required) {
        Ok(())
    } else {
        Err(HoleError::Authorization(format!(
            "Requires {} role",
            required.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin > Role::Editor);
        assert!(Role::Editor > Role::Viewer);

        for actual in Role::all() {
            for required in Role::all() {
                assert_eq!(actual.satisfies(required), actual >= required);
            }
        }
    }

    #[test]
    fn test_require_role() {
        assert!(require_role(Role::Admin, Role::Viewer).is_ok());
        assert!(require_role(Role::Editor, Role::Editor).is_ok());
        assert!(matches!(
            require_role(Role::Viewer, Role::Editor),
            Err(HoleError::Authorization(_))
        ));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("EDITOR".parse::<Role>().unwrap(), Role::Editor);
        assert!("superadmin".parse::<Role>().is_err());
        assert_eq!(Role::Viewer.to_string(), "viewer");
    }
}
