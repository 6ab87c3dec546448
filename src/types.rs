use derive_more::{Display, From, Into};
use serde::{Deserialize, Deserializer, Serialize};

/// Server-assigned entity identifier.
///
/// Always held as a string. The backend serializes numeric database keys, so
/// deserialization accepts JSON numbers as well as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, From, Into)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl PartialEq<str> for EntityId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Signed(n) => Self(n.to_string()),
            Raw::Unsigned(n) => Self(n.to_string()),
        })
    }
}

/// Account role as reported by the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Manager,
    User,
}

/// Identity of the signed-in user, cached alongside the tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: EntityId,
    /// Login name; also used for server-side revocation on logout.
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    /// Assemble an identity, deriving the display name from first and last name and
    /// falling back to the username when both are blank.
    #[must_use]
    pub fn from_profile(
        id: EntityId,
        username: impl Into<String>,
        email: impl Into<String>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        role: Role,
    ) -> Self {
        let username = username.into();
        let full_name = [first_name, last_name]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let display_name = if full_name.is_empty() {
            username.clone()
        } else {
            full_name
        };

        Self {
            id,
            username,
            email: email.into(),
            display_name,
            role,
        }
    }
}

/// Username/password pair for `POST /auth/login`.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Account details for `POST /auth/register`.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Profile changes for `PUT /auth/profile`. Unset fields are left as they are.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of `POST /auth/change-password`.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

impl ChangePasswordRequest {
    /// Change from `current` to `new`, confirming `new` as typed.
    #[must_use]
    pub fn new(current: impl Into<String>, new: impl Into<String>) -> Self {
        let new_password = new.into();
        Self {
            current_password: current.into(),
            confirm_password: new_password.clone(),
            new_password,
        }
    }
}

impl std::fmt::Debug for ChangePasswordRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePasswordRequest").finish_non_exhaustive()
    }
}

/// Priority shared by projects and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_accepts_numbers_and_strings() {
        let from_number: EntityId = serde_json::from_str("42").unwrap();
        let from_string: EntityId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number.to_string(), "42");
    }

    #[test]
    fn test_entity_id_serializes_as_string() {
        let id = EntityId::from(7_u64);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"7\"");
    }

    #[test]
    fn test_role_uses_backend_spelling() {
        let role: Role = serde_json::from_str("\"MANAGER\"").unwrap();
        assert_eq!(role, Role::Manager);
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"ADMIN\"");
    }

    #[test]
    fn test_display_name_from_names() {
        let identity = Identity::from_profile(
            "1".into(),
            "jdoe",
            "jdoe@example.com",
            Some("John"),
            Some("Doe"),
            Role::User,
        );
        assert_eq!(identity.display_name, "John Doe");
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        let identity =
            Identity::from_profile("1".into(), "jdoe", "jdoe@example.com", Some(" "), None, Role::User);
        assert_eq!(identity.display_name, "jdoe");
    }

    #[test]
    fn test_password_change_is_redacted_and_confirmed() {
        let change = ChangePasswordRequest::new("old-secret", "new-secret");
        assert!(!format!("{change:?}").contains("secret"));

        let body = serde_json::to_value(&change).unwrap();
        assert_eq!(body["currentPassword"], "old-secret");
        assert_eq!(body["confirmPassword"], body["newPassword"]);
    }

    #[test]
    fn test_profile_update_omits_unset_fields() {
        let update = UpdateProfileRequest {
            position: Some("Lead".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&update).unwrap(), r#"{"position":"Lead"}"#);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("jdoe", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
