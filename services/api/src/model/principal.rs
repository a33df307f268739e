use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// An authenticated user known to the directory.
///
/// `id` is the identity bound in policy. `external_id` is the identity
/// provider's subject and is never sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Principal {
    pub id: Uuid,
    #[serde(skip)]
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Principal {
    /// Subject string used for policy checks and role assignments.
    pub fn policy_id(&self) -> String {
        self.id.to_string()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Profile used when creating a principal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPrincipal {
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
}

impl NewPrincipal {
    pub fn into_principal(self, now: DateTime<Utc>) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            external_id: self.external_id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, ToSchema)]
pub struct PrincipalPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl PrincipalPatch {
    pub fn apply(&self, principal: &mut Principal, now: DateTime<Utc>) {
        if let Some(first_name) = &self.first_name {
            principal.first_name = first_name.clone();
        }
        if let Some(last_name) = &self.last_name {
            principal.last_name = last_name.clone();
        }
        principal.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_hides_external_id() {
        let principal = NewPrincipal {
            external_id: Some("auth0|abc".to_string()),
            email: Some("a@example.com".to_string()),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }
        .into_principal(Utc::now());
        let value = serde_json::to_value(&principal).expect("json");
        assert!(value.get("external_id").is_none());
        assert!(value.get("deleted_at").is_none());
        assert_eq!(value["first_name"], "Ada");
    }

    #[test]
    fn patch_only_touches_provided_fields() {
        let created = Utc::now();
        let mut principal = NewPrincipal {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            ..NewPrincipal::default()
        }
        .into_principal(created);
        let patch = PrincipalPatch {
            first_name: None,
            last_name: Some("Byron".to_string()),
        };
        patch.apply(&mut principal, created + chrono::Duration::seconds(5));
        assert_eq!(principal.first_name, "Ada");
        assert_eq!(principal.last_name, "Byron");
        assert!(principal.updated_at > principal.created_at);
    }
}
