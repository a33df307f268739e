//! OpenAPI document for the HTTP API, served at `/v1/openapi.json`.
use crate::api::{
    policies, roles, system,
    types::{
        CreateUserRequest, ErrorResponse, HealthStatus, PolicyAddResponse, PolicyListResponse,
        PolicyRuleBody, RoleChangeResponse, RoleListResponse, RolePrincipalsResponse,
        RoleRequest, UpdateProfileRequest, UserListResponse,
    },
    users,
};
use crate::model::Principal;
use utoipa::Modify;
use utoipa::OpenApi;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "eztrip-api",
        version = "v1",
        description = "eztrip travel API"
    ),
    paths(
        system::health,
        users::get_me,
        users::update_me,
        users::list_users,
        users::create_user,
        users::get_user,
        users::delete_user,
        roles::list_roles,
        roles::add_role,
        roles::replace_roles,
        roles::remove_role,
        roles::principals_for_role,
        policies::list_policies,
        policies::add_policy
    ),
    components(schemas(
        ErrorResponse,
        HealthStatus,
        Principal,
        UserListResponse,
        CreateUserRequest,
        UpdateProfileRequest,
        RoleRequest,
        RoleListResponse,
        RoleChangeResponse,
        RolePrincipalsResponse,
        PolicyRuleBody,
        PolicyListResponse,
        PolicyAddResponse
    )),
    modifiers(&BearerAuth),
    security(("bearer" = [])),
    tags(
        (name = "system", description = "Health"),
        (name = "users", description = "User directory"),
        (name = "roles", description = "Role assignments"),
        (name = "rbac", description = "Policy rules")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_guarded_routes_and_bearer_scheme() {
        let doc = serde_json::to_value(ApiDoc::openapi()).expect("json");
        let paths = doc["paths"].as_object().expect("paths");
        for path in [
            "/health",
            "/v1/users/me",
            "/v1/users",
            "/v1/users/{id}",
            "/v1/users/{id}/roles",
            "/v1/users/{id}/roles/{role}",
            "/v1/roles/{role}/principals",
            "/v1/rbac/policies",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
        assert_eq!(
            doc["components"]["securitySchemes"]["bearer"]["scheme"],
            "bearer"
        );
    }
}
