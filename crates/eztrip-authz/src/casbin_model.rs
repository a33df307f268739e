use crate::AuthzResult;
use casbin::prelude::DefaultModel;

// `g` links principals to roles and roles to parent roles. A subject of `*`
// in a rule matches every principal.
const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = (g(r.sub, p.sub) || p.sub == "*") && (r.obj == p.obj || p.obj == "*") && (r.act == p.act || p.act == "*")
"#;

pub fn casbin_model_string() -> &'static str {
    MODEL
}

pub async fn casbin_model() -> AuthzResult<DefaultModel> {
    Ok(DefaultModel::from_str(MODEL).await?)
}
