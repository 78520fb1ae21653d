//! Data types for the console's JSON responses.

use serde::Deserialize;

/// One database role of a formation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoleInfo {
    pub name: String,
    pub id: String,
}

/// JSON view of a formation page; only the roles are of interest here.
#[derive(Debug, Deserialize)]
pub struct FormationResponse {
    #[serde(default)]
    pub roles: Vec<RoleInfo>,
}

/// Response to a role-creation POST. The console signals a name conflict by
/// returning the literal id `"conflict"`.
#[derive(Debug, Deserialize)]
pub struct CreateRoleResponse {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}
