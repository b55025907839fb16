//! Wire request bodies.

use serde::Deserialize;

#[derive(Deserialize, Debug, Default)]
pub struct LoginRequest {
    #[serde(default)]
    pub data: LoginRequestData,
}

#[derive(Deserialize, Debug, Default)]
pub struct LoginRequestData {
    #[serde(rename = "LOGIN_NAME", default)]
    pub login_name: Option<String>,
    #[serde(rename = "PASSWORD", default)]
    pub password: Option<String>,
    #[serde(rename = "ACCOUNT_NAME", default)]
    pub account_name: Option<String>,
    #[serde(rename = "CLIENT_APP_ID", default)]
    pub client_app_id: Option<String>,
    #[serde(rename = "CLIENT_APP_VERSION", default)]
    pub client_app_version: Option<String>,
}

/// Context overrides arrive as query-string parameters on the login URL.
#[derive(Deserialize, Debug, Default)]
pub struct LoginParams {
    #[serde(rename = "databaseName", default)]
    pub database_name: Option<String>,
    #[serde(rename = "schemaName", default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(rename = "roleName", default)]
    pub role_name: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub sql_text: String,
    #[serde(default)]
    pub async_exec: bool,
    #[serde(default)]
    pub sequence_id: u64,
    #[serde(default)]
    pub is_internal: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
    #[serde(default)]
    pub old_session_token: Option<String>,
    #[serde(default)]
    pub request_type: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub sql_text: Option<String>,
}

/// Body of the dashboard's ad-hoc `POST /api/execute`.
#[derive(Deserialize, Debug)]
pub struct ExecuteApiRequest {
    pub sql: String,
}
