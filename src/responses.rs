//! Snowflake wire response envelopes, serialized server-side.

use serde::Serialize;

#[derive(Serialize, Debug, Clone)]
pub struct BaseRestResponse<D> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub data: Option<D>,
}

impl<D> BaseRestResponse<D> {
    pub fn ok(data: D) -> Self {
        Self {
            success: true,
            message: None,
            code: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            code: Some(code.into()),
            data: None,
        }
    }
}

pub type LoginResponse = BaseRestResponse<LoginResponseData>;
pub type QueryResponse = BaseRestResponse<QueryResponseData>;
pub type RenewResponse = BaseRestResponse<RenewResponseData>;
// Data is always null on a successful close.
pub type CloseResponse = BaseRestResponse<()>;

#[derive(Serialize, Debug, Clone)]
pub struct NameValueParameter {
    pub name: String,
    pub value: serde_json::Value,
}

impl NameValueParameter {
    pub fn new(name: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.to_owned(),
            value: value.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponseData {
    pub token: String,
    pub master_token: String,
    pub session_id: String,
    pub server_version: String,
    pub parameters: Vec<NameValueParameter>,
    pub session_info: SessionInfo,
    pub master_validity_in_seconds: i64,
    pub validity_in_seconds: i64,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub database_name: Option<String>,
    pub schema_name: Option<String>,
    pub warehouse_name: Option<String>,
    pub role_name: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RenewSessionResponseData {
    pub session_token: String,
    pub validity_in_seconds_s_t: i64,
    pub master_token: String,
    pub validity_in_seconds_m_t: i64,
    pub session_id: String,
}

pub type RenewResponseData = RenewSessionResponseData;

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponseData {
    pub rowtype: Vec<RowType>,
    /// Row-major values; everything is rendered as a string except NULL.
    pub rowset: Vec<Vec<serde_json::Value>>,
    pub total: i64,
    pub returned: i64,
    pub query_id: String,
    pub statement_type_id: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<NameValueParameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_database_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_schema_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_warehouse_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_role_name: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RowType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: SnowflakeType,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    #[serde(rename = "byteLength", skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<i64>,
}

impl RowType {
    pub fn new(name: &str, type_: SnowflakeType) -> Self {
        Self {
            name: name.to_owned(),
            type_,
            nullable: true,
            precision: None,
            scale: None,
            length: None,
            byte_length: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnowflakeType {
    Fixed,
    Real,
    Text,
    Date,
    Variant,
    TimestampLtz,
    TimestampNtz,
    TimestampTz,
    Object,
    Binary,
    Time,
    Boolean,
    Array,
}

impl SnowflakeType {
    /// Map a Snowflake (or engine) type declaration to the wire type name.
    pub fn from_decl(decl: &str) -> Self {
        let base: String = decl
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match base.as_str() {
            "NUMBER" | "NUMERIC" | "DECIMAL" | "INT" | "INTEGER" | "BIGINT" | "SMALLINT"
            | "TINYINT" | "BYTEINT" | "HUGEINT" | "UBIGINT" | "UINTEGER" | "USMALLINT"
            | "UTINYINT" => Self::Fixed,
            "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "REAL" => Self::Real,
            "BOOLEAN" | "BOOL" => Self::Boolean,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP_LTZ" => Self::TimestampLtz,
            "TIMESTAMP_TZ" | "TIMESTAMPTZ" => Self::TimestampTz,
            "TIMESTAMP" | "TIMESTAMP_NTZ" | "DATETIME" => Self::TimestampNtz,
            "VARIANT" | "JSON" => Self::Variant,
            "OBJECT" | "STRUCT" | "MAP" => Self::Object,
            "ARRAY" | "LIST" => Self::Array,
            "BINARY" | "VARBINARY" | "BLOB" => Self::Binary,
            _ => Self::Text,
        }
    }
}
