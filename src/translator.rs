//! Statement classification and Snowflake→DuckDB dialect rewrite.
//!
//! Input statements are classified into catalog directives (DDL, SHOW,
//! DESCRIBE, USE, UNDROP), short-circuited constants (`SELECT
//! CURRENT_VERSION()` and friends) and data statements. Data statements go
//! through a rewrite pipeline over the token stream, so substitutions can
//! never fire inside string or identifier literals.
//!
//! The whole module is pure: no I/O, no clocks, no catalog access. Callers
//! pass the session's naming context in.

use crate::tokenizer::{self, Token, TokenKind};
use crate::{Result, SnowglobeError};

/// The session naming context used to resolve partial identifiers.
/// Both parts are storage keys (already upper-folded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameContext {
    pub database: Option<String>,
    pub schema: Option<String>,
}

impl NameContext {
    pub fn new(database: &str, schema: &str) -> Self {
        Self {
            database: Some(database.to_owned()),
            schema: Some(schema.to_owned()),
        }
    }
}

/// A fully resolved `DATABASE.SCHEMA.OBJECT` name in storage-key form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    pub database: String,
    pub schema: String,
    pub name: String,
}

impl ObjectName {
    pub fn fqn(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.name)
    }

    /// The engine-side schema payload; the whole Snowflake `D.S` pair maps
    /// onto one DuckDB schema whose name contains the dot.
    pub fn engine_schema(&self) -> String {
        format!("{}.{}", self.database, self.schema)
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fqn())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    Directive(Directive),
    Constant(ConstantFn),
    Data(DataStatement),
}

/// A rewritten statement ready for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DataStatement {
    pub sql: String,
    pub class: StatementClass,
    /// Table-position references found during qualification; the executor
    /// uses these to materialize views lazily.
    pub tables: Vec<ObjectName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Select,
    Create,
    Drop,
    Insert,
    Update,
    Delete,
    Alter,
    Truncate,
    Use,
    Show,
    Other,
}

impl StatementClass {
    /// Stable numeric statement type codes from the wire protocol.
    /// Classes outside the table fall back to the SELECT code.
    pub fn type_id(self) -> i64 {
        match self {
            Self::Create => 8192,
            Self::Drop => 16384,
            Self::Insert => 32768,
            Self::Update => 65536,
            Self::Delete => 131_072,
            Self::Alter => 262_144,
            Self::Truncate => 524_288,
            Self::Use => 1_048_576,
            Self::Show => 2_097_152,
            Self::Select | Self::Other => 4096,
        }
    }
}

/// Metadata pseudo-functions answered from session state without the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantFn {
    Version,
    Timestamp,
    Account,
    Role,
    Warehouse,
    Database,
    Schema,
    User,
    Region,
}

impl ConstantFn {
    pub fn column_name(self) -> &'static str {
        match self {
            Self::Version => "CURRENT_VERSION()",
            Self::Timestamp => "CURRENT_TIMESTAMP()",
            Self::Account => "CURRENT_ACCOUNT()",
            Self::Role => "CURRENT_ROLE()",
            Self::Warehouse => "CURRENT_WAREHOUSE()",
            Self::Database => "CURRENT_DATABASE()",
            Self::Schema => "CURRENT_SCHEMA()",
            Self::User => "CURRENT_USER()",
            Self::Region => "CURRENT_REGION()",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "CURRENT_VERSION" => Some(Self::Version),
            "CURRENT_TIMESTAMP" => Some(Self::Timestamp),
            "CURRENT_ACCOUNT" => Some(Self::Account),
            "CURRENT_ROLE" => Some(Self::Role),
            "CURRENT_WAREHOUSE" => Some(Self::Warehouse),
            "CURRENT_DATABASE" => Some(Self::Database),
            "CURRENT_SCHEMA" => Some(Self::Schema),
            "CURRENT_USER" => Some(Self::User),
            "CURRENT_REGION" => Some(Self::Region),
            _ => None,
        }
    }
}

/// A column definition from `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Snowflake type as written, upper-cased, e.g. `NUMBER(10,2)`.
    pub sf_type: String,
    /// Engine type declaration, e.g. `DECIMAL(10,2)`.
    pub engine_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseTarget {
    Database,
    Schema,
    Warehouse,
    Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowKind {
    Databases,
    Schemas,
    Tables,
    Views,
    Stages,
    Warehouses,
    Roles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowScope {
    Database(String),
    Schema { database: String, schema: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Show {
    pub kind: ShowKind,
    pub dropped: bool,
    pub like: Option<String>,
    pub scope: Option<ShowScope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    CreateDatabase {
        name: String,
        if_not_exists: bool,
        or_replace: bool,
        transient: bool,
        comment: Option<String>,
    },
    DropDatabase {
        name: String,
        if_exists: bool,
        cascade: bool,
    },
    UndropDatabase {
        name: String,
    },
    CreateSchema {
        database: String,
        name: String,
        if_not_exists: bool,
        or_replace: bool,
    },
    DropSchema {
        database: String,
        name: String,
        if_exists: bool,
        cascade: bool,
    },
    UndropSchema {
        database: String,
        name: String,
    },
    CreateTable {
        name: ObjectName,
        columns: Vec<ColumnSpec>,
        if_not_exists: bool,
        or_replace: bool,
    },
    CreateTableAs {
        name: ObjectName,
        or_replace: bool,
        query: DataStatement,
    },
    CloneTable {
        name: ObjectName,
        source: ObjectName,
        if_not_exists: bool,
        or_replace: bool,
    },
    DropTable {
        name: ObjectName,
        if_exists: bool,
    },
    UndropTable {
        name: ObjectName,
    },
    TruncateTable {
        name: ObjectName,
        if_exists: bool,
    },
    RenameTable {
        name: ObjectName,
        to: ObjectName,
        if_exists: bool,
    },
    CreateView {
        name: ObjectName,
        text: String,
        secure: bool,
        if_not_exists: bool,
        or_replace: bool,
    },
    DropView {
        name: ObjectName,
        if_exists: bool,
    },
    UndropView {
        name: ObjectName,
    },
    CreateStage {
        name: ObjectName,
        if_not_exists: bool,
        or_replace: bool,
    },
    DropStage {
        name: ObjectName,
        if_exists: bool,
    },
    Use {
        target: UseTarget,
        name: String,
    },
    Show(Show),
    Describe {
        kind: DescribeKind,
        name: ObjectName,
    },
    /// `ALTER SESSION SET ...` — accepted and ignored; clients send these
    /// right after login.
    AlterSession,
}

impl Directive {
    pub fn class(&self) -> StatementClass {
        match self {
            Self::CreateDatabase { .. }
            | Self::CreateSchema { .. }
            | Self::CreateTable { .. }
            | Self::CreateTableAs { .. }
            | Self::CloneTable { .. }
            | Self::CreateView { .. }
            | Self::CreateStage { .. } => StatementClass::Create,
            Self::DropDatabase { .. }
            | Self::DropSchema { .. }
            | Self::DropTable { .. }
            | Self::DropView { .. }
            | Self::DropStage { .. } => StatementClass::Drop,
            Self::UndropDatabase { .. } | Self::UndropSchema { .. } | Self::UndropTable { .. } | Self::UndropView { .. } => {
                StatementClass::Other
            }
            Self::TruncateTable { .. } => StatementClass::Truncate,
            Self::RenameTable { .. } | Self::AlterSession => StatementClass::Alter,
            Self::Use { .. } => StatementClass::Use,
            Self::Show(_) | Self::Describe { .. } => StatementClass::Show,
        }
    }
}

/// Classify and translate one statement.
pub fn translate(sql: &str, ctx: &NameContext) -> Result<Translated> {
    let tokens = tokenizer::tokenize(sql)?;
    let tokens: Vec<Token> = tokens.into_iter().filter(|t| !t.is_punct(';')).collect();
    if tokens.is_empty() {
        return Err(SnowglobeError::Translation("empty statement".to_owned()));
    }

    if let Some(c) = match_constant(&tokens) {
        return Ok(Translated::Constant(c));
    }

    let first = &tokens[0];
    if first.is_kw("CREATE")
        || first.is_kw("DROP")
        || first.is_kw("UNDROP")
        || first.is_kw("ALTER")
        || first.is_kw("TRUNCATE")
        || first.is_kw("USE")
        || first.is_kw("SHOW")
        || first.is_kw("DESCRIBE")
        || first.is_kw("DESC")
    {
        let mut parser = Parser {
            sql,
            tokens: &tokens,
            pos: 0,
            ctx,
        };
        return parser.directive().map(Translated::Directive);
    }

    rewrite_query_tokens(&tokens, ctx).map(Translated::Data)
}

/// Rewrite a query (or DML) body for the engine, outside of `translate` —
/// used for CTAS bodies and stored view definitions.
pub fn rewrite_query(sql: &str, ctx: &NameContext) -> Result<DataStatement> {
    let tokens = tokenizer::tokenize(sql)?;
    let tokens: Vec<Token> = tokens.into_iter().filter(|t| !t.is_punct(';')).collect();
    if tokens.is_empty() {
        return Err(SnowglobeError::Translation("empty statement".to_owned()));
    }
    rewrite_query_tokens(&tokens, ctx)
}

fn statement_class(tokens: &[Token]) -> StatementClass {
    let Some(first) = tokens.first() else {
        return StatementClass::Other;
    };
    if first.is_kw("SELECT") || first.is_kw("WITH") {
        StatementClass::Select
    } else if first.is_kw("INSERT") || first.is_kw("MERGE") {
        StatementClass::Insert
    } else if first.is_kw("UPDATE") {
        StatementClass::Update
    } else if first.is_kw("DELETE") {
        StatementClass::Delete
    } else {
        StatementClass::Other
    }
}

fn match_constant(tokens: &[Token]) -> Option<ConstantFn> {
    // Exactly `SELECT <fn>()`.
    if tokens.len() == 4
        && tokens[0].is_kw("SELECT")
        && tokens[2].is_punct('(')
        && tokens[3].is_punct(')')
    {
        if let TokenKind::Word(w) = &tokens[1].kind {
            return ConstantFn::from_name(w);
        }
    }
    None
}

fn rewrite_query_tokens(tokens: &[Token], ctx: &NameContext) -> Result<DataStatement> {
    let class = statement_class(tokens);
    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind.clone()).collect();
    let kinds = rewrite_calls(&kinds)?;
    let kinds = rewrite_cast_operators(kinds);
    let mut tables = Vec::new();
    let kinds = qualify_tables(kinds, ctx, &mut tables)?;
    Ok(DataStatement {
        sql: tokenizer::render_kinds(kinds.iter()),
        class,
        tables,
    })
}

// ---------------------------------------------------------------------------
// Rewrite rules 1–3: function calls and casts
// ---------------------------------------------------------------------------

fn upper_word(kind: &TokenKind) -> Option<String> {
    match kind {
        TokenKind::Word(w) => Some(w.to_ascii_uppercase()),
        _ => None,
    }
}

fn word(s: &str) -> TokenKind {
    TokenKind::Word(s.to_owned())
}

fn punct(c: char) -> TokenKind {
    TokenKind::Punct(c)
}

const REWRITTEN_CALLS: &[&str] = &[
    "IFF",
    "NVL2",
    "DECODE",
    "TO_DATE",
    "TO_TIMESTAMP",
    "TO_VARIANT",
    "TO_VARCHAR",
    "TO_CHAR",
    "PARSE_JSON",
    "DATEADD",
    "DATEDIFF",
    "CAST",
    "TRY_CAST",
];

/// Word-for-word renames that keep the argument list untouched.
fn plain_rename(name: &str) -> Option<&'static str> {
    match name {
        "NVL" | "IFNULL" => Some("COALESCE"),
        "OBJECT_CONSTRUCT" => Some("json_object"),
        "ARRAY_CONSTRUCT" => Some("json_array"),
        "REGEXP_LIKE" => Some("regexp_matches"),
        "GETDATE" | "SYSDATE" => Some("now"),
        _ => None,
    }
}

fn matching_paren(kinds: &[TokenKind], open: usize) -> Result<usize> {
    let mut depth = 0usize;
    for (i, k) in kinds.iter().enumerate().skip(open) {
        match k {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(SnowglobeError::Translation("unbalanced parentheses".to_owned()))
}

fn split_args(inner: &[TokenKind]) -> Vec<Vec<TokenKind>> {
    let mut args = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
    for k in inner {
        match k {
            TokenKind::Punct('(') => {
                depth += 1;
                current.push(k.clone());
            }
            TokenKind::Punct(')') => {
                depth = depth.saturating_sub(1);
                current.push(k.clone());
            }
            TokenKind::Punct(',') if depth == 0 => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(k.clone()),
        }
    }
    if !current.is_empty() || !args.is_empty() {
        args.push(current);
    }
    args
}

fn rewrite_calls(kinds: &[TokenKind]) -> Result<Vec<TokenKind>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < kinds.len() {
        let Some(uw) = upper_word(&kinds[i]) else {
            out.push(kinds[i].clone());
            i += 1;
            continue;
        };

        let has_call = kinds.get(i + 1) == Some(&TokenKind::Punct('('));

        // CURRENT_TIMESTAMP / CURRENT_DATE appear with or without parens;
        // any precision argument is dropped.
        if uw == "CURRENT_TIMESTAMP" || uw == "CURRENT_DATE" {
            let renamed = if uw == "CURRENT_TIMESTAMP" { "now" } else { "today" };
            out.extend([word(renamed), punct('('), punct(')')]);
            i = if has_call {
                matching_paren(kinds, i + 1)? + 1
            } else {
                i + 1
            };
            continue;
        }

        if has_call {
            if let Some(renamed) = plain_rename(&uw) {
                out.push(word(renamed));
                i += 1;
                continue;
            }
            if REWRITTEN_CALLS.contains(&uw.as_str()) {
                let close = matching_paren(kinds, i + 1)?;
                let inner = &kinds[i + 2..close];
                out.extend(build_call(&uw, inner)?);
                i = close + 1;
                continue;
            }
        }

        out.push(kinds[i].clone());
        i += 1;
    }
    Ok(out)
}

fn parenthesized(arg: &[TokenKind]) -> Vec<TokenKind> {
    let mut out = vec![punct('(')];
    out.extend(arg.iter().cloned());
    out.push(punct(')'));
    out
}

/// Pass the original call through untouched (after rewriting its arguments);
/// the engine reports its own error if the arity is genuinely wrong.
fn passthrough_call(name: &str, args: &[Vec<TokenKind>]) -> Vec<TokenKind> {
    let mut out = vec![word(name), punct('(')];
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            out.push(punct(','));
        }
        out.extend(a.iter().cloned());
    }
    out.push(punct(')'));
    out
}

fn build_call(name: &str, inner: &[TokenKind]) -> Result<Vec<TokenKind>> {
    // CAST keeps its `expr AS type` body intact apart from type mapping.
    if name == "CAST" || name == "TRY_CAST" {
        let inner = rewrite_calls(inner)?;
        let mapped = map_cast_body(inner);
        let mut out = vec![word(name), punct('(')];
        out.extend(mapped);
        out.push(punct(')'));
        return Ok(out);
    }

    let args: Vec<Vec<TokenKind>> = split_args(inner)
        .iter()
        .map(|a| rewrite_calls(a))
        .collect::<Result<_>>()?;

    let out = match (name, args.len()) {
        ("IFF", 3) => {
            let mut out = vec![word("CASE"), word("WHEN")];
            out.extend(parenthesized(&args[0]));
            out.push(word("THEN"));
            out.extend(parenthesized(&args[1]));
            out.push(word("ELSE"));
            out.extend(parenthesized(&args[2]));
            out.push(word("END"));
            out
        }
        ("NVL2", 3) => {
            let mut out = vec![word("CASE"), word("WHEN")];
            out.extend(parenthesized(&args[0]));
            out.extend([word("IS"), word("NOT"), word("NULL"), word("THEN")]);
            out.extend(parenthesized(&args[1]));
            out.push(word("ELSE"));
            out.extend(parenthesized(&args[2]));
            out.push(word("END"));
            out
        }
        ("DECODE", n) if n >= 3 => {
            let mut out = vec![word("CASE")];
            out.extend(parenthesized(&args[0]));
            let pairs = &args[1..];
            let complete = pairs.len() / 2;
            for p in 0..complete {
                out.push(word("WHEN"));
                out.extend(parenthesized(&pairs[2 * p]));
                out.push(word("THEN"));
                out.extend(parenthesized(&pairs[2 * p + 1]));
            }
            if pairs.len() % 2 == 1 {
                out.push(word("ELSE"));
                out.extend(parenthesized(&pairs[pairs.len() - 1]));
            }
            out.push(word("END"));
            out
        }
        ("TO_DATE", 1) => cast_to(&args[0], &[word("DATE")]),
        ("TO_DATE", 2) => {
            let mut strp = vec![word("strptime"), punct('(')];
            strp.extend(args[0].iter().cloned());
            strp.push(punct(','));
            strp.extend(args[1].iter().cloned());
            strp.push(punct(')'));
            cast_to(&strp, &[word("DATE")])
        }
        ("TO_TIMESTAMP", 1) => cast_to(&args[0], &[word("TIMESTAMP")]),
        ("TO_TIMESTAMP", 2) => passthrough_call("strptime", &args),
        ("TO_VARIANT" | "PARSE_JSON", 1) => cast_to(&args[0], &[word("JSON")]),
        ("TO_VARCHAR" | "TO_CHAR", 1) => cast_to(&args[0], &[word("VARCHAR")]),
        ("TO_VARCHAR" | "TO_CHAR", 2) => passthrough_call("strftime", &args),
        ("DATEADD", 3) => dateadd(&args)?,
        ("DATEDIFF", 3) => {
            let unit = interval_unit(&args[0])?;
            let mut out = vec![word("date_diff"), punct('(')];
            out.push(TokenKind::Str(unit.to_ascii_lowercase()));
            out.push(punct(','));
            out.extend(args[1].iter().cloned());
            out.push(punct(','));
            out.extend(args[2].iter().cloned());
            out.push(punct(')'));
            out
        }
        _ => passthrough_call(name, &args),
    };
    Ok(out)
}

fn cast_to(expr: &[TokenKind], ty: &[TokenKind]) -> Vec<TokenKind> {
    let mut out = vec![word("CAST"), punct('(')];
    out.extend(expr.iter().cloned());
    out.push(word("AS"));
    out.extend(ty.iter().cloned());
    out.push(punct(')'));
    out
}

/// `DATEADD(unit, n, t)` → `(t + to_days(CAST(n AS BIGINT)))` and friends.
/// DuckDB's `to_*` interval constructors take dynamic amounts, unlike the
/// `INTERVAL n unit` literal form.
fn dateadd(args: &[Vec<TokenKind>]) -> Result<Vec<TokenKind>> {
    let unit = interval_unit(&args[0])?;
    let (ctor, factor) = match unit.as_str() {
        "YEAR" => ("to_years", 1),
        "QUARTER" => ("to_months", 3),
        "MONTH" => ("to_months", 1),
        "WEEK" => ("to_days", 7),
        "DAY" => ("to_days", 1),
        "HOUR" => ("to_hours", 1),
        "MINUTE" => ("to_minutes", 1),
        "SECOND" => ("to_seconds", 1),
        "MILLISECOND" => ("to_milliseconds", 1),
        "MICROSECOND" => ("to_microseconds", 1),
        other => {
            return Err(SnowglobeError::Translation(format!(
                "unsupported DATEADD unit {other}"
            )))
        }
    };
    let mut amount = Vec::new();
    if factor != 1 {
        amount.push(TokenKind::Number(factor.to_string()));
        amount.push(punct('*'));
    }
    amount.extend(parenthesized(&args[1]));

    let mut out = vec![punct('(')];
    out.extend(parenthesized(&args[2]));
    out.push(punct('+'));
    out.push(word(ctor));
    out.push(punct('('));
    out.extend(cast_to(&amount, &[word("BIGINT")]));
    out.push(punct(')'));
    out.push(punct(')'));
    Ok(out)
}

fn interval_unit(arg: &[TokenKind]) -> Result<String> {
    let raw = match arg {
        [TokenKind::Word(w)] => w.clone(),
        [TokenKind::Str(s)] => s.clone(),
        _ => {
            return Err(SnowglobeError::Translation(
                "date part must be an identifier or string".to_owned(),
            ))
        }
    };
    let u = raw.to_ascii_uppercase();
    let canonical = match u.as_str() {
        "YEAR" | "YEARS" | "Y" | "YY" | "YYYY" => "YEAR",
        "QUARTER" | "QUARTERS" | "Q" | "QQ" => "QUARTER",
        "MONTH" | "MONTHS" | "MM" | "MON" => "MONTH",
        "WEEK" | "WEEKS" | "W" | "WK" => "WEEK",
        "DAY" | "DAYS" | "D" | "DD" => "DAY",
        "HOUR" | "HOURS" | "H" | "HH" => "HOUR",
        "MINUTE" | "MINUTES" | "MI" | "MIN" => "MINUTE",
        "SECOND" | "SECONDS" | "S" | "SS" | "SEC" => "SECOND",
        "MILLISECOND" | "MILLISECONDS" | "MS" => "MILLISECOND",
        "MICROSECOND" | "MICROSECONDS" | "US" => "MICROSECOND",
        other => {
            return Err(SnowglobeError::Translation(format!(
                "unknown date part {other}"
            )))
        }
    };
    Ok(canonical.to_owned())
}

/// Map the `expr AS type` body of a CAST, leaving the expression alone.
fn map_cast_body(inner: Vec<TokenKind>) -> Vec<TokenKind> {
    // Find the last top-level AS; everything after it is the type.
    let mut depth = 0usize;
    let mut as_pos = None;
    for (i, k) in inner.iter().enumerate() {
        match k {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => depth = depth.saturating_sub(1),
            TokenKind::Word(w) if depth == 0 && w.eq_ignore_ascii_case("AS") => {
                as_pos = Some(i);
            }
            _ => {}
        }
    }
    let Some(pos) = as_pos else { return inner };
    let mut out: Vec<TokenKind> = inner[..=pos].to_vec();
    out.extend(map_type_tokens(&inner[pos + 1..]));
    out
}

/// Apply the Snowflake→engine type map to the word of a type declaration.
fn map_type_tokens(ty: &[TokenKind]) -> Vec<TokenKind> {
    let mut out = ty.to_vec();
    if let Some(TokenKind::Word(w)) = out.first() {
        let mapped = map_type_word(w);
        out[0] = word(&mapped);
    }
    out
}

pub fn map_type_word(w: &str) -> String {
    match w.to_ascii_uppercase().as_str() {
        "NUMBER" | "NUMERIC" => "DECIMAL".to_owned(),
        "STRING" => "VARCHAR".to_owned(),
        "VARIANT" | "OBJECT" | "ARRAY" => "JSON".to_owned(),
        "TIMESTAMP_NTZ" | "DATETIME" => "TIMESTAMP".to_owned(),
        "TIMESTAMP_LTZ" | "TIMESTAMP_TZ" => "TIMESTAMPTZ".to_owned(),
        "BINARY" | "VARBINARY" => "BLOB".to_owned(),
        "BYTEINT" => "TINYINT".to_owned(),
        "FLOAT4" => "FLOAT".to_owned(),
        "FLOAT8" => "DOUBLE".to_owned(),
        other => other.to_owned(),
    }
}

/// Rewrite postfix `::TYPE` casts.
fn rewrite_cast_operators(kinds: Vec<TokenKind>) -> Vec<TokenKind> {
    let mut out: Vec<TokenKind> = Vec::with_capacity(kinds.len());
    let mut i = 0;
    while i < kinds.len() {
        out.push(kinds[i].clone());
        if kinds[i] == TokenKind::Cast {
            if let Some(TokenKind::Word(w)) = kinds.get(i + 1) {
                out.push(word(&map_type_word(w)));
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// Rewrite rule 4: identifier qualification (applied last)
// ---------------------------------------------------------------------------

const CHAIN_KEYWORDS: &[&str] = &["FROM", "JOIN", "INTO", "UPDATE", "TABLE", "USING"];

/// Words that terminate a FROM list; an identifier equal to one of these is
/// never an alias.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "QUALIFY", "WINDOW", "UNION",
    "INTERSECT", "EXCEPT", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "FULL", "CROSS", "NATURAL",
    "ON", "USING", "SET", "VALUES", "SELECT", "RETURNING", "WHEN", "FETCH", "SAMPLE",
];

/// Builtin scalar functions whose argument lists contain a bare `FROM`
/// keyword; a FROM inside them never introduces a table source.
const FROM_BEARING_FUNCS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "POSITION", "OVERLAY"];

/// Mark every token that sits inside the parentheses of a FROM-bearing
/// scalar function call.
fn from_suppression_mask(kinds: &[TokenKind]) -> Vec<bool> {
    let mut mask = vec![false; kinds.len()];
    let mut stack: Vec<bool> = Vec::new();
    let mut prev_word: Option<String> = None;
    for (i, k) in kinds.iter().enumerate() {
        match k {
            TokenKind::Punct('(') => {
                let suppressing = prev_word
                    .as_deref()
                    .is_some_and(|w| FROM_BEARING_FUNCS.contains(&w));
                stack.push(suppressing);
                prev_word = None;
            }
            TokenKind::Punct(')') => {
                stack.pop();
                prev_word = None;
            }
            TokenKind::Word(w) => prev_word = Some(w.to_ascii_uppercase()),
            _ => prev_word = None,
        }
        mask[i] = stack.iter().any(|s| *s);
    }
    mask
}

fn qualify_tables(
    kinds: Vec<TokenKind>,
    ctx: &NameContext,
    tables: &mut Vec<ObjectName>,
) -> Result<Vec<TokenKind>> {
    let ctes = collect_cte_names(&kinds);
    let suppressed = from_suppression_mask(&kinds);
    let mut out: Vec<TokenKind> = Vec::with_capacity(kinds.len());
    let mut i = 0;

    while i < kinds.len() {
        let kw = upper_word(&kinds[i]);
        let starts_chain = kw
            .as_deref()
            .is_some_and(|w| CHAIN_KEYWORDS.contains(&w))
            && !suppressed[i];
        out.push(kinds[i].clone());
        i += 1;
        if !starts_chain {
            continue;
        }
        let in_from_list = kw.as_deref() == Some("FROM");
        // Only FROM/JOIN/USING sources can be table functions; the
        // parenthesis after `INSERT INTO t (...)` is a column list.
        let source_ctx = matches!(kw.as_deref(), Some("FROM" | "JOIN" | "USING"));

        loop {
            // A parenthesized source (subquery) is left alone.
            let Some(next) = kinds.get(i) else { break };
            if matches!(next, TokenKind::Punct('(')) {
                break;
            }
            let chain_start = i;
            let Some(parts) = read_ident_chain(&kinds, &mut i) else {
                break;
            };
            // Table function call, e.g. `FROM read_csv(...)`.
            if source_ctx && kinds.get(i) == Some(&TokenKind::Punct('(')) {
                out.extend(kinds[chain_start..i].iter().cloned());
                break;
            }
            let already_qualified = parts.len() == 2 && parts[0].1 && parts[0].0.contains('.');
            if already_qualified || (parts.len() == 1 && ctes.contains(&parts[0].0)) {
                out.extend(kinds[chain_start..i].iter().cloned());
            } else {
                let name = resolve_parts(&parts, ctx)?;
                out.push(TokenKind::Quoted(name.engine_schema()));
                out.push(punct('.'));
                out.push(TokenKind::Quoted(name.name.clone()));
                tables.push(name);
            }

            if !in_from_list {
                break;
            }
            // Optional alias, then maybe a comma continuing the FROM list.
            if let Some(TokenKind::Word(w)) = kinds.get(i) {
                let uw = w.to_ascii_uppercase();
                if uw == "AS" {
                    out.push(kinds[i].clone());
                    i += 1;
                    if matches!(kinds.get(i), Some(TokenKind::Word(_) | TokenKind::Quoted(_))) {
                        out.push(kinds[i].clone());
                        i += 1;
                    }
                } else if !CLAUSE_KEYWORDS.contains(&uw.as_str()) {
                    out.push(kinds[i].clone());
                    i += 1;
                }
            } else if let Some(TokenKind::Quoted(_)) = kinds.get(i) {
                out.push(kinds[i].clone());
                i += 1;
            }
            if kinds.get(i) == Some(&TokenKind::Punct(',')) {
                out.push(kinds[i].clone());
                i += 1;
                continue;
            }
            break;
        }
    }
    Ok(out)
}

/// Read a dotted identifier chain at `*i`; returns `(key, was_quoted)` parts.
fn read_ident_chain(kinds: &[TokenKind], i: &mut usize) -> Option<Vec<(String, bool)>> {
    let mut parts = Vec::new();
    loop {
        match kinds.get(*i) {
            Some(TokenKind::Word(w)) => {
                parts.push((w.to_ascii_uppercase(), false));
                *i += 1;
            }
            Some(TokenKind::Quoted(q)) => {
                parts.push((q.clone(), true));
                *i += 1;
            }
            _ => break,
        }
        if kinds.get(*i) == Some(&TokenKind::Punct('.')) && parts.len() < 3 {
            *i += 1;
        } else {
            break;
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

fn resolve_parts(parts: &[(String, bool)], ctx: &NameContext) -> Result<ObjectName> {
    let missing = |what: &str| {
        SnowglobeError::Translation(format!(
            "cannot resolve unqualified name: no current {what} is selected"
        ))
    };
    match parts {
        [(t, _)] => Ok(ObjectName {
            database: ctx.database.clone().ok_or_else(|| missing("database"))?,
            schema: ctx.schema.clone().ok_or_else(|| missing("schema"))?,
            name: t.clone(),
        }),
        [(s, _), (t, _)] => Ok(ObjectName {
            database: ctx.database.clone().ok_or_else(|| missing("database"))?,
            schema: s.clone(),
            name: t.clone(),
        }),
        [(d, _), (s, _), (t, _)] => Ok(ObjectName {
            database: d.clone(),
            schema: s.clone(),
            name: t.clone(),
        }),
        _ => Err(SnowglobeError::Translation(
            "identifier has too many parts".to_owned(),
        )),
    }
}

/// Names bound by a WITH clause; they must not be qualified.
fn collect_cte_names(kinds: &[TokenKind]) -> Vec<String> {
    let mut names = Vec::new();
    let mut i = 0;
    if !kinds.first().is_some_and(|k| {
        matches!(k, TokenKind::Word(w) if w.eq_ignore_ascii_case("WITH"))
    }) {
        return names;
    }
    i += 1;
    if let Some(TokenKind::Word(w)) = kinds.get(i) {
        if w.eq_ignore_ascii_case("RECURSIVE") {
            i += 1;
        }
    }
    loop {
        let name = match kinds.get(i) {
            Some(TokenKind::Word(w)) => w.to_ascii_uppercase(),
            Some(TokenKind::Quoted(q)) => q.clone(),
            _ => break,
        };
        names.push(name);
        i += 1;
        // Optional column list.
        if kinds.get(i) == Some(&TokenKind::Punct('(')) {
            if let Ok(close) = matching_paren(kinds, i) {
                i = close + 1;
            } else {
                break;
            }
        }
        if !kinds
            .get(i)
            .is_some_and(|k| matches!(k, TokenKind::Word(w) if w.eq_ignore_ascii_case("AS")))
        {
            break;
        }
        i += 1;
        if kinds.get(i) == Some(&TokenKind::Punct('(')) {
            if let Ok(close) = matching_paren(kinds, i) {
                i = close + 1;
            } else {
                break;
            }
        } else {
            break;
        }
        if kinds.get(i) == Some(&TokenKind::Punct(',')) {
            i += 1;
            continue;
        }
        break;
    }
    names
}

// ---------------------------------------------------------------------------
// Directive parsing
// ---------------------------------------------------------------------------

struct Parser<'a> {
    sql: &'a str,
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a NameContext,
}

impl<'a> Parser<'a> {
    // The token slice outlives the parser, so lookahead references carry
    // `'a` and never pin `self`.
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_kw(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kws(&mut self, kws: &[&str]) -> bool {
        let start = self.pos;
        for kw in kws {
            if !self.eat_kw(kw) {
                self.pos = start;
                return false;
            }
        }
        true
    }

    fn err(&self, msg: impl Into<String>) -> SnowglobeError {
        SnowglobeError::Translation(msg.into())
    }

    fn expect_ident(&mut self) -> Result<String> {
        let key = self.peek().and_then(Token::ident_key);
        match key {
            Some(k) => {
                self.pos += 1;
                Ok(k)
            }
            None => Err(self.err("expected an identifier")),
        }
    }

    fn ident_chain(&mut self) -> Result<Vec<String>> {
        let mut parts = vec![self.expect_ident()?];
        while self.peek().is_some_and(|t| t.is_punct('.')) && parts.len() < 3 {
            self.pos += 1;
            parts.push(self.expect_ident()?);
        }
        Ok(parts)
    }

    fn object_name(&mut self) -> Result<ObjectName> {
        let parts = self.ident_chain()?;
        let pairs: Vec<(String, bool)> = parts.into_iter().map(|p| (p, false)).collect();
        resolve_parts(&pairs, self.ctx)
    }

    /// `[db.]schema` pair for schema-level statements.
    fn schema_name(&mut self) -> Result<(String, String)> {
        let parts = self.ident_chain()?;
        match parts.as_slice() {
            [s] => {
                let db = self
                    .ctx
                    .database
                    .clone()
                    .ok_or_else(|| self.err("no current database is selected"))?;
                Ok((db, s.clone()))
            }
            [d, s] => Ok((d.clone(), s.clone())),
            _ => Err(self.err("schema name has too many parts")),
        }
    }

    fn if_not_exists(&mut self) -> bool {
        self.eat_kws(&["IF", "NOT", "EXISTS"])
    }

    fn if_exists(&mut self) -> bool {
        self.eat_kws(&["IF", "EXISTS"])
    }

    fn directive(&mut self) -> Result<Directive> {
        let first = self.bump().expect("non-empty token stream");
        if first.is_kw("CREATE") {
            return self.create();
        }
        if first.is_kw("DROP") {
            return self.drop();
        }
        if first.is_kw("UNDROP") {
            return self.undrop();
        }
        if first.is_kw("ALTER") {
            return self.alter();
        }
        if first.is_kw("TRUNCATE") {
            self.eat_kw("TABLE");
            let if_exists = self.if_exists();
            let name = self.object_name()?;
            return Ok(Directive::TruncateTable { name, if_exists });
        }
        if first.is_kw("USE") {
            return self.use_stmt();
        }
        if first.is_kw("SHOW") {
            return self.show();
        }
        // DESCRIBE / DESC
        let kind = if self.eat_kw("VIEW") {
            DescribeKind::View
        } else {
            self.eat_kw("TABLE");
            DescribeKind::Table
        };
        let name = self.object_name()?;
        Ok(Directive::Describe { kind, name })
    }

    fn create(&mut self) -> Result<Directive> {
        let or_replace = self.eat_kws(&["OR", "REPLACE"]);
        let secure = self.eat_kw("SECURE");
        let transient = self.eat_kw("TRANSIENT");
        let _temp = self.eat_kw("TEMP") || self.eat_kw("TEMPORARY");

        if self.eat_kw("DATABASE") {
            let if_not_exists = self.if_not_exists();
            let name = self.expect_ident()?;
            let comment = self.trailing_comment();
            return Ok(Directive::CreateDatabase {
                name,
                if_not_exists,
                or_replace,
                transient,
                comment,
            });
        }
        if self.eat_kw("SCHEMA") {
            let if_not_exists = self.if_not_exists();
            let (database, name) = self.schema_name()?;
            return Ok(Directive::CreateSchema {
                database,
                name,
                if_not_exists,
                or_replace,
            });
        }
        if self.eat_kw("TABLE") {
            let if_not_exists = self.if_not_exists();
            let name = self.object_name()?;
            if self.eat_kw("CLONE") {
                let source = self.object_name()?;
                return Ok(Directive::CloneTable {
                    name,
                    source,
                    if_not_exists,
                    or_replace,
                });
            }
            if self.peek().is_some_and(|t| t.is_punct('(')) {
                let columns = self.column_list()?;
                if self.eat_kw("AS") {
                    return Err(self.err(
                        "CREATE TABLE with both a column list and AS SELECT is not supported",
                    ));
                }
                return Ok(Directive::CreateTable {
                    name,
                    columns,
                    if_not_exists,
                    or_replace,
                });
            }
            if self.eat_kw("AS") {
                let rest = &self.tokens[self.pos..];
                if rest.is_empty() {
                    return Err(self.err("CREATE TABLE AS requires a query"));
                }
                let query = rewrite_query_tokens(rest, self.ctx)?;
                return Ok(Directive::CreateTableAs {
                    name,
                    or_replace,
                    query,
                });
            }
            return Err(self.err("expected a column list, AS or CLONE after the table name"));
        }
        if self.eat_kw("VIEW") {
            let if_not_exists = self.if_not_exists();
            let name = self.object_name()?;
            if self.peek().is_some_and(|t| t.is_punct('(')) {
                // Column alias list; the stored definition keeps its own names.
                let open = self.pos;
                let kinds: Vec<TokenKind> =
                    self.tokens.iter().map(|t| t.kind.clone()).collect();
                let close = matching_paren(&kinds, open)?;
                self.pos = close + 1;
            }
            if !self.eat_kw("AS") {
                return Err(self.err("expected AS in CREATE VIEW"));
            }
            let text = match self.tokens.get(self.pos) {
                Some(t) => self.sql[t.start..].trim().to_owned(),
                None => return Err(self.err("CREATE VIEW requires a definition")),
            };
            // Validate the definition lexes; it is stored verbatim.
            tokenizer::tokenize(&text)?;
            return Ok(Directive::CreateView {
                name,
                text,
                secure,
                if_not_exists,
                or_replace,
            });
        }
        if self.eat_kw("STAGE") {
            let if_not_exists = self.if_not_exists();
            let name = self.object_name()?;
            return Ok(Directive::CreateStage {
                name,
                if_not_exists,
                or_replace,
            });
        }
        Err(self.err(format!(
            "unsupported CREATE target near `{}`",
            self.remaining_text()
        )))
    }

    fn drop(&mut self) -> Result<Directive> {
        if self.eat_kw("DATABASE") {
            let if_exists = self.if_exists();
            let name = self.expect_ident()?;
            let cascade = self.eat_kw("CASCADE") || !self.eat_kw("RESTRICT");
            return Ok(Directive::DropDatabase {
                name,
                if_exists,
                cascade,
            });
        }
        if self.eat_kw("SCHEMA") {
            let if_exists = self.if_exists();
            let (database, name) = self.schema_name()?;
            let cascade = self.eat_kw("CASCADE") || !self.eat_kw("RESTRICT");
            return Ok(Directive::DropSchema {
                database,
                name,
                if_exists,
                cascade,
            });
        }
        if self.eat_kw("TABLE") {
            let if_exists = self.if_exists();
            let name = self.object_name()?;
            return Ok(Directive::DropTable { name, if_exists });
        }
        if self.eat_kw("VIEW") {
            let if_exists = self.if_exists();
            let name = self.object_name()?;
            return Ok(Directive::DropView { name, if_exists });
        }
        if self.eat_kw("STAGE") {
            let if_exists = self.if_exists();
            let name = self.object_name()?;
            return Ok(Directive::DropStage { name, if_exists });
        }
        Err(self.err(format!(
            "unsupported DROP target near `{}`",
            self.remaining_text()
        )))
    }

    fn undrop(&mut self) -> Result<Directive> {
        if self.eat_kw("DATABASE") {
            let name = self.expect_ident()?;
            return Ok(Directive::UndropDatabase { name });
        }
        if self.eat_kw("SCHEMA") {
            let (database, name) = self.schema_name()?;
            return Ok(Directive::UndropSchema { database, name });
        }
        if self.eat_kw("TABLE") {
            let name = self.object_name()?;
            return Ok(Directive::UndropTable { name });
        }
        if self.eat_kw("VIEW") {
            let name = self.object_name()?;
            return Ok(Directive::UndropView { name });
        }
        Err(self.err(format!(
            "unsupported UNDROP target near `{}`",
            self.remaining_text()
        )))
    }

    fn alter(&mut self) -> Result<Directive> {
        if self.eat_kw("SESSION") {
            return Ok(Directive::AlterSession);
        }
        if self.eat_kw("TABLE") {
            let if_exists = self.if_exists();
            let name = self.object_name()?;
            if self.eat_kws(&["RENAME", "TO"]) {
                let parts = self.ident_chain()?;
                let to = match parts.as_slice() {
                    [t] => ObjectName {
                        database: name.database.clone(),
                        schema: name.schema.clone(),
                        name: t.clone(),
                    },
                    [s, t] => ObjectName {
                        database: name.database.clone(),
                        schema: s.clone(),
                        name: t.clone(),
                    },
                    [d, s, t] => ObjectName {
                        database: d.clone(),
                        schema: s.clone(),
                        name: t.clone(),
                    },
                    _ => return Err(self.err("rename target has too many parts")),
                };
                return Ok(Directive::RenameTable {
                    name,
                    to,
                    if_exists,
                });
            }
            return Err(self.err("only ALTER TABLE ... RENAME TO is supported"));
        }
        Err(self.err(format!(
            "unsupported ALTER target near `{}`",
            self.remaining_text()
        )))
    }

    fn use_stmt(&mut self) -> Result<Directive> {
        if self.eat_kw("DATABASE") {
            let name = self.expect_ident()?;
            return Ok(Directive::Use {
                target: UseTarget::Database,
                name,
            });
        }
        if self.eat_kw("SCHEMA") {
            // `USE SCHEMA d.s` switches both database and schema; the
            // executor splits on the dot.
            let parts = self.ident_chain()?;
            let name = parts.join(".");
            return Ok(Directive::Use {
                target: UseTarget::Schema,
                name,
            });
        }
        if self.eat_kw("WAREHOUSE") {
            let name = self.expect_ident()?;
            return Ok(Directive::Use {
                target: UseTarget::Warehouse,
                name,
            });
        }
        if self.eat_kw("ROLE") {
            let name = self.expect_ident()?;
            return Ok(Directive::Use {
                target: UseTarget::Role,
                name,
            });
        }
        // Bare `USE name` selects a database.
        let name = self.expect_ident()?;
        Ok(Directive::Use {
            target: UseTarget::Database,
            name,
        })
    }

    fn show(&mut self) -> Result<Directive> {
        self.eat_kw("TERSE");
        let dropped = self.eat_kw("DROPPED");
        let kind = if self.eat_kw("DATABASES") {
            ShowKind::Databases
        } else if self.eat_kw("SCHEMAS") {
            ShowKind::Schemas
        } else if self.eat_kw("TABLES") || self.eat_kw("OBJECTS") {
            ShowKind::Tables
        } else if self.eat_kw("VIEWS") {
            ShowKind::Views
        } else if self.eat_kw("STAGES") {
            ShowKind::Stages
        } else if self.eat_kw("WAREHOUSES") {
            ShowKind::Warehouses
        } else if self.eat_kw("ROLES") {
            ShowKind::Roles
        } else {
            return Err(self.err(format!(
                "unsupported SHOW target near `{}`",
                self.remaining_text()
            )));
        };
        let like = if self.eat_kw("LIKE") {
            match self.bump().map(|t| t.kind.clone()) {
                Some(TokenKind::Str(s)) => Some(s),
                _ => return Err(self.err("LIKE requires a string pattern")),
            }
        } else {
            None
        };
        let scope = if self.eat_kw("IN") {
            if self.eat_kw("ACCOUNT") {
                None
            } else if self.eat_kw("DATABASE") {
                Some(ShowScope::Database(self.expect_ident()?))
            } else if self.eat_kw("SCHEMA") {
                let (database, schema) = self.schema_name()?;
                Some(ShowScope::Schema { database, schema })
            } else {
                // Bare `IN name`: a database for SHOW SCHEMAS/TABLES,
                // a schema path when dotted.
                let parts = self.ident_chain()?;
                match parts.as_slice() {
                    [d] => Some(ShowScope::Database(d.clone())),
                    [d, s] => Some(ShowScope::Schema {
                        database: d.clone(),
                        schema: s.clone(),
                    }),
                    _ => return Err(self.err("IN scope has too many parts")),
                }
            }
        } else {
            None
        };
        Ok(Directive::Show(Show {
            kind,
            dropped,
            like,
            scope,
        }))
    }

    /// Scan forward for `COMMENT = '...'` among database options.
    fn trailing_comment(&mut self) -> Option<String> {
        while self.pos < self.tokens.len() {
            if self.eat_kw("COMMENT") {
                if self.peek().is_some_and(|t| t.is_punct('=')) {
                    self.pos += 1;
                }
                if let Some(Token {
                    kind: TokenKind::Str(s),
                    ..
                }) = self.bump()
                {
                    return Some(s.clone());
                }
                return None;
            }
            self.pos += 1;
        }
        None
    }

    fn column_list(&mut self) -> Result<Vec<ColumnSpec>> {
        // Consume '('.
        self.pos += 1;
        let mut columns: Vec<ColumnSpec> = Vec::new();
        loop {
            if self.peek().is_some_and(|t| t.is_punct(')')) {
                self.pos += 1;
                break;
            }
            // Table-level constraints.
            if self.peek().is_some_and(|t| t.is_kw("PRIMARY")) {
                self.pos += 1;
                self.eat_kw("KEY");
                let keys = self.paren_ident_list()?;
                for k in keys {
                    if let Some(c) = columns.iter_mut().find(|c| c.name == k) {
                        c.primary_key = true;
                        c.nullable = false;
                    }
                }
                self.skip_to_column_end();
                if !self.end_of_column()? {
                    continue;
                }
                break;
            }
            if self
                .peek()
                .is_some_and(|t| t.is_kw("CONSTRAINT") || t.is_kw("UNIQUE") || t.is_kw("FOREIGN"))
            {
                self.skip_to_column_end();
                if !self.end_of_column()? {
                    continue;
                }
                break;
            }

            let name = self.expect_ident()?;
            let (sf_type, engine_type) = self.column_type()?;
            let mut nullable = true;
            let mut primary_key = false;
            // Column modifiers until ',' or ')' at depth zero.
            loop {
                if self.eat_kws(&["NOT", "NULL"]) {
                    nullable = false;
                    continue;
                }
                if self.eat_kw("NULL") {
                    continue;
                }
                if self.eat_kws(&["PRIMARY", "KEY"]) {
                    primary_key = true;
                    nullable = false;
                    continue;
                }
                if self.eat_kw("UNIQUE") {
                    continue;
                }
                if self.eat_kw("COMMENT") {
                    self.bump();
                    continue;
                }
                if self.eat_kw("DEFAULT") || self.eat_kws(&["AUTOINCREMENT"]) || self.eat_kw("IDENTITY") {
                    self.skip_to_column_end();
                    continue;
                }
                break;
            }
            columns.push(ColumnSpec {
                name,
                sf_type,
                engine_type,
                nullable,
                primary_key,
            });
            if !self.end_of_column()? {
                continue;
            }
            break;
        }
        if columns.is_empty() {
            return Err(self.err("CREATE TABLE requires at least one column"));
        }
        Ok(columns)
    }

    /// Expect ',' (more columns) or ')' (done); true means done.
    fn end_of_column(&mut self) -> Result<bool> {
        if self.peek().is_some_and(|t| t.is_punct(',')) {
            self.pos += 1;
            return Ok(false);
        }
        if self.peek().is_some_and(|t| t.is_punct(')')) {
            self.pos += 1;
            return Ok(true);
        }
        Err(self.err("expected `,` or `)` in column list"))
    }

    /// Skip tokens until the next top-level ',' or the closing ')'.
    fn skip_to_column_end(&mut self) {
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            match &t.kind {
                TokenKind::Punct('(') => depth += 1,
                TokenKind::Punct(')') => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Punct(',') if depth == 0 => return,
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn paren_ident_list(&mut self) -> Result<Vec<String>> {
        if !self.peek().is_some_and(|t| t.is_punct('(')) {
            return Err(self.err("expected `(`"));
        }
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            out.push(self.expect_ident()?);
            if self.peek().is_some_and(|t| t.is_punct(',')) {
                self.pos += 1;
                continue;
            }
            if self.peek().is_some_and(|t| t.is_punct(')')) {
                self.pos += 1;
                return Ok(out);
            }
            return Err(self.err("expected `,` or `)`"));
        }
    }

    /// Parse a column type declaration: a word plus optional `(n[,m])`.
    fn column_type(&mut self) -> Result<(String, String)> {
        let base = match self.bump().map(|t| t.kind.clone()) {
            Some(TokenKind::Word(w)) => w.to_ascii_uppercase(),
            _ => return Err(self.err("expected a column type")),
        };
        // Two-word types such as DOUBLE PRECISION.
        let base = if base == "DOUBLE" && self.eat_kw("PRECISION") {
            "DOUBLE".to_owned()
        } else {
            base
        };
        let mut params = String::new();
        if self.peek().is_some_and(|t| t.is_punct('(')) {
            params.push('(');
            self.pos += 1;
            while let Some(t) = self.bump() {
                match &t.kind {
                    TokenKind::Punct(')') => {
                        params.push(')');
                        break;
                    }
                    TokenKind::Punct(',') => params.push(','),
                    TokenKind::Number(n) => params.push_str(n),
                    other => {
                        return Err(SnowglobeError::Translation(format!(
                            "unexpected token in type parameters: {other:?}"
                        )))
                    }
                }
            }
        }
        let sf_type = format!("{base}{params}");
        let mapped = map_type_word(&base);
        // A bare NUMBER maps to the widest decimal.
        let engine_type = if mapped == "DECIMAL" && params.is_empty() {
            "DECIMAL(38,0)".to_owned()
        } else {
            format!("{mapped}{params}")
        };
        Ok((sf_type, engine_type))
    }

    fn remaining_text(&self) -> &str {
        match self.tokens.get(self.pos.min(self.tokens.len().saturating_sub(1))) {
            Some(t) => self.sql[t.start..].trim_end(),
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> NameContext {
        NameContext::new("SNOWGLOBE", "PUBLIC")
    }

    fn data(sql: &str) -> DataStatement {
        match translate(sql, &ctx()).unwrap() {
            Translated::Data(d) => d,
            other => panic!("expected data statement, got {other:?}"),
        }
    }

    fn directive(sql: &str) -> Directive {
        match translate(sql, &ctx()).unwrap() {
            Translated::Directive(d) => d,
            other => panic!("expected directive, got {other:?}"),
        }
    }

    #[test]
    fn constants_short_circuit() {
        for (sql, expected) in [
            ("SELECT CURRENT_VERSION()", ConstantFn::Version),
            ("select current_database()", ConstantFn::Database),
            ("SELECT CURRENT_ROLE();", ConstantFn::Role),
        ] {
            match translate(sql, &ctx()).unwrap() {
                Translated::Constant(c) => assert_eq!(c, expected),
                other => panic!("expected constant, got {other:?}"),
            }
        }
    }

    #[test]
    fn iff_becomes_case() {
        let d = data("SELECT IFF(x > 1, 'big', 'small') FROM t");
        assert!(
            d.sql.contains("CASE WHEN (x > 1) THEN ('big') ELSE ('small') END"),
            "got: {}",
            d.sql
        );
    }

    #[test]
    fn iff_inside_string_is_untouched() {
        let d = data("SELECT 'IFF the user agrees' FROM t");
        assert!(d.sql.contains("'IFF the user agrees'"));
    }

    #[test]
    fn nvl_and_nvl2() {
        let d = data("SELECT NVL(a, b), NVL2(a, b, c) FROM t");
        assert!(d.sql.contains("COALESCE (a, b)"), "got: {}", d.sql);
        assert!(
            d.sql.contains("CASE WHEN (a) IS NOT NULL THEN (b) ELSE (c) END"),
            "got: {}",
            d.sql
        );
    }

    #[test]
    fn decode_builds_balanced_case() {
        let d = data("SELECT DECODE(x, 1, 'one', 2, 'two', 'other') FROM t");
        assert!(
            d.sql
                .contains("CASE (x) WHEN (1) THEN ('one') WHEN (2) THEN ('two') ELSE ('other') END"),
            "got: {}",
            d.sql
        );
    }

    #[test]
    fn datetime_rewrites() {
        let d = data("SELECT TO_DATE(x), TO_TIMESTAMP(y), DATEADD(day, 3, z) FROM t");
        assert!(d.sql.contains("CAST (x AS DATE)"), "got: {}", d.sql);
        assert!(d.sql.contains("CAST (y AS TIMESTAMP)"), "got: {}", d.sql);
        assert!(d.sql.contains("to_days"), "got: {}", d.sql);
    }

    #[test]
    fn current_timestamp_with_and_without_parens() {
        let d = data("SELECT CURRENT_TIMESTAMP, CURRENT_TIMESTAMP()");
        assert_eq!(d.sql.matches("now ()").count(), 2, "got: {}", d.sql);
    }

    #[test]
    fn variant_cast_maps_to_json() {
        let d = data("SELECT PARSE_JSON(s)::VARIANT, CAST(s AS VARIANT) FROM t");
        assert!(d.sql.contains(":: JSON") || d.sql.contains("::JSON"));
        assert!(d.sql.contains("AS JSON"));
    }

    #[test]
    fn qualification_uses_session_context() {
        let d = data("SELECT * FROM t");
        assert!(d.sql.contains("\"SNOWGLOBE.PUBLIC\".\"T\""));
        assert_eq!(d.tables.len(), 1);
        assert_eq!(d.tables[0].fqn(), "SNOWGLOBE.PUBLIC.T");
    }

    #[test]
    fn qualification_respects_explicit_parts() {
        let d = data("SELECT * FROM db1.s1.t1 JOIN s2.t2 ON 1=1");
        assert!(d.sql.contains("\"DB1.S1\".\"T1\""));
        assert!(d.sql.contains("\"SNOWGLOBE.S2\".\"T2\""));
    }

    #[test]
    fn quoted_table_name_keeps_case() {
        let d = data(r#"SELECT * FROM "t""#);
        assert!(d.sql.contains("\"SNOWGLOBE.PUBLIC\".\"t\""));
    }

    #[test]
    fn cte_names_are_not_qualified() {
        let d = data("WITH x AS (SELECT 1) SELECT * FROM x, t");
        assert!(d.sql.contains("FROM x,"), "got: {}", d.sql);
        assert!(d.sql.contains("\"SNOWGLOBE.PUBLIC\".\"T\""), "got: {}", d.sql);
    }

    #[test]
    fn extract_from_is_not_a_table_source() {
        let d = data("SELECT EXTRACT(DAY FROM ts) FROM t");
        assert!(d.sql.contains("EXTRACT (DAY FROM ts)"), "got: {}", d.sql);
        assert_eq!(d.tables.len(), 1);
        assert_eq!(d.tables[0].name, "T");
    }

    #[test]
    fn insert_column_list_is_not_a_table_function() {
        let d = data("INSERT INTO t (id, name) VALUES (1, 'A')");
        assert!(
            d.sql.contains("\"SNOWGLOBE.PUBLIC\".\"T\" (id, name)"),
            "got: {}",
            d.sql
        );
        assert_eq!(d.class, StatementClass::Insert);
    }

    #[test]
    fn table_functions_are_not_qualified() {
        let d = data("SELECT * FROM range(10)");
        assert!(d.sql.contains("range ("));
        assert!(d.tables.is_empty());
    }

    #[test]
    fn translation_is_idempotent() {
        let once = data("SELECT IFF(a, NVL(b, c), d), x::VARIANT FROM s1.t WHERE e = 'NVL(q,w)'");
        let twice = rewrite_query(&once.sql, &ctx()).unwrap();
        assert_eq!(once.sql, twice.sql);
    }

    #[test]
    fn unknown_create_target_errors() {
        let err = translate("CREATE FUNCTION f() RETURNS INT", &ctx()).unwrap_err();
        assert_eq!(err.code(), "Translation");
    }

    #[test]
    fn create_table_parses_columns() {
        let d = directive("CREATE TABLE T (ID INT NOT NULL PRIMARY KEY, NAME VARCHAR(20), V VARIANT)");
        match d {
            Directive::CreateTable { name, columns, .. } => {
                assert_eq!(name.fqn(), "SNOWGLOBE.PUBLIC.T");
                assert_eq!(columns.len(), 3);
                assert!(columns[0].primary_key);
                assert!(!columns[0].nullable);
                assert_eq!(columns[1].engine_type, "VARCHAR(20)");
                assert_eq!(columns[2].engine_type, "JSON");
                assert_eq!(columns[2].sf_type, "VARIANT");
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn number_maps_to_decimal() {
        let d = directive("CREATE TABLE T (N NUMBER, M NUMBER(10,2))");
        match d {
            Directive::CreateTable { columns, .. } => {
                assert_eq!(columns[0].engine_type, "DECIMAL(38,0)");
                assert_eq!(columns[1].engine_type, "DECIMAL(10,2)");
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn create_or_replace_and_if_not_exists() {
        match directive("CREATE OR REPLACE TABLE T (A INT)") {
            Directive::CreateTable { or_replace, .. } => assert!(or_replace),
            other => panic!("unexpected directive {other:?}"),
        }
        match directive("CREATE TABLE IF NOT EXISTS T (A INT)") {
            Directive::CreateTable { if_not_exists, .. } => assert!(if_not_exists),
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn clone_directive() {
        match directive("CREATE TABLE T2 CLONE T") {
            Directive::CloneTable { name, source, .. } => {
                assert_eq!(name.fqn(), "SNOWGLOBE.PUBLIC.T2");
                assert_eq!(source.fqn(), "SNOWGLOBE.PUBLIC.T");
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn view_text_is_verbatim() {
        match directive("CREATE VIEW V AS SELECT iff(a, 1, 2) FROM t  ") {
            Directive::CreateView { text, .. } => {
                assert_eq!(text, "SELECT iff(a, 1, 2) FROM t");
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn show_variants() {
        match directive("SHOW DROPPED TABLES IN SCHEMA DB1.S1") {
            Directive::Show(s) => {
                assert_eq!(s.kind, ShowKind::Tables);
                assert!(s.dropped);
                assert_eq!(
                    s.scope,
                    Some(ShowScope::Schema {
                        database: "DB1".into(),
                        schema: "S1".into()
                    })
                );
            }
            other => panic!("unexpected directive {other:?}"),
        }
        match directive("SHOW DATABASES LIKE 'TEST%'") {
            Directive::Show(s) => assert_eq!(s.like.as_deref(), Some("TEST%")),
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn use_statements() {
        match directive("USE DATABASE TESTDB") {
            Directive::Use { target, name } => {
                assert_eq!(target, UseTarget::Database);
                assert_eq!(name, "TESTDB");
            }
            other => panic!("unexpected directive {other:?}"),
        }
        match directive("USE SCHEMA A.B") {
            Directive::Use { target, name } => {
                assert_eq!(target, UseTarget::Schema);
                assert_eq!(name, "A.B");
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn alter_rename_and_session() {
        match directive("ALTER TABLE T RENAME TO T2") {
            Directive::RenameTable { name, to, .. } => {
                assert_eq!(name.name, "T");
                assert_eq!(to.name, "T2");
                assert_eq!(to.schema, "PUBLIC");
            }
            other => panic!("unexpected directive {other:?}"),
        }
        assert_eq!(directive("ALTER SESSION SET TIMEZONE='UTC'"), Directive::AlterSession);
    }

    #[test]
    fn statement_type_codes() {
        assert_eq!(StatementClass::Select.type_id(), 4096);
        assert_eq!(StatementClass::Create.type_id(), 8192);
        assert_eq!(StatementClass::Drop.type_id(), 16384);
        assert_eq!(StatementClass::Insert.type_id(), 32768);
        assert_eq!(StatementClass::Update.type_id(), 65536);
        assert_eq!(StatementClass::Delete.type_id(), 131_072);
        assert_eq!(StatementClass::Alter.type_id(), 262_144);
        assert_eq!(StatementClass::Truncate.type_id(), 524_288);
        assert_eq!(StatementClass::Use.type_id(), 1_048_576);
        assert_eq!(StatementClass::Show.type_id(), 2_097_152);
    }
}
