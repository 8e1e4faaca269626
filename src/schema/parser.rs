//! Per-field type-string parser.
//!
//! Grammar (informal):
//!
//! ```text
//! field        := prompt? core optional? index?
//! core         := primitive | ref | array | enum
//! primitive    := 'string' | 'number' | 'boolean' | 'date' | 'datetime'
//!               | 'markdown' | 'json'
//! ref          := operator TypeName ('.' Backref)?
//! operator     := '->' | '<-' | '~>' | '<~'
//! array        := '[' core ']'
//! enum         := Value ('|' Value)+
//! union        := fuzzy-operator TypeName ('|' TypeName)+
//! optional     := '?'
//! index        := '#' | '##'
//! prompt       := TEXT '?'
//! ```
//!
//! Examples: `"string?#"` (optional, indexed string), `"->Author.posts"`
//! (hard reference with back-reference), `"~>Category?"` (optional fuzzy
//! reference), `"<~Person|Company"` (fuzzy backward union).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validate::{validate_field_name, validate_type_name};
use crate::{Error, Result};

// ============================================================================
// Schema containers
// ============================================================================

/// Raw schema input: entity name → (field name → type expression).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSource {
    pub entities: IndexMap<String, IndexMap<String, String>>,
}

impl SchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity with its fields, preserving declaration order.
    pub fn entity<'a>(
        &mut self,
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> &mut Self {
        self.entities.insert(
            name.into(),
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

/// A fully parsed schema. Entity order is declaration order — it is the
/// tie-break for dependency layering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub entities: IndexMap<String, EntitySchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub fields: IndexMap<String, FieldSpec>,
}

// ============================================================================
// Field specifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    String,
    Number,
    Boolean,
    Date,
    DateTime,
    Markdown,
    Json,
}

impl Primitive {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Primitive::String),
            "number" => Some(Primitive::Number),
            "boolean" => Some(Primitive::Boolean),
            "date" => Some(Primitive::Date),
            "datetime" => Some(Primitive::DateTime),
            "markdown" => Some(Primitive::Markdown),
            "json" => Some(Primitive::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::String => "string",
            Primitive::Number => "number",
            Primitive::Boolean => "boolean",
            Primitive::Date => "date",
            Primitive::DateTime => "datetime",
            Primitive::Markdown => "markdown",
            Primitive::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    Primitive(Primitive),
    Reference,
    Enum(Vec<String>),
}

/// Reference operators.
///
/// | Operator | Meaning | Dependency |
/// |----------|---------|------------|
/// | `->` | exact forward | hard (soft when optional) |
/// | `<-` | exact reverse | none |
/// | `~>` | fuzzy forward | soft |
/// | `<~` | fuzzy reverse | soft |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefOperator {
    Forward,
    Backward,
    FuzzyForward,
    FuzzyBackward,
}

impl RefOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            RefOperator::Forward => "->",
            RefOperator::Backward => "<-",
            RefOperator::FuzzyForward => "~>",
            RefOperator::FuzzyBackward => "<~",
        }
    }

    pub fn is_fuzzy(&self) -> bool {
        matches!(self, RefOperator::FuzzyForward | RefOperator::FuzzyBackward)
    }

    pub fn direction(&self) -> RefDirection {
        match self {
            RefOperator::Forward | RefOperator::FuzzyForward => RefDirection::Forward,
            RefOperator::Backward | RefOperator::FuzzyBackward => RefDirection::Backward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    None,
    Indexed,
    Unique,
}

/// One parsed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub operator: Option<RefOperator>,
    pub target_type: Option<String>,
    pub backref: Option<String>,
    pub is_array: bool,
    pub is_optional: bool,
    pub match_mode: MatchMode,
    pub direction: RefDirection,
    pub union_types: Option<Vec<String>>,
    pub prompt: Option<String>,
    /// No surface syntax; populated programmatically (e.g. by migrations).
    pub default: Option<Value>,
    pub index: IndexKind,
}

impl FieldSpec {
    /// Render the canonical type expression back out, minus the prompt.
    pub fn canonical(&self) -> String {
        let core = match &self.field_type {
            FieldType::Primitive(p) => p.as_str().to_string(),
            FieldType::Enum(values) => values.join("|"),
            FieldType::Reference => {
                let op = self.operator.map(|o| o.symbol()).unwrap_or("->");
                let target = match &self.union_types {
                    Some(types) => types.join("|"),
                    None => self.target_type.clone().unwrap_or_default(),
                };
                match &self.backref {
                    Some(backref) => format!("{op}{target}.{backref}"),
                    None => format!("{op}{target}"),
                }
            }
        };
        let core = if self.is_array { format!("[{core}]") } else { core };
        let opt = if self.is_optional { "?" } else { "" };
        let idx = match self.index {
            IndexKind::None => "",
            IndexKind::Indexed => "#",
            IndexKind::Unique => "##",
        };
        format!("{core}{opt}{idx}")
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn schema_err(path: &str, message: impl Into<String>) -> Error {
    Error::InvalidSchema {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Parse a full schema source. Fails with `InvalidSchema` carrying the
/// `Entity.field` path of the first offending expression.
pub fn parse_schema(source: &SchemaSource) -> Result<Schema> {
    let mut schema = Schema::default();
    for (entity_name, fields) in &source.entities {
        validate_type_name(entity_name)
            .map_err(|e| schema_err(entity_name, e.to_string()))?;
        let mut entity = EntitySchema {
            name: entity_name.clone(),
            fields: IndexMap::new(),
        };
        for (field_name, expr) in fields {
            let path = format!("{entity_name}.{field_name}");
            validate_field_name(field_name).map_err(|e| schema_err(&path, e.to_string()))?;
            let spec = parse_field(field_name, expr).map_err(|e| match e {
                // Re-anchor bare parse failures to the full field path.
                Error::InvalidSchema { message, .. } => schema_err(&path, message),
                other => other,
            })?;
            entity.fields.insert(field_name.clone(), spec);
        }
        schema.entities.insert(entity_name.clone(), entity);
    }
    Ok(schema)
}

/// Parse one field's type expression.
pub fn parse_field(name: &str, expr: &str) -> Result<FieldSpec> {
    let mut rest = expr.trim();
    if rest.is_empty() {
        return Err(schema_err(name, "empty type expression"));
    }

    // prompt? — natural-language hint ending in '?', followed by the core.
    let mut prompt = None;
    if let Some(pos) = rest.find('?') {
        let tail = rest[pos + 1..].trim_start();
        if starts_core(tail) {
            prompt = Some(rest[..=pos].trim().to_string());
            rest = tail;
        }
    }

    // index? — outermost suffix.
    let mut index = IndexKind::None;
    if let Some(stripped) = rest.strip_suffix("##") {
        index = IndexKind::Unique;
        rest = stripped.trim_end();
    } else if let Some(stripped) = rest.strip_suffix('#') {
        index = IndexKind::Indexed;
        rest = stripped.trim_end();
    }

    // optional?
    let mut is_optional = false;
    if let Some(stripped) = rest.strip_suffix('?') {
        is_optional = true;
        rest = stripped.trim_end();
    }

    // array
    let mut is_array = false;
    if let Some(inner) = rest.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| schema_err(name, "unterminated array type"))?;
        is_array = true;
        rest = inner.trim();
    }

    let mut spec = parse_core(name, rest)?;
    spec.name = name.to_string();
    spec.is_array = is_array;
    spec.is_optional = is_optional;
    spec.index = index;
    spec.prompt = prompt;
    Ok(spec)
}

/// Whether `s` can start a core expression — used to tell a prompt's `?`
/// apart from the optional marker.
fn starts_core(s: &str) -> bool {
    s.chars().next().is_some_and(|c| {
        c.is_ascii_alphanumeric() || c == '[' || c == '-' || c == '<' || c == '~' || c == '_'
    })
}

fn parse_core(name: &str, core: &str) -> Result<FieldSpec> {
    if core.is_empty() {
        return Err(schema_err(name, "missing core type"));
    }

    let blank = FieldSpec {
        name: String::new(),
        field_type: FieldType::Primitive(Primitive::String),
        operator: None,
        target_type: None,
        backref: None,
        is_array: false,
        is_optional: false,
        match_mode: MatchMode::Exact,
        direction: RefDirection::Forward,
        union_types: None,
        prompt: None,
        default: None,
        index: IndexKind::None,
    };

    // References first: '->', '<-', '~>', '<~'.
    let operator = [
        ("->", RefOperator::Forward),
        ("<-", RefOperator::Backward),
        ("~>", RefOperator::FuzzyForward),
        ("<~", RefOperator::FuzzyBackward),
    ]
    .iter()
    .find_map(|(sym, op)| core.strip_prefix(sym).map(|rest| (*op, rest.trim())));

    if let Some((op, target_expr)) = operator {
        return parse_reference(name, op, target_expr, blank);
    }

    if let Some(primitive) = Primitive::parse(core) {
        return Ok(FieldSpec {
            field_type: FieldType::Primitive(primitive),
            ..blank
        });
    }

    // Pipe-separated literals form an enum.
    if core.contains('|') {
        let values: Vec<String> = core.split('|').map(|v| v.trim().to_string()).collect();
        if values.iter().any(|v| v.is_empty()) {
            return Err(schema_err(name, "empty enum value"));
        }
        return Ok(FieldSpec {
            field_type: FieldType::Enum(values),
            ..blank
        });
    }

    Err(schema_err(name, format!("unknown type '{core}'")))
}

fn parse_reference(
    name: &str,
    operator: RefOperator,
    target_expr: &str,
    blank: FieldSpec,
) -> Result<FieldSpec> {
    if target_expr.is_empty() {
        return Err(schema_err(name, "reference operator without target type"));
    }

    let mut spec = FieldSpec {
        field_type: FieldType::Reference,
        operator: Some(operator),
        match_mode: if operator.is_fuzzy() {
            MatchMode::Fuzzy
        } else {
            MatchMode::Exact
        },
        direction: operator.direction(),
        ..blank
    };

    if target_expr.contains('|') {
        if !operator.is_fuzzy() {
            return Err(schema_err(
                name,
                "union targets require a fuzzy operator (~> or <~)",
            ));
        }
        let types: Vec<String> = target_expr.split('|').map(|t| t.trim().to_string()).collect();
        for t in &types {
            validate_type_name(t).map_err(|e| schema_err(name, e.to_string()))?;
        }
        spec.target_type = types.first().cloned();
        spec.union_types = Some(types);
        return Ok(spec);
    }

    let (target, backref) = match target_expr.split_once('.') {
        Some((target, backref)) => (target.trim(), Some(backref.trim())),
        None => (target_expr, None),
    };
    validate_type_name(target).map_err(|e| schema_err(name, e.to_string()))?;
    if let Some(backref) = backref {
        validate_field_name(backref).map_err(|e| schema_err(name, e.to_string()))?;
        spec.backref = Some(backref.to_string());
    }
    spec.target_type = Some(target.to_string());
    Ok(spec)
}

// ============================================================================
// Tests
// ============================================================================
