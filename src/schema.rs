//! Structured-output validation.
//!
//! Model output is searched for an embedded JSON object, which is then checked
//! against the domain schema registered for the example's declared function
//! name, or against a generic status/message schema when no function name is
//! declared.
//!
//! ## Example
//!
//! ```rust
//! use model_bench::schema::SchemaRegistry;
//!
//! let registry = SchemaRegistry::builtin();
//! let result = registry.validate(r#"Yanıt: {"status": "success", "message": "ok"}"#, None);
//! assert!(result.valid);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

/// Error text recorded when no JSON object can be recovered from the output
pub const NO_JSON_ERROR: &str = "no parseable JSON object found in output";

/// Errors that can occur while loading domain schemas
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse schema file: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Schema for '{0}' declares no fields")]
    NoFields(String),
}

/// JSON type expected for a field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "list")]
    Array,
    #[serde(alias = "dict")]
    Object,
    Any,
}

impl FieldType {
    /// Whether `value` has this type; integers also satisfy `Number`
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    /// Lowercase label used in error messages
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const fn default_required() -> bool {
    true
}

/// One field of a domain schema
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    /// Expected JSON type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Required fields must be present and non-null
    #[serde(default = "default_required")]
    pub required: bool,
}

impl FieldSpec {
    /// Required field of the given type
    #[must_use]
    pub const fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
        }
    }

    /// Optional field of the given type
    #[must_use]
    pub const fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
        }
    }
}

/// Expected structure of one function's response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSchema {
    /// Function/tool name
    pub name: String,
    /// Field name to spec, sorted for stable error order
    pub fields: BTreeMap<String, FieldSpec>,
}

impl DomainSchema {
    /// Check an object, returning one message per missing or mistyped field.
    ///
    /// Fields not named by the schema are ignored.
    #[must_use]
    pub fn check(&self, object: &serde_json::Map<String, Value>) -> Vec<String> {
        self.fields
            .iter()
            .filter_map(|(field, spec)| match object.get(field) {
                None | Some(Value::Null) if spec.required => {
                    Some(format!("missing required field '{field}'"))
                }
                None | Some(Value::Null) => None,
                Some(value) if spec.field_type.matches(value) => None,
                Some(value) => Some(format!(
                    "field '{field}' expected {}, found {}",
                    spec.field_type.label(),
                    json_type_name(value)
                )),
            })
            .collect()
    }
}

/// Fallback structure for outputs without a declared function
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenericResponse {
    pub status: String,
    pub message: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub priority_level: Option<i64>,
}

/// Result of validating one output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaValidation {
    /// Whether the output conforms
    pub valid: bool,
    /// Diagnostics; empty when valid
    pub errors: Vec<String>,
    /// Schema-coerced object on success
    pub normalized: Option<Value>,
}

impl SchemaValidation {
    fn pass(normalized: Value) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            normalized: Some(normalized),
        }
    }

    fn fail(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            normalized: None,
        }
    }
}

/// Recover the first JSON object embedded in `text`.
///
/// The whole text is tried first. Otherwise each `{` starts a candidate that
/// ends where its braces balance (braces inside string literals are
/// skipped); candidates are tried in order of first occurrence and the
/// first one that parses to an object wins.
#[must_use]
pub fn extract_json(text: &str) -> Option<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(value);
    }

    text.char_indices()
        .filter(|&(_, c)| c == '{')
        .find_map(|(start, _)| {
            let end = balanced_end(&text[start..])?;
            match serde_json::from_str::<Value>(&text[start..start + end]) {
                Ok(value @ Value::Object(_)) => Some(value),
                _ => None,
            }
        })
}

/// Every non-overlapping JSON object embedded in `text`, in order.
///
/// Uses the same brace scan as [`extract_json`]; once a candidate parses,
/// scanning resumes after it, so nested objects are not reported twice.
#[must_use]
pub fn json_objects(text: &str) -> Vec<serde_json::Map<String, Value>> {
    let mut objects = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        let parsed = balanced_end(&text[start..]).and_then(|end| {
            match serde_json::from_str::<Value>(&text[start..start + end]) {
                Ok(Value::Object(object)) => Some((object, end)),
                _ => None,
            }
        });
        match parsed {
            Some((object, end)) => {
                objects.push(object);
                cursor = start + end;
            }
            None => cursor = start + 1,
        }
    }
    objects
}

/// Byte length of the brace-balanced prefix of `s`, which starts with `{`
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Registry of domain schemas keyed by function name
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, DomainSchema>,
}

use FieldType::{Array, Bool, Integer, Number, Object, String as Str};

/// Response structures of the telecom self-service functions
const BUILTIN: &[(&str, &[(&str, FieldType)])] = &[
    (
        "get_customer_package",
        &[
            ("musteri_bilgileri", Object),
            ("aktif_paket", Object),
            ("kullanim_durumu", Object),
            ("fatura_durumu", Object),
        ],
    ),
    (
        "change_package",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("eski_paket", Str),
            ("yeni_paket", Str),
            ("yeni_aylik_ucret", Number),
            ("islem_id", Str),
        ],
    ),
    (
        "get_remaining_quotas",
        &[
            ("musteri_id", Str),
            ("paket_adi", Str),
            ("kotalar", Object),
            ("son_guncelleme", Str),
        ],
    ),
    (
        "enable_roaming",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("musteri_id", Str),
            ("ulke_kodu", Str),
            ("islem_id", Str),
        ],
    ),
    (
        "get_current_bill",
        &[
            ("fatura_bilgileri", Object),
            ("musteri_bilgileri", Object),
            ("fatura_kalemleri", Array),
            ("ozet", Object),
        ],
    ),
    (
        "get_past_bills",
        &[
            ("musteri_id", Str),
            ("toplam_fatura_sayisi", Integer),
            ("toplam_tutar", Number),
            ("faturalar", Array),
        ],
    ),
    (
        "pay_bill",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("fatura_id", Str),
            ("odenen_tutar", Number),
            ("islem_id", Str),
        ],
    ),
    (
        "setup_autopay",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("musteri_id", Str),
            ("aktif", Bool),
            ("islem_id", Str),
        ],
    ),
    (
        "check_network_status",
        &[
            ("musteri_id", Str),
            ("telefon", Str),
            ("ag_durumu", Str),
            ("sinyal_gucu", Integer),
            ("ag_tipi", Str),
            ("baz_istasyonu", Str),
            ("son_guncelleme", Str),
            ("uyarilar", Array),
        ],
    ),
    (
        "create_fault_ticket",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("talep_id", Str),
            ("tahmini_cozum_suresi", Str),
            ("oncelik", Str),
        ],
    ),
    (
        "get_fault_ticket_status",
        &[
            ("talep_id", Str),
            ("durum", Str),
            ("oncelik", Str),
            ("tahmini_cozum_suresi", Str),
            ("son_guncelleme", Str),
        ],
    ),
    (
        "test_internet_speed",
        &[
            ("musteri_id", Str),
            ("telefon", Str),
            ("paket", Str),
            ("hedef_hiz", Object),
            ("test_sonuclari", Object),
            ("test_tarihi", Str),
            ("degerlendirme", Str),
        ],
    ),
    (
        "update_customer_contact",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("musteri_id", Str),
            ("guncellenen_alanlar", Array),
            ("islem_id", Str),
        ],
    ),
    (
        "suspend_line",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("musteri_id", Str),
            ("hat_durumu", Str),
            ("islem_id", Str),
        ],
    ),
    (
        "reactivate_line",
        &[
            ("durum", Str),
            ("mesaj", Str),
            ("musteri_id", Str),
            ("hat_durumu", Str),
        ],
    ),
];

/// On-disk shape of one schema entry
#[derive(Debug, Deserialize)]
struct SchemaFileEntry {
    fields: BTreeMap<String, FieldSpec>,
}

impl SchemaRegistry {
    /// Registry without domain schemas; every declared function is unknown
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in telecom schemas
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (name, fields) in BUILTIN {
            registry.register(DomainSchema {
                name: (*name).to_string(),
                fields: fields
                    .iter()
                    .map(|(field, ty)| ((*field).to_string(), FieldSpec::required(*ty)))
                    .collect(),
            });
        }
        registry
    }

    /// Add or replace a schema
    pub fn register(&mut self, schema: DomainSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Merge schemas from YAML text (`function_name: {fields: {...}}`).
    ///
    /// Returns the number of schemas added or replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or a schema has no fields.
    pub fn extend_from_yaml_str(&mut self, yaml: &str) -> Result<usize, SchemaError> {
        let entries: BTreeMap<String, SchemaFileEntry> = serde_yaml::from_str(yaml)?;
        if let Some((name, _)) = entries.iter().find(|(_, e)| e.fields.is_empty()) {
            return Err(SchemaError::NoFields(name.clone()));
        }

        let count = entries.len();
        for (name, entry) in entries {
            self.register(DomainSchema {
                name,
                fields: entry.fields,
            });
        }
        Ok(count)
    }

    /// Merge schemas from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn extend_from_yaml<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, SchemaError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let count = self.extend_from_yaml_str(&content)?;
        tracing::info!(path = %path.as_ref().display(), count, "loaded domain schemas");
        Ok(count)
    }

    /// Schema registered for `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DomainSchema> {
        self.schemas.get(name)
    }

    /// Number of registered schemas
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether no schema is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Registered function names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate raw model output
    #[must_use]
    pub fn validate(&self, output: &str, function_name: Option<&str>) -> SchemaValidation {
        match extract_json(output) {
            Some(value) => self.validate_value(value, function_name),
            None => SchemaValidation::fail(vec![NO_JSON_ERROR.to_string()]),
        }
    }

    /// Validate an already structured value.
    ///
    /// A declared function name must have a registered schema; there is no
    /// fallback to the generic schema in that case.
    #[must_use]
    pub fn validate_value(&self, value: Value, function_name: Option<&str>) -> SchemaValidation {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return SchemaValidation::fail(vec![format!(
                    "expected a JSON object, found {}",
                    json_type_name(&other)
                )])
            }
        };

        match function_name.filter(|name| !name.is_empty()) {
            Some(name) => match self.get(name) {
                Some(schema) => {
                    let errors = schema.check(&object);
                    if errors.is_empty() {
                        SchemaValidation::pass(Value::Object(object))
                    } else {
                        SchemaValidation::fail(
                            errors
                                .into_iter()
                                .map(|e| format!("{name}: {e}"))
                                .collect(),
                        )
                    }
                }
                None => SchemaValidation::fail(vec![format!(
                    "no schema registered for function '{name}'"
                )]),
            },
            None => validate_generic(object),
        }
    }
}

fn generic_schema() -> DomainSchema {
    DomainSchema {
        name: "generic".to_string(),
        fields: [
            ("status", FieldSpec::required(Str)),
            ("message", FieldSpec::required(Str)),
            ("recommendations", FieldSpec::optional(Array)),
            ("priority_level", FieldSpec::optional(Integer)),
        ]
        .into_iter()
        .map(|(name, spec)| (name.to_string(), spec))
        .collect(),
    }
}

fn validate_generic(object: serde_json::Map<String, Value>) -> SchemaValidation {
    let errors = generic_schema().check(&object);
    if !errors.is_empty() {
        return SchemaValidation::fail(errors);
    }

    let normalized = serde_json::from_value::<GenericResponse>(Value::Object(object))
        .and_then(serde_json::to_value);
    match normalized {
        Ok(value) => SchemaValidation::pass(value),
        Err(e) => SchemaValidation::fail(vec![format!("generic schema: {e}")]),
    }
}
