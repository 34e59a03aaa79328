//! Class and attribute descriptors.
//!
//! A [`Model`] is the immutable description of every persistent class: its
//! numeric id, superclass, attributes and delete policies. It is produced by
//! [`ModelBuilder`] and shared by the object store and every backend.
//!
//! # Example
//!
//! ```
//! use middlestore_core::model::{AttrDef, DeletePolicy, KlassDef, ModelBuilder};
//!
//! let model = ModelBuilder::new("Shop")
//!     .klass(KlassDef::new("Customer").attr(AttrDef::string("name").required()))
//!     .klass(
//!         KlassDef::new("Order")
//!             .attr(AttrDef::obj_ref("customer", "Customer").on_delete_other(DeletePolicy::Cascade)),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(model.klass("Order").unwrap().id(), 2);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{
    Error, InvalidValueKind, ModelErrorKind, Result, config_error, invalid_value, model_error,
    unknown_attr, unknown_klass,
};
use crate::value::{DATE_FORMAT, DATETIME_FORMAT, TIME_FORMAT, Value};

// ============================================================================
// Delete Policy
// ============================================================================

/// What happens to a reference when one side of it is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Refuse the delete.
    Deny,
    /// Clear the reference.
    Detach,
    /// Delete the other side too.
    Cascade,
}

impl DeletePolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeletePolicy::Deny => "deny",
            DeletePolicy::Detach => "detach",
            DeletePolicy::Cascade => "cascade",
        }
    }
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deny" => Ok(DeletePolicy::Deny),
            "detach" => Ok(DeletePolicy::Detach),
            "cascade" => Ok(DeletePolicy::Cascade),
            other => Err(config_error(format!("unknown delete policy {other:?}"))),
        }
    }
}

// ============================================================================
// Attribute Types
// ============================================================================

/// Type tag of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrType {
    Bool,
    Int,
    Long,
    Float,
    String { max_length: Option<usize> },
    Enum { values: Vec<String> },
    Date,
    Time,
    DateTime,
    Decimal { precision: u8, scale: u8 },
    /// Reference to a single object of `target` (or a subclass).
    ObjRef { target: String },
    /// Objects of `element` whose `back_ref` attribute points at the owner.
    List { element: String, back_ref: String },
}

impl AttrType {
    pub fn name(&self) -> &'static str {
        match self {
            AttrType::Bool => "bool",
            AttrType::Int => "int",
            AttrType::Long => "long",
            AttrType::Float => "float",
            AttrType::String { .. } => "string",
            AttrType::Enum { .. } => "enum",
            AttrType::Date => "date",
            AttrType::Time => "time",
            AttrType::DateTime => "datetime",
            AttrType::Decimal { .. } => "decimal",
            AttrType::ObjRef { .. } => "objref",
            AttrType::List { .. } => "list",
        }
    }
}

// ============================================================================
// Attr
// ============================================================================

/// An attribute of a persistent class.
#[derive(Debug, Clone)]
pub struct Attr {
    name: String,
    attr_type: AttrType,
    klass_name: String,
    index: usize,
    on_delete_self: DeletePolicy,
    on_delete_other: DeletePolicy,
    is_required: bool,
    is_indexed: bool,
    default: Option<Value>,
}

impl Attr {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr_type(&self) -> &AttrType {
        &self.attr_type
    }

    /// Name of the class that declares this attribute.
    pub fn klass_name(&self) -> &str {
        &self.klass_name
    }

    /// Position in the declaring class's `all_attrs`, identical in every subclass.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Policy applied to the referenced object when the owner is deleted.
    pub fn on_delete_self(&self) -> DeletePolicy {
        self.on_delete_self
    }

    /// Policy applied to the owner when the referenced object is deleted.
    pub fn on_delete_other(&self) -> DeletePolicy {
        self.on_delete_other
    }

    pub fn is_required(&self) -> bool {
        self.is_required
    }

    pub fn is_indexed(&self) -> bool {
        self.is_indexed
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_obj_ref(&self) -> bool {
        matches!(self.attr_type, AttrType::ObjRef { .. })
    }

    pub fn is_list(&self) -> bool {
        matches!(self.attr_type, AttrType::List { .. })
    }

    /// Lists have no column; everything else does.
    pub fn has_sql_column(&self) -> bool {
        !self.is_list()
    }

    /// Target class of an objref, element class of a list.
    pub fn target_klass(&self) -> Option<&str> {
        match &self.attr_type {
            AttrType::ObjRef { target } => Some(target),
            AttrType::List { element, .. } => Some(element),
            _ => None,
        }
    }

    /// Back-reference attribute name of a list.
    pub fn back_ref(&self) -> Option<&str> {
        match &self.attr_type {
            AttrType::List { back_ref, .. } => Some(back_ref),
            _ => None,
        }
    }

    /// Convert a scalar into the canonical representation for this attribute.
    ///
    /// Accepts the loose forms drivers hand back (integers for booleans, text
    /// for dates) and rejects values that do not fit.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |v: &Value| {
            invalid_value(
                InvalidValueKind::TypeMismatch,
                &self.klass_name,
                &self.name,
                format!("expected {}, got {}", self.attr_type.name(), v.type_name()),
            )
        };
        match &self.attr_type {
            AttrType::Bool => value.as_bool().map(Value::Bool).ok_or_else(|| mismatch(&value)),
            AttrType::Int => match value {
                Value::Int(_) => Ok(value),
                Value::BigInt(i) => i32::try_from(i).map(Value::Int).map_err(|_| {
                    invalid_value(
                        InvalidValueKind::OutOfRange,
                        &self.klass_name,
                        &self.name,
                        format!("{i} does not fit in int"),
                    )
                }),
                Value::Bool(b) => Ok(Value::Int(i32::from(b))),
                other => Err(mismatch(&other)),
            },
            AttrType::Long => value.as_i64().map(Value::BigInt).ok_or_else(|| mismatch(&value)),
            AttrType::Float => match &value {
                Value::Text(s) => s.parse().map(Value::Double).map_err(|_| mismatch(&value)),
                _ => value.as_f64().map(Value::Double).ok_or_else(|| mismatch(&value)),
            },
            AttrType::String { max_length } => match value {
                Value::Text(s) => {
                    if let Some(max) = max_length {
                        if s.chars().count() > *max {
                            return Err(invalid_value(
                                InvalidValueKind::OutOfRange,
                                &self.klass_name,
                                &self.name,
                                format!("longer than {max} characters"),
                            ));
                        }
                    }
                    Ok(Value::Text(s))
                }
                other => Err(mismatch(&other)),
            },
            AttrType::Enum { values } => match value {
                Value::Text(s) if values.iter().any(|v| *v == s) => Ok(Value::Text(s)),
                Value::Text(s) => Err(invalid_value(
                    InvalidValueKind::NotAllowed,
                    &self.klass_name,
                    &self.name,
                    format!("{s:?} is not one of {}", values.join(", ")),
                )),
                other => Err(mismatch(&other)),
            },
            AttrType::Decimal { .. } => match value {
                Value::Decimal(_) => Ok(value),
                Value::Text(s) if s.trim().parse::<f64>().is_ok() => {
                    Ok(Value::Decimal(s.trim().to_string()))
                }
                Value::Int(i) => Ok(Value::Decimal(i.to_string())),
                Value::BigInt(i) => Ok(Value::Decimal(i.to_string())),
                Value::Double(d) => Ok(Value::Decimal(d.to_string())),
                other => Err(mismatch(&other)),
            },
            AttrType::Date => match value {
                Value::Date(_) => Ok(value),
                Value::Timestamp(ts) => Ok(Value::Date(ts.date())),
                Value::Text(ref s) => NaiveDate::parse_from_str(s, DATE_FORMAT)
                    .map(Value::Date)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            AttrType::Time => match value {
                Value::Time(_) => Ok(value),
                Value::Text(ref s) => NaiveTime::parse_from_str(s, TIME_FORMAT)
                    .map(Value::Time)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            AttrType::DateTime => match value {
                Value::Timestamp(_) => Ok(value),
                Value::Text(ref s) => NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map(Value::Timestamp)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            AttrType::ObjRef { .. } | AttrType::List { .. } => Err(mismatch(&value)),
        }
    }
}

// ============================================================================
// Klass
// ============================================================================

/// A persistent class.
#[derive(Debug)]
pub struct Klass {
    name: String,
    id: u32,
    super_name: Option<String>,
    ancestors: Vec<String>,
    is_abstract: bool,
    own_attrs: Vec<Arc<Attr>>,
    all_attrs: Vec<Arc<Attr>>,
    attr_index: HashMap<String, usize>,
    subklass_names: Vec<String>,
}

impl Klass {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    /// Superclass names, nearest first.
    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Attributes declared by this class only.
    pub fn own_attrs(&self) -> &[Arc<Attr>] {
        &self.own_attrs
    }

    /// Inherited attributes first, then own attributes.
    pub fn all_attrs(&self) -> &[Arc<Attr>] {
        &self.all_attrs
    }

    /// Attributes stored in columns (everything except lists).
    pub fn sql_attrs(&self) -> impl Iterator<Item = &Arc<Attr>> {
        self.all_attrs.iter().filter(|a| a.has_sql_column())
    }

    pub fn lookup_attr(&self, name: &str) -> Option<&Arc<Attr>> {
        self.attr_index.get(name).map(|&i| &self.all_attrs[i])
    }

    pub fn attr(&self, name: &str) -> Result<&Arc<Attr>> {
        self.lookup_attr(name)
            .ok_or_else(|| unknown_attr(&self.name, name))
    }

    /// Names of direct subclasses.
    pub fn subklass_names(&self) -> &[String] {
        &self.subklass_names
    }

    /// True if this class is `name` or inherits from it.
    pub fn is_kind_of(&self, name: &str) -> bool {
        self.name == name || self.ancestors.iter().any(|a| a == name)
    }

    /// Table name for this class.
    pub fn sql_table_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
// Model
// ============================================================================

/// The full set of persistent classes.
#[derive(Debug)]
pub struct Model {
    name: String,
    klasses: Vec<Arc<Klass>>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classes in declaration order.
    pub fn klasses(&self) -> &[Arc<Klass>] {
        &self.klasses
    }

    pub fn lookup_klass(&self, name: &str) -> Option<&Arc<Klass>> {
        self.by_name.get(name).map(|&i| &self.klasses[i])
    }

    pub fn klass(&self, name: &str) -> Result<&Arc<Klass>> {
        self.lookup_klass(name).ok_or_else(|| unknown_klass(name))
    }

    pub fn klass_for_id(&self, id: u32) -> Option<&Arc<Klass>> {
        self.by_id.get(&id).map(|&i| &self.klasses[i])
    }

    /// Direct subclasses of `klass`.
    pub fn subklasses(&self, klass: &Klass) -> Vec<&Arc<Klass>> {
        klass
            .subklass_names
            .iter()
            .filter_map(|n| self.lookup_klass(n))
            .collect()
    }

    /// `klass` followed by every class that inherits from it.
    pub fn klass_and_descendants(&self, klass: &Arc<Klass>) -> Vec<Arc<Klass>> {
        let mut out = vec![Arc::clone(klass)];
        let mut i = 0;
        while i < out.len() {
            let next: Vec<Arc<Klass>> = self
                .subklasses(&out[i])
                .into_iter()
                .map(Arc::clone)
                .collect();
            out.extend(next);
            i += 1;
        }
        out
    }

    /// Every objref attribute that can point at an instance of `klass`,
    /// paired with the class that declares it.
    pub fn referencing_attrs(&self, klass: &Klass) -> Vec<(Arc<Klass>, Arc<Attr>)> {
        let mut out = Vec::new();
        for source in &self.klasses {
            for attr in &source.own_attrs {
                if let AttrType::ObjRef { target } = &attr.attr_type {
                    if klass.is_kind_of(target) {
                        out.push((Arc::clone(source), Arc::clone(attr)));
                    }
                }
            }
        }
        out
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Definition of one attribute, consumed by [`ModelBuilder`].
#[derive(Debug, Clone)]
pub struct AttrDef {
    name: String,
    attr_type: AttrType,
    on_delete_self: DeletePolicy,
    on_delete_other: DeletePolicy,
    is_required: bool,
    is_indexed: bool,
    default: Option<Value>,
}

impl AttrDef {
    pub fn new(name: impl Into<String>, attr_type: AttrType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            on_delete_self: DeletePolicy::Detach,
            on_delete_other: DeletePolicy::Deny,
            is_required: false,
            is_indexed: false,
            default: None,
        }
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::Bool)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::Int)
    }

    pub fn long(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::Long)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::Float)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::String { max_length: None })
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::Date)
    }

    pub fn time(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::Time)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, AttrType::DateTime)
    }

    pub fn decimal(name: impl Into<String>, precision: u8, scale: u8) -> Self {
        Self::new(name, AttrType::Decimal { precision, scale })
    }

    pub fn enumeration<S: Into<String>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            AttrType::Enum {
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn obj_ref(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            AttrType::ObjRef {
                target: target.into(),
            },
        )
    }

    pub fn list(
        name: impl Into<String>,
        element: impl Into<String>,
        back_ref: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            AttrType::List {
                element: element.into(),
                back_ref: back_ref.into(),
            },
        )
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    #[must_use]
    pub fn on_delete_self(mut self, policy: DeletePolicy) -> Self {
        self.on_delete_self = policy;
        self
    }

    #[must_use]
    pub fn on_delete_other(mut self, policy: DeletePolicy) -> Self {
        self.on_delete_other = policy;
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Limit a string attribute's length.
    #[must_use]
    pub fn max_length(mut self, max: usize) -> Self {
        if let AttrType::String { max_length } = &mut self.attr_type {
            *max_length = Some(max);
        }
        self
    }
}

/// Definition of one class, consumed by [`ModelBuilder`].
#[derive(Debug, Clone)]
pub struct KlassDef {
    name: String,
    super_name: Option<String>,
    is_abstract: bool,
    attrs: Vec<AttrDef>,
}

impl KlassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_name: None,
            is_abstract: false,
            attrs: Vec::new(),
        }
    }

    #[must_use]
    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    #[must_use]
    pub fn abstract_klass(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    #[must_use]
    pub fn attr(mut self, attr: AttrDef) -> Self {
        self.attrs.push(attr);
        self
    }
}

/// Builds a [`Model`], validating names and cross-references.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    klasses: Vec<KlassDef>,
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z_0-9]*$").expect("valid regex"))
}

fn reserved_attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(allattrs|changed|clone|debugstr|dumpattrs|key|klass|serialnum|store|valueforattr|valueforkey)$",
        )
        .expect("valid regex")
    })
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(model_error(
            ModelErrorKind::InvalidName,
            format!("invalid {what} name {name:?}"),
        ))
    }
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            klasses: Vec::new(),
        }
    }

    #[must_use]
    pub fn klass(mut self, klass: KlassDef) -> Self {
        self.klasses.push(klass);
        self
    }

    /// Validate and freeze the model. Class ids are assigned 1..=n in
    /// declaration order.
    #[tracing::instrument(level = "debug", skip(self), fields(model = %self.name))]
    pub fn build(self) -> Result<Arc<Model>> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (i, def) in self.klasses.iter().enumerate() {
            check_name("class", &def.name)?;
            if positions.insert(def.name.as_str(), i).is_some() {
                return Err(model_error(
                    ModelErrorKind::Duplicate,
                    format!("class {} defined twice", def.name),
                ));
            }
            for attr in &def.attrs {
                check_name("attribute", &attr.name)?;
                if reserved_attr_regex().is_match(&attr.name) {
                    return Err(model_error(
                        ModelErrorKind::InvalidName,
                        format!("{}.{} uses a reserved name", def.name, attr.name),
                    ));
                }
            }
        }

        // Ancestor chains, nearest first.
        let mut ancestors: Vec<Vec<String>> = Vec::with_capacity(self.klasses.len());
        for def in &self.klasses {
            let mut chain = Vec::new();
            let mut seen = HashSet::from([def.name.as_str()]);
            let mut current = def.super_name.as_deref();
            while let Some(parent) = current {
                let &pos = positions.get(parent).ok_or_else(|| {
                    model_error(
                        ModelErrorKind::UnknownKlass,
                        format!("{} extends unknown class {parent}", def.name),
                    )
                })?;
                if !seen.insert(parent) {
                    return Err(model_error(
                        ModelErrorKind::Inconsistent,
                        format!("inheritance cycle through {parent}"),
                    ));
                }
                chain.push(parent.to_string());
                current = self.klasses[pos].super_name.as_deref();
            }
            ancestors.push(chain);
        }

        // Attribute lists: root ancestor first so inherited indexes are stable.
        let mut all_attrs: Vec<Option<Vec<Arc<Attr>>>> = vec![None; self.klasses.len()];
        let mut own_attrs: Vec<Vec<Arc<Attr>>> = vec![Vec::new(); self.klasses.len()];
        for i in 0..self.klasses.len() {
            let mut order: Vec<usize> = ancestors[i]
                .iter()
                .rev()
                .map(|n| positions[n.as_str()])
                .collect();
            order.push(i);
            for pos in order {
                if all_attrs[pos].is_some() {
                    continue;
                }
                let def = &self.klasses[pos];
                let mut attrs = match def.super_name.as_deref() {
                    Some(parent) => all_attrs[positions[parent]].clone().unwrap_or_default(),
                    None => Vec::new(),
                };
                let mut own = Vec::with_capacity(def.attrs.len());
                for attr_def in &def.attrs {
                    if attrs.iter().any(|a| a.name == attr_def.name) {
                        return Err(model_error(
                            ModelErrorKind::Duplicate,
                            format!("{}.{} defined twice", def.name, attr_def.name),
                        ));
                    }
                    let attr = Arc::new(Attr {
                        name: attr_def.name.clone(),
                        attr_type: attr_def.attr_type.clone(),
                        klass_name: def.name.clone(),
                        index: attrs.len(),
                        on_delete_self: attr_def.on_delete_self,
                        on_delete_other: attr_def.on_delete_other,
                        is_required: attr_def.is_required,
                        is_indexed: attr_def.is_indexed,
                        default: attr_def.default.clone(),
                    });
                    own.push(Arc::clone(&attr));
                    attrs.push(attr);
                }
                own_attrs[pos] = own;
                all_attrs[pos] = Some(attrs);
            }
        }

        let mut klasses = Vec::with_capacity(self.klasses.len());
        for (i, def) in self.klasses.iter().enumerate() {
            let attrs = all_attrs[i].take().unwrap_or_default();
            let attr_index = attrs
                .iter()
                .enumerate()
                .map(|(j, a)| (a.name.clone(), j))
                .collect();
            let subklass_names = self
                .klasses
                .iter()
                .filter(|k| k.super_name.as_deref() == Some(def.name.as_str()))
                .map(|k| k.name.clone())
                .collect();
            let id = u32::try_from(i + 1)
                .map_err(|_| model_error(ModelErrorKind::Inconsistent, "too many classes"))?;
            klasses.push(Arc::new(Klass {
                name: def.name.clone(),
                id,
                super_name: def.super_name.clone(),
                ancestors: ancestors[i].clone(),
                is_abstract: def.is_abstract,
                own_attrs: std::mem::take(&mut own_attrs[i]),
                all_attrs: attrs,
                attr_index,
                subklass_names,
            }));
        }

        let model = Model {
            name: self.name,
            by_name: klasses
                .iter()
                .enumerate()
                .map(|(i, k)| (k.name.clone(), i))
                .collect(),
            by_id: klasses.iter().enumerate().map(|(i, k)| (k.id, i)).collect(),
            klasses,
        };
        validate_references(&model)?;

        tracing::debug!(klasses = model.klasses.len(), "Model built");
        Ok(Arc::new(model))
    }
}

fn validate_references(model: &Model) -> Result<()> {
    for klass in &model.klasses {
        for attr in &klass.own_attrs {
            match &attr.attr_type {
                AttrType::ObjRef { target } => {
                    model.lookup_klass(target).ok_or_else(|| {
                        model_error(
                            ModelErrorKind::UnknownKlass,
                            format!("{}.{} refers to unknown class {target}", klass.name, attr.name),
                        )
                    })?;
                }
                AttrType::List { element, back_ref } => {
                    let element_klass = model.lookup_klass(element).ok_or_else(|| {
                        model_error(
                            ModelErrorKind::UnknownKlass,
                            format!("{}.{} lists unknown class {element}", klass.name, attr.name),
                        )
                    })?;
                    let back = element_klass.lookup_attr(back_ref).ok_or_else(|| {
                        model_error(
                            ModelErrorKind::Inconsistent,
                            format!(
                                "{}.{}: {element} has no back reference {back_ref}",
                                klass.name, attr.name
                            ),
                        )
                    })?;
                    let points_back = match &back.attr_type {
                        AttrType::ObjRef { target } => klass.is_kind_of(target),
                        _ => false,
                    };
                    if !points_back {
                        return Err(model_error(
                            ModelErrorKind::Inconsistent,
                            format!(
                                "{}.{}: {element}.{back_ref} must refer to {}",
                                klass.name, attr.name, klass.name
                            ),
                        ));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> Arc<Model> {
        ModelBuilder::new("Shop")
            .klass(
                KlassDef::new("Party")
                    .abstract_klass()
                    .attr(AttrDef::string("name").required()),
            )
            .klass(
                KlassDef::new("Customer")
                    .extends("Party")
                    .attr(AttrDef::list("orders", "Order", "customer")),
            )
            .klass(
                KlassDef::new("Order")
                    .attr(AttrDef::obj_ref("customer", "Customer"))
                    .attr(AttrDef::decimal("total", 10, 2)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_ids_follow_declaration_order() {
        let model = shop();
        let ids: Vec<u32> = model.klasses().iter().map(|k| k.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(model.klass_for_id(3).unwrap().name(), "Order");
        assert!(model.klass_for_id(9).is_none());
    }

    #[test]
    fn test_inherited_attrs_come_first() {
        let model = shop();
        let customer = model.klass("Customer").unwrap();
        let names: Vec<&str> = customer.all_attrs().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["name", "orders"]);
        assert_eq!(customer.attr("name").unwrap().klass_name(), "Party");
        assert_eq!(customer.attr("name").unwrap().index(), 0);
        assert_eq!(customer.own_attrs().len(), 1);
        assert!(customer.is_kind_of("Party"));
        assert_eq!(customer.sql_attrs().count(), 1);
    }

    #[test]
    fn test_subklasses_and_descendants() {
        let model = shop();
        let party = model.klass("Party").unwrap();
        let subs: Vec<&str> = model.subklasses(party).iter().map(|k| k.name()).collect();
        assert_eq!(subs, vec!["Customer"]);
        assert_eq!(model.klass_and_descendants(party).len(), 2);
    }

    #[test]
    fn test_referencing_attrs() {
        let model = shop();
        let customer = model.klass("Customer").unwrap();
        let refs = model.referencing_attrs(customer);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0.name(), "Order");
        assert_eq!(refs[0].1.name(), "customer");
    }

    #[test]
    fn test_default_policies() {
        let attr = AttrDef::obj_ref("owner", "Party");
        assert_eq!(attr.on_delete_self, DeletePolicy::Detach);
        assert_eq!(attr.on_delete_other, DeletePolicy::Deny);
    }

    #[test]
    fn test_rejects_reserved_and_invalid_names() {
        let err = ModelBuilder::new("M")
            .klass(KlassDef::new("A").attr(AttrDef::int("serialNum")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Model(ref e) if e.kind == ModelErrorKind::InvalidName));

        let err = ModelBuilder::new("M")
            .klass(KlassDef::new("9Lives"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Model(ref e) if e.kind == ModelErrorKind::InvalidName));
    }

    #[test]
    fn test_rejects_unknown_targets() {
        let err = ModelBuilder::new("M")
            .klass(KlassDef::new("A").attr(AttrDef::obj_ref("b", "B")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Model(ref e) if e.kind == ModelErrorKind::UnknownKlass));

        let err = ModelBuilder::new("M")
            .klass(KlassDef::new("A").attr(AttrDef::list("bs", "B", "a")))
            .klass(KlassDef::new("B").attr(AttrDef::int("a")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Model(ref e) if e.kind == ModelErrorKind::Inconsistent));
    }

    #[test]
    fn test_rejects_inheritance_cycle() {
        let err = ModelBuilder::new("M")
            .klass(KlassDef::new("A").extends("B"))
            .klass(KlassDef::new("B").extends("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Model(ref e) if e.kind == ModelErrorKind::Inconsistent));
    }

    #[test]
    fn test_coerce_driver_values() {
        let model = ModelBuilder::new("M")
            .klass(
                KlassDef::new("T")
                    .attr(AttrDef::bool("flag"))
                    .attr(AttrDef::int("n"))
                    .attr(AttrDef::date("day"))
                    .attr(AttrDef::enumeration("color", ["red", "blue"]))
                    .attr(AttrDef::string("code").max_length(3)),
            )
            .build()
            .unwrap();
        let t = model.klass("T").unwrap();
        assert_eq!(
            t.attr("flag").unwrap().coerce(Value::BigInt(1)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            t.attr("n").unwrap().coerce(Value::BigInt(42)).unwrap(),
            Value::Int(42)
        );
        assert!(t.attr("n").unwrap().coerce(Value::BigInt(i64::MAX)).is_err());
        assert_eq!(
            t.attr("day").unwrap().coerce(Value::from("2020-01-31")).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2020, 1, 31).unwrap())
        );
        assert!(t.attr("color").unwrap().coerce(Value::from("green")).is_err());
        assert!(t.attr("code").unwrap().coerce(Value::from("ABCD")).is_err());
        assert_eq!(t.attr("code").unwrap().coerce(Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Cascade".parse::<DeletePolicy>().unwrap(), DeletePolicy::Cascade);
        assert!("explode".parse::<DeletePolicy>().is_err());
    }
}
