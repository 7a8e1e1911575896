//! The validation engine: a schema tree mirroring the data tree's shape,
//! gating every write by typed-path matching and access level.

mod defs;
mod expand;
mod types;

pub use defs::DEFAULT_SCHEMA;
pub use expand::expand_stubs;
pub(crate) use types::parse_cidr;
pub use types::{ValType, RINGS};

use thiserror::Error;

use crate::{
    access::AccessLevel,
    path::{PathError, PropPath},
    tree::MAIN_ROOT,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("no schema for property: {0}")]
    NoSchema(String),

    #[error("property is not settable: {0}")]
    NotSettable(String),

    #[error("access denied: {path} requires {need}, caller is {have}")]
    LevelDenied {
        path: String,
        need: AccessLevel,
        have: AccessLevel,
    },

    #[error("bad value for {path}: {reason}")]
    BadValue { path: String, reason: String },

    #[error("schema definition error: {0}")]
    Definition(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, PartialEq)]
enum KeyType {
    Const,
    Typed(ValType),
}

#[derive(Debug)]
struct SchemaNode {
    key_text: String,
    key_type: KeyType,
    level: AccessLevel,
    val_type: Option<ValType>,
    children: Vec<SchemaNode>,
}

impl SchemaNode {
    fn new(key_text: String, key_type: KeyType) -> SchemaNode {
        SchemaNode {
            key_text,
            key_type,
            level: AccessLevel::User,
            val_type: None,
            children: Vec::new(),
        }
    }

    /// First-match resolution: `const` children take precedence over typed
    /// ones; among typed children the first whose validator accepts the
    /// segment wins.
    fn match_child(&self, segment: &str) -> Option<&SchemaNode> {
        self.children
            .iter()
            .find(|c| c.key_type == KeyType::Const && c.key_text == segment)
            .or_else(|| {
                self.children.iter().find(|c| match &c.key_type {
                    KeyType::Typed(t) => t.validate(segment).is_ok(),
                    KeyType::Const => false,
                })
            })
    }
}

/// The loaded schema for one tree.
#[derive(Debug)]
pub struct Schema {
    root: SchemaNode,
}

fn parse_key(segment: &str) -> Result<KeyType, SchemaError> {
    match segment
        .strip_prefix('%')
        .and_then(|rest| rest.strip_suffix('%'))
    {
        Some(inner) => {
            let val_type: ValType = inner
                .parse()
                .map_err(|e| SchemaError::Definition(format!("bad key type: {e}")))?;
            Ok(KeyType::Typed(val_type))
        }
        None => Ok(KeyType::Const),
    }
}

/// Two key types conflict when either accepts a canonical value of the
/// other. Probing with samples keeps the check honest as validators evolve.
fn types_overlap(a: &ValType, b: &ValType) -> bool {
    if a == b {
        return true;
    }
    a.samples().iter().any(|s| b.validate(s).is_ok())
        || b.samples().iter().any(|s| a.validate(s).is_ok())
}

impl Schema {
    /// Loads a schema from its text form. See [`DEFAULT_SCHEMA`] for the
    /// format. Sibling key types with overlapping accept-sets are a
    /// definition error.
    pub fn load(text: &str) -> Result<Schema, SchemaError> {
        let mut root = SchemaNode::new(MAIN_ROOT.to_owned(), KeyType::Const);

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let [path, val_type, level] = fields[..] else {
                return Err(SchemaError::Definition(format!(
                    "line {}: expected 'path type level'",
                    lineno + 1
                )));
            };

            let val_type: ValType = val_type
                .parse()
                .map_err(|e| SchemaError::Definition(format!("line {}: {e}", lineno + 1)))?;
            let level: AccessLevel = level
                .parse()
                .map_err(|e| SchemaError::Definition(format!("line {}: {e}", lineno + 1)))?;

            for expanded in expand_stubs(path) {
                let parsed = PropPath::parse(MAIN_ROOT, &expanded)?;
                Self::insert(&mut root, parsed.segments(), &val_type, level)?;
            }
        }

        Ok(Schema { root })
    }

    pub fn load_default() -> Result<Schema, SchemaError> {
        Schema::load(DEFAULT_SCHEMA)
    }

    fn insert(
        node: &mut SchemaNode,
        segments: &[String],
        val_type: &ValType,
        level: AccessLevel,
    ) -> Result<(), SchemaError> {
        let Some(segment) = segments.first() else {
            node.val_type = Some(val_type.clone());
            node.level = level;
            return Ok(());
        };

        if let Some(idx) = node.children.iter().position(|c| c.key_text == *segment) {
            return Self::insert(&mut node.children[idx], &segments[1..], val_type, level);
        }

        let key_type = parse_key(segment)?;
        if let KeyType::Typed(new_type) = &key_type {
            for sibling in &node.children {
                if let KeyType::Typed(sib_type) = &sibling.key_type {
                    if types_overlap(new_type, sib_type) {
                        return Err(SchemaError::Definition(format!(
                            "overlapping sibling key types '{new_type}' and '{sib_type}' under '{}'",
                            node.key_text
                        )));
                    }
                }
            }
        }

        node.children
            .push(SchemaNode::new(segment.clone(), key_type));
        let idx = node.children.len() - 1;
        Self::insert(&mut node.children[idx], &segments[1..], val_type, level)
    }

    fn resolve(&self, path: &PropPath) -> Option<&SchemaNode> {
        let mut node = &self.root;
        for segment in path.segments() {
            node = node.match_child(segment)?;
        }
        Some(node)
    }

    /// GET gate: the path must be syntactically reachable in the schema.
    pub fn validate_prop(&self, path: &PropPath) -> Result<(), SchemaError> {
        self.resolve(path)
            .map(|_| ())
            .ok_or_else(|| SchemaError::NoSchema(path.to_string_under(MAIN_ROOT)))
    }

    /// Write gate: the path must resolve to a typed leaf, the caller's
    /// level must be sufficient, and the value must validate.
    pub fn validate_prop_val(
        &self,
        path: &PropPath,
        value: &str,
        level: AccessLevel,
    ) -> Result<(), SchemaError> {
        let display = path.to_string_under(MAIN_ROOT);
        let node = self
            .resolve(path)
            .ok_or_else(|| SchemaError::NoSchema(display.clone()))?;
        let val_type = node
            .val_type
            .as_ref()
            .ok_or_else(|| SchemaError::NotSettable(display.clone()))?;

        if level < node.level {
            return Err(SchemaError::LevelDenied {
                path: display,
                need: node.level,
                have: level,
            });
        }

        val_type
            .validate(value)
            .map_err(|reason| SchemaError::BadValue {
                path: display,
                reason,
            })
    }

    /// Delete gate: every settable path under the target must be writable
    /// at the caller's level.
    pub fn validate_prop_del(
        &self,
        path: &PropPath,
        level: AccessLevel,
    ) -> Result<(), SchemaError> {
        let display = path.to_string_under(MAIN_ROOT);
        let node = self
            .resolve(path)
            .ok_or_else(|| SchemaError::NoSchema(display.clone()))?;
        Self::sweep_levels(node, &display, level)
    }

    fn sweep_levels(
        node: &SchemaNode,
        display: &str,
        level: AccessLevel,
    ) -> Result<(), SchemaError> {
        if node.val_type.is_some() && node.level > level {
            return Err(SchemaError::LevelDenied {
                path: display.to_owned(),
                need: node.level,
                have: level,
            });
        }
        for child in &node.children {
            Self::sweep_levels(child, display, level)?;
        }
        Ok(())
    }
}
