// nc_doc_loader/src/mapping/mod.rs
// Declarative field-to-document-path mapping.

use std::fmt;

use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{IngestorError, Result};
use crate::row::{Row, RowValue};

pub mod document;
pub mod query;
pub mod shape;

pub use document::build_document;
pub use query::{build_modifier_update, build_query};
pub use shape::{TopLevelShape, has_top_level_document_insert, resolve};

/// One step of a target path inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash,)]
pub enum PathSegment {
    Key(String,),
    Index(usize,),
}

/// Partial-update operator applied to a field in modifier-update mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,)]
pub enum ModifierOp {
    #[default]
    #[serde(rename = "$set")]
    Set,
    #[serde(rename = "$inc")]
    Inc,
    #[serde(rename = "$push")]
    Push,
}

impl ModifierOp {
    pub fn operator(&self,) -> &'static str {
        match self {
            ModifierOp::Set => "$set",
            ModifierOp::Inc => "$inc",
            ModifierOp::Push => "$push",
        }
    }
}

/// Largest array index a configured path may name. Arrays are padded with
/// nulls up to the index, so a larger one is treated as a configuration typo.
pub const MAX_ARRAY_INDEX: usize = 10_000;

fn default_true() -> bool {
    true
}

/// Field mapping as written in the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize,)]
pub struct FieldMapping {
    pub incoming_field:       String,
    /// Dotted path with optional `[n]` array indexes, e.g. `customer.phones[0]`.
    #[serde(default)]
    pub path:                 String,
    /// Append the incoming field name as the last path element.
    #[serde(default = "default_true")]
    pub use_field_name:       bool,
    #[serde(default)]
    pub match_key:            bool,
    #[serde(default)]
    pub modifier_update_only: bool,
    /// Parse the field's text as a JSON sub-document before storing it.
    #[serde(default)]
    pub json:                 bool,
    #[serde(default)]
    pub modifier:             ModifierOp,
}

/// Resolved mapping of one incoming field onto a document path.
#[derive(Debug, Clone, PartialEq,)]
pub struct PathSpec {
    pub incoming_field:          String,
    pub target_path:             Vec<PathSegment,>,
    pub is_match_key:            bool,
    pub is_modifier_update_only: bool,
    pub parse_as_sub_document:   bool,
    pub modifier:                ModifierOp,
}

impl PathSpec {
    pub fn new(incoming_field: impl Into<String,>, target_path: Vec<PathSegment,>,) -> Self {
        Self {
            incoming_field: incoming_field.into(),
            target_path,
            is_match_key: false,
            is_modifier_update_only: false,
            parse_as_sub_document: false,
            modifier: ModifierOp::Set,
        }
    }

    pub fn match_key(mut self,) -> Self {
        self.is_match_key = true;
        self
    }

    pub fn modifier_update_only(mut self,) -> Self {
        self.is_modifier_update_only = true;
        self
    }

    pub fn sub_document(mut self,) -> Self {
        self.parse_as_sub_document = true;
        self
    }

    pub fn with_modifier(mut self, modifier: ModifierOp,) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn from_mapping(mapping: &FieldMapping,) -> Result<Self,> {
        if mapping.incoming_field.is_empty() {
            return Err(IngestorError::ConfigurationError(
                "field mapping without an incoming field name".to_string(),
            ),);
        }
        let mut target_path = parse_path(&mapping.path,)?;
        if mapping.use_field_name {
            target_path.push(PathSegment::Key(mapping.incoming_field.clone(),),);
        }
        Ok(Self {
            incoming_field: mapping.incoming_field.clone(),
            target_path,
            is_match_key: mapping.match_key,
            is_modifier_update_only: mapping.modifier_update_only,
            parse_as_sub_document: mapping.json,
            modifier: mapping.modifier,
        },)
    }

    /// The whole field value becomes the document root.
    pub fn is_top_level_document(&self,) -> bool {
        self.target_path.is_empty()
    }

    /// Dot-notation path used by queries and partial updates (`a.0.b`).
    pub fn dotted_path(&self,) -> String {
        self.target_path
            .iter()
            .map(|segment| match segment {
                PathSegment::Key(key,) => key.clone(),
                PathSegment::Index(index,) => index.to_string(),
            },)
            .collect::<Vec<_,>>()
            .join(".",)
    }

    /// Row value converted to BSON, parsed first when it holds a sub-document.
    pub(crate) fn value_from(&self, value: &RowValue,) -> Result<Bson,> {
        if self.parse_as_sub_document {
            parse_sub_document(&self.incoming_field, value,)
        } else {
            Ok(value.to_bson(),)
        }
    }

    pub(crate) fn non_null_value<'r,>(&self, row: &'r Row,) -> Option<&'r RowValue,> {
        Some(row.get(&self.incoming_field,),).filter(|v| !v.is_null(),)
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_,>,) -> fmt::Result {
        let mut first = true;
        for segment in &self.target_path {
            match segment {
                PathSegment::Key(key,) if first => write!(f, "{key}")?,
                PathSegment::Key(key,) => write!(f, ".{key}")?,
                PathSegment::Index(index,) => write!(f, "[{index}]")?,
            }
            first = false;
        }
        Ok((),)
    }
}

/// Parses `a.b[0].c` style paths. An empty string yields an empty path.
pub fn parse_path(path: &str,) -> Result<Vec<PathSegment,>,> {
    let path = path.trim();
    let mut segments = Vec::new();
    if path.is_empty() {
        return Ok(segments,);
    }

    let invalid = |reason: &str| {
        IngestorError::ConfigurationError(format!("invalid document path '{path}': {reason}"),)
    };

    for part in path.split('.',) {
        let (key, mut rest,) = match part.find('[',) {
            Some(pos,) => part.split_at(pos,),
            None => (part, "",),
        };
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string(),),);
        } else if rest.is_empty() {
            return Err(invalid("empty key",),);
        }
        while !rest.is_empty() {
            let close = rest.find(']',).ok_or_else(|| invalid("unterminated '['",),)?;
            if !rest.starts_with('[',) {
                return Err(invalid("unexpected text after ']'",),);
            }
            let index = rest[1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid("array index must be a non-negative integer",),)?;
            if index > MAX_ARRAY_INDEX {
                return Err(invalid(&format!("array index exceeds {MAX_ARRAY_INDEX}"),),);
            }
            segments.push(PathSegment::Index(index,),);
            rest = &rest[close + 1..];
        }
    }
    Ok(segments,)
}

pub(crate) fn parse_sub_document(field: &str, value: &RowValue,) -> Result<Bson,> {
    let invalid = |reason: String| IngestorError::InvalidSubDocument {
        field: field.to_string(),
        reason,
    };
    let text = value
        .as_text()
        .ok_or_else(|| invalid("value is not text".to_string(),),)?;
    let json: serde_json::Value = serde_json::from_str(text,).map_err(|e| invalid(e.to_string(),),)?;
    Bson::try_from(json,).map_err(|e| invalid(e.to_string(),),)
}

/// Field mappings checked once for shape and ambiguity, ready to map rows.
#[derive(Debug, Clone,)]
pub struct MappingPlan {
    specs:              Vec<PathSpec,>,
    shape:              TopLevelShape,
    top_level_document: bool,
}

impl MappingPlan {
    pub fn resolve(specs: Vec<PathSpec,>,) -> Result<Self,> {
        if specs.is_empty() {
            return Err(IngestorError::ConfigurationError(
                "no field mappings configured".to_string(),
            ),);
        }
        let shape = resolve(&specs,);
        if shape == TopLevelShape::Inconsistent {
            return Err(IngestorError::ConfigurationError(
                "field paths disagree on whether the document root is an object or an array"
                    .to_string(),
            ),);
        }
        let top_level_document = has_top_level_document_insert(&specs,)?;
        shape::check_ambiguity(&specs,)?;
        Ok(Self {
            specs,
            shape,
            top_level_document,
        },)
    }

    pub fn shape(&self,) -> TopLevelShape {
        self.shape
    }

    pub fn specs(&self,) -> &[PathSpec] {
        &self.specs
    }

    pub fn has_top_level_document_insert(&self,) -> bool {
        self.top_level_document
    }

    pub fn build_document(&self, row: &Row,) -> Result<Option<Bson,>,> {
        build_document(&self.specs, row, self.shape, self.top_level_document,)
    }

    pub fn build_query(&self, row: &Row,) -> Result<Option<Document,>,> {
        build_query(&self.specs, row,)
    }

    pub fn build_modifier_update(&self, row: &Row,) -> Result<Option<Document,>,> {
        build_modifier_update(&self.specs, row,)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_indexes() {
        assert_eq!(
            parse_path("a.b[0].c").unwrap(),
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(0),
                PathSegment::Key("c".into()),
            ]
        );
        assert_eq!(parse_path("[2]").unwrap(), vec![PathSegment::Index(2)]);
        assert_eq!(
            parse_path("m[1][3]").unwrap(),
            vec![PathSegment::Key("m".into()), PathSegment::Index(1), PathSegment::Index(3)]
        );
        assert!(parse_path("").unwrap().is_empty());
        assert_eq!(parse_path("[10000]").unwrap(), vec![PathSegment::Index(MAX_ARRAY_INDEX)]);
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in [
            "a..b",
            "a[",
            "a[x]",
            "a[1]b",
            "a[-1]",
            "a[10001]",
            "[18446744073709551615]",
        ] {
            let err = parse_path(bad).unwrap_err();
            assert!(err.is_configuration(), "{bad} should be rejected");
        }
    }

    #[test]
    fn field_name_is_appended_to_path() {
        let mapping: FieldMapping =
            serde_json::from_str(r#"{"incoming_field":"city","path":"address"}"#).unwrap();
        let spec = PathSpec::from_mapping(&mapping).unwrap();
        assert_eq!(spec.dotted_path(), "address.city");
        assert_eq!(spec.modifier, ModifierOp::Set);

        let mapping: FieldMapping = serde_json::from_str(
            r#"{"incoming_field":"tag","path":"tags[1]","use_field_name":false,"modifier":"$push"}"#,
        )
        .unwrap();
        let spec = PathSpec::from_mapping(&mapping).unwrap();
        assert_eq!(spec.to_string(), "tags[1]");
        assert_eq!(spec.dotted_path(), "tags.1");
        assert_eq!(spec.modifier, ModifierOp::Push);
    }
}
