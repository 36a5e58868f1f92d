// nc_doc_loader/src/mapping/shape.rs
// Decides whether documents are object- or array-rooted, once per pipeline.

use tracing::debug;

use super::{PathSegment, PathSpec};
use crate::error::{IngestorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum TopLevelShape {
    Object,
    Array,
    Inconsistent,
}

/// Root shape implied by the first segment of every non-empty target path.
///
/// Top-level document inserts carry no path and do not vote.
pub fn resolve(specs: &[PathSpec],) -> TopLevelShape {
    let mut array_roots = 0usize;
    let mut object_roots = 0usize;
    for spec in specs {
        match spec.target_path.first() {
            Some(PathSegment::Index(_,),) => array_roots += 1,
            Some(PathSegment::Key(_,),) => object_roots += 1,
            None => {},
        }
    }

    let shape = match (array_roots, object_roots,) {
        (0, _,) => TopLevelShape::Object,
        (_, 0,) => TopLevelShape::Array,
        _ => TopLevelShape::Inconsistent,
    };
    debug!(array_roots, object_roots, ?shape, "resolved top-level document shape");
    shape
}

/// True when one field supplies the complete document verbatim.
///
/// Such a field must be a sub-document, must be the only one of its kind, and
/// every other field may only take part in the upsert query.
pub fn has_top_level_document_insert(specs: &[PathSpec],) -> Result<bool,> {
    let top_level: Vec<&PathSpec,> = specs.iter().filter(|s| s.is_top_level_document(),).collect();
    let Some(spec,) = top_level.first() else {
        return Ok(false,);
    };

    if let Some(plain,) = top_level.iter().find(|s| !s.parse_as_sub_document,) {
        return Err(IngestorError::ConfigurationError(format!(
            "field '{}' has no document path; only a JSON sub-document may be inserted as the \
             whole document",
            plain.incoming_field
        ),),);
    }
    if top_level.len() > 1 {
        return Err(IngestorError::ConfigurationError(format!(
            "{} fields are mapped to the document root; at most one is allowed",
            top_level.len()
        ),),);
    }
    if let Some(other,) = specs
        .iter()
        .find(|s| !s.is_top_level_document() && !s.is_match_key,)
    {
        return Err(IngestorError::ConfigurationError(format!(
            "field '{}' cannot be written alongside the whole-document field '{}'",
            other.incoming_field, spec.incoming_field
        ),),);
    }
    Ok(true,)
}

/// Rejects mappings that would write two values to the same place.
pub(crate) fn check_ambiguity(specs: &[PathSpec],) -> Result<(),> {
    let paths: Vec<&PathSpec,> = specs.iter().filter(|s| !s.is_top_level_document(),).collect();
    for (i, a,) in paths.iter().enumerate() {
        for b in &paths[i + 1..] {
            if let Some(reason,) = path_conflict(&a.target_path, &b.target_path,) {
                return Err(IngestorError::ConfigurationError(format!(
                    "ambiguous mapping between '{}' ({a}) and '{}' ({b}): {reason}",
                    a.incoming_field, b.incoming_field
                ),),);
            }
        }
    }
    Ok((),)
}

fn path_conflict(a: &[PathSegment], b: &[PathSegment],) -> Option<&'static str,> {
    let common = a.iter().zip(b,).take_while(|(x, y,)| x == y,).count();
    if common == a.len() && common == b.len() {
        return Some("both map to the same path",);
    }
    if common == a.len() || common == b.len() {
        return Some("one path is nested beneath the other",);
    }
    match (&a[common], &b[common],) {
        (PathSegment::Key(_,), PathSegment::Index(_,),)
        | (PathSegment::Index(_,), PathSegment::Key(_,),) => {
            Some("a container is addressed both as an object and as an array",)
        },
        _ => None,
    }
}
