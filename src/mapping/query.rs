// nc_doc_loader/src/mapping/query.rs
// Upsert match queries and partial (modifier) updates.

use mongodb::bson::Document;

use super::PathSpec;
use crate::error::{IngestorError, Result};
use crate::row::Row;

/// Match query built from the match-key fields of `row`.
///
/// A null key is left out rather than matched against null. `None` means no
/// match key has a value and the row cannot be upserted.
pub fn build_query(specs: &[PathSpec], row: &Row,) -> Result<Option<Document,>,> {
    let mut query = Document::new();
    for spec in specs.iter().filter(|s| s.is_match_key,) {
        let Some(value,) = spec.non_null_value(row,) else {
            continue;
        };
        query.insert(spec.dotted_path(), spec.value_from(value,)?,);
    }
    Ok((!query.is_empty()).then_some(query,),)
}

/// Partial update addressing each non-null field by its dotted path, grouped
/// under its modifier operator (`{"$set": {"a.b": 1}}`).
///
/// Match keys are left to the query. `None` means every field was null.
pub fn build_modifier_update(specs: &[PathSpec], row: &Row,) -> Result<Option<Document,>,> {
    let mut update = Document::new();
    for spec in specs
        .iter()
        .filter(|s| !s.is_top_level_document(),)
        .filter(|s| !s.is_match_key || s.is_modifier_update_only,)
    {
        let Some(value,) = spec.non_null_value(row,) else {
            continue;
        };
        let operator = spec.modifier.operator();
        if !update.contains_key(operator,) {
            update.insert(operator, Document::new(),);
        }
        update
            .get_document_mut(operator,)
            .map_err(|e| IngestorError::MappingError(e.to_string(),),)?
            .insert(spec.dotted_path(), spec.value_from(value,)?,);
    }
    Ok((!update.is_empty()).then_some(update,),)
}
