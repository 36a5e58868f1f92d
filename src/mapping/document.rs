// nc_doc_loader/src/mapping/document.rs
// Folds one flat row into a nested document.

use mongodb::bson::{Bson, Document};

use super::{PathSegment, PathSpec, TopLevelShape, parse_sub_document};
use crate::error::{IngestorError, Result};
use crate::row::Row;

/// Builds the insert / replacement document for `row`.
///
/// Null fields are omitted. Returns `None` when the row contributes nothing,
/// in which case nothing must be written for it.
pub fn build_document(
    specs: &[PathSpec],
    row: &Row,
    shape: TopLevelShape,
    top_level_document_insert: bool,
) -> Result<Option<Bson,>,> {
    if top_level_document_insert {
        return whole_document(specs, row,);
    }

    let mut root = match shape {
        TopLevelShape::Object => Bson::Document(Document::new(),),
        TopLevelShape::Array => Bson::Array(Vec::new(),),
        TopLevelShape::Inconsistent => {
            return Err(IngestorError::ConfigurationError(
                "cannot build documents for an inconsistent top-level shape".to_string(),
            ),);
        },
    };

    let mut written = false;
    for spec in specs
        .iter()
        .filter(|s| !s.is_modifier_update_only && !s.is_top_level_document(),)
    {
        let Some(value,) = spec.non_null_value(row,) else {
            continue;
        };
        let value = spec.value_from(value,)?;
        place(&mut root, &spec.target_path, value,).map_err(|reason| {
            IngestorError::MappingError(format!(
                "cannot place field '{}' at {spec}: {reason}",
                spec.incoming_field
            ),)
        },)?;
        written = true;
    }

    Ok(written.then_some(root,),)
}

fn whole_document(specs: &[PathSpec], row: &Row,) -> Result<Option<Bson,>,> {
    let spec = specs
        .iter()
        .find(|s| s.is_top_level_document(),)
        .ok_or_else(|| {
            IngestorError::ConfigurationError("no field is mapped to the document root".to_string(),)
        },)?;

    let Some(value,) = spec.non_null_value(row,) else {
        return Ok(None,);
    };
    if value.as_text().is_some_and(|text| text.trim().is_empty(),) {
        return Ok(None,);
    }

    match parse_sub_document(&spec.incoming_field, value,)? {
        doc @ (Bson::Document(_,) | Bson::Array(_,)) => Ok(Some(doc,),),
        _ => Err(IngestorError::InvalidSubDocument {
            field:  spec.incoming_field.clone(),
            reason: "a whole document must be a JSON object or array".to_string(),
        },),
    }
}

/// Sets `value` at `path` below `container`, creating intermediate containers.
fn place(
    container: &mut Bson,
    path: &[PathSegment],
    value: Bson,
) -> std::result::Result<(), &'static str,> {
    let Some((head, rest,),) = path.split_first() else {
        return Err("empty path",);
    };
    let slot = slot_mut(container, head,)?;

    let Some(next,) = rest.first() else {
        *slot = value;
        return Ok((),);
    };
    if matches!(slot, Bson::Null) {
        *slot = match next {
            PathSegment::Key(_,) => Bson::Document(Document::new(),),
            PathSegment::Index(_,) => Bson::Array(Vec::new(),),
        };
    }
    place(slot, rest, value,)
}

fn slot_mut<'a,>(
    container: &'a mut Bson,
    segment: &PathSegment,
) -> std::result::Result<&'a mut Bson, &'static str,> {
    match (container, segment,) {
        (Bson::Document(doc,), PathSegment::Key(key,),) => {
            if !doc.contains_key(key,) {
                doc.insert(key.clone(), Bson::Null,);
            }
            doc.get_mut(key,).ok_or("missing key",)
        },
        (Bson::Array(items,), PathSegment::Index(index,),) => {
            let len = index.checked_add(1,).ok_or("array index out of range",)?;
            if items.len() < len {
                items.resize(len, Bson::Null,);
            }
            Ok(&mut items[*index],)
        },
        (Bson::Document(_,), PathSegment::Index(_,),) => Err("an object is addressed by array index",),
        (Bson::Array(_,), PathSegment::Key(_,),) => Err("an array is addressed by key",),
        _ => Err("a scalar value is in the way",),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mongodb::bson::{bson, doc};

    use super::*;
    use crate::mapping::{PathSpec, parse_path};
    use crate::row::{RowMeta, RowValue};

    fn row(fields: &[(&str, RowValue,)],) -> Row {
        let meta = Arc::new(RowMeta::new(fields.iter().map(|(n, _)| *n)));
        Row::new(meta, fields.iter().map(|(_, v)| v.clone()).collect()).unwrap()
    }

    fn spec(name: &str, path: &str,) -> PathSpec {
        PathSpec::new(name, parse_path(path,).unwrap(),)
    }

    #[test]
    fn nests_fields_in_declaration_order() {
        let specs = [
            spec("name", "name"),
            spec("city", "address.city"),
            spec("zip", "address.zip"),
        ];
        let row = row(&[
            ("name", RowValue::String("ada".into())),
            ("city", RowValue::String("London".into())),
            ("zip", RowValue::Integer(1815)),
        ]);

        let built = build_document(&specs, &row, TopLevelShape::Object, false)
            .unwrap()
            .unwrap();
        assert_eq!(
            built,
            Bson::Document(doc! {
                "name": "ada",
                "address": { "city": "London", "zip": 1815_i64 },
            })
        );
    }

    #[test]
    fn null_fields_are_omitted_and_all_null_rows_yield_nothing() {
        let specs = [spec("a", "a"), spec("b", "x.b")];
        let partial = row(&[("a", RowValue::Null), ("b", RowValue::Boolean(true))]);
        let built = build_document(&specs, &partial, TopLevelShape::Object, false)
            .unwrap()
            .unwrap();
        assert_eq!(built, Bson::Document(doc! { "x": { "b": true } }));

        let empty = row(&[("a", RowValue::Null), ("b", RowValue::Null)]);
        assert!(
            build_document(&specs, &empty, TopLevelShape::Object, false)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn array_root_grows_to_index() {
        let specs = [spec("first", "[0]"), spec("third", "[2].v")];
        let row = row(&[
            ("first", RowValue::Integer(1)),
            ("third", RowValue::Integer(3)),
        ]);
        let built = build_document(&specs, &row, TopLevelShape::Array, false)
            .unwrap()
            .unwrap();
        assert_eq!(built, bson!([1_i64, null, { "v": 3_i64 }]));
    }

    #[test]
    fn sub_documents_are_spliced() {
        let specs = [spec("id", "id"), spec("meta", "meta").sub_document()];
        let row = row(&[
            ("id", RowValue::Integer(7)),
            ("meta", RowValue::String(r#"{"tags":["a","b"],"score":null}"#.into())),
        ]);
        let built = build_document(&specs, &row, TopLevelShape::Object, false)
            .unwrap()
            .unwrap();
        assert_eq!(
            built,
            Bson::Document(doc! {
                "id": 7_i64,
                "meta": { "tags": ["a", "b"], "score": null },
            })
        );
    }

    #[test]
    fn modifier_only_fields_stay_out_of_full_documents() {
        let specs = [spec("a", "a"), spec("hits", "hits").modifier_update_only()];
        let row = row(&[("a", RowValue::Integer(1)), ("hits", RowValue::Integer(5))]);
        let built = build_document(&specs, &row, TopLevelShape::Object, false)
            .unwrap()
            .unwrap();
        assert_eq!(built, Bson::Document(doc! { "a": 1_i64 }));
    }

    #[test]
    fn whole_document_insert_uses_field_verbatim() {
        let specs = [PathSpec::new("doc", vec![]).sub_document()];
        let full = row(&[("doc", RowValue::String(r#"{"k":{"n":"v"}}"#.into()))]);
        let built = build_document(&specs, &full, TopLevelShape::Object, true)
            .unwrap()
            .unwrap();
        assert_eq!(built, Bson::Document(doc! { "k": { "n": "v" } }));

        let blank = row(&[("doc", RowValue::String("  ".into()))]);
        assert!(build_document(&specs, &blank, TopLevelShape::Object, true).unwrap().is_none());

        let scalar = row(&[("doc", RowValue::String("42".into()))]);
        assert!(build_document(&specs, &scalar, TopLevelShape::Object, true).is_err());
    }

    #[test]
    fn overflowing_index_is_a_mapping_error() {
        let specs = [PathSpec::new("a", vec![PathSegment::Index(usize::MAX)])];
        let row = row(&[("a", RowValue::Integer(1))]);
        let err = build_document(&specs, &row, TopLevelShape::Array, false).unwrap_err();
        assert!(matches!(err, IngestorError::MappingError(_)));
    }

    #[test]
    fn invalid_json_is_reported() {
        let specs = [spec("meta", "meta").sub_document()];
        let row = row(&[("meta", RowValue::String("{oops".into()))]);
        let err = build_document(&specs, &row, TopLevelShape::Object, false).unwrap_err();
        assert!(matches!(err, IngestorError::InvalidSubDocument { .. }));
    }

    #[test]
    fn identical_input_builds_identical_documents() {
        let specs = [spec("b", "z.b"), spec("a", "a"), spec("c", "z.c")];
        let values = [
            ("b", RowValue::Float(1.5)),
            ("a", RowValue::String("x".into())),
            ("c", RowValue::Boolean(false)),
        ];
        let first = build_document(&specs, &row(&values), TopLevelShape::Object, false).unwrap();
        let second = build_document(&specs, &row(&values), TopLevelShape::Object, false).unwrap();
        assert_eq!(first, second);
        let keys: Vec<_> = first.unwrap().as_document().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z".to_string(), "a".to_string()]);
    }
}
