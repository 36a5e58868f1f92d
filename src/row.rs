// nc_doc_loader/src/row.rs
// Tabular rows fed into the loader, and the sources that produce them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson, DateTime};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use crate::error::{IngestorError, Result};

/// A single typed value inside a row.
#[derive(Debug, Clone, PartialEq,)]
pub enum RowValue {
    Null,
    Boolean(bool,),
    Integer(i64,),
    Float(f64,),
    String(String,),
    Binary(Vec<u8,>,),
    /// Milliseconds since the Unix epoch.
    DateTime(i64,),
}

impl RowValue {
    pub fn is_null(&self,) -> bool {
        matches!(self, RowValue::Null)
    }

    pub fn to_bson(&self,) -> Bson {
        match self {
            RowValue::Null => Bson::Null,
            RowValue::Boolean(b,) => Bson::Boolean(*b,),
            RowValue::Integer(i,) => Bson::Int64(*i,),
            RowValue::Float(f,) => Bson::Double(*f,),
            RowValue::String(s,) => Bson::String(s.clone(),),
            RowValue::Binary(bytes,) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes:   bytes.clone(),
            },),
            RowValue::DateTime(millis,) => Bson::DateTime(DateTime::from_millis(*millis,),),
        }
    }

    /// Textual form used when the value has to be parsed as a sub-document.
    pub fn as_text(&self,) -> Option<&str,> {
        match self {
            RowValue::String(s,) => Some(s.as_str(),),
            _ => None,
        }
    }
}

impl From<&serde_json::Value,> for RowValue {
    fn from(value: &serde_json::Value,) -> Self {
        match value {
            serde_json::Value::Null => RowValue::Null,
            serde_json::Value::Bool(b,) => RowValue::Boolean(*b,),
            serde_json::Value::Number(n,) => match n.as_i64() {
                Some(i,) => RowValue::Integer(i,),
                None => RowValue::Float(n.as_f64().unwrap_or(f64::NAN,),),
            },
            serde_json::Value::String(s,) => RowValue::String(s.clone(),),
            // nested structures travel as JSON text so they can be mapped as sub-documents
            other => RowValue::String(other.to_string(),),
        }
    }
}

/// Names of the fields carried by every row of a stream, in column order.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct RowMeta {
    names: Vec<String,>,
}

impl RowMeta {
    pub fn new<I, S,>(names: I,) -> Self
    where
        I: IntoIterator<Item = S,>,
        S: Into<String,>,
    {
        Self {
            names: names.into_iter().map(Into::into,).collect(),
        }
    }

    pub fn field_names(&self,) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str,) -> Option<usize,> {
        self.names.iter().position(|n| n == name,)
    }

    pub fn len(&self,) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self,) -> bool {
        self.names.is_empty()
    }
}

/// One incoming record. Values are positional against the shared [`RowMeta`].
#[derive(Debug, Clone,)]
pub struct Row {
    meta:   Arc<RowMeta,>,
    values: Vec<RowValue,>,
}

impl Row {
    pub fn new(meta: Arc<RowMeta,>, values: Vec<RowValue,>,) -> Result<Self,> {
        if meta.len() != values.len() {
            return Err(IngestorError::MappingError(format!(
                "row carries {} values but its schema names {} fields",
                values.len(),
                meta.len()
            ),),);
        }
        Ok(Self { meta, values, },)
    }

    pub fn meta(&self,) -> &RowMeta {
        &self.meta
    }

    /// Value of the named field. Unknown names read as null.
    pub fn get(&self, name: &str,) -> &RowValue {
        self.meta
            .index_of(name,)
            .and_then(|i| self.values.get(i,),)
            .unwrap_or(&RowValue::Null,)
    }
}

/// Pull-based producer of rows.
#[async_trait]
pub trait RowSource: Send {
    /// Returns `None` once the stream is exhausted.
    async fn next_row(&mut self,) -> Result<Option<Row,>,>;
}

#[async_trait]
impl RowSource for std::vec::IntoIter<Row,> {
    async fn next_row(&mut self,) -> Result<Option<Row,>,> {
        Ok(self.next(),)
    }
}

/// Reads one flat JSON object per line. The first record fixes the schema.
pub struct JsonLinesSource<R,> {
    lines:   Lines<R,>,
    meta:    Option<Arc<RowMeta,>,>,
    line_no: usize,
}

impl JsonLinesSource<BufReader<tokio::fs::File,>,> {
    pub async fn open(path: &Path,) -> Result<Self,> {
        let file = tokio::fs::File::open(path,).await?;
        Ok(Self::new(BufReader::new(file,),),)
    }
}

impl<R: AsyncBufRead + Unpin + Send,> JsonLinesSource<R,> {
    pub fn new(reader: R,) -> Self {
        Self {
            lines:   reader.lines(),
            meta:    None,
            line_no: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send,> RowSource for JsonLinesSource<R,> {
    async fn next_row(&mut self,) -> Result<Option<Row,>,> {
        while let Some(line,) = self.lines.next_line().await? {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let value: serde_json::Value = serde_json::from_str(&line,)?;
            let serde_json::Value::Object(object,) = value else {
                return Err(IngestorError::MappingError(format!(
                    "line {} is not a JSON object",
                    self.line_no
                ),),);
            };

            let meta = match &self.meta {
                Some(meta,) => Arc::clone(meta,),
                None => {
                    let meta = Arc::new(RowMeta::new(object.keys().cloned(),),);
                    self.meta = Some(Arc::clone(&meta,),);
                    meta
                },
            };

            if object.keys().any(|k| meta.index_of(k,).is_none(),) {
                warn!(
                    "Line {} carries fields outside the stream schema; they are ignored",
                    self.line_no
                );
            }

            let values = meta
                .field_names()
                .iter()
                .map(|name| object.get(name,).map(RowValue::from,).unwrap_or(RowValue::Null,),)
                .collect();
            return Row::new(meta, values,).map(Some,);
        }
        Ok(None,)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_lines_keep_first_schema_and_fill_missing_with_null() {
        let input = b"{\"name\":\"ada\",\"age\":36}\n\n{\"name\":\"alan\",\"extra\":1}\n" as &[u8];
        let mut source = JsonLinesSource::new(input,);

        let first = source.next_row().await.unwrap().unwrap();
        assert_eq!(first.get("age"), &RowValue::Integer(36));

        let second = source.next_row().await.unwrap().unwrap();
        assert_eq!(second.get("name"), &RowValue::String("alan".into()));
        assert!(second.get("age").is_null());
        assert!(second.get("extra").is_null());

        assert!(source.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nested_json_values_become_text() {
        let input = b"{\"address\":{\"city\":\"Paris\"}}\n" as &[u8];
        let mut source = JsonLinesSource::new(input,);
        let row = source.next_row().await.unwrap().unwrap();
        assert_eq!(row.get("address").as_text(), Some("{\"city\":\"Paris\"}"));
    }

    #[test]
    fn row_rejects_value_count_mismatch() {
        let meta = Arc::new(RowMeta::new(["a", "b"],),);
        assert!(Row::new(meta, vec![RowValue::Null],).is_err());
    }
}
