use std::slice::Iter;

use tracing::debug;

use crate::riverpool::common::{Error, Result};
use crate::riverpool::pg::protocol::{Message, ProtocolVersion, Tag};


/// One column of a RowDescription. V2 descriptions carry only name, type oid, size and modifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    /// The object ID of the table if the field can be identified as a column of a specific table, otherwise 0.
    pub table_oid: i32,
    /// The attribute number of the column, if the field can be identified as a table column, otherwise 0.
    pub column_attribute_num: i16,
    /// The object ID of the field's data type.
    pub type_oid: i32,
    /// The data type size (see pg_type.typlen). Note that negative values denote variable-width types.
    pub type_len: i16,
    /// The type modifier (see pg_attribute.atttypmod). The meaning of the modifier is type-specific.
    pub type_mod: i32,
    /// The format code being used for the field. Currently will be zero (text) or one (binary).
    pub format_code: i16,
}

#[derive(Clone, Debug, Default)]
pub struct RowDescription {
    fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub fn parse(msg: &Message, version: ProtocolVersion) -> Result<Self> {
        if msg.tag() != Tag::ROW_DESCRIPTION {
            return Err(Error::protocol_error(format!("expected RowDescription, got {}", msg.tag())));
        }
        let r = msg.reader();
        let num_fields = r.read_i16();
        let mut fields = Vec::with_capacity(num_fields.max(0) as usize);
        for _ in 0..num_fields {
            let name = r.read_str()?.to_string();
            let field = match version {
                ProtocolVersion::V3 => FieldDescription{
                    name,
                    table_oid: r.read_i32(),
                    column_attribute_num: r.read_i16(),
                    type_oid: r.read_i32(),
                    type_len: r.read_i16(),
                    type_mod: r.read_i32(),
                    format_code: r.read_i16(),
                },
                ProtocolVersion::V2 => FieldDescription{
                    name,
                    type_oid: r.read_i32(),
                    type_len: r.read_i16(),
                    type_mod: r.read_i32(),
                    ..Default::default()
                },
            };
            fields.push(field);
        }
        r.error()?;
        Ok(Self{fields})
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldDescription> {
        self.fields.get(index)
    }

    pub fn iter(&self) -> Iter<FieldDescription> {
        self.fields.iter()
    }

    /// compare checks other (from backend node) against this reference description.
    /// Differing field counts, name lengths or type sizes are a SchemaMismatch.
    /// Differing type oids or modifiers are only logged.
    pub fn compare(&self, other: &RowDescription, node: usize) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::schema_mismatch(format!(
                "num_fields does not match between backends, master({}) node {}({})",
                self.len(), node, other.len())));
        }
        for (i, (a, b)) in self.iter().zip(other.iter()).enumerate() {
            if a.name.len() != b.name.len() {
                return Err(Error::schema_mismatch(format!(
                    "field length does not match between backends, master({}) node {}({}) field {}",
                    a.name.len(), node, b.name.len(), i)));
            }
            if a.type_oid != b.type_oid {
                debug!(node, field = i, master_oid = a.type_oid, oid = b.type_oid, "data type oid does not match between backends");
            }
            if a.type_len != b.type_len {
                return Err(Error::schema_mismatch(format!(
                    "size does not match between backends, master({}) node {}({}) field {}",
                    a.type_len, node, b.type_len, i)));
            }
            if a.type_mod != b.type_mod {
                debug!(node, field = i, master_mod = a.type_mod, modifier = b.type_mod, "modifier does not match between backends");
            }
        }
        Ok(())
    }
}
