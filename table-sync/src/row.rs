use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::name;

/// Flat map of field name to value, used for edits and for draft-add records.
pub type FieldMap = Map<String, Value>;

/// First id handed to locally added rows of numerically keyed tables. Remote
/// ids are expected to stay below it.
pub const BASE_DRAFT_ID: u64 = 1 << 62;

/// Identity type of a row: totally ordered and unique within one table scope.
pub trait RowId: Clone + Ord + Hash + Debug + Display + Serialize + DeserializeOwned + 'static {
    /// Convert the 64-bit key carried by journal entries.
    fn from_journal_key(key: u64) -> Self;

    /// Whether the table picks the ids of draft adds. Otherwise the caller
    /// names them.
    const ASSIGNS_DRAFT_IDS: bool = false;

    /// The id the table assigns to the next draft add, given the greatest id
    /// currently cached. `None` when the draft range is used up or ids are
    /// supplied by the caller.
    fn next_draft_id(last: Option<&Self>) -> Option<Self>;

    /// Whether the id falls in the range reserved for local drafts.
    fn is_draft_range(&self) -> bool {
        false
    }

    fn lower_bound(&self) -> Value;
}

impl RowId for u64 {
    const ASSIGNS_DRAFT_IDS: bool = true;

    fn from_journal_key(key: u64) -> Self {
        key
    }

    fn next_draft_id(last: Option<&Self>) -> Option<Self> {
        match last {
            Some(&last) if last >= BASE_DRAFT_ID => last.checked_add(1),
            _ => Some(BASE_DRAFT_ID),
        }
    }

    fn is_draft_range(&self) -> bool {
        *self >= BASE_DRAFT_ID
    }

    fn lower_bound(&self) -> Value {
        Value::from(*self)
    }
}

impl RowId for String {
    fn from_journal_key(key: u64) -> Self {
        name::u64_to_string(key)
    }

    fn next_draft_id(_last: Option<&Self>) -> Option<Self> {
        None
    }

    fn lower_bound(&self) -> Value {
        Value::String(self.clone())
    }
}

/// A row of a remote table.
///
/// Rows are plain values: cloned freely, compared structurally, ordered by
/// [`Row::id`] only. The serde representation is the wire representation, and
/// its field names are the names accepted in edit maps.
pub trait Row: Clone + PartialEq + Debug + Default + Serialize + DeserializeOwned + 'static {
    type Id: RowId;

    /// Name of the remote table holding rows of this type.
    const TABLE: &'static str;

    fn id(&self) -> Self::Id;
    fn set_id(&mut self, id: Self::Id);
}

/// A row decoded from a raw payload, with the payload fields the schema did
/// not use.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<R> {
    pub row: R,
    pub unknown: Vec<String>,
}

/// Names of the fields declared by the schema.
pub fn declared_fields<R: Row>() -> Vec<String> {
    match serde_json::to_value(R::default()) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

pub fn to_fields<R: Row>(row: &R) -> FieldMap {
    match serde_json::to_value(row) {
        Ok(Value::Object(map)) => map,
        _ => FieldMap::new(),
    }
}

pub fn encode<R: Row>(row: &R) -> Value {
    Value::Object(to_fields(row))
}

/// Decode a raw payload object. Missing declared fields and ill-typed values
/// are errors; extra fields are reported in [`Decoded::unknown`].
pub fn decode<R: Row>(raw: &Value) -> Result<Decoded<R>> {
    let object = raw.as_object().ok_or_else(|| Error::Decode {
        table: R::TABLE.to_string(),
        reason: format!("expected an object, got {}", raw),
    })?;

    let declared = declared_fields::<R>();
    let missing: Vec<&str> = declared
        .iter()
        .filter(|f| !object.contains_key(f.as_str()))
        .map(|f| f.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Decode {
            table: R::TABLE.to_string(),
            reason: format!("missing fields {:?}", missing),
        });
    }

    let unknown = object
        .keys()
        .filter(|k| !declared.contains(k))
        .cloned()
        .collect();
    let row = serde_json::from_value(raw.clone()).map_err(|e| Error::Decode {
        table: R::TABLE.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Decoded { row, unknown })
}

/// Overlay `changes` onto `base`. Keys the schema does not declare are left
/// out and reported in [`Decoded::unknown`].
pub fn apply_fields<R: Row>(base: &R, changes: &FieldMap) -> Result<Decoded<R>> {
    let mut fields = to_fields(base);
    let mut unknown = Vec::new();
    for (key, value) in changes {
        match fields.get_mut(key) {
            Some(slot) => *slot = value.clone(),
            None => unknown.push(key.clone()),
        }
    }
    let row = serde_json::from_value(Value::Object(fields)).map_err(|e| Error::Decode {
        table: R::TABLE.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Decoded { row, unknown })
}

/// Whether every field named in `fields` equals the same field of `row`.
/// Fields absent from `fields` match anything.
pub fn matches_fields<R: Row>(row: &R, fields: &FieldMap) -> bool {
    let actual = to_fields(row);
    fields
        .iter()
        .filter(|(key, _)| actual.contains_key(key.as_str()))
        .all(|(key, expected)| actual.get(key) == Some(expected))
}

#[cfg(test)]
pub(crate) mod testing {
    use serde::{Deserialize, Serialize};

    use super::Row;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Item {
        pub id: u64,
        pub name: String,
        pub weight: u32,
    }

    impl Row for Item {
        type Id = u64;
        const TABLE: &'static str = "items";

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
    }

    pub fn item(id: u64, name: &str, weight: u32) -> Item {
        Item { id, name: name.to_string(), weight }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Member {
        pub account: String,
        pub weight: u32,
    }

    impl Row for Member {
        type Id = String;
        const TABLE: &'static str = "members";

        fn id(&self) -> String {
            self.account.clone()
        }

        fn set_id(&mut self, id: String) {
            self.account = id;
        }
    }

    pub fn member(account: &str, weight: u32) -> Member {
        Member { account: account.to_string(), weight }
    }
}
