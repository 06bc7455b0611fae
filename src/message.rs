//! Message envelope for the ESB protocol
//!
//! Every frame on the wire is a JSON object `{"meta": {...}, "data": ...}`.
//! `meta` carries routing and control fields, `data` carries the payload.
//! Messages are immutable once built; new envelopes are derived with
//! [`Message::merge`] / [`Message::extend`].
//!
//! # Merge precedence
//!
//! Meta fields merge left to right, later sources overriding earlier ones.
//! Data follows an intentionally asymmetric rule that the envelope builders
//! below depend on:
//!
//! 1. if any source's data is an array, the result is the concatenation of
//!    every array-typed data in source order (all other data is ignored);
//! 2. otherwise, if any source's data is a scalar, the last scalar wins;
//! 3. otherwise object data merges key by key, later overriding earlier.
//!
//! A `null` or absent `data` does not take part in the merge.

use crate::error::{EsbError, Result};

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Meta field mapping, ordered by insertion
pub type Meta = Map<String, Value>;

pub const META_ID: &str = "id";
pub const META_TYPE: &str = "type";
pub const META_GROUP: &str = "group";
pub const META_REPLY_TO: &str = "replyTo";
pub const META_INRE: &str = "inre";
pub const META_RESULT: &str = "result";
pub const META_REASON: &str = "reason";
pub const META_FROM: &str = "from";
pub const META_SESSION: &str = "session";
pub const META_CC_GROUP: &str = "cc.group";

pub const TYPE_LOGIN: &str = "login";
pub const TYPE_SUBSCRIBE: &str = "subscribe";
pub const TYPE_SEND: &str = "sendMessage";

pub const RESULT_SUCCESS: &str = "SUCCESS";
pub const RESULT_FAILURE: &str = "FAILURE";

/// Suffix of the group an RPC responder answers on
pub const RESULT_GROUP_SUFFIX: &str = "-result";

/// A single ESB message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    meta: Meta,
    data: Value,
}

/// One input to [`Message::merge`]: a raw `{meta, data}` structure or a message
#[derive(Debug, Clone)]
pub enum Fragment {
    Raw(Value),
    Message(Message),
}

impl From<Value> for Fragment {
    fn from(value: Value) -> Self {
        Fragment::Raw(value)
    }
}

impl From<Message> for Fragment {
    fn from(msg: Message) -> Self {
        Fragment::Message(msg)
    }
}

impl From<&Message> for Fragment {
    fn from(msg: &Message) -> Self {
        Fragment::Message(msg.clone())
    }
}

/// A fragment after structural validation
struct Part {
    meta: Meta,
    data: Option<Value>,
}

impl Fragment {
    fn into_part(self) -> Result<Part> {
        match self {
            Fragment::Message(msg) => Ok(Part {
                meta: msg.meta,
                data: Some(msg.data),
            }),
            Fragment::Raw(Value::Object(mut raw)) => {
                let meta = match raw.remove("meta") {
                    None | Some(Value::Null) => Meta::new(),
                    Some(Value::Object(meta)) => meta,
                    Some(other) => {
                        return Err(EsbError::MalformedMessage(format!(
                            "meta must be an object, got {}",
                            kind_of(&other)
                        )))
                    }
                };
                let data = match raw.remove("data") {
                    None | Some(Value::Null) => None,
                    Some(data) => Some(data),
                };
                Ok(Part { meta, data })
            }
            Fragment::Raw(other) => Err(EsbError::MalformedMessage(format!(
                "message must be an object, got {}",
                kind_of(&other)
            ))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Combine validated parts according to the merge precedence rule
fn combine(parts: Vec<Part>) -> Message {
    let mut meta = Meta::new();
    let mut sequence: Option<Vec<Value>> = None;
    let mut scalar: Option<Value> = None;
    let mut object = Map::new();

    for part in parts {
        for (key, value) in part.meta {
            meta.insert(key, value);
        }

        match part.data {
            Some(Value::Array(items)) => sequence.get_or_insert_with(Vec::new).extend(items),
            Some(Value::Object(fields)) => {
                for (key, value) in fields {
                    object.insert(key, value);
                }
            }
            Some(Value::Null) | None => {}
            Some(value) => scalar = Some(value),
        }
    }

    let data = match (sequence, scalar) {
        (Some(items), _) => Value::Array(items),
        (None, Some(value)) => value,
        (None, None) => Value::Object(object),
    };

    Message::from_parts(meta, data)
}

/// Build a meta mapping from key/value pairs
fn meta_of<const N: usize>(pairs: [(&str, Value); N]) -> Meta {
    pairs
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn lookup_map<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    // A key that itself contains dots (e.g. `cc.group`) wins over traversal
    if let Some(value) = map.get(path) {
        return Some(value);
    }

    let (head, rest) = path.split_once('.')?;
    let mut current = map.get(head)?;
    for segment in rest.split('.') {
        current = match current {
            Value::Object(fields) => fields.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    match root {
        Value::Object(fields) => lookup_map(fields, path),
        Value::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let item = items.get(head.parse::<usize>().ok()?)?;
            match rest {
                Some(rest) => lookup(item, rest),
                None => Some(item),
            }
        }
        _ => None,
    }
}

/// Flatten a scalar-or-sequence meta value into its string members
fn string_members(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

impl Message {
    /// Create a message from a meta mapping and a payload
    ///
    /// `meta` must be an object (or null). A missing `id` is generated and a
    /// null `data` becomes an empty object.
    pub fn new(meta: Value, data: Value) -> Result<Self> {
        let meta = match meta {
            Value::Null => Meta::new(),
            Value::Object(meta) => meta,
            other => {
                return Err(EsbError::MalformedMessage(format!(
                    "meta must be an object, got {}",
                    kind_of(&other)
                )))
            }
        };
        Ok(Self::from_parts(meta, data))
    }

    /// Parse the canonical `{meta, data}` wire structure
    pub fn from_value(value: Value) -> Result<Self> {
        let part = Fragment::Raw(value).into_part()?;
        Ok(Self::from_parts(part.meta, part.data.unwrap_or(Value::Null)))
    }

    pub(crate) fn from_parts(mut meta: Meta, data: Value) -> Self {
        let has_id = matches!(meta.get(META_ID), Some(Value::String(id)) if !id.is_empty())
            || matches!(meta.get(META_ID), Some(Value::Number(_)));
        if !has_id {
            meta.insert(
                META_ID.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }
        let data = if data.is_null() {
            Value::Object(Map::new())
        } else {
            data
        };
        Self { meta, data }
    }

    /// Merge fragments into a new message (see the module docs for precedence)
    pub fn merge<I, F>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = F>,
        F: Into<Fragment>,
    {
        let parts = sources
            .into_iter()
            .map(|source| source.into().into_part())
            .collect::<Result<Vec<_>>>()?;
        Ok(combine(parts))
    }

    /// Merge `overlay` on top of this message
    pub fn extend(&self, overlay: impl Into<Fragment>) -> Result<Self> {
        Self::merge([Fragment::from(self), overlay.into()])
    }

    /// Correlation identifier
    pub fn id(&self) -> String {
        match self.meta.get(META_ID) {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Message kind (`meta.type`)
    pub fn kind(&self) -> Option<&str> {
        self.meta_str(META_TYPE)
    }

    /// A meta field as a string, if it is one
    pub fn meta_str(&self, path: &str) -> Option<&str> {
        self.get_meta(path).and_then(Value::as_str)
    }

    /// Target groups (`meta.group`, scalar or sequence)
    pub fn groups(&self) -> Vec<String> {
        string_members(self.meta.get(META_GROUP))
    }

    /// Additional groups a reply should be broadcast to (`meta["cc.group"]`)
    pub fn cc_groups(&self) -> Vec<String> {
        string_members(self.get_meta(META_CC_GROUP))
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// Value at a dot-delimited path into `data`
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, path)
    }

    /// Value at a path into `data`, or `default` when absent
    pub fn get_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get(path).unwrap_or(default)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Value at a dot-delimited path into `meta`
    pub fn get_meta(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return None;
        }
        lookup_map(&self.meta, path)
    }

    pub fn get_meta_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get_meta(path).unwrap_or(default)
    }

    pub fn has_meta(&self, path: &str) -> bool {
        self.get_meta(path).is_some()
    }

    /// Canonical `{meta, data}` structure
    pub fn to_wire(&self) -> Value {
        let mut wire = Map::new();
        wire.insert("meta".to_string(), Value::Object(self.meta.clone()));
        wire.insert("data".to_string(), self.data.clone());
        Value::Object(wire)
    }

    /// Login request carrying the name and an initial subscription list
    pub fn login(name: &str, subscriptions: &[String]) -> Self {
        combine(vec![Part {
            meta: meta_of([(META_TYPE, Value::from(TYPE_LOGIN))]),
            data: Some(serde_json::json!({
                "name": name,
                "subscriptions": subscriptions,
            })),
        }])
    }

    /// Subscription request for a single channel
    pub fn subscribe(channel: &str) -> Self {
        combine(vec![Part {
            meta: meta_of([(META_TYPE, Value::from(TYPE_SUBSCRIBE))]),
            data: Some(serde_json::json!({ "channel": channel })),
        }])
    }

    /// Publication of `data` into `group`
    pub fn send(group: Value, data: Value, inre: Option<&str>, session: Option<&str>) -> Self {
        combine(vec![
            Part {
                meta: meta_of([
                    (META_TYPE, Value::from(TYPE_SEND)),
                    (META_GROUP, group),
                    (META_INRE, inre.map(Value::from).unwrap_or(Value::Null)),
                    (META_SESSION, session.map(Value::from).unwrap_or(Value::Null)),
                ]),
                data: None,
            },
            Part {
                meta: Meta::new(),
                data: Some(data),
            },
        ])
    }

    /// Successful reply to this message, addressed to `groups`
    pub fn success(&self, groups: Vec<String>, data: Value) -> Self {
        self.reply(groups, RESULT_SUCCESS, None, data)
    }

    /// Failed reply to this message, addressed to `groups`
    pub fn failure(&self, groups: Vec<String>, reason: &str) -> Self {
        self.reply(groups, RESULT_FAILURE, Some(reason), Value::Null)
    }

    fn reply(&self, groups: Vec<String>, result: &str, reason: Option<&str>, data: Value) -> Self {
        let id = self.id();
        let envelope = Self::send(Value::from(groups), Value::Null, Some(&id), None);
        combine(vec![
            Part {
                meta: envelope.meta,
                data: None,
            },
            Part {
                meta: meta_of([
                    (META_REPLY_TO, Value::from(id)),
                    (META_RESULT, Value::from(result)),
                    (META_REASON, reason.map(Value::from).unwrap_or(Value::Null)),
                ]),
                data: Some(data),
            },
        ])
    }
}
