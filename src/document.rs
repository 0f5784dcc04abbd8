//! Document ids, operations and the in-flight document representation.
//!
//! A document id follows the `id:<namespace>:<type>:<attribute>:<local-id>`
//! scheme, where the attribute is empty, `g=<group>` or `n=<number>`, and
//! the local id may itself contain colons. Ids are constructed only by
//! [`DocumentId::parse`] and are immutable afterwards.

use std::fmt;

use bytes::Bytes;

/// Error produced when a document id string does not match the id scheme.
#[derive(Debug, thiserror::Error)]
#[error("invalid document id '{input}': {reason} (expected id:<namespace>:<type>:[g=<group>|n=<number>]:<local-id>)")]
pub struct IdParseError {
    pub input: String,
    pub reason: String,
}

impl IdParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed document id.
///
/// At most one of `group`/`number` is set, depending on the attribute part
/// of the id string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentId {
    pub namespace: String,
    pub doc_type: String,
    pub group: Option<String>,
    pub number: Option<i64>,
    pub local_id: String,
}

impl DocumentId {
    /// Parse an `id:...` string into its structured parts.
    ///
    /// No normalization or escaping is performed beyond the split; URL
    /// escaping happens in the HTTP layer.
    pub fn parse(input: &str) -> Result<Self, IdParseError> {
        let mut parts = input.splitn(5, ':');
        let scheme = parts.next().unwrap_or_default();
        let namespace = parts.next();
        let doc_type = parts.next();
        let attribute = parts.next();
        let local_id = parts.next();

        if scheme != "id" {
            return Err(IdParseError::new(input, format!("scheme '{scheme}' is not 'id'")));
        }
        let (Some(namespace), Some(doc_type), Some(attribute), Some(local_id)) =
            (namespace, doc_type, attribute, local_id)
        else {
            return Err(IdParseError::new(input, "fewer than 5 colon-separated parts"));
        };
        if namespace.is_empty() {
            return Err(IdParseError::new(input, "empty namespace"));
        }
        if doc_type.is_empty() {
            return Err(IdParseError::new(input, "empty document type"));
        }
        if local_id.is_empty() {
            return Err(IdParseError::new(input, "empty local id"));
        }

        let (group, number) = match attribute {
            "" => (None, None),
            a if a.starts_with("g=") => {
                let g = &a[2..];
                if g.is_empty() {
                    return Err(IdParseError::new(input, "empty group in 'g=' attribute"));
                }
                (Some(g.to_string()), None)
            }
            a if a.starts_with("n=") => {
                let n = a[2..].parse::<i64>().map_err(|e| {
                    IdParseError::new(input, format!("'n=' attribute is not an integer: {e}"))
                })?;
                (None, Some(n))
            }
            other => {
                return Err(IdParseError::new(
                    input,
                    format!("attribute '{other}' is not empty, 'g=<group>' or 'n=<number>'"),
                ));
            }
        };

        Ok(Self {
            namespace: namespace.to_string(),
            doc_type: doc_type.to_string(),
            group,
            number,
            local_id: local_id.to_string(),
        })
    }

    /// Path segments for the document API, in order:
    /// `<namespace>/<type>/[group/<g>/|number/<n>/]docid/<local-id>`.
    ///
    /// Returned as segments so the HTTP layer can escape each one.
    pub fn path_segments(&self) -> Vec<String> {
        let mut segments = vec![self.namespace.clone(), self.doc_type.clone()];
        if let Some(group) = &self.group {
            segments.push("group".to_string());
            segments.push(group.clone());
        } else if let Some(number) = self.number {
            segments.push("number".to_string());
            segments.push(number.to_string());
        }
        segments.push("docid".to_string());
        segments.push(self.local_id.clone());
        segments
    }

    /// The rendered (unescaped) document API path.
    pub fn url_path(&self) -> String {
        self.path_segments().join("/")
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attribute = match (&self.group, self.number) {
            (Some(g), _) => format!("g={g}"),
            (None, Some(n)) => format!("n={n}"),
            (None, None) => String::new(),
        };
        write!(
            f,
            "id:{}:{}:{}:{}",
            self.namespace, self.doc_type, attribute, self.local_id
        )
    }
}

/// The operation to apply to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Full replace. Sent as POST with a body.
    Put,
    /// Partial field merge. Sent as PUT with a body.
    Update,
    /// Delete. Sent as DELETE, no body.
    Remove,
    /// Fetch. Sent as GET, no body.
    Get,
}

impl Operation {
    /// Whether the operation carries a request body.
    pub fn has_body(self) -> bool {
        matches!(self, Operation::Put | Operation::Update)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Put => "put",
            Operation::Update => "update",
            Operation::Remove => "remove",
            Operation::Get => "get",
        }
    }
}

/// One document operation, ready to dispatch.
///
/// `body` is the verbatim `{"fields": ...}` payload for put/update and
/// `None` for bodyless operations. A document is constructed once,
/// consumed exactly once by the dispatcher, and not reused.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub operation: Operation,
    pub body: Option<Bytes>,
    /// Test-and-set condition forwarded as the `condition` query parameter.
    pub condition: Option<String>,
    /// For updates: create the document if it does not exist.
    pub create: bool,
}

impl Document {
    pub fn new(id: DocumentId, operation: Operation, body: Option<Bytes>) -> Self {
        Self {
            id,
            operation,
            body,
            condition: None,
            create: false,
        }
    }
}
