//! Typed values that flow between steps.
//!
//! A [`Payload`] is a closed set of kinds. Every variant holds either one item
//! of its kind or an ordered sequence of them, which together with the kind
//! forms the payload's [`PayloadShape`]. On the wire a payload is written as
//! `{"kind": "Text", "value": "..."}` or `{"kind": "Text", "value": ["...", "..."]}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// One item or an ordered sequence of items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Items<T> {
    /// An ordered sequence
    Many(Vec<T>),
    /// A single item
    One(T),
}

impl<T> Items<T> {
    /// Whether this holds a sequence
    pub fn is_many(&self) -> bool {
        matches!(self, Items::Many(_))
    }

    /// Number of items held
    pub fn len(&self) -> usize {
        match self {
            Items::Many(items) => items.len(),
            Items::One(_) => 1,
        }
    }

    /// Whether this is an empty sequence
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Turn a single item into a one-element sequence; sequences are unchanged
    pub fn into_many(self) -> Self {
        match self {
            Items::One(item) => Items::Many(vec![item]),
            many => many,
        }
    }

    /// Consume into a vector of items
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Items::Many(items) => items,
            Items::One(item) => vec![item],
        }
    }

    /// Borrow the items in order
    pub fn as_slice(&self) -> &[T] {
        match self {
            Items::Many(items) => items.as_slice(),
            Items::One(item) => std::slice::from_ref(item),
        }
    }
}

/// Text rendering of a [`FormattedText`] payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFormat {
    /// Markdown
    Markdown,
    /// Plain text
    Plain,
}

/// Text with an explicit format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedText {
    /// Rendering format
    pub format: TextFormat,
    /// Text content
    pub content: String,
}

/// A fetched web page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebPage {
    /// Page URL
    pub url: String,
    /// Page title, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Extracted text content
    pub text_content: String,
}

/// An entity proposed by an action but not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedEntity {
    /// Identifier local to the proposing flow
    pub local_entity_id: String,
    /// Versioned URLs of the entity's types
    pub entity_type_ids: Vec<String>,
    /// Property values keyed by base URL
    pub properties: serde_json::Value,
    /// Source entity when this proposes a link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_entity_local_id: Option<String>,
    /// Target entity when this proposes a link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity_local_id: Option<String>,
}

/// An entity that exists in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntity {
    /// Graph entity id
    pub entity_id: String,
    /// Versioned URLs of the entity's types
    pub entity_type_ids: Vec<String>,
    /// Property values keyed by base URL
    pub properties: serde_json::Value,
}

macro_rules! payload_kinds {
    ($($(#[$doc:meta])* $variant:ident => $item:ty),* $(,)?) => {
        /// A typed value passed between steps
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "kind", content = "value")]
        pub enum Payload {
            $($(#[$doc])* $variant(Items<$item>),)*
        }

        /// The kind of a [`Payload`], independent of array-ness
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum PayloadKind {
            $($(#[$doc])* $variant,)*
        }

        impl PayloadKind {
            /// Every payload kind
            pub const ALL: &'static [PayloadKind] = &[$(PayloadKind::$variant,)*];
        }

        impl fmt::Display for PayloadKind {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(PayloadKind::$variant => f.write_str(stringify!($variant)),)*
                }
            }
        }

        impl Payload {
            /// The payload's kind
            pub fn kind(&self) -> PayloadKind {
                match self {
                    $(Payload::$variant(_) => PayloadKind::$variant,)*
                }
            }

            /// Whether the payload holds a sequence
            pub fn is_array(&self) -> bool {
                match self {
                    $(Payload::$variant(items) => items.is_many(),)*
                }
            }

            /// Number of items, 1 for a single value
            pub fn len(&self) -> usize {
                match self {
                    $(Payload::$variant(items) => items.len(),)*
                }
            }

            /// Wrap a single value into a one-element array. Arrays are returned unchanged.
            pub fn wrap_to_array(self) -> Payload {
                match self {
                    $(Payload::$variant(items) => Payload::$variant(items.into_many()),)*
                }
            }

            /// Split into one single-valued payload per item, in order
            pub fn elements(&self) -> Vec<Payload> {
                match self {
                    $(Payload::$variant(items) => items
                        .as_slice()
                        .iter()
                        .cloned()
                        .map(|item| Payload::$variant(Items::One(item)))
                        .collect(),)*
                }
            }

            /// An empty array of the given kind
            pub fn empty_array(kind: PayloadKind) -> Payload {
                match kind {
                    $(PayloadKind::$variant => Payload::$variant(Items::Many(Vec::new())),)*
                }
            }

            /// Concatenate payloads of one kind into a single array, flattening one level
            pub fn concat(
                kind: PayloadKind,
                parts: impl IntoIterator<Item = Payload>,
            ) -> Result<Payload, CoreError> {
                match kind {
                    $(PayloadKind::$variant => {
                        let mut merged = Vec::new();
                        for part in parts {
                            match part {
                                Payload::$variant(items) => merged.extend(items.into_vec()),
                                other => {
                                    return Err(CoreError::PayloadError(format!(
                                        "cannot aggregate {} into {}",
                                        other.kind(),
                                        kind
                                    )))
                                }
                            }
                        }
                        Ok(Payload::$variant(Items::Many(merged)))
                    })*
                }
            }
        }
    };
}

payload_kinds! {
    /// Plain text
    Text => String,
    /// A number
    Number => f64,
    /// A boolean
    Boolean => bool,
    /// A versioned type URL
    VersionedUrl => String,
    /// A graph entity id
    EntityId => String,
    /// An entity proposal
    ProposedEntity => ProposedEntity,
    /// A persisted entity
    PersistedEntity => PersistedEntity,
    /// A fetched web page
    WebPage => WebPage,
    /// Formatted text
    FormattedText => FormattedText,
}

/// Kind plus array-ness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadShape {
    /// Payload kind
    pub kind: PayloadKind,
    /// Whether the payload is an array
    pub array: bool,
}

impl fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.array {
            write!(f, "{}[]", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl Payload {
    /// Kind and array-ness
    pub fn shape(&self) -> PayloadShape {
        PayloadShape {
            kind: self.kind(),
            array: self.is_array(),
        }
    }

    /// Single text value
    pub fn text(value: impl Into<String>) -> Payload {
        Payload::Text(Items::One(value.into()))
    }

    /// Array of text values
    pub fn texts<I, S>(values: I) -> Payload
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Payload::Text(Items::Many(values.into_iter().map(Into::into).collect()))
    }

    /// Single number value
    pub fn number(value: f64) -> Payload {
        Payload::Number(Items::One(value))
    }

    /// Single boolean value
    pub fn boolean(value: bool) -> Payload {
        Payload::Boolean(Items::One(value))
    }

    /// Bring the payload to the array-ness a consumer declares.
    ///
    /// A single value flowing into an array slot is wrapped. An array flowing
    /// into a single-value slot is rejected.
    pub fn coerce_to(self, array: bool) -> Result<Payload, CoreError> {
        match (array, self.is_array()) {
            (true, false) => Ok(self.wrap_to_array()),
            (false, true) => Err(CoreError::PayloadError(format!(
                "an array of {} cannot be passed to a single-value input",
                self.kind()
            ))),
            _ => Ok(self),
        }
    }
}
