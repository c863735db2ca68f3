use serde::Serialize;
use serde_json::{Map, Value};

/// The next `dev/data` message, accumulated between sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Payload {
    pub value: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl Payload {
    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.value.insert(name.into(), value.into());
    }

    /// Replaces the whole value object.
    pub fn set_object(&mut self, object: Map<String, Value>) {
        self.value = object;
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .get_or_insert_with(Vec::new)
            .extend(tags.into_iter().map(Into::into));
    }

    /// Hands out the accumulated payload and leaves an empty one behind.
    pub fn take(&mut self) -> Payload {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.model.is_none() && self.tags.is_none()
    }
}
