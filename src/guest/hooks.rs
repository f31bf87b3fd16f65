//! Optional payload inspection for automatic spans.
//!
//! Which fields are worth tagging is a deployment decision, so nothing is
//! tagged unless a tagger is configured.

use crate::span::Tag;

pub trait PayloadTagger: Send + Sync {
    fn tag(&self, payload: &[u8]) -> Vec<Tag>;
}

/// Tags selected top-level fields of a JSON object payload.
pub struct JsonFieldTagger {
    fields: Vec<String>,
}

impl JsonFieldTagger {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl PayloadTagger for JsonFieldTagger {
    fn tag(&self, payload: &[u8]) -> Vec<Tag> {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return vec![Tag::new("payload.json", "invalid")],
        };
        let object = match value.as_object() {
            Some(o) => o,
            None => return Vec::new(),
        };

        self.fields
            .iter()
            .filter_map(|field| {
                object.get(field).map(|v| {
                    let rendered = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Tag::new(field.clone(), rendered)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_field_tagger() {
        let tagger = JsonFieldTagger::new(vec!["brand".into(), "price".into(), "missing".into()]);
        let tags = tagger.tag(br#"{"brand":"Apple","price":549,"stock":94}"#);
        assert_eq!(tags, vec![Tag::new("brand", "Apple"), Tag::new("price", "549")]);
    }

    #[test]
    fn test_invalid_json_is_marked() {
        let tagger = JsonFieldTagger::new(vec!["brand".into()]);
        assert_eq!(tagger.tag(b"not json"), vec![Tag::new("payload.json", "invalid")]);
        assert!(tagger.tag(b"[1,2]").is_empty());
    }
}
