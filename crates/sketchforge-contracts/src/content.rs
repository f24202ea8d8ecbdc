/// One part of a multimodal model response, in the order the model emitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

impl InlineData {
    /// True when the payload is non-empty and not declared as something other
    /// than an image.
    pub fn is_image(&self) -> bool {
        if self.data.is_empty() {
            return false;
        }
        match self.mime_type.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(mime) => mime.to_ascii_lowercase().starts_with("image/"),
        }
    }
}

/// First part carrying inline image bytes. Text parts and non-image inline
/// payloads are skipped; later image parts are never considered.
pub fn first_inline_image(parts: &[ContentPart]) -> Option<&InlineData> {
    parts.iter().find_map(|part| match part {
        ContentPart::InlineData(inline) if inline.is_image() => Some(inline),
        _ => None,
    })
}

/// Text parts joined with newlines, for logging what the model said alongside
/// the image.
pub fn joined_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(text) => Some(text.trim()),
            ContentPart::InlineData(_) => None,
        })
        .filter(|text| !text.is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
}
