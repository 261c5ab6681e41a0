/// Inline keyboard (buttons) attached to an outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }

    /// One button per row, labels truncated to `max_label_len` characters.
    pub fn one_per_row(options: &[(String, String)], max_label_len: usize) -> Self {
        let buttons = options
            .iter()
            .map(|(label, data)| {
                let label = if label.chars().count() > max_label_len {
                    format!("{}...", label.chars().take(max_label_len).collect::<String>())
                } else {
                    label.clone()
                };
                InlineButton {
                    label,
                    callback_data: data.clone(),
                }
            })
            .collect();
        Self { buttons }
    }
}

/// Capabilities / limits of a transport implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_delete: bool,
    pub supports_inline_keyboards: bool,
    pub max_message_len: usize,
}

/// Split `text` into pieces of at most `max_chars` characters, cutting after
/// the last line break that fits and mid-line only when a line is too long.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while let Some((limit, _)) = rest.char_indices().nth(max_chars) {
        let cut = match rest[..limit].rfind('\n') {
            Some(i) if i > 0 => i + 1,
            _ => limit,
        };
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
