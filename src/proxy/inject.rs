use crate::ai::types::{ChatMessage, ContentPart};
use crate::prompts;

/// Index right after the leading run of system/developer messages.
pub fn injection_index(messages: &[ChatMessage]) -> usize {
    messages.iter().take_while(|m| m.is_system()).count()
}

/// Insert one user message carrying the annotation and the image, returning its index.
pub fn inject_image(messages: &mut Vec<ChatMessage>, image_url: String) -> usize {
    let index = injection_index(messages);
    messages.insert(
        index,
        ChatMessage::parts(
            "user",
            vec![
                ContentPart::Text {
                    text: prompts::image_annotation().to_string(),
                },
                ContentPart::image(image_url),
            ],
        ),
    );
    index
}
