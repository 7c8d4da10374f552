/// Text sent alongside an injected image.
pub const IMAGE_ANNOTATION: &str = include_str!("../data/prompts/image_annotation.txt");

/// The annotation without the trailing newline of the prompt file.
pub fn image_annotation() -> &'static str {
    IMAGE_ANNOTATION.trim()
}
