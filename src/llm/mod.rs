pub mod gemini;
pub mod media;

pub use gemini::{generate_character_sheet, generate_new_image, generate_yaml_prompt, GeneratedOutput};
pub use media::ImageFile;
