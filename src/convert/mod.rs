mod pipeline;
pub mod render;

pub use pipeline::{convert, ConvertOutcome, ConvertRequest, OutputFormat, MAX_SELECTOR_LEN};
pub use render::{html_to_markdown, html_to_text, markdown_to_text, Rendered};
