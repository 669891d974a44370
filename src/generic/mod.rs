mod render_file;

pub use render_file::{CheckFileContentsTask, DEFAULT_ENCODING, RenderFileTask, render_file};
