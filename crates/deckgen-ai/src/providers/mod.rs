mod common;
mod gemini;

pub use gemini::GeminiAdapter;
