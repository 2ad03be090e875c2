mod apex;
mod assembler;
mod classify;
mod template;

pub use assembler::{write_patch, Assembler, Patch, ScriptInput, ScriptOutput};
pub use classify::classify;
pub use template::{render, Fragments, Placeholder, TemplateContext};
