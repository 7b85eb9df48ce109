pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockGenerator, ScriptedGenerator};
pub use openai::OpenAiGenerator;
pub use traits::{
    parse_generation, ContextMessage, ContextRole, Generation, PromptContext, TextGenerator,
};
