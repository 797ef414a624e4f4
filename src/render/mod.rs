// Render Engine - stems from voice MIDI files and their mixdown
// Renderer and mixer are collaborators behind traits; external commands or hound

pub mod stem;
pub mod mixdown;
pub mod command;
pub mod wav;
pub mod cache;

// Re-export main types
pub use stem::{AudioTrack, RenderError, RenderJob, StemRenderer};
pub use mixdown::{MixError, MixInput, MixJob, StemMixer};
pub use command::{CommandMixer, CommandRenderer};
pub use wav::WavMixer;
pub use cache::{stem_paths, StemPaths};
