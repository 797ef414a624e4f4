// MIDI - event model, tempo track and file codecs
// Binary Standard MIDI Files via midly plus a hand-editable text format

pub mod event;
pub mod tempo;
pub mod codec;
pub mod text;

pub use event::{
    EventKind, InvalidEventError, MetaEvent, MidiEvent, MidiFile, MidiFormat, MidiTrack,
    SmpteOffset, CC_PAN, CC_REVERB, CC_VOLUME,
};
pub use tempo::{TempoEntry, TempoEntryConfig, TempoTrack, TempoTrackError};
pub use codec::{decode, encode, read_file, write_file, EncodeError, MalformedFileError};
pub use text::{from_text, to_text, ParseError};
