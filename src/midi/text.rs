// MIDI Text Format - line-oriented dump of a MIDI file for hand editing
// One event per line: absolute tick, kind keyword, kind-specific fields

use super::event::{
    EventKind, InvalidEventError, MetaEvent, MidiEvent, MidiFile, MidiFormat, MidiTrack,
    SmpteOffset,
};
use thiserror::Error;

/// Malformed text input, naming the offending line (1-based)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        ParseError {
            line,
            message: message.into(),
        }
    }
}

const MAJOR_KEYS: [&str; 15] = [
    "Cb", "Gb", "Db", "Ab", "Eb", "Bb", "F", "C", "G", "D", "A", "E", "B", "F#", "C#",
];
const MINOR_KEYS: [&str; 15] = [
    "Ab", "Eb", "Bb", "F", "C", "G", "D", "A", "E", "B", "F#", "C#", "G#", "D#", "A#",
];

/// Render a MIDI file in the text format
pub fn to_text(file: &MidiFile) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "MFile {} {} {}",
        file.format.as_u16(),
        file.tracks.len(),
        file.ticks_per_quarter
    ));
    for track in &file.tracks {
        lines.push("MTrk".to_string());
        for event in track.events() {
            lines.push(format!("{} {}", event.tick(), event_text(event.kind())));
        }
        lines.push("TrkEnd".to_string());
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

fn event_text(kind: &EventKind) -> String {
    match kind {
        EventKind::NoteOn { channel, key, velocity } => {
            format!("On ch={} n={} v={}", channel + 1, key, velocity)
        }
        EventKind::NoteOff { channel, key, velocity } => {
            format!("Off ch={} n={} v={}", channel + 1, key, velocity)
        }
        EventKind::PolyPressure { channel, key, pressure } => {
            format!("PolyPress ch={} n={} v={}", channel + 1, key, pressure)
        }
        EventKind::ControlChange { channel, controller, value } => {
            format!("Par ch={} c={} v={}", channel + 1, controller, value)
        }
        EventKind::ProgramChange { channel, program } => {
            format!("PrCh ch={} p={}", channel + 1, program)
        }
        EventKind::ChannelPressure { channel, pressure } => {
            format!("ChanPress ch={} v={}", channel + 1, pressure)
        }
        EventKind::PitchBend { channel, value } => {
            format!("PitchWhl ch={} v={}", channel + 1, value)
        }
        EventKind::SysEx(data) => with_hex("SysEx", data),
        EventKind::Escape(data) => with_hex("SysExEnd", data),
        EventKind::Meta(meta) => format!("Meta {}", meta_text(meta)),
    }
}

fn with_hex(keyword: &str, data: &[u8]) -> String {
    if data.is_empty() {
        keyword.to_string()
    } else {
        format!("{} {}", keyword, hex::encode(data))
    }
}

fn meta_text(meta: &MetaEvent) -> String {
    match meta {
        MetaEvent::SequenceNumber(None) => "SeqNum".to_string(),
        MetaEvent::SequenceNumber(Some(n)) => format!("SeqNum {}", n),
        MetaEvent::Text(b) => format!("Text {}", quote(b)),
        MetaEvent::Copyright(b) => format!("Copyright {}", quote(b)),
        MetaEvent::TrackName(b) => format!("TrkName {}", quote(b)),
        MetaEvent::InstrumentName(b) => format!("InstrName {}", quote(b)),
        MetaEvent::Lyric(b) => format!("Lyric {}", quote(b)),
        MetaEvent::Marker(b) => format!("Marker {}", quote(b)),
        MetaEvent::CuePoint(b) => format!("CuePt {}", quote(b)),
        MetaEvent::ProgramName(b) => format!("PrgName {}", quote(b)),
        MetaEvent::DeviceName(b) => format!("DevName {}", quote(b)),
        MetaEvent::ChannelPrefix(c) => format!("ChanPrfx {}", c + 1),
        MetaEvent::Port(p) => format!("Port {}", p),
        MetaEvent::EndOfTrack => "TrkEnd".to_string(),
        MetaEvent::Tempo(t) => format!("Tempo {}", t),
        MetaEvent::SmpteOffset(s) => format!(
            "SMPTE fps={} hr={} mn={} se={} fr={} ff={}",
            s.fps, s.hour, s.minute, s.second, s.frame, s.subframe
        ),
        MetaEvent::TimeSignature {
            numerator,
            denominator_pow,
            clocks_per_click,
            thirty_seconds_per_quarter,
        } => format!(
            "TimeSig {}/{} {} {}",
            numerator,
            1u16 << denominator_pow,
            clocks_per_click,
            thirty_seconds_per_quarter
        ),
        MetaEvent::KeySignature { sharps, minor } => match key_name(*sharps, *minor) {
            Some(name) => format!("KeySig {}", name),
            None => format!("KeySig sf={} mi={}", sharps, u8::from(*minor)),
        },
        MetaEvent::SequencerSpecific(b) => with_hex("SeqSpec", b),
        MetaEvent::Unknown { kind, data } => with_hex(&format!("Raw t={}", kind), data),
    }
}

fn key_name(sharps: i8, minor: bool) -> Option<String> {
    let index = usize::try_from(sharps as i16 + 7).ok()?;
    if minor {
        MINOR_KEYS.get(index).map(|k| format!("{}m", k))
    } else {
        MAJOR_KEYS.get(index).map(|k| k.to_string())
    }
}

/// Quote bytes; backslash, quote and non-printable bytes are escaped
fn quote(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
    out
}

/// Parse a quoted string; the whole input must be one quoted token
fn unquote(input: &str) -> Result<Vec<u8>, String> {
    let inner = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .filter(|_| input.len() >= 2)
        .ok_or_else(|| format!("expected a quoted string, found {:?}", input))?;

    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => out.push(b'\\'),
                Some('"') => out.push(b'"'),
                Some('x') => {
                    let digits: String = chars.by_ref().take(2).collect();
                    let byte = u8::from_str_radix(&digits, 16)
                        .map_err(|_| format!("bad escape \\x{}", digits))?;
                    out.push(byte);
                }
                other => return Err(format!("unknown escape \\{}", other.unwrap_or(' '))),
            },
            '"' => return Err("unescaped quote inside string".to_string()),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    Ok(out)
}

/// Parse the text format back into a MIDI file
///
/// Blank lines and lines starting with `#` are ignored.
pub fn from_text(text: &str) -> Result<MidiFile, ParseError> {
    let mut header: Option<(MidiFormat, usize, u16)> = None;
    let mut tracks: Vec<MidiTrack> = Vec::new();
    let mut current: Option<Vec<MidiEvent>> = None;
    let mut last_line = 0;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        last_line = line_no;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err = |message: String| ParseError::new(line_no, message);

        let Some(declared) = header.map(|(_, count, _)| count) else {
            header = Some(parse_header(line).map_err(err)?);
            continue;
        };

        match (line, current.as_mut()) {
            ("MTrk", None) => {
                if tracks.len() == declared {
                    return Err(err(format!("more than the {} declared tracks", declared)));
                }
                current = Some(Vec::new());
            }
            ("MTrk", Some(_)) => return Err(err("MTrk inside an open track".to_string())),
            ("TrkEnd", Some(_)) => {
                let events = current.take().unwrap_or_default();
                tracks.push(MidiTrack::from_events(events));
            }
            ("TrkEnd", None) => return Err(err("TrkEnd without MTrk".to_string())),
            (_, None) => return Err(err(format!("expected MTrk, found {:?}", line))),
            (_, Some(events)) => {
                let event = parse_event(line).map_err(err)?;
                if let Some(previous) = events.last() {
                    if event.tick() < previous.tick() {
                        return Err(err(format!(
                            "tick {} is before the previous tick {}",
                            event.tick(),
                            previous.tick()
                        )));
                    }
                }
                events.push(event);
            }
        }
    }

    let Some((format, declared, ticks_per_quarter)) = header else {
        return Err(ParseError::new(last_line.max(1), "missing MFile header"));
    };
    if current.is_some() {
        return Err(ParseError::new(last_line, "track not closed with TrkEnd"));
    }
    if tracks.len() != declared {
        return Err(ParseError::new(
            last_line,
            format!("header declares {} tracks, found {}", declared, tracks.len()),
        ));
    }
    Ok(MidiFile::new(format, ticks_per_quarter, tracks))
}

fn parse_header(line: &str) -> Result<(MidiFormat, usize, u16), String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["MFile", format, count, resolution] => {
            let format = parse_number::<u16>(format)
                .ok()
                .and_then(MidiFormat::from_u16)
                .ok_or_else(|| format!("invalid format {:?}", format))?;
            let count = parse_number::<usize>(count)?;
            let resolution = parse_number::<u16>(resolution)?;
            if resolution == 0 || resolution > 0x7FFF {
                return Err(format!("ticks per quarter {} out of range", resolution));
            }
            Ok((format, count, resolution))
        }
        _ => Err(format!("expected 'MFile <format> <tracks> <ticks>', found {:?}", line)),
    }
}

fn parse_number<T: std::str::FromStr>(token: &str) -> Result<T, String> {
    token
        .parse::<T>()
        .map_err(|_| format!("invalid number {:?}", token))
}

/// Values of `key=value` tokens, which must appear exactly in `keys` order
fn fields(tokens: &[&str], keys: &[&str]) -> Result<Vec<u32>, String> {
    if tokens.len() != keys.len() {
        return Err(format!(
            "expected fields {}, found {:?}",
            keys.iter().map(|k| format!("{}=", k)).collect::<Vec<_>>().join(" "),
            tokens.join(" ")
        ));
    }
    tokens
        .iter()
        .zip(keys)
        .map(|(token, key)| {
            let value = token
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .ok_or_else(|| format!("expected {}=, found {:?}", key, token))?;
            parse_number::<u32>(value)
        })
        .collect()
}

fn byte(value: u32) -> Result<u8, String> {
    u8::try_from(value).map_err(|_| format!("value {} out of range", value))
}

/// Convert a 1-based channel field
fn channel(value: u32) -> Result<u8, String> {
    if (1..=16).contains(&value) {
        Ok((value - 1) as u8)
    } else {
        Err(format!("channel {} out of range (1-16)", value))
    }
}

fn hex_payload(tokens: &[&str]) -> Result<Vec<u8>, String> {
    match tokens {
        [] => Ok(Vec::new()),
        [data] => hex::decode(data).map_err(|e| format!("invalid hex data: {}", e)),
        _ => Err("expected a single hex token".to_string()),
    }
}

fn parse_event(line: &str) -> Result<MidiEvent, String> {
    let (tick_token, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("expected '<tick> <kind> ...', found {:?}", line))?;
    let tick = parse_number::<i64>(tick_token)?;
    let rest = rest.trim_start();
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let Some((&keyword, args)) = tokens.split_first() else {
        return Err("missing event kind".to_string());
    };

    let kind = match keyword {
        "On" | "Off" | "PolyPress" => {
            let v = fields(args, &["ch", "n", "v"])?;
            let (channel, key, value) = (channel(v[0])?, byte(v[1])?, byte(v[2])?);
            match keyword {
                "On" => EventKind::NoteOn { channel, key, velocity: value },
                "Off" => EventKind::NoteOff { channel, key, velocity: value },
                _ => EventKind::PolyPressure { channel, key, pressure: value },
            }
        }
        "Par" => {
            let v = fields(args, &["ch", "c", "v"])?;
            EventKind::ControlChange {
                channel: channel(v[0])?,
                controller: byte(v[1])?,
                value: byte(v[2])?,
            }
        }
        "PrCh" => {
            let v = fields(args, &["ch", "p"])?;
            EventKind::ProgramChange {
                channel: channel(v[0])?,
                program: byte(v[1])?,
            }
        }
        "ChanPress" => {
            let v = fields(args, &["ch", "v"])?;
            EventKind::ChannelPressure {
                channel: channel(v[0])?,
                pressure: byte(v[1])?,
            }
        }
        "PitchWhl" => {
            let v = fields(args, &["ch", "v"])?;
            EventKind::PitchBend {
                channel: channel(v[0])?,
                value: u16::try_from(v[1]).map_err(|_| format!("value {} out of range", v[1]))?,
            }
        }
        "SysEx" => EventKind::SysEx(hex_payload(args)?),
        "SysExEnd" => EventKind::Escape(hex_payload(args)?),
        "Meta" => {
            let meta_rest = rest.strip_prefix("Meta").unwrap_or(rest).trim_start();
            EventKind::Meta(parse_meta(meta_rest)?)
        }
        other => return Err(format!("unknown event kind {:?}", other)),
    };

    MidiEvent::new(tick, kind).map_err(|e: InvalidEventError| e.to_string())
}

fn parse_meta(rest: &str) -> Result<MetaEvent, String> {
    let (keyword, args_text) = match rest.split_once(char::is_whitespace) {
        Some((keyword, args)) => (keyword, args.trim()),
        None => (rest, ""),
    };
    let args: Vec<&str> = args_text.split_whitespace().collect();

    let text = |build: fn(Vec<u8>) -> MetaEvent| unquote(args_text).map(build);

    match keyword {
        "SeqNum" => match args.as_slice() {
            [] => Ok(MetaEvent::SequenceNumber(None)),
            [n] => Ok(MetaEvent::SequenceNumber(Some(parse_number(n)?))),
            _ => Err("expected at most one sequence number".to_string()),
        },
        "Text" => text(MetaEvent::Text),
        "Copyright" => text(MetaEvent::Copyright),
        "TrkName" => text(MetaEvent::TrackName),
        "InstrName" => text(MetaEvent::InstrumentName),
        "Lyric" => text(MetaEvent::Lyric),
        "Marker" => text(MetaEvent::Marker),
        "CuePt" => text(MetaEvent::CuePoint),
        "PrgName" => text(MetaEvent::ProgramName),
        "DevName" => text(MetaEvent::DeviceName),
        "ChanPrfx" => match args.as_slice() {
            [c] => Ok(MetaEvent::ChannelPrefix(channel(parse_number(c)?)?)),
            _ => Err("expected a channel".to_string()),
        },
        "Port" => match args.as_slice() {
            [p] => Ok(MetaEvent::Port(parse_number(p)?)),
            _ => Err("expected a port number".to_string()),
        },
        "TrkEnd" if args.is_empty() => Ok(MetaEvent::EndOfTrack),
        "Tempo" => match args.as_slice() {
            [t] => Ok(MetaEvent::Tempo(parse_number(t)?)),
            _ => Err("expected microseconds per quarter note".to_string()),
        },
        "SMPTE" => {
            let v = fields(&args, &["fps", "hr", "mn", "se", "fr", "ff"])?;
            Ok(MetaEvent::SmpteOffset(SmpteOffset {
                fps: byte(v[0])?,
                hour: byte(v[1])?,
                minute: byte(v[2])?,
                second: byte(v[3])?,
                frame: byte(v[4])?,
                subframe: byte(v[5])?,
            }))
        }
        "TimeSig" => parse_time_signature(&args),
        "KeySig" => parse_key_signature(&args),
        "SeqSpec" => Ok(MetaEvent::SequencerSpecific(hex_payload(&args)?)),
        "Raw" => {
            let (kind_token, data) = args
                .split_first()
                .ok_or_else(|| "expected t=<type>".to_string())?;
            let kind = fields(&[*kind_token], &["t"])?;
            Ok(MetaEvent::Unknown {
                kind: byte(kind[0])?,
                data: hex_payload(data)?,
            })
        }
        other => Err(format!("unknown meta event {:?}", other)),
    }
}

fn parse_time_signature(args: &[&str]) -> Result<MetaEvent, String> {
    let [fraction, clocks, thirty_seconds] = args else {
        return Err("expected 'TimeSig n/d clocks 32nds'".to_string());
    };
    let (numerator, denominator) = fraction
        .split_once('/')
        .ok_or_else(|| format!("invalid time signature {:?}", fraction))?;
    let numerator: u8 = parse_number(numerator)?;
    let denominator: u16 = parse_number(denominator)?;
    if !denominator.is_power_of_two() || denominator > 128 {
        return Err(format!("denominator {} is not a power of two", denominator));
    }
    Ok(MetaEvent::TimeSignature {
        numerator,
        denominator_pow: denominator.trailing_zeros() as u8,
        clocks_per_click: parse_number(clocks)?,
        thirty_seconds_per_quarter: parse_number(thirty_seconds)?,
    })
}

fn parse_key_signature(args: &[&str]) -> Result<MetaEvent, String> {
    match args {
        [name] => {
            let (table, key) = match name.strip_suffix('m') {
                Some(key) => (&MINOR_KEYS, key),
                None => (&MAJOR_KEYS, *name),
            };
            let index = table
                .iter()
                .position(|k| *k == key)
                .ok_or_else(|| format!("unknown key {:?}", name))?;
            Ok(MetaEvent::KeySignature {
                sharps: index as i8 - 7,
                minor: name.ends_with('m'),
            })
        }
        [sharps, minor] => {
            let sharps = sharps
                .strip_prefix("sf=")
                .ok_or_else(|| format!("expected sf=, found {:?}", sharps))?;
            let minor = fields(&[*minor], &["mi"])?;
            Ok(MetaEvent::KeySignature {
                sharps: parse_number(sharps)?,
                minor: minor[0] != 0,
            })
        }
        _ => Err("expected a key name or 'sf=<n> mi=<0|1>'".to_string()),
    }
}
