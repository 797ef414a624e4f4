// Command Collaborators - external renderer and mixer processes
// Command lines are templates with ${name} placeholders

use super::mixdown::{MixError, MixJob, StemMixer};
use super::stem::{RenderError, RenderJob, StemRenderer};
use std::process::{Command, ExitStatus, Output};

/// Longest stderr excerpt kept in an error
const STDERR_EXCERPT: usize = 400;

/// Replace `${name}` placeholders; unknown names stay as written
pub fn expand_template(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match vars.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + end + 3]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Split a command line into words; single or double quotes group words
pub fn split_command(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Words of a template, each expanded on its own so values with blanks stay one argument
fn expand_words(template: &str, vars: &[(&str, String)]) -> Vec<String> {
    split_command(template)
        .iter()
        .map(|word| expand_template(word, vars))
        .collect()
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

fn stderr_excerpt(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_EXCERPT);
    text.chars().skip(skip).collect()
}

fn run(args: &[String]) -> std::io::Result<Output> {
    log::debug!("Running: {}", args.join(" "));
    Command::new(&args[0]).args(&args[1..]).output()
}

/// Renderer driven by a command template
///
/// Variables: `${voice}`, `${infile}`, `${outfile}`, `${instrument}`,
/// `${effects}` and `${reverb}`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    template: String,
}

impl CommandRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        CommandRenderer {
            template: template.into(),
        }
    }

    pub fn arguments(&self, job: &RenderJob) -> Vec<String> {
        let vars = [
            ("voice", job.voice.clone()),
            ("infile", job.midi_path.display().to_string()),
            ("outfile", job.stem_path.display().to_string()),
            ("instrument", job.instrument.clone()),
            ("effects", job.effects.clone()),
            ("reverb", format!("{}", job.reverb)),
        ];
        expand_words(&self.template, &vars)
    }
}

impl StemRenderer for CommandRenderer {
    fn render(&self, job: &RenderJob) -> Result<(), RenderError> {
        let args = self.arguments(job);
        if args.is_empty() {
            return Err(RenderError::EmptyCommand);
        }

        let output = run(&args).map_err(|source| RenderError::Spawn {
            voice: job.voice.clone(),
            program: args[0].clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(RenderError::ExitStatus {
                voice: job.voice.clone(),
                status: describe_status(output.status),
                stderr: stderr_excerpt(&output),
            });
        }
        if !job.stem_path.is_file() {
            return Err(RenderError::MissingOutput {
                voice: job.voice.clone(),
                path: job.stem_path.clone(),
            });
        }
        Ok(())
    }
}

/// Mixer driven by a command template
///
/// The bracketed part is repeated once per stem with `${voice}`,
/// `${infile}`, `${factor}` (linear gain), `${balance}` and `${shift}`.
/// The rest may use `${target}` and `${outfile}`, e.g.
/// `sox -m [-v ${factor} ${infile}] ${outfile}`.
#[derive(Debug, Clone)]
pub struct CommandMixer {
    head: String,
    repeated: String,
    tail: String,
}

impl CommandMixer {
    pub fn new(template: &str) -> Self {
        let bracket = template
            .find('[')
            .and_then(|open| template[open..].find(']').map(|close| (open, open + close)));
        match bracket {
            Some((open, close)) => CommandMixer {
                head: template[..open].to_string(),
                repeated: template[open + 1..close].to_string(),
                tail: template[close + 1..].to_string(),
            },
            None => CommandMixer {
                head: template.to_string(),
                repeated: String::new(),
                tail: String::new(),
            },
        }
    }

    pub fn arguments(&self, job: &MixJob) -> Vec<String> {
        let outer = [
            ("target", job.target.clone()),
            ("outfile", job.output_path.display().to_string()),
        ];
        let mut args = expand_words(&self.head, &outer);
        for input in &job.inputs {
            let vars = [
                ("voice", input.voice.clone()),
                ("infile", input.stem_path.display().to_string()),
                ("factor", format!("{:.4}", super::wav::db_to_factor(input.volume_db))),
                ("balance", format!("{}", input.balance)),
                ("shift", format!("{:.3}", input.shift_seconds)),
            ];
            args.extend(expand_words(&self.repeated, &vars));
        }
        args.extend(expand_words(&self.tail, &outer));
        args
    }
}

impl StemMixer for CommandMixer {
    fn mix(&self, job: &MixJob) -> Result<(), MixError> {
        if job.inputs.is_empty() {
            return Err(MixError::NoInputs(job.target.clone()));
        }
        let args = self.arguments(job);
        if args.is_empty() {
            return Err(MixError::EmptyCommand);
        }

        let output = run(&args).map_err(|source| MixError::Spawn {
            program: args[0].clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(MixError::ExitStatus {
                status: describe_status(output.status),
                stderr: stderr_excerpt(&output),
            });
        }
        if !job.output_path.is_file() {
            return Err(MixError::MissingOutput(job.output_path.clone()));
        }
        Ok(())
    }
}
