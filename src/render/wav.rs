// WAV Mixer - in-process mixdown of rendered stems
// Gain, balance and shift per stem, then peak normalization to 16-bit stereo

use super::mixdown::{MixError, MixJob, StemMixer};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Full scale of a 16-bit sample
const FULL_SCALE: f64 = 32767.0;

/// Decibel per doubling of amplitude
const DB_PER_DOUBLING: f64 = 6.0206;

/// Stereo frames scaled to the 16-bit range
#[derive(Debug, Clone, PartialEq)]
pub struct StereoAudio {
    pub sample_rate: u32,
    pub frames: Vec<[f64; 2]>,
}

/// Linear gain for a level in decibel
pub fn db_to_factor(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Left and right factors for a balance in -1.0..=1.0
pub fn balance_factors(balance: f64) -> (f64, f64) {
    let balance = balance.clamp(-1.0, 1.0);
    let left = if balance < 0.0 { 1.0 } else { 1.0 - balance };
    let right = if balance > 0.0 { 1.0 } else { 1.0 + balance };
    (left, right)
}

/// Scale bringing `peak` to full scale raised by `amplification_db`
///
/// Near-silent mixes (peak below a tenth of full scale) are left alone.
pub fn normalization_factor(peak: f64, amplification_db: f64) -> f64 {
    if peak <= FULL_SCALE / 10.0 {
        1.0
    } else {
        FULL_SCALE * 2f64.powf(amplification_db / DB_PER_DOUBLING) / peak
    }
}

/// Prepend silence for a positive shift, drop leading frames for a negative one
pub fn shift_audio(audio: StereoAudio, seconds: f64) -> StereoAudio {
    let count = (audio.sample_rate as f64 * seconds.abs()).round() as usize;
    let frames = if seconds >= 0.0 {
        let mut shifted = vec![[0.0; 2]; count];
        shifted.extend(audio.frames);
        shifted
    } else {
        audio.frames.into_iter().skip(count).collect()
    };
    StereoAudio {
        sample_rate: audio.sample_rate,
        frames,
    }
}

/// Read a PCM or float WAV file as stereo; mono is duplicated, extra channels dropped
pub fn read_stereo(path: &Path) -> Result<StereoAudio, MixError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f64> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(f64::from))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits @ (8 | 24 | 32)) => {
            let scale = 32768.0 / 2f64.powi(bits as i32 - 1);
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f64 * scale))
                .collect::<Result<_, _>>()?
        }
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|s| s as f64 * FULL_SCALE))
            .collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(MixError::UnsupportedFormat {
                path: path.to_path_buf(),
                format: format!("{:?} {}-bit", format, bits),
            })
        }
    };

    let channels = spec.channels.max(1) as usize;
    let frames = samples
        .chunks_exact(channels)
        .map(|frame| {
            let left = frame[0];
            let right = if channels > 1 { frame[1] } else { left };
            [left, right]
        })
        .collect();

    Ok(StereoAudio {
        sample_rate: spec.sample_rate,
        frames,
    })
}

/// Write 16-bit stereo, clamping to full scale
pub fn write_stereo(path: &Path, audio: &StereoAudio) -> Result<(), MixError> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for frame in &audio.frames {
        for sample in frame {
            writer.write_sample(sample.round().clamp(-FULL_SCALE, FULL_SCALE) as i16)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Mixer that sums stems with hound instead of an external tool
#[derive(Debug, Clone, Default)]
pub struct WavMixer {
    /// Level above full scale the mix is normalized to (0 = full scale)
    pub amplification_db: f64,
}

impl WavMixer {
    pub fn new(amplification_db: f64) -> Self {
        WavMixer { amplification_db }
    }
}

impl StemMixer for WavMixer {
    fn mix(&self, job: &MixJob) -> Result<(), MixError> {
        if job.inputs.is_empty() {
            return Err(MixError::NoInputs(job.target.clone()));
        }

        let mut sample_rate: Option<u32> = None;
        let mut mixed: Vec<[f64; 2]> = Vec::new();

        for input in &job.inputs {
            let stem = read_stereo(&input.stem_path)?;
            let expected = *sample_rate.get_or_insert(stem.sample_rate);
            if stem.sample_rate != expected {
                return Err(MixError::SampleRateMismatch {
                    path: input.stem_path.clone(),
                    expected,
                    found: stem.sample_rate,
                });
            }

            let stem = shift_audio(stem, input.shift_seconds);
            let gain = db_to_factor(input.volume_db);
            let (left, right) = balance_factors(input.balance);

            if mixed.len() < stem.frames.len() {
                mixed.resize(stem.frames.len(), [0.0; 2]);
            }
            for (out, frame) in mixed.iter_mut().zip(&stem.frames) {
                out[0] += frame[0] * gain * left;
                out[1] += frame[1] * gain * right;
            }
        }

        let peak = mixed
            .iter()
            .flat_map(|frame| frame.iter())
            .fold(0.0f64, |max, s| max.max(s.abs()));
        let factor = normalization_factor(peak, self.amplification_db);
        log::info!(
            "Mixing {} stems for '{}': peak {:.0}, normalization {:.3}",
            job.inputs.len(),
            job.target,
            peak,
            factor
        );

        let audio = StereoAudio {
            sample_rate: sample_rate.unwrap_or(44_100),
            frames: mixed
                .into_iter()
                .map(|[l, r]| [l * factor, r * factor])
                .collect(),
        };
        write_stereo(&job.output_path, &audio)
    }
}
