use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::info;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vxmaster::{
    mastered_file_name, AudioBuffer, MasteringJob, MasteringReport, MixSpec, OutputPreset,
    PresetManager,
};

const USAGE: &str = "usage: vxmaster-render <vocal.wav> <beat.wav> [-o out.wav] \
[--preset NAME] [--spec spec.json] [--report report.json] [--timeout SECS]";

#[derive(Debug, Default)]
struct Args {
    vocal: PathBuf,
    beat: PathBuf,
    output: Option<PathBuf>,
    preset: Option<OutputPreset>,
    spec: Option<PathBuf>,
    report: Option<PathBuf>,
    timeout: Option<Duration>,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().with_context(|| format!("{arg} needs a value\n{USAGE}"));
        match arg.as_str() {
            "-o" | "--output" => args.output = Some(PathBuf::from(value()?)),
            "--preset" => {
                let name = value()?;
                args.preset = Some(
                    OutputPreset::from_name(&name)
                        .with_context(|| format!("unknown preset '{name}'"))?,
                );
            }
            "--spec" => args.spec = Some(PathBuf::from(value()?)),
            "--report" => args.report = Some(PathBuf::from(value()?)),
            "--timeout" => {
                let secs: f64 = value()?.parse().context("--timeout expects seconds")?;
                if !(secs.is_finite() && secs > 0.0) {
                    bail!("--timeout must be a positive number of seconds");
                }
                args.timeout = Some(Duration::from_secs_f64(secs));
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ if arg.starts_with('-') => bail!("unknown option '{arg}'\n{USAGE}"),
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    match <[PathBuf; 2]>::try_from(positional) {
        Ok([vocal, beat]) => {
            args.vocal = vocal;
            args.beat = beat;
            Ok(args)
        }
        Err(_) => bail!("expected a vocal and a beat file\n{USAGE}"),
    }
}

fn read_wav(path: &Path) -> Result<(AudioBuffer, WavSpec)> {
    let reader =
        WavReader::open(path).with_context(|| format!("failed to open WAV '{}'", path.display()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, bits @ (16 | 24 | 32)) => {
            let scale = 1.0 / (1u64 << (bits - 1)) as f64;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v as f64 * scale) as f32))
                .collect::<std::result::Result<_, _>>()?
        }
        (format, bits) => bail!(
            "'{}': unsupported sample format {:?} {}-bit",
            path.display(),
            format,
            bits
        ),
    };
    let buffer = AudioBuffer::from_interleaved(&interleaved, spec.channels as usize, spec.sample_rate)
        .with_context(|| format!("'{}' is not a usable audio file", path.display()))?;
    Ok((buffer, spec))
}

fn write_wav(path: &Path, buffer: &AudioBuffer, like: WavSpec) -> Result<()> {
    let spec = WavSpec {
        channels: buffer.channel_count() as u16,
        sample_rate: buffer.sample_rate(),
        ..like
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create '{}'", path.display()))?;
    let samples = buffer.to_interleaved();
    match spec.sample_format {
        SampleFormat::Float => {
            for s in samples {
                writer.write_sample(s)?;
            }
        }
        SampleFormat::Int => {
            let full = ((1u64 << (spec.bits_per_sample - 1)) - 1) as f64;
            for s in samples {
                writer.write_sample((s as f64 * full).round() as i32)?;
            }
        }
    }
    writer.finalize()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args()?;

    let mut spec = match &args.spec {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read mix spec '{}'", path.display()))?;
            MixSpec::from_json(&json)?
        }
        None => MixSpec::default(),
    };
    if let Some(preset) = args.preset {
        info!("preset: {} ({})", preset.name(), preset.description());
        spec = PresetManager::global().apply(preset, spec);
    }

    let (vocal, wav_spec) = read_wav(&args.vocal)?;
    let (beat, _) = read_wav(&args.beat)?;
    info!(
        "vocal {:.2}s, beat {:.2}s at {} Hz -> {:.1} LUFS",
        vocal.duration_secs(),
        beat.duration_secs(),
        vocal.sample_rate(),
        spec.target_lufs
    );

    let mut job = MasteringJob::new(vocal, beat, spec);
    if let Some(timeout) = args.timeout {
        job = job.with_timeout(timeout);
    }
    let out = job.run().context("mastering failed")?;

    let output = match args.output {
        Some(path) => path,
        None => {
            let name = args
                .vocal
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            args.vocal
                .with_file_name(mastered_file_name(out.vocal_plan.static_gain_db, &name))
        }
    };
    write_wav(&output, &out.buffer, wav_spec)?;
    info!("wrote '{}'", output.display());

    let report = MasteringReport::from_output(&out).to_json()?;
    if let Some(path) = &args.report {
        std::fs::write(path, &report)
            .with_context(|| format!("failed to write report '{}'", path.display()))?;
    }
    println!("{report}");
    Ok(())
}
