use std::env;
use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use shrike_runtime::harness::{load_fixture, run_fixture, HarnessOutput};

const USAGE: &str = "\
state_harness --fixture <path> [options]
    -f, --fixture <path>       fixture to run (required)
    -g, --golden <path>        compare the run against a recorded output
    -o, --write-output <path>  record the run to a JSON file
    -h, --help                 show this text";

fn main() {
    if let Err(err) = run() {
        eprintln!("[state-harness] {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let opts = Options::from_env()?;
    let fixture = load_fixture(&opts.fixture)?;
    let output = run_fixture(&fixture)?;

    if let Some(path) = &opts.record {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
        }
        let file = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
        serde_json::to_writer_pretty(file, &output).context("encoding harness output")?;
        println!("[state-harness] recorded {}", path.display());
    }

    match &opts.golden {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("opening golden '{}'", path.display()))?;
            let golden: HarnessOutput =
                serde_json::from_reader(file).context("decoding golden output")?;
            if golden != output {
                bail!(
                    "run of {} diverges from golden {} (re-record with --write-output)\n--- golden ---\n{}\n--- actual ---\n{}",
                    opts.fixture.display(),
                    path.display(),
                    serde_json::to_string_pretty(&golden).unwrap_or_default(),
                    serde_json::to_string_pretty(&output).unwrap_or_default(),
                );
            }
            println!("[state-harness] {} matches {}", opts.fixture.display(), path.display());
        }
        None if opts.record.is_none() => {
            serde_json::to_writer_pretty(std::io::stdout().lock(), &output)?;
            println!();
        }
        None => {}
    }

    Ok(())
}

struct Options {
    fixture: PathBuf,
    golden: Option<PathBuf>,
    record: Option<PathBuf>,
}

impl Options {
    fn from_env() -> Result<Self> {
        let mut fixture = None;
        let mut golden = None;
        let mut record = None;
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-f" | "--fixture" => fixture = Some(path_value(&mut args, &arg)?),
                "-g" | "--golden" => golden = Some(path_value(&mut args, &arg)?),
                "-o" | "--write-output" => record = Some(path_value(&mut args, &arg)?),
                "-h" | "--help" => {
                    println!("{USAGE}");
                    std::process::exit(0);
                }
                other => bail!("unrecognized argument '{other}'\n{USAGE}"),
            }
        }
        let fixture = fixture.ok_or_else(|| anyhow!("a fixture is required\n{USAGE}"))?;
        Ok(Self { fixture, golden, record })
    }
}

fn path_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<PathBuf> {
    args.next().map(PathBuf::from).ok_or_else(|| anyhow!("{flag} expects a path"))
}
