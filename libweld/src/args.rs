//! Command line argument parsing. We accept a subset of what GNU ld accepts
//! and ignore (with a warning) a handful of flags that compiler drivers pass
//! but that we don't need.

use crate::error::Result;
use crate::error::bail;
use std::path::PathBuf;

pub struct Args {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub pie: bool,
    pub relax: bool,
    pub icf: bool,
    pub print_icf_sections: bool,
    pub num_threads: usize,
}

// Flags that take a separate value argument and that we ignore.
const IGNORED_WITH_VALUE: &[&str] = &["--dynamic-linker", "-dynamic-linker", "-z", "-m", "--plugin"];

const IGNORED: &[&str] = &[
    "--eh-frame-hdr",
    "--as-needed",
    "--no-as-needed",
    "--gc-sections",
    "--start-group",
    "--end-group",
    "--fatal-warnings",
];

impl Default for Args {
    fn default() -> Args {
        Args {
            inputs: Vec::new(),
            output: PathBuf::from("a.out"),
            pie: false,
            relax: true,
            icf: false,
            print_icf_sections: false,
            num_threads: 0,
        }
    }
}

impl Args {
    pub fn from_env() -> Result<Args> {
        Args::parse(std::env::args().skip(1))
    }

    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Args> {
        let mut args = Args::default();
        while let Some(arg) = input.next() {
            let arg = arg.as_ref();
            let mut take_value = |name| -> Result<String> {
                match input.next() {
                    Some(v) => Ok(v.as_ref().to_owned()),
                    None => bail!("missing argument to {name}"),
                }
            };
            match arg {
                "-o" | "--output" => args.output = PathBuf::from(take_value(arg)?),
                "-pie" | "--pie" => args.pie = true,
                "--no-pie" => args.pie = false,
                "--relax" => args.relax = true,
                "--no-relax" => args.relax = false,
                "--icf" | "--icf=all" => args.icf = true,
                "--no-icf" | "--icf=none" => args.icf = false,
                "--print-icf-sections" => args.print_icf_sections = true,
                "--threads" | "--thread-count" => {
                    args.num_threads = take_value(arg)?.parse()?;
                }
                _ if IGNORED_WITH_VALUE.contains(&arg) => {
                    let _ = take_value(arg)?;
                    tracing::warn!("ignoring unsupported argument {arg}");
                }
                _ if IGNORED.contains(&arg) || arg.starts_with("--hash-style") => {
                    tracing::warn!("ignoring unsupported argument {arg}");
                }
                _ if arg.starts_with('-') && arg.len() > 1 => {
                    bail!("unrecognized argument: {arg}");
                }
                _ => args.inputs.push(PathBuf::from(arg)),
            }
        }
        if args.inputs.is_empty() {
            bail!("no input files");
        }
        Ok(args)
    }

    pub fn setup_thread_pool(&self) -> Result {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build_global()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Args;

    #[test]
    fn basic_args() {
        let args = Args::parse(["-o", "out", "--pie", "--icf", "a.o", "b.o"].into_iter()).unwrap();
        assert_eq!(args.output.as_os_str(), "out");
        assert!(args.pie);
        assert!(args.icf);
        assert!(args.relax);
        assert_eq!(args.inputs.len(), 2);
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(Args::parse(["--definitely-not-a-flag", "a.o"].into_iter()).is_err());
    }

    #[test]
    fn no_inputs_is_an_error() {
        assert!(Args::parse(["-o", "out"].into_iter()).is_err());
    }
}
