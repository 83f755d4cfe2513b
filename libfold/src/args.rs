//! A hand-written parser for our arguments. Argument order matters to a
//! linker (inputs are resolved in command-line order and that order decides
//! symbol tie-breaks), so we don't reach for a declarative parser.

use crate::error::Result;
use anyhow::anyhow;
use anyhow::bail;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;

pub struct Args {
    pub(crate) inputs: Vec<Input>,
    pub(crate) lib_search_path: Vec<Box<Path>>,
    pub output: PathBuf,
    pub(crate) pie: bool,
    pub(crate) relax: bool,
    pub(crate) icf: bool,
    pub(crate) print_icf_sections: bool,
    pub(crate) trace_symbols: Vec<String>,
    pub(crate) num_threads: NonZeroUsize,
    pub(crate) time_phases: bool,
}

pub enum Action {
    Link(Args),
    Version,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Input {
    File(Box<Path>),
    Lib(Box<str>),
}

// Flags that don't affect our behaviour, accepted so that we can be used as a
// drop-in replacement in existing build setups.
const IGNORED_FLAGS: &[&str] = &[
    "--start-group",
    "--end-group",
    "--gc-sections",
    "--eh-frame-hdr",
    "--as-needed",
    "--no-as-needed",
    "-nostdlib",
];

pub fn from_env() -> Result<Action> {
    parse(std::env::args())
}

// Parses the supplied arguments, including the program name.
pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut inputs = Vec::new();
    let mut lib_search_path = Vec::new();
    let mut output = None;
    let mut pie = false;
    let mut relax = true;
    let mut icf = true;
    let mut print_icf_sections = false;
    let mut trace_symbols = Vec::new();
    let mut num_threads = None;
    let mut time_phases = false;
    let mut action = None;

    // Skip the program name.
    input.next();
    while let Some(arg) = input.next() {
        let arg = arg.as_ref();
        if let Some(rest) = arg.strip_prefix("-L") {
            if rest.is_empty() {
                if let Some(next) = input.next() {
                    lib_search_path.push(Box::from(Path::new(next.as_ref())));
                }
            } else {
                lib_search_path.push(Box::from(Path::new(rest)));
            }
        } else if let Some(rest) = arg.strip_prefix("-l") {
            inputs.push(Input::Lib(Box::from(rest)));
        } else if arg == "-o" {
            output = input.next().map(|a| PathBuf::from(a.as_ref()));
        } else if arg == "-pie" || arg == "--pie" {
            pie = true;
        } else if arg == "--relax" {
            relax = true;
        } else if arg == "--no-relax" {
            relax = false;
        } else if arg == "--icf" || arg == "--icf=all" {
            icf = true;
        } else if arg == "--no-icf" || arg == "--icf=none" {
            icf = false;
        } else if arg == "--print-icf-sections" {
            print_icf_sections = true;
        } else if let Some(rest) = arg.strip_prefix("--trace-symbol=") {
            trace_symbols.push(rest.to_owned());
        } else if arg == "--trace-symbol" || arg == "-y" {
            if let Some(next) = input.next() {
                trace_symbols.push(next.as_ref().to_owned());
            }
        } else if let Some(rest) = arg.strip_prefix("--threads=") {
            num_threads = Some(NonZeroUsize::try_from(rest.parse::<usize>()?)?);
        } else if arg == "--time" {
            time_phases = true;
        } else if arg == "--version" || arg == "-v" {
            action = Some(Action::Version);
        } else if arg == "-m" || arg == "-z" || arg == "-plugin" {
            input.next();
        } else if arg.starts_with("--hash-style=")
            || arg.starts_with("--build-id")
            || arg.starts_with("-plugin-opt=")
            || arg.starts_with("-O")
        {
        } else if IGNORED_FLAGS.contains(&arg) {
        } else if arg.starts_with('-') && arg.len() > 1 {
            bail!("Unrecognised argument `{arg}`");
        } else {
            inputs.push(Input::File(Box::from(Path::new(arg))));
        }
    }

    if let Some(action) = action {
        return Ok(action);
    }
    let num_threads = num_threads.unwrap_or_else(|| {
        std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
    });
    Ok(Action::Link(Args {
        inputs,
        lib_search_path,
        output: output.ok_or_else(|| anyhow!("Missing required argument -o"))?,
        pie,
        relax,
        icf,
        print_icf_sections,
        trace_symbols,
        num_threads,
        time_phases,
    }))
}

impl Args {
    pub(crate) fn setup_thread_pool(&self) -> Result {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads.get())
            .build_global()?;
        Ok(())
    }

    pub(crate) fn base_address(&self) -> u64 {
        if self.pie {
            0
        } else {
            crate::elf::NON_PIE_START_MEM_ADDRESS
        }
    }

    #[cfg(test)]
    pub(crate) fn for_testing() -> Args {
        Args {
            inputs: Vec::new(),
            lib_search_path: Vec::new(),
            output: PathBuf::from("/dev/null"),
            pie: false,
            relax: true,
            icf: true,
            print_icf_sections: false,
            trace_symbols: Vec::new(),
            num_threads: NonZeroUsize::new(2).unwrap(),
            time_phases: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT1: &[&str] = &[
        "fold",
        "-pie",
        "-z",
        "now",
        "--hash-style=gnu",
        "--build-id",
        "--eh-frame-hdr",
        "-m",
        "elf_x86_64",
        "-o",
        "/tmp/out",
        "/usr/lib/crt1.o",
        "-L/usr/lib",
        "-L",
        "/lib",
        "main.o",
        "--start-group",
        "-lc",
        "-lm",
        "--end-group",
        "--no-relax",
        "--trace-symbol=main",
        "--threads=3",
    ];

    #[test]
    fn parse_link_invocation() {
        let Action::Link(args) = parse(INPUT1.iter()).unwrap() else {
            panic!("Unexpected action");
        };
        assert!(args.pie);
        assert!(!args.relax);
        assert!(args.icf);
        assert_eq!(args.output, PathBuf::from("/tmp/out"));
        assert_eq!(args.num_threads.get(), 3);
        assert_eq!(args.trace_symbols, ["main"]);
        assert_eq!(
            args.inputs,
            [
                Input::File(Box::from(Path::new("/usr/lib/crt1.o"))),
                Input::File(Box::from(Path::new("main.o"))),
                Input::Lib(Box::from("c")),
                Input::Lib(Box::from("m")),
            ]
        );
        assert_eq!(args.lib_search_path.len(), 2);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse(["fold", "--definitely-not-a-flag", "-o", "x"].iter()).is_err());
    }
}
