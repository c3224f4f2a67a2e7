//! Compiler command line classification.
//!
//! Only enough of the gcc/clang option grammar is understood to decide whether
//! an invocation can be offloaded: the mode (compile, preprocess, link), the
//! source files, and the output path. Anything unusual compiles locally.

use std::fmt;
use std::path::{Path, PathBuf};

/// Options whose value is the next argument when not attached.
const OPTIONS_WITH_VALUE: &[&str] = &[
    "-o",
    "-I",
    "-D",
    "-U",
    "-include",
    "-imacros",
    "-isystem",
    "-iquote",
    "-idirafter",
    "-iprefix",
    "-iwithprefix",
    "-isysroot",
    "--sysroot",
    "-x",
    "-MF",
    "-MT",
    "-MQ",
    "-arch",
    "-target",
    "-L",
    "-Xclang",
    "-Xpreprocessor",
    "-Xassembler",
    "-Xlinker",
    "-aux-info",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// `-c`: one translation unit to an object file.
    Compile,
    /// `-E`, `-M`, `-MM`: preprocessor only.
    Preprocess,
    /// `-S`: stop after generating assembly.
    Assemble,
    /// No stop option: compile and link.
    Link,
    /// A command line we cannot reason about (response files, dangling
    /// options).
    Invalid,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compile => "compile",
            Self::Preprocess => "preprocess",
            Self::Assemble => "assemble",
            Self::Link => "link",
            Self::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    Cxx,
    ObjC,
    ObjCxx,
    /// Already preprocessed (`.i`, `.ii`).
    Preprocessed,
    Assembler,
}

impl Language {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "c" => Some(Self::C),
            "cc" | "cp" | "cpp" | "cxx" | "c++" | "C" | "CPP" => Some(Self::Cxx),
            "m" => Some(Self::ObjC),
            "mm" | "M" => Some(Self::ObjCxx),
            "i" | "ii" => Some(Self::Preprocessed),
            "s" | "S" | "sx" => Some(Self::Assembler),
            _ => None,
        }
    }

    /// Language named by `-x`.
    pub fn from_x_option(value: &str) -> Option<Self> {
        match value {
            "c" | "c-header" => Some(Self::C),
            "c++" | "c++-header" => Some(Self::Cxx),
            "objective-c" => Some(Self::ObjC),
            "objective-c++" => Some(Self::ObjCxx),
            "cpp-output" | "c++-cpp-output" => Some(Self::Preprocessed),
            "assembler" | "assembler-with-cpp" => Some(Self::Assembler),
            _ => None,
        }
    }

    /// Whether a remote worker can compile this language from preprocessed
    /// source.
    pub fn is_remotable(self) -> bool {
        matches!(self, Self::C | Self::Cxx | Self::ObjC | Self::ObjCxx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub language: Language,
}

/// `-x none` goes back to guessing from the extension.
fn x_option(value: &str) -> Option<Option<Language>> {
    (value != "none").then(|| Language::from_x_option(value))
}

/// A parsed compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerInvocation {
    /// The compiler as it was invoked, e.g. `gcc` or `/usr/bin/clang++`.
    pub argv0: String,
    /// Arguments after `argv0`, with `--fisk-*` flags already removed.
    pub args: Vec<String>,
    pub mode: InvocationMode,
    pub sources: Vec<SourceFile>,
    pub output: Option<String>,
    /// A `-` source: input is read from stdin.
    pub stdin_source: bool,
}

impl CompilerInvocation {
    pub fn parse(argv0: impl Into<String>, args: Vec<String>) -> Self {
        let mut mode = InvocationMode::Link;
        let mut stop_rank = 0;
        let mut sources = Vec::new();
        let mut output = None;
        let mut stdin_source = false;
        let mut forced_language: Option<Option<Language>> = None;
        let mut invalid = false;

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let arg = arg.as_str();
            // -E beats -S beats -c, whatever the order.
            let stop = match arg {
                "-E" | "-M" | "-MM" => Some((3, InvocationMode::Preprocess)),
                "-S" => Some((2, InvocationMode::Assemble)),
                "-c" => Some((1, InvocationMode::Compile)),
                _ => None,
            };
            if let Some((rank, stop_mode)) = stop {
                if rank > stop_rank {
                    stop_rank = rank;
                    mode = stop_mode;
                }
                continue;
            }

            if arg.starts_with('@') {
                invalid = true;
                continue;
            }
            if arg == "-" {
                stdin_source = true;
                continue;
            }
            if OPTIONS_WITH_VALUE.contains(&arg) {
                let Some(value) = iter.next() else {
                    invalid = true;
                    break;
                };
                match arg {
                    "-o" => output = Some(value.clone()),
                    "-x" => forced_language = x_option(value),
                    _ => {}
                }
                continue;
            }
            if let Some(value) = arg.strip_prefix("-o") {
                output = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("-x") {
                forced_language = x_option(value);
                continue;
            }
            if arg.starts_with('-') {
                continue;
            }

            let language = match forced_language {
                Some(language) => language,
                None => Path::new(arg)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .and_then(Language::from_extension),
            };
            if let Some(language) = language {
                sources.push(SourceFile {
                    path: arg.to_string(),
                    language,
                });
            }
        }

        Self {
            argv0: argv0.into(),
            args,
            mode: if invalid { InvocationMode::Invalid } else { mode },
            sources,
            output,
            stdin_source,
        }
    }

    /// Why this invocation cannot go remote, if it cannot.
    pub fn local_reason(&self) -> Option<String> {
        if self.mode != InvocationMode::Compile {
            return Some(format!("{} mode", self.mode));
        }
        if self.stdin_source {
            return Some("source read from stdin".to_string());
        }
        match self.sources.as_slice() {
            [] => Some("no source file".to_string()),
            [source] if !source.language.is_remotable() => {
                Some(format!("{:?} source {}", source.language, source.path))
            }
            [_] => None,
            many => Some(format!("{} source files", many.len())),
        }
    }

    /// The single source file of a remotable compile.
    pub fn source_file(&self) -> Option<&str> {
        match self.sources.as_slice() {
            [source] => Some(source.path.as_str()),
            _ => None,
        }
    }

    /// Arguments that run only the preprocessor, writing to stdout.
    pub fn preprocess_args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-c" => {}
                "-o" => {
                    iter.next();
                }
                other if other.starts_with("-o") => {}
                _ => out.push(arg.clone()),
            }
        }
        out.push("-E".to_string());
        out
    }

    /// Command line sent to the worker, with the scheduler's extra arguments.
    pub fn remote_command_line(&self, extra_args: &[String]) -> Vec<String> {
        self.args.iter().chain(extra_args).cloned().collect()
    }

    /// Where the primary compiler output goes: `-o`, or the source's stem with
    /// `.o` in the working directory.
    pub fn object_output(&self) -> Option<PathBuf> {
        if let Some(output) = &self.output {
            return Some(PathBuf::from(output));
        }
        let source = self.source_file()?;
        let stem = Path::new(source).file_stem()?;
        Some(PathBuf::from(stem).with_extension("o"))
    }
}
