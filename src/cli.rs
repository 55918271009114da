//! CLI argument parsing for calltrace

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Library call tracer: filters calls and correlates return values", long_about = None)]
pub struct Cli {
    /// TOML configuration file (flags below override it)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// White/black list filter file
    #[arg(short = 'f', long = "filter-file", value_name = "FILE")]
    pub filter_file: Option<PathBuf>,

    /// Flush the whole return value cache once it holds N records (0 = off)
    #[arg(long = "max-cache-size", value_name = "N")]
    pub max_cache_size: Option<usize>,

    /// Capacity of the return value cache
    #[arg(long = "cache-capacity", value_name = "N")]
    pub cache_capacity: Option<usize>,

    /// One line per call (`call = value`) for use with grep
    #[arg(long = "grepable")]
    pub grepable: bool,

    /// Trace log path, or - for stderr
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<String>,

    /// Read string return values from this live process
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<i32>,

    /// Print the filter decision for MODULE!FUNCTION and exit
    #[arg(long = "check", value_name = "MODULE!FUNCTION")]
    pub check: Option<String>,

    /// Enable debug logging of the tracer itself
    #[arg(long = "debug")]
    pub debug: bool,

    /// Recorded event script (JSON lines)
    #[arg(value_name = "SCRIPT")]
    pub script: Option<PathBuf>,
}
