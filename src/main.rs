use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use csv_ext_sort::buffer::mem::MemoryLimitedBufferBuilder;
use csv_ext_sort::{
    Dialect, ExternalSorter, ExternalSorterBuilder, KeyOrder, LimitedBufferBuilder, MergePolicy, RunBufferBuilder,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = path::Path::new(arg_parser.value_of("input").expect("value is required"));
    let output = path::Path::new(arg_parser.value_of("output").expect("value is required"));

    let sorted = match arg_parser.value_of("memory_limit") {
        Some(memory_limit) => {
            let memory_limit = memory_limit.parse::<ByteSize>().expect("value is pre-validated").as_u64();
            sort(configure(&arg_parser, MemoryLimitedBufferBuilder::new(memory_limit)), input, output)
        }
        None => {
            let batch_size: usize = arg_parser.value_of_t_or_exit("batch_size");
            sort(configure(&arg_parser, LimitedBufferBuilder::new(batch_size, false)), input, output)
        }
    };

    if let Err(err) = sorted {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn configure<B: RunBufferBuilder>(arg_parser: &clap::ArgMatches, buffer: B) -> ExternalSorterBuilder<B> {
    let policy: Policy = arg_parser.value_of_t_or_exit("policy");
    let delimiter = parse_delimiter(arg_parser.value_of("delimiter").expect("value has default"))
        .expect("value is pre-validated");

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_buffer(buffer)
        .with_dialect(Dialect::default().with_delimiter(delimiter))
        .with_merge_policy(policy.into());

    if arg_parser.is_present("numeric") {
        sorter_builder = sorter_builder.with_key_order(KeyOrder::Numeric);
    }

    if arg_parser.is_present("threads") {
        sorter_builder = sorter_builder.with_threads_number(arg_parser.value_of_t_or_exit("threads"));
    }

    if arg_parser.is_present("fan_in") {
        sorter_builder = sorter_builder.with_fan_in(arg_parser.value_of_t_or_exit("fan_in"));
    }

    if let Some(tmp_dir) = arg_parser.value_of("tmp_dir") {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    return sorter_builder;
}

fn sort<B: RunBufferBuilder>(
    sorter_builder: ExternalSorterBuilder<B>,
    input: &path::Path,
    output: &path::Path,
) -> Result<(), String> {
    let sorter: ExternalSorter<B> = sorter_builder
        .build()
        .map_err(|err| format!("sorter initialization error: {}", err))?;

    sorter
        .sort(input, output)
        .map_err(|err| format!("data sorting error: {}", err))?;

    return Ok(());
}

fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "\\t" | "tab" => Ok(b'\t'),
        _ if value.len() == 1 && value.is_ascii() => Ok(value.as_bytes()[0]),
        _ => Err(format!("delimiter must be a single ASCII character: {:?}", value)),
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Policy {
    Kway,
    Binary,
}

impl Policy {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl From<Policy> for MergePolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Kway => MergePolicy::KWay,
            Policy::Binary => MergePolicy::BinaryTree,
        }
    }
}

impl std::str::FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Policy as clap::ArgEnum>::from_str(s, false)
    }
}

fn is_number(value: &str) -> Result<(), String> {
    match value.parse::<usize>() {
        Ok(0) => Err("value must be positive".to_string()),
        Ok(_) => Ok(()),
        Err(err) => Err(format!("number format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::Command::new("csv-ext-sort")
        .about("sorts a delimited record file by its first field using external merge sort")
        .arg(
            clap::Arg::new("input")
                .help("file to be sorted")
                .required(true)
                .index(1),
        )
        .arg(
            clap::Arg::new("output")
                .help("result file, replaced if exists")
                .required(true)
                .index(2),
        )
        .arg(
            clap::Arg::new("batch_size")
                .short('b')
                .long("batch-size")
                .help("number of records sorted in memory at once")
                .takes_value(true)
                .default_value("100000")
                .validator(is_number),
        )
        .arg(
            clap::Arg::new("memory_limit")
                .short('m')
                .long("memory-limit")
                .help("memory used by records sorted at once, overrides batch size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory limit format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("policy")
                .short('p')
                .long("policy")
                .help("runs merge policy")
                .takes_value(true)
                .default_value("kway")
                .possible_values(Policy::possible_values()),
        )
        .arg(
            clap::Arg::new("fan_in")
                .short('f')
                .long("fan-in")
                .help("maximum number of runs merged at once by the kway policy")
                .takes_value(true)
                .validator(is_number),
        )
        .arg(
            clap::Arg::new("numeric")
                .short('n')
                .long("numeric")
                .help("compare keys as numbers"),
        )
        .arg(
            clap::Arg::new("delimiter")
                .long("delimiter")
                .help("field delimiter")
                .takes_value(true)
                .default_value(",")
                .validator(parse_delimiter),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting and merging")
                .takes_value(true)
                .validator(is_number),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

#[cfg(test)]
mod test {
    use rstest::*;

    use csv_ext_sort::MergePolicy;

    use super::{LogLevel, Policy};

    #[rstest]
    #[case("kway", Some(MergePolicy::KWay))]
    #[case("binary", Some(MergePolicy::BinaryTree))]
    #[case("k-way", None)]
    fn test_policy_values(#[case] value: &str, #[case] expected: Option<MergePolicy>) {
        let actual = value.parse::<Policy>().ok().map(MergePolicy::from);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_possible_values() {
        let policies: Vec<&str> = Policy::possible_values().map(|value| value.get_name()).collect();
        assert_eq!(policies, vec!["kway", "binary"]);

        let levels: Vec<&str> = LogLevel::possible_values().map(|value| value.get_name()).collect();
        assert_eq!(levels, vec!["off", "error", "warn", "info", "debug", "trace"]);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
