use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_dedup::{ExternalDeduper, ExternalDeduperBuilder, LineFilter, LineSource, MemoryLimitedSetBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let tmp_file_bytes = arg_parser.value_of("tmp_file_bytes").expect("value is required");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let append = arg_parser.is_present("append");
    let track_progress = !arg_parser.is_present("no_progress");

    let skip_patterns = Vec::from_iter(arg_parser.values_of("skip_pattern").into_iter().flatten());
    let filter = match LineFilter::compile(&skip_patterns) {
        Ok(filter) => filter,
        Err(err) => {
            log::error!("skip pattern compilation error: {}", err);
            process::exit(1);
        }
    };

    let inputs = Vec::from_iter(arg_parser.values_of("input").expect("value is required"));
    let input_streams = open_inputs(&inputs);

    let output = arg_parser.value_of("output").expect("value is required");
    let mut output_stream = match open_output(output, append) {
        Ok(file) => file,
        Err(err) => {
            log::error!("output file opening error: {}", err);
            process::exit(1);
        }
    };

    let mut deduper_builder = ExternalDeduperBuilder::new().with_filter(filter);
    if let Some(threads) = threads {
        deduper_builder = deduper_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        deduper_builder = deduper_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    deduper_builder = deduper_builder.with_buffer(MemoryLimitedSetBuilder::new(
        tmp_file_bytes.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
    ));

    let deduper: ExternalDeduper = match deduper_builder.build() {
        Ok(deduper) => deduper,
        Err(err) => {
            log::error!("deduplicator initialization error: {}", err);
            process::exit(1);
        }
    };

    log::info!("starting dedup...");

    let input = LineSource::concat(input_streams);
    let result = if track_progress {
        let progress_stream = io::BufReader::new(concat_readers(open_inputs(&inputs)));
        deduper.dedup_with_progress(input, &mut output_stream, progress_stream)
    } else {
        deduper.dedup(input, &mut output_stream)
    };

    if let Err(err) = result {
        log::error!("deduplication error: {}", err);
        process::exit(1);
    }

    if let Err(err) = output_stream.sync_all() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }

    log::info!("success!");
}

fn open_inputs(inputs: &[&str]) -> Vec<io::BufReader<fs::File>> {
    Vec::from_iter(inputs.iter().map(|input| match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file {} opening error: {}", input, err);
            process::exit(1);
        }
    }))
}

fn concat_readers<R: Read + Send + 'static>(readers: Vec<R>) -> Box<dyn Read + Send> {
    readers
        .into_iter()
        .fold(Box::new(io::empty()), |acc, reader| Box::new(acc.chain(reader)))
}

/// Opens the destination. Without `append` the file must not exist yet.
fn open_output(output: &str, append: bool) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    if append {
        options.create(true).append(true);
    } else {
        options.create_new(true).write(true);
    }

    return options.open(output);
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

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-dedup")
        .about("removes duplicate lines from files larger than memory, sorting the result")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("in")
                .help("input file location (can be used multiple times)")
                .required(true)
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("out")
                .help("output file location")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("skip_pattern")
                .short('s')
                .long("skip-pattern")
                .help("regex pattern that will skip the line if it matches (can be used multiple times)")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            clap::Arg::new("tmp_file_bytes")
                .short('c')
                .long("tmp-file-bytes")
                .help("distinct bytes held in memory before spilling to a temporary file")
                .takes_value(true)
                .default_value("250MB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(size) if size.as_u64() > 0 => Ok(()),
                    Ok(_) => Err(String::from("Temporary file size must be positive")),
                    Err(err) => Err(format!("Temporary file size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("append")
                .short('a')
                .long("append")
                .help("append to the output file (by default only new files are allowed)"),
        )
        .arg(
            clap::Arg::new("no_progress")
                .long("no-progress")
                .help("do not estimate and report progress"),
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
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
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
