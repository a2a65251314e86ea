//! Generates a file of random lowercase hex lines to be deduplicated.

use std::fs;
use std::io::{self, prelude::*};
use std::process;

use env_logger;
use log;
use rand::Rng;

const HEX_DIGITS: &[u8] = b"0123456789abcdef";

fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let arg_parser = build_arg_parser();

    let file = arg_parser.value_of("file").expect("value is required");
    let lines: u64 = arg_parser.value_of_t_or_exit("lines");
    let strlen: usize = arg_parser.value_of_t_or_exit("strlen");

    let output = match fs::OpenOptions::new().create(true).write(true).truncate(true).open(file) {
        Ok(output) => output,
        Err(err) => {
            log::error!("test data file creation error: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = generate(io::BufWriter::with_capacity(256 * 1024, output), lines, strlen) {
        log::error!("test data writing error: {}", err);
        process::exit(1);
    }

    log::info!("{} lines written to {}", lines, file);
}

fn generate<W: Write>(mut output: W, lines: u64, strlen: usize) -> io::Result<()> {
    let mut rng = rand::thread_rng();
    let mut line = vec![0u8; strlen + 1];
    line[strlen] = b'\n';

    for _ in 0..lines {
        for byte in line[..strlen].iter_mut() {
            *byte = HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())];
        }
        output.write_all(&line)?;
    }

    return output.flush();
}

fn positive_number(v: &str) -> Result<(), String> {
    match v.parse::<u64>() {
        Ok(number) if number > 0 => Ok(()),
        Ok(_) => Err(String::from("value must be a positive integer")),
        Err(err) => Err(format!("value format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("gen-test-data")
        .about("generates random test data for ext-dedup")
        .arg(
            clap::Arg::new("file")
                .short('f')
                .long("file")
                .help("file location for the test data to be created")
                .takes_value(true)
                .default_value("testdata.log"),
        )
        .arg(
            clap::Arg::new("lines")
                .short('n')
                .long("lines")
                .help("how many lines to generate")
                .takes_value(true)
                .default_value("100")
                .validator(positive_number),
        )
        .arg(
            clap::Arg::new("strlen")
                .long("strlen")
                .help("length of the strings to generate")
                .takes_value(true)
                .default_value("50")
                .validator(positive_number),
        )
        .get_matches()
}
