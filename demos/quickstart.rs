use std::fs;
use std::io::{self, prelude::*};
use std::path;

use bytesize::MB;
use env_logger;
use log;

use ext_dedup::{ExternalDeduper, ExternalDeduperBuilder, LineSource, MemoryLimitedSetBuilder};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input = LineSource::new(io::BufReader::new(fs::File::open("input.txt").unwrap()));
    let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let deduper: ExternalDeduper = ExternalDeduperBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_buffer(MemoryLimitedSetBuilder::new(50 * MB))
        .build()
        .unwrap();

    let stats = deduper.dedup(input, &mut output_writer).unwrap();
    output_writer.flush().unwrap();

    log::info!("{} distinct lines written, {} duplicates removed", stats.records_written, stats.duplicates());
}
