//! instlat command-line driver.
//!
//! Walks the instruction database in mnemonic order, measures every
//! classified operand shape four ways (latency/throughput, active/overhead)
//! and writes one JSON document with the post-processed results.

use instlat::{
    finish, inst_text, mnemonic_str, report::JsonWriter, report::verbose_line,
    test_instruction, Classifier, HostCpu, InstDb, MeasureConfig,
};

struct Options {
    round: bool,
    estimate: bool,
    verbose: bool,
    single_inst: Option<String>,
    output: Option<String>,
}

fn usage() {
    eprintln!("instlat - x86-64 instruction latency / throughput benchmark");
    eprintln!();
    eprintln!("options:");
    eprintln!("  --round                round results to canonical cycle fractions");
    eprintln!("  --estimate             loosen convergence for a quick run");
    eprintln!("  --single-inst=<name>   benchmark a single mnemonic (e.g. add)");
    eprintln!("  --output=<path>        write the JSON document to a file");
    eprintln!("  --verbose, -v          progress lines on stderr");
    eprintln!("  --help                 this text");
}

fn parse_args() -> Option<Options> {
    let mut opts = Options {
        round: false,
        estimate: false,
        verbose: false,
        single_inst: None,
        output: None,
    };
    for arg in std::env::args().skip(1) {
        if arg == "--round" {
            opts.round = true;
        } else if arg == "--estimate" {
            opts.estimate = true;
        } else if arg == "--verbose" || arg == "-v" {
            opts.verbose = true;
        } else if let Some(name) = arg.strip_prefix("--single-inst=") {
            opts.single_inst = Some(name.to_ascii_lowercase());
        } else if let Some(path) = arg.strip_prefix("--output=") {
            opts.output = Some(path.to_string());
        } else if arg == "--help" || arg == "-h" {
            usage();
            return None;
        } else {
            eprintln!("unknown option '{arg}'");
            usage();
            return None;
        }
    }
    Some(opts)
}

fn main() {
    env_logger::init();

    let Some(opts) = parse_args() else {
        return;
    };

    if !cfg!(target_arch = "x86_64") {
        eprintln!("instlat only runs on x86-64 hosts");
        std::process::exit(1);
    }

    let db = InstDb::get();
    let cpu = HostCpu::get();
    let classifier = Classifier::new(db, cpu, 64);
    let cfg = MeasureConfig { estimate: opts.estimate };

    if opts.verbose {
        let freq = instlat::tsc::tsc_freq_hz();
        if freq != 0 {
            eprintln!("Detected TSC frequency: {freq}");
        }
        eprintln!("Benchmark (latency & reciprocal throughput):");
    }

    let mut json = JsonWriter::new();

    for group in db.groups() {
        if let Some(ref only) = opts.single_inst {
            if mnemonic_str(group.mnemonic) != *only {
                continue;
            }
        }

        for case in classifier.classify(group.mnemonic) {
            let text = inst_text(case.mnemonic, case.spec);

            let lat_overhead = test_instruction(&case, false, true, cfg, cpu);
            let rcp_overhead = test_instruction(&case, true, true, cfg, cpu);
            let lat = test_instruction(&case, false, false, cfg, cpu);
            let rcp = test_instruction(&case, true, false, cfg, cpu);

            let Some((lat, rcp)) = finish(lat, rcp, lat_overhead, rcp_overhead, opts.round)
            else {
                continue;
            };

            if opts.verbose {
                eprintln!("{}", verbose_line(&text, lat, rcp));
            }
            json.record(&text, lat, rcp);
        }
    }

    let doc = json.finish();
    match opts.output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &doc) {
                eprintln!("failed to write '{path}': {e}");
                std::process::exit(1);
            }
        }
        None => print!("{doc}"),
    }
}
