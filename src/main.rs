use std::process;
use std::rc::Rc;

use clap::Parser;

use bosun::catalog;
use bosun::cli::Cli;
use bosun::facts::SystemFacts;
use bosun::logging::{ConsoleSink, Severity};
use bosun::runner::Runner;
use bosun::settings::{Session, Settings};

fn main() {
    let cli = Cli::parse();

    let mut settings = Settings::default();
    if let Err(error) = settings.configure(&cli.to_options()) {
        eprintln!("ERROR: {}", error);
        process::exit(1);
    }

    let threshold = if cli.debug {
        Severity::Debug
    } else {
        Severity::Warn
    };
    let session = Session::new(settings, Box::new(SystemFacts::new()));
    session.log.add_sink(Rc::new(ConsoleSink::new(threshold)));

    let runner = Runner::new(session, catalog::root());
    process::exit(runner.run());
}
